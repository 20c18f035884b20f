/// Notifications fired by `FlashLog::write_item` after every programmed page so the producer of
/// the source buffer can be throttled, e.g. by toggling RTS of a UART.
pub trait FlowControl {
    /// The source buffer was drained below half of its capacity.
    fn resume(&mut self);

    /// The source buffer is full.
    fn pause(&mut self);
}

/// No flow control.
impl FlowControl for () {
    fn resume(&mut self) {}

    fn pause(&mut self) {}
}

impl<F: FlowControl> FlowControl for &mut F {
    fn resume(&mut self) {
        (**self).resume()
    }

    fn pause(&mut self) {
        (**self).pause()
    }
}

/// Adapts a pair of closures.
///
/// ```
/// use spiflash_log::Callbacks;
///
/// let mut paused = false;
/// let mut flow = Callbacks::new(|| {}, || paused = true);
/// ```
pub struct Callbacks<R: FnMut(), P: FnMut()> {
    resume: R,
    pause: P,
}

impl<R: FnMut(), P: FnMut()> Callbacks<R, P> {
    pub fn new(resume: R, pause: P) -> Self {
        Self { resume, pause }
    }
}

impl<R: FnMut(), P: FnMut()> FlowControl for Callbacks<R, P> {
    fn resume(&mut self) {
        (self.resume)()
    }

    fn pause(&mut self) {
        (self.pause)()
    }
}
