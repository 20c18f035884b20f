use embedded_storage::nor_flash::NorFlash;

/// See README.md for an example implementation.
pub trait Platform: Ready + NorFlash {}

impl<T: Ready + NorFlash> Platform for T {}

/// Busy polling of the flash device. Every read, program and erase is preceded by polling
/// `ready`, calling `backoff` in between unsuccessful polls.
pub trait Ready {
    /// Returns `false` while a previous program or erase is still in progress.
    fn ready(&mut self) -> bool;

    /// Delay between two polls, either of `ready` or of an empty or full ring buffer.
    fn backoff(&mut self);
}

impl<T: Ready> Ready for &mut T {
    fn ready(&mut self) -> bool {
        (**self).ready()
    }

    fn backoff(&mut self) {
        (**self).backoff()
    }
}

pub trait AlignedOps: Platform {
    fn align_read_floor(offset: usize) -> usize {
        align_floor(offset, Self::READ_SIZE)
    }

    fn align_read_ceil(size: usize) -> usize {
        align_ceil(size, Self::READ_SIZE)
    }

    fn align_write_ceil(size: usize) -> usize {
        align_ceil(size, Self::WRITE_SIZE)
    }
}

#[inline(always)]
const fn align_ceil(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size.saturating_add(alignment - 1) & !(alignment - 1)
    } else {
        size.saturating_add(alignment - 1) / alignment * alignment
    }
}

#[inline(always)]
const fn align_floor(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size & !(alignment - 1)
    } else {
        size / alignment * alignment
    }
}

impl<T: Platform> AlignedOps for T {}

#[cfg(any(
    feature = "esp32",
    feature = "esp32s2",
    feature = "esp32s3",
    feature = "esp32c2",
    feature = "esp32c3",
    feature = "esp32c6",
    feature = "esp32h2",
))]
mod chip {
    use esp_hal::delay::Delay;
    use esp_storage::FlashStorage;

    use crate::platform::Ready;

    const BACKOFF_MILLIS: u32 = 1;

    // FlashStorage only returns once an operation has completed
    impl Ready for FlashStorage<'_> {
        fn ready(&mut self) -> bool {
            true
        }

        fn backoff(&mut self) {
            Delay::new().delay_millis(BACKOFF_MILLIS);
        }
    }
}
