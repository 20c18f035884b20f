#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use spiflash_log::platform::Ready;
use spiflash_log::raw::LOG_SIZE;
use spiflash_log::{ByteSource, Config, FlashLog, FlowControl, ItemId, Producer};

pub const FLASH_SECTOR_SIZE: usize = 4096;
// Taken from https://github.com/esp-rs/esp-hal/blob/main/esp-storage/src/stub.rs
pub const WORD_SIZE: usize = 4;
/// Capacity reported by `Data`, the same as a `RingBuffer<512>`
pub const SOURCE_CAPACITY: usize = 511;

pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub fail_after_writes: usize,
    pub operations: Vec<Operation>,
    writes: usize,
    /// Number of `ready` polls reporting busy before every operation
    pub busy_polls: u32,
    pending_busy: u32,
    pub backoffs: usize,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new() -> Self {
        Self::with_size(LOG_SIZE)
    }

    pub fn with_size(size: usize) -> Self {
        Self {
            buf: vec![0xffu8; size],
            fail_after_operation: usize::MAX,
            fail_after_writes: usize::MAX,
            operations: Vec::new(),
            writes: 0,
            busy_polls: 0,
            pending_busy: 0,
            backoffs: 0,
        }
    }

    pub fn new_with_fault(fail_after_operation: usize) -> Self {
        Self {
            fail_after_operation,
            ..Self::new()
        }
    }

    /// Fails every write after the first `fail_after_writes` ones.
    pub fn new_with_write_fault(fail_after_writes: usize) -> Self {
        Self {
            fail_after_writes,
            ..Self::new()
        }
    }

    pub fn new_busy(busy_polls: u32) -> Self {
        Self {
            busy_polls,
            pending_busy: busy_polls,
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
        self.fail_after_writes = usize::MAX;
    }

    pub fn erases(&self) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .collect()
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }

    fn record(&mut self, op: Operation) -> Result<(), FlashError> {
        self.pending_busy = self.busy_polls;
        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT {op:?}");
            return Err(FlashError);
        }
        if let Operation::Write { .. } = op {
            if self.writes >= self.fail_after_writes {
                println!("    flash: FAULT {op:?}");
                return Err(FlashError);
            }
            self.writes += 1;
        }
        self.operations.push(op);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::READ_SIZE));

        self.record(Operation::Read {
            offset,
            len: bytes.len(),
        })?;

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));

        println!("    flash: erase: {from:06X} - {to:06X}");

        self.record(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        })?;

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));
        assert!(!bytes.is_empty());

        self.record(Operation::Write {
            offset,
            len: bytes.len(),
        })?;

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // NOR flash can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}

impl Ready for Flash {
    fn ready(&mut self) -> bool {
        if self.pending_busy > 0 {
            self.pending_busy -= 1;
            return false;
        }
        true
    }

    fn backoff(&mut self) {
        self.backoffs += 1;
        std::thread::yield_now();
    }
}

/// Source that always holds the rest of `bytes`, up to `SOURCE_CAPACITY`.
pub struct Data {
    bytes: Vec<u8>,
    pos: usize,
}

impl Data {
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            pos: 0,
        }
    }
}

impl ByteSource for Data {
    fn remove(&mut self) -> Option<u8> {
        let byte = self.bytes.get(self.pos).copied()?;
        self.pos += 1;
        Some(byte)
    }

    fn count(&self) -> usize {
        (self.bytes.len() - self.pos).min(SOURCE_CAPACITY)
    }

    fn capacity(&self) -> usize {
        SOURCE_CAPACITY
    }
}

/// Refills the ring buffer whenever the log asks to resume, standing in for an interrupt driven
/// producer in single threaded tests.
pub struct Feeder<'a, const N: usize> {
    producer: Producer<'a, N>,
    data: std::vec::IntoIter<u8>,
    pending: Option<u8>,
    pub resumes: usize,
    pub pauses: usize,
}

impl<'a, const N: usize> Feeder<'a, N> {
    pub fn new(producer: Producer<'a, N>, data: &[u8]) -> Self {
        Self {
            producer,
            data: data.to_vec().into_iter(),
            pending: None,
            resumes: 0,
            pauses: 0,
        }
    }

    pub fn fill(&mut self) {
        while let Some(byte) = self.pending.take().or_else(|| self.data.next()) {
            if let Err(byte) = self.producer.add(byte) {
                self.pending = Some(byte);
                break;
            }
        }
    }
}

impl<const N: usize> FlowControl for Feeder<'_, N> {
    fn resume(&mut self) {
        self.resumes += 1;
        self.fill();
    }

    fn pause(&mut self) {
        self.pauses += 1;
    }
}

pub fn id(raw: u8) -> ItemId {
    ItemId::new(raw).unwrap()
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn open(flash: &mut Flash) -> FlashLog<&mut Flash> {
    FlashLog::new(flash, Config::default()).unwrap()
}

pub fn write(log: &mut FlashLog<&mut Flash>, raw_id: u8, data: &[u8]) {
    log.write_item(id(raw_id), data.len(), Data::new(data), ())
        .unwrap();
}
