#![doc = include_str ! ("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod error;
mod flow;
mod index;
mod internal;
pub mod platform;
pub mod raw;
mod recovery;
mod ring;
mod u24;

pub use flow::{Callbacks, FlowControl};
pub use index::IndexEntry;
pub use ring::{ByteSink, ByteSource, Consumer, Producer, RingBuffer};

extern crate alloc;

use crate::error::Error;
use crate::index::IndexTable;
use crate::platform::Platform;
use crate::raw::{BLOCK_COUNT, BLOCK_SIZE, LOG_SIZE, MAX_ITEM_LENGTH, PAGE_SIZE};
use alloc::vec::Vec;
use core::fmt;

/// Identifies an item in the log, 0 to 126. The remaining 7 bit value is reserved for the
/// persisted index table.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ItemId(u8);

impl ItemId {
    pub const MAX: u8 = raw::INDEX_TABLE_ID - 1;

    pub const fn new(id: u8) -> Result<Self, Error> {
        if id > Self::MAX {
            return Err(Error::InvalidItemId);
        }
        Ok(Self(id))
    }

    /// Usage in a const context: `const GPS: ItemId = ItemId::from_u8(3);`
    pub const fn from_u8(id: u8) -> Self {
        assert!(id <= Self::MAX);
        Self(id)
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for ItemId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Start of the log on the flash, has to be aligned to `raw::BLOCK_SIZE`
    pub partition_offset: usize,
    /// Number of polls of the device or a ring buffer before giving up, `None` waits forever
    pub retry_limit: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            partition_offset: 0,
            retry_limit: None,
        }
    }
}

impl Config {
    pub fn with_partition_offset(mut self, partition_offset: usize) -> Self {
        self.partition_offset = partition_offset;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }
}

/// Returned by a successful `FlashLog::read_item`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub id: ItemId,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogStatistics {
    pub blocks: Vec<BlockStatistics>,
    /// Blocks carrying a valid header
    pub used_blocks: u8,
    /// Blocks that were never started or whose header got lost
    pub unused_blocks: u8,
    pub index_entries: u8,
    pub free_index_slots: u8,
    pub latest_block_id: u8,
    pub next_address: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockStatistics {
    /// Recency counter, `None` if the block was not started
    pub header: Option<u8>,
}

/// The FlashLog keeps the write cursor and the index table in memory. Both are rebuilt from the
/// flash on construction, so a power loss at any point only loses the item being written.
pub struct FlashLog<T: Platform> {
    pub(crate) hal: T,
    pub(crate) base_address: usize,
    pub(crate) retry_limit: Option<u32>,
    pub(crate) faulted: bool,
    pub(crate) resync: bool,

    // set after calling self.load_blocks
    pub(crate) latest_block_id: u8,
    pub(crate) block_counter: u8,
    pub(crate) next_page_id: u16,
    pub(crate) index: IndexTable,
}

impl<T: Platform> FlashLog<T> {
    /// Scans the 16 blocks behind `config.partition_offset` to find
    /// 1. the most recently started block by following the chain of block headers
    /// 2. the first unwritten page in that block
    /// 3. the most recently persisted index table
    ///
    /// A partially written item at the end of the log is skipped and will be overwritten.
    pub fn new(hal: T, config: Config) -> Result<FlashLog<T>, Error> {
        if !config.partition_offset.is_multiple_of(BLOCK_SIZE) {
            return Err(Error::InvalidPartitionOffset);
        }

        if !BLOCK_SIZE.is_multiple_of(T::ERASE_SIZE)
            || !PAGE_SIZE.is_multiple_of(T::READ_SIZE)
            || !PAGE_SIZE.is_multiple_of(T::WRITE_SIZE)
        {
            return Err(Error::UnsupportedGeometry);
        }

        if hal.capacity() < config.partition_offset + LOG_SIZE {
            return Err(Error::InvalidPartitionSize);
        }

        let mut log: FlashLog<T> = Self {
            hal,
            base_address: config.partition_offset,
            retry_limit: config.retry_limit,
            faulted: false,
            resync: false,
            latest_block_id: 0,
            block_counter: 0,
            next_page_id: 0,
            index: IndexTable::new(),
        };

        match log.load_blocks() {
            Ok(()) => Ok(log),
            Err(Error::FlashError) => {
                log.faulted = true;
                Err(Error::FlashError)
            }
            Err(e) => Err(e),
        }
    }

    /// Rebuilds cursor and index from the flash, exactly like `new`. Clears a previous fault on
    /// success.
    pub fn recover(&mut self) -> Result<(), Error> {
        match self.load_blocks() {
            Ok(()) => {
                self.faulted = false;
                self.resync = false;
                Ok(())
            }
            Err(Error::FlashError) => {
                self.faulted = true;
                Err(Error::FlashError)
            }
            Err(e) => {
                self.resync = true;
                Err(e)
            }
        }
    }

    /// Drains `length` bytes from `source` into the log and persists the updated index table
    /// afterward. `flow` is notified after every programmed page.
    ///
    /// An item with the id of an existing one supersedes it. On error the item is lost and the
    /// log continues behind the last complete item.
    pub fn write_item<S, F>(
        &mut self,
        id: ItemId,
        length: usize,
        mut source: S,
        mut flow: F,
    ) -> Result<(), Error>
    where
        S: ByteSource,
        F: FlowControl,
    {
        if self.faulted {
            return Err(Error::FlashError);
        }

        if length > MAX_ITEM_LENGTH {
            return Err(Error::ValueTooLong);
        }

        if self.resync {
            self.recover()?;
        }

        match self.append_item(id, length as u32, &mut source, &mut flow) {
            Ok(()) => Ok(()),
            Err(Error::FlashError) => {
                self.faulted = true;
                Err(Error::FlashError)
            }
            Err(e) => {
                // the cursor may point into the middle of the aborted item
                self.resync = self.load_blocks().is_err();
                Err(e)
            }
        }
    }

    /// Streams the most recent version of item `id` into `sink`.
    ///
    /// Returns `ItemNotFound` if the id is not indexed or its location was overwritten since.
    pub fn read_item<S: ByteSink>(&mut self, id: ItemId, mut sink: S) -> Result<ItemInfo, Error> {
        let entry = self.index.find(id).ok_or(Error::ItemNotFound)?;

        match self.stream_item(entry, &mut sink) {
            Ok(()) => Ok(ItemInfo {
                id,
                length: entry.length(),
            }),
            Err(Error::FlashError) => {
                self.faulted = true;
                Err(Error::FlashError)
            }
            Err(e) => Err(e),
        }
    }

    /// Reads a whole item into memory.
    pub fn read_vec(&mut self, id: ItemId) -> Result<Vec<u8>, Error> {
        let length = self.index.find(id).ok_or(Error::ItemNotFound)?.length();
        let mut buf = Vec::with_capacity(length as usize);
        self.read_item(id, &mut buf)?;
        Ok(buf)
    }

    /// Block holding the write cursor, or the block before it if the cursor sits on a block start.
    pub fn latest_block_id(&self) -> u8 {
        self.latest_block_id
    }

    /// Header of the latest block.
    pub fn block_counter(&self) -> u8 {
        self.block_counter
    }

    /// Page the next item starts on.
    pub fn next_page_id(&self) -> u16 {
        self.next_page_id
    }

    /// Address the next item starts on, relative to the partition offset.
    pub fn next_address(&self) -> u32 {
        self.next_page_id as u32 * PAGE_SIZE as u32
    }

    /// Live index entries in slot order.
    pub fn index(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        self.index.entries()
    }

    /// Returns detailed statistics about the block usage of the log
    pub fn statistics(&mut self) -> Result<LogStatistics, Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        let headers = match self.read_block_headers() {
            Ok(headers) => headers,
            Err(Error::FlashError) => {
                self.faulted = true;
                return Err(Error::FlashError);
            }
            Err(e) => return Err(e),
        };

        let blocks = headers
            .iter()
            .map(|header| BlockStatistics {
                header: header.map(|h| h.counter()),
            })
            .collect::<Vec<_>>();
        let used_blocks = blocks.iter().filter(|b| b.header.is_some()).count() as u8;
        let index_entries = self.index.len() as u8;

        Ok(LogStatistics {
            blocks,
            used_blocks,
            unused_blocks: BLOCK_COUNT as u8 - used_blocks,
            index_entries,
            free_index_slots: raw::INDEX_ENTRIES as u8 - index_entries,
            latest_block_id: self.latest_block_id,
            next_address: self.next_address(),
        })
    }
}
