//! On-flash layout of the log.
//!
//! ```text
//! block (64k) := header: u8 (0..=31)  page 0 .. page 255
//! item        := id: u8  length: u24 (big endian)  payload[length]
//! ```
//!
//! Items start at a page boundary, one byte later if that page opens a block. A payload crossing
//! into the next block continues after the block header and a repeated item header, which has the
//! continuation bit set and carries the number of payload bytes still to come.

use crate::platform::{AlignedOps, Platform};
use crate::u24::u24;
use alloc::vec;
use core::fmt::{Debug, Formatter};
#[cfg(feature = "defmt")]
use defmt::trace;

pub const PAGE_SIZE: usize = 256;
pub const BLOCK_SIZE: usize = 64 * 1024;
pub const BLOCK_COUNT: usize = 16;
pub const PAGES_PER_BLOCK: usize = BLOCK_SIZE / PAGE_SIZE;
pub const PAGE_COUNT: usize = PAGES_PER_BLOCK * BLOCK_COUNT;
/// Size of the flash region occupied by the log
pub const LOG_SIZE: usize = BLOCK_SIZE * BLOCK_COUNT;

pub(crate) const BLOCK_HEADER_SIZE: usize = 1;
pub(crate) const ITEM_HEADER_SIZE: usize = 4;
/// Bytes taken from a block by a payload continuing into it
pub(crate) const CONTINUATION_OVERHEAD: usize = BLOCK_HEADER_SIZE + ITEM_HEADER_SIZE;
pub(crate) const BLOCK_COUNTER_MODULUS: u8 = 32;

pub(crate) const ERASED: u8 = 0xFF;
pub(crate) const CONTINUATION_FLAG: u8 = 0x80;
pub(crate) const ID_MASK: u8 = 0x7F;

/// Reserved id of the persisted index table
pub const INDEX_TABLE_ID: u8 = 0x7F;
pub const INDEX_ENTRY_SIZE: usize = 7;
pub const INDEX_ENTRIES: usize = 35;
pub const INDEX_TABLE_SIZE: usize = INDEX_ENTRY_SIZE * INDEX_ENTRIES;

/// An item is not allowed to wrap around the ring onto its own first block, neither with its
/// payload nor with the index table following it.
pub const MAX_ITEM_LENGTH: usize = (BLOCK_COUNT - 2) * (BLOCK_SIZE - CONTINUATION_OVERHEAD);

const _: () = assert!(
    BLOCK_HEADER_SIZE + ITEM_HEADER_SIZE + INDEX_TABLE_SIZE <= PAGE_SIZE,
    "Index table has to fit into a single page"
);
const _: () = assert!(MAX_ITEM_LENGTH as u32 <= u24::MAX);
const _: () = assert!(LOG_SIZE as u32 - 1 <= u24::MAX);

/// Recency counter stored in the first byte of every started block.
#[derive(Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockHeader(u8);

impl BlockHeader {
    /// Returns `None` for bytes outside the counter range, e.g. an erased block.
    pub(crate) const fn from_raw(raw: u8) -> Option<Self> {
        if raw < BLOCK_COUNTER_MODULUS {
            Some(Self(raw))
        } else {
            None
        }
    }

    pub(crate) const fn from_counter(counter: u8) -> Self {
        Self(counter % BLOCK_COUNTER_MODULUS)
    }

    pub const fn counter(self) -> u8 {
        self.0
    }

    pub(crate) const fn next(self) -> Self {
        Self((self.0 + 1) % BLOCK_COUNTER_MODULUS)
    }

    pub(crate) const fn previous(self) -> Self {
        Self((self.0 + BLOCK_COUNTER_MODULUS - 1) % BLOCK_COUNTER_MODULUS)
    }

    /// `true` if `successor` was started right after this block.
    pub(crate) fn is_followed_by(self, successor: Option<BlockHeader>) -> bool {
        successor == Some(self.next())
    }
}

impl Debug for BlockHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("BlockHeader({})", self.0))
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ItemHeader {
    id: u8,
    continuation: bool,
    length: u32,
}

impl ItemHeader {
    pub(crate) fn start(id: u8, length: u32) -> Self {
        debug_assert!(id <= ID_MASK && length <= u24::MAX);
        Self {
            id,
            continuation: false,
            length,
        }
    }

    pub(crate) fn continuation(id: u8, remaining: u32) -> Self {
        Self {
            continuation: true,
            ..Self::start(id, remaining)
        }
    }

    pub(crate) fn index_table() -> Self {
        Self::start(INDEX_TABLE_ID, INDEX_TABLE_SIZE as u32)
    }

    /// Returns `None` if the header was never written.
    pub(crate) fn parse(raw: [u8; ITEM_HEADER_SIZE]) -> Option<Self> {
        let [id, length @ ..] = raw;
        if id == ERASED {
            return None;
        }
        Some(Self {
            id: id & ID_MASK,
            continuation: id & CONTINUATION_FLAG != 0,
            length: u24::from_be_bytes(length).to_u32(),
        })
    }

    pub(crate) fn to_bytes(self) -> [u8; ITEM_HEADER_SIZE] {
        let flag = if self.continuation {
            CONTINUATION_FLAG
        } else {
            0
        };
        let [a, b, c] = u24::truncate(self.length).to_be_bytes();
        [self.id | flag, a, b, c]
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn is_continuation(&self) -> bool {
        self.continuation
    }

    pub(crate) fn is_index_table(&self) -> bool {
        *self == Self::index_table()
    }
}

impl Debug for ItemHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let id = self.id;
        let length = self.length;
        let continuation = self.continuation;
        f.write_fmt(format_args!(
            "ItemHeader {{ id: {id:>3}, length: {length:>7}, continuation: {continuation} }}"
        ))
    }
}

pub(crate) const fn block_of(address: u32) -> usize {
    address as usize / BLOCK_SIZE % BLOCK_COUNT
}

pub(crate) const fn block_start(block: usize) -> u32 {
    (block % BLOCK_COUNT * BLOCK_SIZE) as u32
}

pub(crate) const fn is_block_start(address: u32) -> bool {
    address as usize % BLOCK_SIZE == 0
}

pub(crate) const fn page_ceil(address: u32) -> u32 {
    (address as usize).div_ceil(PAGE_SIZE) as u32 * PAGE_SIZE as u32
}

pub(crate) const fn page_floor(address: u32) -> u32 {
    address / PAGE_SIZE as u32 * PAGE_SIZE as u32
}

/// Address one past the last payload byte of an item whose header starts at `header`.
///
/// The payload fills its first block up to the end, every further block holds
/// `BLOCK_SIZE - CONTINUATION_OVERHEAD` bytes. The result is not wrapped around the ring.
pub(crate) const fn item_end(header: u32, length: u32) -> u32 {
    let payload_start = header + ITEM_HEADER_SIZE as u32;
    let first_block_end = (header / BLOCK_SIZE as u32 + 1) * BLOCK_SIZE as u32;
    let room = first_block_end - payload_start;
    if length <= room {
        return payload_start + length;
    }

    let per_block = (BLOCK_SIZE - CONTINUATION_OVERHEAD) as u32;
    let overflow = length - room;
    let crossings = overflow.div_ceil(per_block);
    let tail = overflow - (crossings - 1) * per_block;
    first_block_end + (crossings - 1) * BLOCK_SIZE as u32 + CONTINUATION_OVERHEAD as u32 + tail
}

/// Reads `bytes.len()` bytes at an arbitrary offset from a flash that only supports reads aligned
/// to `READ_SIZE`.
pub(crate) fn read_aligned<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &mut [u8],
) -> Result<(), T::Error> {
    #[cfg(feature = "defmt")]
    trace!("read_aligned @{:#08x}: [{}]", offset, bytes.len());

    let start = T::align_read_floor(offset as usize);
    let end = T::align_read_ceil(offset as usize + bytes.len());
    if start == offset as usize && end - start == bytes.len() {
        return hal.read(offset, bytes);
    }

    let mut buf = vec![ERASED; end - start];
    hal.read(start as u32, &mut buf)?;
    let skip = offset as usize - start;
    bytes.copy_from_slice(&buf[skip..skip + bytes.len()]);
    Ok(())
}

/// Programs the first `used` bytes of a page buffer. The buffer is padded with 0xFF, so rounding
/// up to `WRITE_SIZE` only reprograms erased cells.
pub(crate) fn write_page<T: Platform>(
    hal: &mut T,
    offset: u32,
    page: &[u8; PAGE_SIZE],
    used: usize,
) -> Result<(), T::Error> {
    #[cfg(feature = "defmt")]
    trace!("write_page @{:#08x}: [{}]", offset, used);

    let len = T::align_write_ceil(used).min(PAGE_SIZE);
    if len == 0 {
        return Ok(());
    }
    hal.write(offset, &page[..len])
}
