//! The index table maps item ids to the location of their most recent version. It is bounded to
//! `INDEX_ENTRIES` slots and persisted as item `INDEX_TABLE_ID` after every written item.

use crate::ItemId;
use crate::raw::{
    BLOCK_COUNT, BLOCK_SIZE, ERASED, INDEX_ENTRIES, INDEX_ENTRY_SIZE, INDEX_TABLE_SIZE, LOG_SIZE,
    block_of, is_block_start, item_end,
};
use crate::u24::u24;
use core::fmt::{Debug, Formatter};

/// Location of an item on the flash, relative to the start of the log.
#[derive(Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IndexEntry {
    id: ItemId,
    address: u32,
    length: u32,
}

impl IndexEntry {
    pub(crate) fn new(id: ItemId, address: u32, length: u32) -> Self {
        Self {
            id,
            address,
            length,
        }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    /// Start of the page holding the item header. The header itself is one byte later if the page
    /// opens a block.
    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub(crate) fn header_address(&self) -> u32 {
        if is_block_start(self.address) {
            self.address + 1
        } else {
            self.address
        }
    }

    /// `true` if any byte of the item, including continuation fragments, lives in `block`.
    pub(crate) fn touches_block(&self, block: usize) -> bool {
        let first = block_of(self.address);
        let last = (item_end(self.header_address(), self.length) as usize - 1) / BLOCK_SIZE;
        let span = last - self.address as usize / BLOCK_SIZE;
        (block + BLOCK_COUNT - first) % BLOCK_COUNT <= span
    }

    fn parse(raw: &[u8; INDEX_ENTRY_SIZE]) -> Result<Option<Self>, ()> {
        let [id, a0, a1, a2, l0, l1, l2] = *raw;
        if id == ERASED {
            return Ok(None);
        }
        let id = ItemId::new(id).map_err(|_| ())?;
        let address = u24::from_be_bytes([a0, a1, a2]).to_u32();
        if address as usize >= LOG_SIZE {
            return Err(());
        }
        let length = u24::from_be_bytes([l0, l1, l2]).to_u32();
        Ok(Some(Self::new(id, address, length)))
    }

    fn to_bytes(self) -> [u8; INDEX_ENTRY_SIZE] {
        let [a0, a1, a2] = u24::truncate(self.address).to_be_bytes();
        let [l0, l1, l2] = u24::truncate(self.length).to_be_bytes();
        [self.id.get(), a0, a1, a2, l0, l1, l2]
    }
}

impl Debug for IndexEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let id = self.id.get();
        let address = self.address;
        let length = self.length;
        f.write_fmt(format_args!(
            "IndexEntry {{ id: {id:>3}, address: 0x{address:0>6x}, length: {length} }}"
        ))
    }
}

/// Bounded set of index entries. Freed slots are refilled first, a full table drops slot 0.
#[derive(Clone, PartialEq)]
pub(crate) struct IndexTable {
    slots: [Option<IndexEntry>; INDEX_ENTRIES],
}

impl IndexTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [None; INDEX_ENTRIES],
        }
    }

    /// Returns `None` if any slot holds something that was not written by `to_bytes`.
    pub(crate) fn parse(raw: &[u8; INDEX_TABLE_SIZE]) -> Option<Self> {
        let mut table = Self::new();
        for (slot, chunk) in table
            .slots
            .iter_mut()
            .zip(raw.chunks_exact(INDEX_ENTRY_SIZE))
        {
            let chunk: &[u8; INDEX_ENTRY_SIZE] = chunk.try_into().ok()?;
            *slot = IndexEntry::parse(chunk).ok()?;
        }
        Some(table)
    }

    pub(crate) fn to_bytes(&self) -> [u8; INDEX_TABLE_SIZE] {
        let mut raw = [ERASED; INDEX_TABLE_SIZE];
        for (slot, chunk) in self
            .slots
            .iter()
            .zip(raw.chunks_exact_mut(INDEX_ENTRY_SIZE))
        {
            if let Some(entry) = slot {
                chunk.copy_from_slice(&entry.to_bytes());
            }
        }
        raw
    }

    /// Overwrites the slot of the same id, otherwise takes the first free slot. A full table
    /// drops its oldest slot and appends the entry at the end.
    pub(crate) fn upsert(&mut self, entry: IndexEntry) {
        let existing = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Some(e) if e.id == entry.id));
        let target = existing.or_else(|| self.slots.iter().position(Option::is_none));

        match target {
            Some(idx) => self.slots[idx] = Some(entry),
            None => {
                self.slots.rotate_left(1);
                self.slots[INDEX_ENTRIES - 1] = Some(entry);
            }
        }
    }

    /// Frees all slots referencing data in `block`, returns the number of freed slots.
    pub(crate) fn invalidate_block(&mut self, block: usize) -> usize {
        let mut invalidated = 0;
        for slot in self.slots.iter_mut() {
            if slot.is_some_and(|entry| entry.touches_block(block)) {
                *slot = None;
                invalidated += 1;
            }
        }
        invalidated
    }

    /// Searches from the last slot backwards.
    pub(crate) fn find(&self, id: ItemId) -> Option<IndexEntry> {
        self.slots.iter().rev().flatten().find(|e| e.id == id).copied()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        self.slots.iter().flatten().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::PAGE_SIZE;

    fn id(raw: u8) -> ItemId {
        ItemId::new(raw).unwrap()
    }

    #[test]
    fn serialized_layout() {
        let mut table = IndexTable::new();
        table.upsert(IndexEntry::new(id(5), 0x01_0200, 0x00_0300));

        let raw = table.to_bytes();
        assert_eq!(raw[..7], [5, 0x01, 0x02, 0x00, 0x00, 0x03, 0x00]);
        assert!(raw[7..].iter().all(|&b| b == 0xFF));

        assert!(IndexTable::parse(&raw).unwrap() == table);
    }

    #[test]
    fn malformed_table_is_rejected() {
        let mut raw = IndexTable::new().to_bytes();
        raw[7] = 0x80;
        assert!(IndexTable::parse(&raw).is_none());

        let mut raw = IndexTable::new().to_bytes();
        raw[0] = 1;
        raw[1] = 0x10; // address beyond the log
        assert!(IndexTable::parse(&raw).is_none());
    }

    #[test]
    fn upsert_overwrites_existing_id() {
        let mut table = IndexTable::new();
        table.upsert(IndexEntry::new(id(1), 0, 10));
        table.upsert(IndexEntry::new(id(2), 512, 10));
        table.upsert(IndexEntry::new(id(1), 1024, 20));

        assert_eq!(table.len(), 2);
        assert_eq!(table.find(id(1)), Some(IndexEntry::new(id(1), 1024, 20)));
    }

    #[test]
    fn full_table_evicts_oldest_slot() {
        let mut table = IndexTable::new();
        for i in 0..INDEX_ENTRIES as u8 {
            table.upsert(IndexEntry::new(id(i), u32::from(i) * 512, 1));
        }
        table.upsert(IndexEntry::new(id(100), 0x8000, 1));

        assert_eq!(table.len(), INDEX_ENTRIES);
        assert_eq!(table.find(id(0)), None);
        assert_eq!(table.entries().next().map(|e| e.id()), Some(id(1)));
        assert_eq!(table.entries().last().map(|e| e.id()), Some(id(100)));
    }

    #[test]
    fn invalidation_covers_continuation_fragments() {
        let mut table = IndexTable::new();
        let last_page = (BLOCK_SIZE * 15 + BLOCK_SIZE - PAGE_SIZE) as u32;
        // starts in block 15, spills over into block 0
        table.upsert(IndexEntry::new(id(1), last_page, 1000));
        table.upsert(IndexEntry::new(id(2), BLOCK_SIZE as u32, 10));

        assert_eq!(table.invalidate_block(3), 0);
        assert_eq!(table.invalidate_block(0), 1);
        assert_eq!(table.find(id(1)), None);
        assert!(table.find(id(2)).is_some());
    }
}
