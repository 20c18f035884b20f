use crate::error::Error;
use crate::index::IndexTable;
use crate::platform::Platform;
use crate::raw::{
    BLOCK_COUNT, BLOCK_HEADER_SIZE, BLOCK_SIZE, BlockHeader, INDEX_TABLE_SIZE, ITEM_HEADER_SIZE,
    PAGE_COUNT, PAGE_SIZE, block_start, item_end, page_ceil, page_floor,
};
use crate::FlashLog;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

pub(crate) type BlockHeaders = [Option<BlockHeader>; BLOCK_COUNT];

/// Why the item scan of a block stopped.
#[derive(strum::Display, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ScanEnd {
    /// Reached an unwritten item header.
    Erased,
    /// The items fill the block up to its last page.
    BlockEnd,
    /// The last item reaches into a block that was never started.
    Crossing,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BlockScan {
    /// First page that is free for writing, may be the start of the next block
    pub(crate) cursor: u32,
    pub(crate) end: ScanEnd,
    /// Item header addresses of the index tables in the block, oldest first
    pub(crate) index_tables: Vec<u32>,
}

/// Finds the most recently started block: the first started block whose successor in ring order
/// does not carry the next counter value.
pub(crate) fn find_latest_block(headers: &BlockHeaders) -> Option<(usize, BlockHeader)> {
    (0..BLOCK_COUNT).find_map(|block| match headers[block] {
        Some(header) if !header.is_followed_by(headers[(block + 1) % BLOCK_COUNT]) => {
            Some((block, header))
        }
        _ => None,
    })
}

const fn previous_block(block: usize) -> usize {
    (block + BLOCK_COUNT - 1) % BLOCK_COUNT
}

impl<T: Platform> FlashLog<T> {
    pub(crate) fn load_blocks(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("load_blocks");

        #[cfg(feature = "debug-logs")]
        println!("recovery: load_blocks");

        self.index = IndexTable::new();

        let headers = self.read_block_headers()?;
        let Some((latest, header)) = find_latest_block(&headers) else {
            #[cfg(feature = "debug-logs")]
            println!("recovery: load_blocks: empty log");

            self.latest_block_id = 0;
            self.block_counter = 0;
            self.next_page_id = 0;
            return Ok(());
        };

        let scan = self.scan_block(latest)?;

        #[cfg(feature = "debug-logs")]
        println!(
            "recovery: load_blocks: latest block {latest} ({header:?}), scan stopped: {} at 0x{:0>6x}",
            scan.end, scan.cursor
        );

        if scan.end == ScanEnd::Crossing {
            #[cfg(feature = "defmt")]
            warn!("incomplete item at the end of block {}", latest);
        }

        if scan.end == ScanEnd::Erased && scan.cursor == block_start(latest) {
            // Nothing made it behind the header, restarting the block reproduces it.
            #[cfg(feature = "defmt")]
            warn!("block {} holds only its header", latest);

            self.latest_block_id = previous_block(latest) as u8;
            self.block_counter = header.previous().counter();
        } else {
            self.latest_block_id = latest as u8;
            self.block_counter = header.counter();
        }
        self.next_page_id = ((scan.cursor as usize / PAGE_SIZE) % PAGE_COUNT) as u16;

        let found = self.find_index_table(&headers, latest, &scan.index_tables)?;
        if let Some((block, table)) = found {
            self.index = table;

            // entries persisted before the later blocks were started may point into them
            let mut later = block;
            while later != latest {
                later = (later + 1) % BLOCK_COUNT;
                self.index.invalidate_block(later);
            }
        }

        Ok(())
    }

    pub(crate) fn read_block_headers(&mut self) -> Result<BlockHeaders, Error> {
        let mut headers = [None; BLOCK_COUNT];
        for (block, header) in headers.iter_mut().enumerate() {
            let mut raw = [0u8; BLOCK_HEADER_SIZE];
            self.read(block_start(block), &mut raw)?;
            *header = BlockHeader::from_raw(raw[0]);
        }
        Ok(headers)
    }

    /// Walks the items of `block` from its first header up to the first free page.
    pub(crate) fn scan_block(&mut self, block: usize) -> Result<BlockScan, Error> {
        #[cfg(feature = "defmt")]
        trace!("scan_block: {}", block);

        let start = block_start(block);
        let block_end = start + BLOCK_SIZE as u32;
        let mut candidate = start + BLOCK_HEADER_SIZE as u32;
        let mut index_tables = Vec::new();

        loop {
            let Some(header) = self.read_item_header(candidate)? else {
                return Ok(BlockScan {
                    cursor: page_floor(candidate),
                    end: ScanEnd::Erased,
                    index_tables,
                });
            };

            let end = item_end(candidate, header.length());
            if end > block_end {
                return Ok(BlockScan {
                    cursor: block_end,
                    end: ScanEnd::Crossing,
                    index_tables,
                });
            }

            if header.is_index_table() {
                index_tables.push(candidate);
            }

            candidate = page_ceil(end);
            if candidate >= block_end {
                return Ok(BlockScan {
                    cursor: block_end,
                    end: ScanEnd::BlockEnd,
                    index_tables,
                });
            }
        }
    }

    /// Returns the most recent well-formed index table and the block holding it. Searches
    /// `latest` first, then follows the chain of block headers backwards.
    fn find_index_table(
        &mut self,
        headers: &BlockHeaders,
        latest: usize,
        tables: &[u32],
    ) -> Result<Option<(usize, IndexTable)>, Error> {
        if let Some(table) = self.load_last_index_table(tables)? {
            return Ok(Some((latest, table)));
        }

        let mut block = latest;
        for _ in 1..BLOCK_COUNT {
            let previous = previous_block(block);
            match headers[previous] {
                Some(header) if header.is_followed_by(headers[block]) => {}
                _ => break,
            }

            let scan = self.scan_block(previous)?;
            if let Some(table) = self.load_last_index_table(&scan.index_tables)? {
                #[cfg(feature = "debug-logs")]
                println!("recovery: index table of block {latest} taken from block {previous}");
                return Ok(Some((previous, table)));
            }
            block = previous;
        }
        Ok(None)
    }

    /// Newest table among `addresses` that parses, torn ones are skipped.
    fn load_last_index_table(&mut self, addresses: &[u32]) -> Result<Option<IndexTable>, Error> {
        for &address in addresses.iter().rev() {
            let mut raw = [0u8; INDEX_TABLE_SIZE];
            self.read(address + ITEM_HEADER_SIZE as u32, &mut raw)?;
            if let Some(table) = IndexTable::parse(&raw) {
                return Ok(Some(table));
            }

            #[cfg(feature = "defmt")]
            warn!("skipping malformed index table at {:#08x}", address);

            #[cfg(feature = "debug-logs")]
            println!("recovery: malformed index table at 0x{address:0>6x}");
        }
        Ok(None)
    }
}
