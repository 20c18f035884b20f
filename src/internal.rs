use crate::error::Error;
use crate::flow::FlowControl;
use crate::index::IndexEntry;
use crate::platform::Platform;
use crate::raw::{
    BLOCK_HEADER_SIZE, BLOCK_SIZE, BlockHeader, CONTINUATION_OVERHEAD, ERASED, ITEM_HEADER_SIZE,
    ItemHeader, LOG_SIZE, PAGE_COUNT, PAGE_SIZE, PAGES_PER_BLOCK, block_of, block_start,
    is_block_start, page_floor, read_aligned, write_page,
};
use crate::ring::{ByteSink, ByteSource};
use crate::{FlashLog, ItemId};
#[cfg(feature = "defmt")]
use defmt::trace;

pub(crate) const fn page_address(page_id: u16) -> u32 {
    page_id as u32 * PAGE_SIZE as u32
}

/// Feeds the serialized index table through the same page loop as regular items.
struct SliceSource<'a> {
    data: &'a [u8],
    capacity: usize,
}

impl<'a> SliceSource<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            capacity: data.len(),
        }
    }
}

impl ByteSource for SliceSource<'_> {
    fn remove(&mut self) -> Option<u8> {
        let (&first, rest) = self.data.split_first()?;
        self.data = rest;
        Some(first)
    }

    fn count(&self) -> usize {
        self.data.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Platform> FlashLog<T> {
    pub(crate) fn append_item<S: ByteSource, F: FlowControl>(
        &mut self,
        id: ItemId,
        length: u32,
        source: &mut S,
        flow: &mut F,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("append_item: {} [{}]", id, length);

        #[cfg(feature = "debug-logs")]
        println!(
            "internal: append_item: {id:?} length {length} at 0x{:0>6x}",
            self.next_address()
        );

        let address = self.next_address();
        self.write_pages(ItemHeader::start(id.get(), length), source, flow)?;
        self.index.upsert(IndexEntry::new(id, address, length));
        self.persist_index()
    }

    /// Appends the index table as its own item behind the last written one.
    fn persist_index(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("persist_index: @{:#08x}", self.next_address());

        // Starting a block can invalidate entries, so the table is serialized only once its page
        // has been opened.
        if is_block_start(self.next_address()) {
            let header = self.start_block(block_of(self.next_address()))?;
            let mut page = [ERASED; PAGE_SIZE];
            page[0] = header.counter();
            let mut used = BLOCK_HEADER_SIZE;
            used += put_header(&mut page[used..], ItemHeader::index_table());
            let table = self.index.to_bytes();
            page[used..used + table.len()].copy_from_slice(&table);
            used += table.len();
            self.program_page(self.next_page_id, &page, used)?;
            self.next_page_id = (self.next_page_id + 1) % PAGE_COUNT as u16;
            return Ok(());
        }

        let table = self.index.to_bytes();
        self.write_pages(
            ItemHeader::index_table(),
            &mut SliceSource::new(&table),
            &mut (),
        )
    }

    /// Core page loop: writes `header` and drains `header.length()` payload bytes from `source`,
    /// starting at `next_page_id`. Every page is assembled in RAM and programmed exactly once.
    fn write_pages<S: ByteSource, F: FlowControl>(
        &mut self,
        header: ItemHeader,
        source: &mut S,
        flow: &mut F,
    ) -> Result<(), Error> {
        let mut page_id = self.next_page_id;
        let mut remaining = header.length() as usize;
        let mut first = true;

        loop {
            let address = page_address(page_id);
            let mut page = [ERASED; PAGE_SIZE];
            let mut used = 0;

            if is_block_start(address) {
                page[0] = self.start_block(block_of(address))?.counter();
                used += BLOCK_HEADER_SIZE;
                if !first {
                    let continuation = ItemHeader::continuation(header.id(), remaining as u32);
                    used += put_header(&mut page[used..], continuation);
                }
            }
            if first {
                used += put_header(&mut page[used..], header);
                first = false;
            }

            let take = (PAGE_SIZE - used).min(remaining);
            for byte in &mut page[used..used + take] {
                *byte = self.pull(source)?;
            }
            used += take;
            remaining -= take;

            self.program_page(page_id, &page, used)?;
            notify(source, flow);

            page_id = (page_id + 1) % PAGE_COUNT as u16;
            if remaining == 0 {
                break;
            }
        }

        self.next_page_id = page_id;
        Ok(())
    }

    /// Prepares `block` for writing: erases it unless it is blank already, drops index entries
    /// pointing into it and returns the header to write into its first byte.
    pub(crate) fn start_block(&mut self, block: usize) -> Result<BlockHeader, Error> {
        #[cfg(feature = "defmt")]
        trace!("start_block: {}", block);

        if !self.is_block_blank(block)? {
            self.erase_block(block)?;
        }

        let _invalidated = self.index.invalidate_block(block);

        #[cfg(feature = "debug-logs")]
        println!("internal: start_block: {block}, invalidated {_invalidated} index entries");

        let header = BlockHeader::from_counter(self.block_counter).next();
        self.block_counter = header.counter();
        self.latest_block_id = block as u8;
        Ok(header)
    }

    /// Streams the payload of `entry` into `sink` after checking that the indexed location still
    /// holds the item.
    pub(crate) fn stream_item<S: ByteSink>(
        &mut self,
        entry: IndexEntry,
        sink: &mut S,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("stream_item: {}", entry);

        let header_address = entry.header_address();
        let header = self.read_item_header(header_address)?;
        match header {
            Some(h)
                if !h.is_continuation()
                    && h.id() == entry.id().get()
                    && h.length() == entry.length() => {}
            _ => return Err(Error::ItemNotFound),
        }

        let mut address = header_address + ITEM_HEADER_SIZE as u32;
        let mut remaining = entry.length() as usize;
        let mut buf = [0u8; PAGE_SIZE];

        while remaining > 0 {
            address %= LOG_SIZE as u32;
            if is_block_start(address) {
                let expected = ItemHeader::continuation(entry.id().get(), remaining as u32);
                if self.read_item_header(address + BLOCK_HEADER_SIZE as u32)? != Some(expected) {
                    #[cfg(feature = "debug-logs")]
                    println!("internal: stream_item: continuation at 0x{address:0>6x} overwritten");
                    return Err(Error::ItemNotFound);
                }
                address += CONTINUATION_OVERHEAD as u32;
            }

            let page_end = page_floor(address) + PAGE_SIZE as u32;
            let chunk = ((page_end - address) as usize).min(remaining);
            self.read(address, &mut buf[..chunk])?;
            for &byte in &buf[..chunk] {
                self.push(sink, byte)?;
            }

            address += chunk as u32;
            remaining -= chunk;
        }

        Ok(())
    }

    pub(crate) fn read_item_header(&mut self, address: u32) -> Result<Option<ItemHeader>, Error> {
        let mut raw = [0u8; ITEM_HEADER_SIZE];
        self.read(address, &mut raw)?;
        Ok(ItemHeader::parse(raw))
    }

    /// Takes the next payload byte, polling an empty source.
    fn pull<S: ByteSource>(&mut self, source: &mut S) -> Result<u8, Error> {
        let mut attempts = 0;
        loop {
            if let Some(byte) = source.remove() {
                return Ok(byte);
            }
            attempts += 1;
            if self.exhausted(attempts) {
                return Err(Error::SourceStalled);
            }
            self.hal.backoff();
        }
    }

    /// Hands a read byte to the sink, polling while it is full.
    fn push<S: ByteSink>(&mut self, sink: &mut S, byte: u8) -> Result<(), Error> {
        let mut attempts = 0;
        let mut byte = byte;
        loop {
            match sink.add(byte) {
                Ok(()) => return Ok(()),
                Err(rejected) => byte = rejected,
            }
            attempts += 1;
            if self.exhausted(attempts) {
                return Err(Error::SinkStalled);
            }
            self.hal.backoff();
        }
    }

    fn wait_ready(&mut self) -> Result<(), Error> {
        let mut attempts = 0;
        while !self.hal.ready() {
            attempts += 1;
            if self.exhausted(attempts) {
                return Err(Error::DeviceBusy);
            }
            self.hal.backoff();
        }
        Ok(())
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.retry_limit.is_some_and(|limit| attempts > limit)
    }

    /// Reads at an address relative to the start of the log.
    pub(crate) fn read(&mut self, address: u32, bytes: &mut [u8]) -> Result<(), Error> {
        self.wait_ready()?;
        let offset = self.base_address as u32 + address;
        read_aligned(&mut self.hal, offset, bytes).map_err(|_| Error::FlashError)
    }

    fn program_page(
        &mut self,
        page_id: u16,
        page: &[u8; PAGE_SIZE],
        used: usize,
    ) -> Result<(), Error> {
        self.wait_ready()?;
        let offset = self.base_address as u32 + page_address(page_id);
        write_page(&mut self.hal, offset, page, used).map_err(|_| Error::FlashError)
    }

    fn erase_block(&mut self, block: usize) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("erase_block: {}", block);

        self.wait_ready()?;
        let from = self.base_address as u32 + block_start(block);
        self.hal
            .erase(from, from + BLOCK_SIZE as u32)
            .map_err(|_| Error::FlashError)
    }

    /// Reads the block page by page and stops at the first programmed byte.
    fn is_block_blank(&mut self, block: usize) -> Result<bool, Error> {
        let start = block_start(block);
        let mut buf = [0u8; PAGE_SIZE];
        for page in 0..PAGES_PER_BLOCK {
            self.read(start + page_address(page as u16), &mut buf)?;
            if buf.iter().any(|&b| b != ERASED) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn put_header(page: &mut [u8], header: ItemHeader) -> usize {
    page[..ITEM_HEADER_SIZE].copy_from_slice(&header.to_bytes());
    ITEM_HEADER_SIZE
}

/// Resume below half of the source capacity, pause once it is full.
fn notify<S: ByteSource, F: FlowControl>(source: &S, flow: &mut F) {
    let count = source.count();
    let capacity = source.capacity();
    if count < capacity / 2 {
        flow.resume();
    } else if count >= capacity {
        flow.pause();
    }
}
