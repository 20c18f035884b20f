use thiserror::Error;

/// Errors that can occur during log operations. Marked as non-exhaustive to allow for future
/// additions without breaking the API. A caller would usually only need to handle `ItemNotFound`
/// and, if a retry limit is configured, the stall variants as the other errors are static.
#[derive(Error, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The partition offset has to be aligned to the size of an erase block (64k)
    #[error("invalid partition offset")]
    InvalidPartitionOffset,

    /// The flash has to hold all 16 erase blocks of the log behind the partition offset
    #[error("invalid partition size")]
    InvalidPartitionSize,

    /// Read and write granularity of the flash have to divide a page (256 bytes) and the erase
    /// granularity has to divide an erase block (64k)
    #[error("unsupported flash geometry")]
    UnsupportedGeometry,

    /// The internal error value is returned from the provided `&mut impl NorFlash`
    #[error("internal flash error")]
    FlashError,

    /// Item ids are 7 bit wide and 127 is reserved for the index table
    #[error("invalid item id")]
    InvalidItemId,

    /// Items are limited to `MAX_ITEM_LENGTH` bytes so they never wrap onto their own first block
    #[error("value too long")]
    ValueTooLong,

    /// Either the id is not part of the index table or the indexed location was overwritten since.
    #[error("item not found")]
    ItemNotFound,

    /// The device did not report ready within the configured retry limit.
    #[error("device busy")]
    DeviceBusy,

    /// The source ring buffer stayed empty for longer than the configured retry limit.
    #[error("source stalled")]
    SourceStalled,

    /// The destination ring buffer stayed full for longer than the configured retry limit.
    #[error("sink stalled")]
    SinkStalled,
}
