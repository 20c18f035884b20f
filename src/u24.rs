use core::fmt::{Debug, Formatter};

/// Big-endian 24 bit unsigned integer as used for every length and address on the flash.
#[derive(Copy, Clone, PartialEq, Ord, PartialOrd, Eq)]
#[allow(non_camel_case_types)]
#[repr(transparent)]
pub struct u24([u8; 3]);

impl Debug for u24 {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("0x{:0>6x}", self.to_u32()))
    }
}

impl u24 {
    pub const MAX: u32 = 0x00FF_FFFF;

    pub const fn from_be_bytes(bytes: [u8; 3]) -> Self {
        u24(bytes)
    }

    pub const fn to_be_bytes(self) -> [u8; 3] {
        self.0
    }

    pub const fn to_u32(self) -> u32 {
        let u24([a, b, c]) = self;
        u32::from_be_bytes([0, a, b, c])
    }

    /// Keeps the lower 24 bits of `num`.
    pub const fn truncate(num: u32) -> Self {
        let [_, a, b, c] = num.to_be_bytes();
        u24([a, b, c])
    }
}
