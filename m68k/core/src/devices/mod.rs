//! Reference peripherals.

pub mod compactflash;
pub mod mc68681;
pub mod simple;

pub use compactflash::CompactFlash;
pub use mc68681::{DuartPort, Mc68681};
pub use simple::{SimpleDisk, SimpleTimer, SimpleUart};

use serde::{Deserialize, Serialize};

/// How a peripheral's 8-bit registers sit on the data bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterArrangement {
    /// One register per byte.
    #[serde(rename = "8-bit")]
    Packed8,
    /// Registers on every other byte (one per 16-bit word).
    #[serde(rename = "16-bit")]
    Wide16,
    /// Registers answering on both bytes of each 16-bit word.
    #[serde(rename = "16-bit-doubled")]
    Doubled16,
}

impl RegisterArrangement {
    /// Byte offsets at which register index `index` decodes.
    pub fn offsets(self, index: u32) -> (u32, Option<u32>) {
        match self {
            RegisterArrangement::Packed8 => (index, None),
            RegisterArrangement::Wide16 => (index * 2, None),
            RegisterArrangement::Doubled16 => (index * 2, Some(index * 2 + 1)),
        }
    }

    /// Recover the register index for a byte offset, if it decodes.
    pub fn index_of(self, offset: u32) -> Option<u32> {
        match self {
            RegisterArrangement::Packed8 => Some(offset),
            RegisterArrangement::Wide16 => (offset % 2 == 0).then_some(offset / 2),
            RegisterArrangement::Doubled16 => Some(offset / 2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrangement_offsets() {
        assert_eq!(RegisterArrangement::Packed8.offsets(3), (3, None));
        assert_eq!(RegisterArrangement::Wide16.offsets(3), (6, None));
        assert_eq!(RegisterArrangement::Doubled16.offsets(3), (6, Some(7)));
        assert_eq!(RegisterArrangement::Wide16.index_of(7), None);
        assert_eq!(RegisterArrangement::Doubled16.index_of(7), Some(3));
    }
}
