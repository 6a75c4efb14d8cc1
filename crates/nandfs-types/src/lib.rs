#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Erased flash reads back as all-ones.
pub const ERASED_BYTE: u8 = 0xFF;

/// Number of dirty page-buffer groups a device tracks.
pub const MAX_DIRTY_BUF_GROUPS: usize = 3;

/// Physical erase-unit number, chip-absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Page number within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical serial number assigned by the index layer.
///
/// Opaque to this core; it only serves as the grouping key for dirty
/// page buffers and as a field carried through tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Serial(pub u16);

impl Serial {
    /// Dirty-group slot this serial maps to.
    #[must_use]
    pub fn dirty_group(self) -> usize {
        usize::from(self.0) % MAX_DIRTY_BUF_GROUPS
    }
}

/// Kind of physical media backing a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    Null,
    Nand,
    SmartMedia,
    Ram,
    Rom,
    Emulated,
}

/// Contiguous block range owned by one device (inclusive bounds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub start: BlockId,
    pub end: BlockId,
}

impl Partition {
    /// Create a partition, rejecting inverted bounds.
    pub fn new(start: BlockId, end: BlockId) -> Result<Self, ParseError> {
        if end.0 < start.0 {
            return Err(ParseError::InvalidField {
                field: "partition",
                reason: "end block before start block",
            });
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn contains(&self, block: BlockId) -> bool {
        (self.start.0..=self.end.0).contains(&block.0)
    }

    /// Number of blocks in the partition.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.end.0 - self.start.0 + 1
    }
}

/// Errors from decoding on-flash structures (layout tables, tags).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes, got {actual}")]
    InsufficientData { needed: usize, actual: usize },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("missing terminator sentinel in layout table")]
    MissingSentinel,
}
