#![forbid(unsafe_code)]
//! Error types for nandfs.
//!
//! # Error Taxonomy
//!
//! The flash stack uses a two-layer error model:
//!
//! | Layer | Type | Purpose |
//! |-------|------|---------|
//! | Driver | `IoError` (`nandfs-flash`) | Raw per-operation outcome of a flash driver call |
//! | Device | `FlashError` (this crate) | Classified, caller-facing failures after retry/ECC handling |
//!
//! Driver results map to `FlashError` at the device service layer:
//!
//! | Driver outcome | Device handling | Surfaced as |
//! |----------------|-----------------|-------------|
//! | `IoError::Retry` | bounded retry loop | `FlashError::Io` once retries are exhausted |
//! | `IoError::Uncorrectable` (data read) | none — retirement is the caller's move | `FlashError::EccFailed` |
//! | `IoError::Uncorrectable` (spare read) | cache entry dropped, rescan forced | `FlashError::SpareEccFailed` |
//! | `IoError::BadBlock` (write/erase) | pending-bad-block slot recorded | `FlashError::BadBlock` |
//! | `Ok(n > 0)` corrected bits | statistics only | success (count returned) |
//!
//! `PoolExhausted` and `LockMisuse` never originate from the driver; they
//! are hard failures of this layer and propagate to the caller untouched.
//! No operation silently ignores a nonzero driver outcome.

use thiserror::Error;

/// Unified caller-facing error for all device and flash-service operations.
///
/// Driver-internal outcomes (`IoError` in `nandfs-flash`) convert into
/// `FlashError` at the device boundary after retry and ECC policy have run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlashError {
    /// Transient I/O failure that persisted through the bounded retry loop.
    #[error("flash I/O error at block {block} page {page} after {attempts} attempts")]
    Io { block: u32, page: u32, attempts: u32 },

    /// Page data corruption beyond ECC correction capability.
    ///
    /// The block should be retired by the layer above (mark bad, reallocate
    /// the logical block).
    #[error("uncorrectable ECC error in data at block {block} page {page}")]
    EccFailed { block: u32, page: u32 },

    /// Spare/tag metadata loss: spare read was uncorrectable or the tag
    /// seal did not verify. The block-info cache entry has been dropped;
    /// the next access re-reads spare from flash.
    #[error("uncorrectable spare/tag at block {block} page {page}")]
    SpareEccFailed { block: u32, page: u32 },

    /// The driver detected a bad block during write or erase.
    ///
    /// The block is recorded in the device's pending-bad-block slot and
    /// must be retired; buffered writes destined for it belong elsewhere.
    #[error("bad block detected at block {block}")]
    BadBlock { block: u32 },

    /// Bad-block marking failed at the driver.
    #[error("failed to mark block {block} bad")]
    MarkBadFailed { block: u32 },

    /// Pool or buffer capacity exhausted with nothing evictable or
    /// flushable. Dirty data is never dropped to make room.
    #[error("resource exhausted: {0}")]
    PoolExhausted(&'static str),

    /// Lock released by a task that does not hold it. A programming
    /// defect, not a runtime condition to recover from.
    #[error("device lock misuse: {0}")]
    LockMisuse(&'static str),

    /// Mount-time configuration rejected (geometry, layout tables, or a
    /// mandatory driver operation missing for the selected ECC/layout
    /// policy).
    #[error("invalid device configuration: {0}")]
    Config(String),

    /// Block or page address outside the device partition.
    #[error("address out of range: block {block} page {page}")]
    OutOfRange { block: u32, page: u32 },

    /// On-flash structure failed to decode.
    #[error("parse error: {0}")]
    Parse(String),
}

/// Result alias using `FlashError`.
pub type Result<T> = std::result::Result<T, FlashError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = FlashError::EccFailed { block: 3, page: 0 };
        assert_eq!(
            err.to_string(),
            "uncorrectable ECC error in data at block 3 page 0"
        );

        let io = FlashError::Io {
            block: 1,
            page: 2,
            attempts: 4,
        };
        assert!(io.to_string().contains("after 4 attempts"));

        let cfg = FlashError::Config("spare layout overlaps status byte".into());
        assert!(cfg.to_string().starts_with("invalid device configuration"));
    }

    #[test]
    fn variants_compare_by_value() {
        assert_eq!(
            FlashError::BadBlock { block: 9 },
            FlashError::BadBlock { block: 9 }
        );
        assert_ne!(
            FlashError::BadBlock { block: 9 },
            FlashError::BadBlock { block: 10 }
        );
    }
}
