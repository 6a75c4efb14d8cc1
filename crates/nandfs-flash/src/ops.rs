//! The operation set a flash driver implements.
//!
//! Drivers are selected at mount time and used through `Box<dyn FlashOps>`;
//! which of the optional operations must be provided depends on the
//! device's ECC and layout modes (see [`crate::attr::StorageAttr::check_ops`]).
//! Optional operations default to [`IoError::Unsupported`], and the mount
//! check guarantees an unsupported one is never reached afterwards.

use nandfs_types::{BlockId, PageId};
use thiserror::Error;

/// Raw outcome of a single driver call, before the device layer's retry
/// and classification funnel runs.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// Transient I/O failure; the caller may retry a bounded number of
    /// times before escalating.
    #[error("transient I/O error")]
    Retry,

    /// Flipped bits beyond ECC correction capability.
    #[error("uncorrectable ECC failure")]
    Uncorrectable,

    /// The driver detected a bad block during write or erase.
    #[error("bad block detected")]
    BadBlock,

    /// The driver does not provide this operation. Only reachable when
    /// mount-time capability checking was skipped.
    #[error("operation not provided by driver")]
    Unsupported,
}

/// Result of a driver call. Reads return the number of bits the driver
/// (or its hardware) corrected; `Ok(0)` means no flipped bits.
pub type IoResult<T> = Result<T, IoError>;

/// Which optional operation pairs a driver provides.
///
/// Checked once at mount against the device's layout/ECC policy; absence
/// of a mandatory pair is a configuration error, not a first-I/O surprise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpsCaps {
    /// `read_page_spare` / `write_page_spare`: raw spare access, the
    /// filesystem owns byte offsets within spare.
    pub spare_raw: bool,
    /// `read_page_spare_layout` / `write_page_spare_layout`: the driver
    /// owns the physical spare packing and exposes only tag + ECC.
    pub spare_layout: bool,
    /// `is_bad_block`: driver-maintained fast bad-block table. Without
    /// it the device layer falls back to reading the block-status byte.
    pub bad_block_probe: bool,
}

/// Low-level flash operations, implemented by each driver variant.
///
/// All addresses are chip-absolute: `block` is the erase unit, `page` the
/// page within it. Calls are synchronous and blocking; no cancellation
/// contract is exposed at this boundary.
pub trait FlashOps: Send + Sync {
    /// Driver start-up hook, run once at device construction before any
    /// cache or buffer pool is usable.
    fn init(&self) -> IoResult<()> {
        Ok(())
    }

    /// Driver shutdown hook, run once at device teardown after all pools
    /// are gone.
    fn close(&self) {}

    /// Optional operations this driver provides.
    fn caps(&self) -> OpsCaps;

    /// Read page data into `data`.
    ///
    /// In `Hw` ECC mode the driver must fill `ecc` with the ECC it read or
    /// computed; in `HwAuto` mode it corrects internally and may ignore
    /// `ecc`. When `data.len()` is less than the physical page data size,
    /// the unread tail counts as 0xFF (erased) for ECC purposes.
    ///
    /// Returns the number of flipped bits corrected.
    fn read_page_data(
        &self,
        block: BlockId,
        page: PageId,
        data: &mut [u8],
        ecc: Option<&mut [u8]>,
    ) -> IoResult<u32>;

    /// Write page data.
    ///
    /// In `Hw` ECC mode the driver must return its computed ECC through
    /// `ecc` so the filesystem can store it in spare; `HwAuto` drivers
    /// need not. `Err(BadBlock)` reports a bad block detected while
    /// programming.
    fn write_page_data(
        &self,
        block: BlockId,
        page: PageId,
        data: &[u8],
        ecc: Option<&mut [u8]>,
    ) -> IoResult<()>;

    /// Read the raw spare region. Mandatory when the layout mode is
    /// [`crate::LayoutMode::Fs`].
    fn read_page_spare(&self, block: BlockId, page: PageId, spare: &mut [u8]) -> IoResult<u32> {
        let _ = (block, page, spare);
        Err(IoError::Unsupported)
    }

    /// Write the raw spare region. Mandatory when the layout mode is
    /// [`crate::LayoutMode::Fs`].
    fn write_page_spare(&self, block: BlockId, page: PageId, spare: &[u8]) -> IoResult<()> {
        let _ = (block, page, spare);
        Err(IoError::Unsupported)
    }

    /// Read spare with the driver unpacking its native layout directly
    /// into packed tag bytes and ECC. Mandatory when the layout mode is
    /// [`crate::LayoutMode::Flash`].
    fn read_page_spare_layout(
        &self,
        block: BlockId,
        page: PageId,
        tag: &mut [u8],
        ecc: Option<&mut [u8]>,
    ) -> IoResult<u32> {
        let _ = (block, page, tag, ecc);
        Err(IoError::Unsupported)
    }

    /// Write spare with the driver packing tag bytes and ECC into its
    /// native layout. Mandatory when the layout mode is
    /// [`crate::LayoutMode::Flash`].
    fn write_page_spare_layout(
        &self,
        block: BlockId,
        page: PageId,
        tag: &[u8],
        ecc: Option<&[u8]>,
    ) -> IoResult<()> {
        let _ = (block, page, tag, ecc);
        Err(IoError::Unsupported)
    }

    /// Fast bad-block probe from a driver-maintained table.
    ///
    /// Optional: when absent the device layer reads the block-status byte
    /// at `block_status_offs` in the spare of the block's first page.
    fn is_bad_block(&self, block: BlockId) -> IoResult<bool> {
        let _ = block;
        Err(IoError::Unsupported)
    }

    /// Mark a block bad. Marking an already-bad block is not an error.
    fn mark_bad_block(&self, block: BlockId) -> IoResult<()>;

    /// Erase a block. `Err(BadBlock)` reports a bad block detected during
    /// erase; `Err(Retry)` covers unknown, possibly transient failures.
    fn erase_block(&self, block: BlockId) -> IoResult<()>;
}
