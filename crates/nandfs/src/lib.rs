//! Flash abstraction and block management core for NAND filesystems.
//!
//! The crates compose bottom-up:
//!
//! - [`types`]: plain identifiers and shared constants;
//! - [`error`]: the error taxonomy every layer speaks;
//! - [`flash`]: the driver contract ([`flash::FlashOps`]), storage
//!   attributes, software ECC, and the packed page tag;
//! - [`device`]: the mounted aggregate ([`device::Device`]) with the
//!   block-info cache, page buffer pool, device lock, and the flash
//!   service paths.
//!
//! A driver implements [`flash::FlashOps`], registers a
//! [`flash::StorageAttr`], and hands both to [`device::Device::mount`];
//! everything above talks to the returned device.

#![forbid(unsafe_code)]

pub use nandfs_device as device;
pub use nandfs_error as error;
pub use nandfs_flash as flash;
pub use nandfs_types as types;

pub use nandfs_device::{Device, DeviceConfig, FlashStats};
pub use nandfs_error::{FlashError, Result};
pub use nandfs_flash::{EccMode, FlashOps, LayoutMode, StorageAttr, Tag};
pub use nandfs_types::{BlockId, DeviceType, PageId, Partition, Serial};
