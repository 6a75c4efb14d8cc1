//! Device layer: the mounted-flash aggregate and its service paths.
//!
//! [`Device`] owns a driver (`FlashOps`), the storage attributes, the
//! block-info cache, the page buffer pool, the task-tagged device lock,
//! and the flash statistics. The flash service methods in [`flash`]
//! (`read_page`, `write_page_combine`, `erase_block`, ...) are the only
//! way callers reach the driver.

#![forbid(unsafe_code)]

mod arena;
mod device;
mod flash;
mod info_cache;
mod lock;
mod pagebuf;

pub use device::{Device, DeviceConfig, FlashStats, PageCom};
pub use info_cache::{BlockInfoCache, PageSpare};
pub use lock::{DeviceGuard, DeviceLock};
pub use pagebuf::{BufHandle, PageBuf, PageBufPool};
