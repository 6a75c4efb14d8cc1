//! The device aggregate: one partition, one driver, one lock.
//!
//! A [`Device`] owns everything needed to use a flash partition: the
//! storage attributes, the driver operations, the block-info cache, the
//! page buffer pool, statistics, and the reentrant device lock that
//! serializes all of it. Shared ownership is plain `Arc<Device>`;
//! teardown happens when the last holder drops, at which point the
//! driver's `close` hook runs.

use crate::info_cache::BlockInfoCache;
use crate::lock::{DeviceGuard, DeviceLock};
use crate::pagebuf::PageBufPool;
use nandfs_error::{FlashError, Result};
use nandfs_flash::{FlashOps, StorageAttr};
use nandfs_types::{BlockId, DeviceType, Partition};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use tracing::{info, warn};

/// Pool sizing and retry policy supplied at mount time.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Page buffer pool capacity.
    pub buf_max: usize,
    /// Per-group dirty buffer count that triggers a flush signal.
    pub dirty_buf_max: usize,
    /// Block-info cache capacity in blocks.
    pub cache_blocks: usize,
    /// Bounded retry count for transient driver I/O errors.
    pub max_retries: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            buf_max: 40,
            dirty_buf_max: 32,
            cache_blocks: 10,
            max_retries: 4,
        }
    }
}

/// Page geometry summary, derived once at mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCom {
    /// Page data region size.
    pub pg_data_size: u32,
    /// ECC bytes the filesystem stores per page.
    pub ecc_size: u32,
    /// Full page size (data + spare).
    pub pg_size: u32,
}

/// Monotonic flash activity counters. Never reset during the device's
/// lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashStats {
    pub block_erase_count: u64,
    pub page_write_count: u64,
    pub page_read_count: u64,
    pub spare_write_count: u64,
    pub spare_read_count: u64,
}

/// One mounted flash partition.
pub struct Device {
    dev_type: DeviceType,
    par: Partition,
    attr: Arc<StorageAttr>,
    pub(crate) ops: Box<dyn FlashOps>,
    cfg: DeviceConfig,
    com: PageCom,
    pub(crate) lock: DeviceLock,
    pub(crate) cache: Mutex<BlockInfoCache>,
    pub(crate) bufs: Mutex<PageBufPool>,
    pub(crate) stats: Mutex<FlashStats>,
    pub(crate) pending_bad: Mutex<Option<BlockId>>,
    index: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("dev_type", &self.dev_type)
            .field("par", &self.par)
            .field("com", &self.com)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Validate configuration, run the driver's `init` hook, and build
    /// the caches. Exactly one device exists per partition; the returned
    /// `Arc` is the shared handle.
    pub fn mount(
        dev_type: DeviceType,
        par: Partition,
        attr: Arc<StorageAttr>,
        ops: Box<dyn FlashOps>,
        cfg: DeviceConfig,
    ) -> Result<Arc<Self>> {
        attr.validate()?;
        let caps = ops.caps();
        attr.check_ops(caps)?;
        if !caps.bad_block_probe && !caps.spare_raw {
            return Err(FlashError::Config(
                "driver provides neither a bad-block probe nor raw spare for the status-byte fallback"
                    .into(),
            ));
        }
        if par.end.0 >= attr.total_blocks {
            return Err(FlashError::Config(format!(
                "partition end {} outside chip of {} blocks",
                par.end, attr.total_blocks
            )));
        }
        if cfg.cache_blocks == 0 {
            return Err(FlashError::Config("cache_blocks must be > 0".into()));
        }
        if cfg.max_retries == 0 {
            return Err(FlashError::Config("max_retries must be > 0".into()));
        }

        let bufs = PageBufPool::new(
            cfg.buf_max,
            cfg.dirty_buf_max,
            attr.page_data_size as usize,
        )?;
        let cache = BlockInfoCache::new(cfg.cache_blocks, attr.pages_per_block);

        ops.init()
            .map_err(|err| FlashError::Config(format!("driver init failed: {err}")))?;

        let ecc_size = attr.ecc_size() as u32;
        let com = PageCom {
            pg_data_size: attr.page_data_size,
            ecc_size,
            pg_size: attr.page_data_size + attr.spare_size,
        };

        info!(
            ?dev_type,
            start = par.start.0,
            end = par.end.0,
            ecc = ?attr.ecc_mode,
            layout = ?attr.layout_mode,
            "device mounted"
        );

        Ok(Arc::new(Self {
            dev_type,
            par,
            attr,
            ops,
            cfg,
            com,
            lock: DeviceLock::new(),
            cache: Mutex::new(cache),
            bufs: Mutex::new(bufs),
            stats: Mutex::new(FlashStats::default()),
            pending_bad: Mutex::new(None),
            index: Mutex::new(None),
        }))
    }

    #[must_use]
    pub fn dev_type(&self) -> DeviceType {
        self.dev_type
    }

    #[must_use]
    pub fn partition(&self) -> Partition {
        self.par
    }

    #[must_use]
    pub fn attr(&self) -> &StorageAttr {
        &self.attr
    }

    #[must_use]
    pub fn com(&self) -> PageCom {
        self.com
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.cfg
    }

    /// Snapshot of the activity counters.
    #[must_use]
    pub fn stats(&self) -> FlashStats {
        *self.stats.lock()
    }

    /// Acquire the device lock (reentrant from the owning task).
    pub fn lock(&self) -> DeviceGuard<'_> {
        self.lock.lock()
    }

    /// Lock re-entry depth held by the calling task.
    #[must_use]
    pub fn lock_depth(&self) -> u32 {
        self.lock.hold_depth()
    }

    /// Drain the single pending-bad-block slot.
    ///
    /// Only the most recent discovery is held; if a second bad block was
    /// found before the previous one was drained, the earlier one was
    /// overwritten (and logged).
    pub fn take_pending_bad(&self) -> Option<BlockId> {
        let _guard = self.lock.lock();
        self.pending_bad.lock().take()
    }

    pub(crate) fn record_pending_bad(&self, block: BlockId) {
        let mut slot = self.pending_bad.lock();
        if let Some(prev) = *slot {
            if prev != block {
                warn!(
                    dropped = prev.0,
                    replaced_by = block.0,
                    "pending bad block overwritten before retirement"
                );
            }
        }
        *slot = Some(block);
    }

    /// Attach the opaque index-layer handle. This core never calls into
    /// it; the index layer calls back into the device.
    pub fn attach_index(&self, handle: Arc<dyn Any + Send + Sync>) {
        let _guard = self.lock.lock();
        *self.index.lock() = Some(handle);
    }

    #[must_use]
    pub fn index_handle(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.index.lock().clone()
    }

    pub(crate) fn check_bounds(&self, block: BlockId, page: nandfs_types::PageId) -> Result<()> {
        if !self.par.contains(block) || page.0 >= self.attr.pages_per_block {
            return Err(FlashError::OutOfRange {
                block: block.0,
                page: page.0,
            });
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Pools first, then the driver's release hook.
        self.bufs.lock().clear();
        self.cache.lock().clear();
        self.ops.close();
        info!(dev_type = ?self.dev_type, start = self.par.start.0, "device released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_coherent() {
        let cfg = DeviceConfig::default();
        assert!(cfg.dirty_buf_max <= cfg.buf_max);
        assert!(cfg.cache_blocks > 0);
        assert!(cfg.max_retries > 0);
    }
}
