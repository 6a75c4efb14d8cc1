//! Flash service layer: every read/write/erase path of the device.
//!
//! All driver access funnels through here. Each operation takes the
//! device lock, runs the bounded retry loop for transient I/O errors,
//! applies the ECC policy, and keeps the block-info cache and statistics
//! coherent. Error classification follows one rule set:
//!
//! - transient errors retry up to `max_retries`, then surface as `Io`;
//! - uncorrectable data reads surface as `EccFailed` (retirement is the
//!   caller's move);
//! - uncorrectable spare reads drop the cache entry and surface as
//!   `SpareEccFailed` so the next access rescans flash;
//! - bad blocks detected by write or erase land in the pending-bad-block
//!   slot and surface as `BadBlock`.

use crate::device::Device;
use crate::info_cache::PageSpare;
use crate::pagebuf::{BufHandle, PageBuf};
use nandfs_error::{FlashError, Result};
use nandfs_flash::{
    ecc_compute, ecc_correct, EccError, EccMode, IoError, IoResult, LayoutMode, Tag, TAG_BYTES,
};
use nandfs_types::{BlockId, PageId, Serial, ERASED_BYTE};
use tracing::{debug, trace, warn};

impl Device {
    fn with_retries<T>(
        &self,
        mut op: impl FnMut() -> IoResult<T>,
    ) -> std::result::Result<T, (IoError, u32)> {
        let max = self.config().max_retries;
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(IoError::Retry) if attempts < max => {
                    warn!(attempts, "transient flash I/O error, retrying");
                }
                Err(err) => return Err((err, attempts)),
            }
        }
    }

    fn classify_read_err(
        &self,
        block: BlockId,
        page: PageId,
        err: IoError,
        attempts: u32,
    ) -> FlashError {
        match err {
            IoError::Retry => FlashError::Io {
                block: block.0,
                page: page.0,
                attempts,
            },
            IoError::Uncorrectable => {
                debug!(block = block.0, page = page.0, "uncorrectable data read");
                FlashError::EccFailed {
                    block: block.0,
                    page: page.0,
                }
            }
            IoError::BadBlock => FlashError::BadBlock { block: block.0 },
            IoError::Unsupported => {
                FlashError::Config("driver operation missing (mount check bypassed)".into())
            }
        }
    }

    fn classify_spare_err(
        &self,
        block: BlockId,
        page: PageId,
        err: IoError,
        attempts: u32,
    ) -> FlashError {
        match err {
            IoError::Uncorrectable => {
                // Metadata loss: force a rescan on the next access.
                self.cache.lock().invalidate(block);
                FlashError::SpareEccFailed {
                    block: block.0,
                    page: page.0,
                }
            }
            other => self.classify_read_err(block, page, other, attempts),
        }
    }

    fn classify_write_err(
        &self,
        block: BlockId,
        page: PageId,
        err: IoError,
        attempts: u32,
    ) -> FlashError {
        match err {
            IoError::Retry => FlashError::Io {
                block: block.0,
                page: page.0,
                attempts,
            },
            IoError::BadBlock => {
                warn!(block = block.0, page = page.0, "bad block detected while writing");
                self.record_pending_bad(block);
                self.cache.lock().invalidate(block);
                FlashError::BadBlock { block: block.0 }
            }
            IoError::Uncorrectable => FlashError::EccFailed {
                block: block.0,
                page: page.0,
            },
            IoError::Unsupported => {
                FlashError::Config("driver operation missing (mount check bypassed)".into())
            }
        }
    }

    fn read_spare_uncached(&self, block: BlockId, page: PageId) -> Result<PageSpare> {
        let attr = self.attr();
        let ecc_size = self.com().ecc_size as usize;

        let (tag_raw, ecc, flips) = match attr.layout_mode {
            LayoutMode::Fs => {
                let mut spare = vec![0_u8; attr.spare_size as usize];
                let mut flips = self
                    .with_retries(|| self.ops.read_page_spare(block, page, &mut spare))
                    .map_err(|(err, n)| self.classify_spare_err(block, page, err, n))?;
                self.stats.lock().spare_read_count += 1;

                let mut tag_raw = [0_u8; TAG_BYTES];
                attr.data_layout
                    .unpack_from(&spare, &mut tag_raw)
                    .map_err(|err| FlashError::Parse(err.to_string()))?;
                // Tag bytes carry their own soft ECC when the attr maps
                // one; repair them before the seal check so a single
                // flip is a correction, not metadata loss.
                if attr.ecc_mode == EccMode::Soft && !attr.s_ecc_layout.is_empty() {
                    let mut tag_ecc = vec![0_u8; nandfs_flash::ecc_size(TAG_BYTES)];
                    attr.s_ecc_layout
                        .unpack_from(&spare, &mut tag_ecc)
                        .map_err(|err| FlashError::Parse(err.to_string()))?;
                    flips += ecc_correct(&mut tag_raw, &tag_ecc).map_err(|_| {
                        self.cache.lock().invalidate(block);
                        FlashError::SpareEccFailed {
                            block: block.0,
                            page: page.0,
                        }
                    })?;
                }
                let mut ecc = vec![0_u8; ecc_size];
                if ecc_size > 0 {
                    attr.ecc_layout
                        .unpack_from(&spare, &mut ecc)
                        .map_err(|err| FlashError::Parse(err.to_string()))?;
                }
                (tag_raw, ecc, flips)
            }
            LayoutMode::Flash => {
                let mut tag_raw = [0_u8; TAG_BYTES];
                let mut ecc = vec![0_u8; ecc_size];
                let flips = self
                    .with_retries(|| {
                        let ecc_out = if ecc.is_empty() { None } else { Some(&mut ecc[..]) };
                        self.ops.read_page_spare_layout(block, page, &mut tag_raw, ecc_out)
                    })
                    .map_err(|(err, n)| self.classify_spare_err(block, page, err, n))?;
                self.stats.lock().spare_read_count += 1;
                (tag_raw, ecc, flips)
            }
        };

        // A broken seal is the spare-metadata-loss case: the entry must
        // not be cached and the caller gets the uncorrectable class.
        let tag = Tag::unpack(&tag_raw).map_err(|_| {
            self.cache.lock().invalidate(block);
            FlashError::SpareEccFailed {
                block: block.0,
                page: page.0,
            }
        })?;

        Ok(PageSpare {
            tag,
            ecc,
            bits_corrected: flips,
        })
    }

    fn spare_cached(&self, block: BlockId, page: PageId) -> Result<PageSpare> {
        if let Some(hit) = self.cache.lock().lookup(block, page) {
            return Ok(hit);
        }
        let spare = self.read_spare_uncached(block, page)?;
        self.cache.lock().store(block, page, spare.clone());
        Ok(spare)
    }

    /// Read one page's tag (and correction count), through the block-info
    /// cache. `None` means the page has never been programmed.
    pub fn read_page_spare(&self, block: BlockId, page: PageId) -> Result<(Option<Tag>, u32)> {
        let _guard = self.lock.lock();
        self.check_bounds(block, page)?;
        let spare = self.spare_cached(block, page)?;
        Ok((spare.tag, spare.bits_corrected))
    }

    /// Read one page's data into `data` (full data region), applying the
    /// ECC policy. Returns the number of bits corrected.
    pub fn read_page(&self, block: BlockId, page: PageId, data: &mut [u8]) -> Result<u32> {
        let _guard = self.lock.lock();
        self.check_bounds(block, page)?;
        let attr = self.attr();
        if data.len() != attr.page_data_size as usize {
            return Err(FlashError::Config(format!(
                "read buffer is {} bytes, page data region is {}",
                data.len(),
                attr.page_data_size
            )));
        }

        let flips = match attr.ecc_mode {
            EccMode::None | EccMode::HwAuto => self
                .with_retries(|| self.ops.read_page_data(block, page, data, None))
                .map_err(|(err, n)| self.classify_read_err(block, page, err, n))?,
            EccMode::Hw => {
                let mut ecc = vec![0_u8; self.com().ecc_size as usize];
                self.with_retries(|| self.ops.read_page_data(block, page, data, Some(&mut ecc)))
                    .map_err(|(err, n)| self.classify_read_err(block, page, err, n))?
            }
            EccMode::Soft => {
                let raw_flips = self
                    .with_retries(|| self.ops.read_page_data(block, page, data, None))
                    .map_err(|(err, n)| self.classify_read_err(block, page, err, n))?;
                let spare = self.spare_cached(block, page)?;
                let corrected = ecc_correct(data, &spare.ecc).map_err(|err| match err {
                    EccError::Uncorrectable => {
                        debug!(block = block.0, page = page.0, "soft ECC correction failed");
                        FlashError::EccFailed {
                            block: block.0,
                            page: page.0,
                        }
                    }
                    EccError::LengthMismatch { expected, actual } => FlashError::Config(format!(
                        "stored ECC is {actual} bytes, page needs {expected}"
                    )),
                })?;
                raw_flips + corrected
            }
        };

        self.stats.lock().page_read_count += 1;
        if flips > 0 {
            trace!(block = block.0, page = page.0, flips, "read corrected flip bits");
        }
        Ok(flips)
    }

    /// Write one page's data and its spare/tag together.
    ///
    /// Data lands before spare: the tag is what marks a page as present,
    /// so power loss between the two writes leaves the page logically
    /// absent rather than half-committed. `data` shorter than the page
    /// data region is padded with the erased byte.
    pub fn write_page_combine(
        &self,
        block: BlockId,
        page: PageId,
        data: &[u8],
        tag: Tag,
    ) -> Result<()> {
        let _guard = self.lock.lock();
        self.check_bounds(block, page)?;
        let attr = self.attr();
        let pg = attr.page_data_size as usize;
        if data.len() > pg {
            return Err(FlashError::Config(format!(
                "write of {} bytes exceeds page data region of {pg}",
                data.len()
            )));
        }

        let mut full = vec![ERASED_BYTE; pg];
        full[..data.len()].copy_from_slice(data);

        let ecc_size = self.com().ecc_size as usize;
        let mut ecc = vec![0_u8; ecc_size];
        match attr.ecc_mode {
            EccMode::Soft => {
                ecc = ecc_compute(&full);
                self.with_retries(|| self.ops.write_page_data(block, page, &full, None))
                    .map_err(|(err, n)| self.classify_write_err(block, page, err, n))?;
            }
            EccMode::Hw => {
                self.with_retries(|| {
                    self.ops.write_page_data(block, page, &full, Some(&mut ecc))
                })
                .map_err(|(err, n)| self.classify_write_err(block, page, err, n))?;
            }
            EccMode::None | EccMode::HwAuto => {
                self.with_retries(|| self.ops.write_page_data(block, page, &full, None))
                    .map_err(|(err, n)| self.classify_write_err(block, page, err, n))?;
            }
        }
        self.stats.lock().page_write_count += 1;

        let tag_raw = tag
            .pack()
            .map_err(|err| FlashError::Parse(err.to_string()))?;
        match attr.layout_mode {
            LayoutMode::Fs => {
                let mut spare = vec![ERASED_BYTE; attr.spare_size as usize];
                attr.data_layout
                    .pack_into(&tag_raw, &mut spare)
                    .map_err(|err| FlashError::Parse(err.to_string()))?;
                if ecc_size > 0 {
                    attr.ecc_layout
                        .pack_into(&ecc, &mut spare)
                        .map_err(|err| FlashError::Parse(err.to_string()))?;
                }
                if attr.ecc_mode == EccMode::Soft && !attr.s_ecc_layout.is_empty() {
                    let s_ecc = ecc_compute(&tag_raw);
                    attr.s_ecc_layout
                        .pack_into(&s_ecc, &mut spare)
                        .map_err(|err| FlashError::Parse(err.to_string()))?;
                }
                self.with_retries(|| self.ops.write_page_spare(block, page, &spare))
                    .map_err(|(err, n)| self.classify_write_err(block, page, err, n))?;
            }
            LayoutMode::Flash => {
                let ecc_opt = if ecc_size > 0 { Some(&ecc[..]) } else { None };
                self.with_retries(|| {
                    self.ops.write_page_spare_layout(block, page, &tag_raw, ecc_opt)
                })
                .map_err(|(err, n)| self.classify_write_err(block, page, err, n))?;
            }
        }
        self.stats.lock().spare_write_count += 1;

        self.cache.lock().store(
            block,
            page,
            PageSpare {
                tag: Some(tag),
                ecc,
                bits_corrected: 0,
            },
        );
        Ok(())
    }

    /// Is this block bad? Uses the driver's bad-block table when it has
    /// one, otherwise reads the block-status byte from the spare of the
    /// block's first page. An unreadable spare counts as bad.
    pub fn is_bad_block(&self, block: BlockId) -> Result<bool> {
        let _guard = self.lock.lock();
        if !self.partition().contains(block) {
            return Err(FlashError::OutOfRange {
                block: block.0,
                page: 0,
            });
        }

        if self.ops.caps().bad_block_probe {
            return self
                .with_retries(|| self.ops.is_bad_block(block))
                .map_err(|(_, n)| FlashError::Io {
                    block: block.0,
                    page: 0,
                    attempts: n,
                });
        }

        let mut spare = vec![0_u8; self.attr().spare_size as usize];
        match self.with_retries(|| self.ops.read_page_spare(block, PageId(0), &mut spare)) {
            Ok(_) => {
                self.stats.lock().spare_read_count += 1;
                Ok(!self.attr().status_byte_good(&spare))
            }
            Err((IoError::Uncorrectable, _)) => Ok(true),
            Err((_, n)) => Err(FlashError::Io {
                block: block.0,
                page: 0,
                attempts: n,
            }),
        }
    }

    /// Retire a block. Idempotent; the block's cache entry is dropped and
    /// the pending-bad-block slot is drained if it names this block.
    pub fn mark_bad_block(&self, block: BlockId) -> Result<()> {
        let _guard = self.lock.lock();
        if !self.partition().contains(block) {
            return Err(FlashError::OutOfRange {
                block: block.0,
                page: 0,
            });
        }

        warn!(block = block.0, "retiring bad block");
        self.with_retries(|| self.ops.mark_bad_block(block))
            .map_err(|_| FlashError::MarkBadFailed { block: block.0 })?;

        self.cache.lock().invalidate(block);
        let mut pending = self.pending_bad.lock();
        if *pending == Some(block) {
            *pending = None;
        }
        Ok(())
    }

    /// Erase a block, dropping its cache entry. Bad-block detection
    /// during erase records the pending-bad-block slot.
    pub fn erase_block(&self, block: BlockId) -> Result<()> {
        let _guard = self.lock.lock();
        if !self.partition().contains(block) {
            return Err(FlashError::OutOfRange {
                block: block.0,
                page: 0,
            });
        }

        // Stale either way once the erase is attempted.
        self.cache.lock().invalidate(block);

        match self.with_retries(|| self.ops.erase_block(block)) {
            Ok(()) => {
                self.stats.lock().block_erase_count += 1;
                Ok(())
            }
            Err((IoError::BadBlock, _)) => {
                warn!(block = block.0, "bad block detected during erase");
                self.record_pending_bad(block);
                Err(FlashError::BadBlock { block: block.0 })
            }
            Err((_, n)) => Err(FlashError::Io {
                block: block.0,
                page: 0,
                attempts: n,
            }),
        }
    }

    // ── page buffer pool integration ───────────────────────────────────

    /// Read a physical page into a pool buffer registered under the
    /// logical `(serial, logical_page)` address.
    pub fn read_page_into_buf(
        &self,
        block: BlockId,
        page: PageId,
        serial: Serial,
        logical_page: PageId,
    ) -> Result<BufHandle> {
        let _guard = self.lock.lock();
        let handle = self.bufs.lock().acquire(serial, logical_page)?;

        // Flash I/O happens outside the pool mutex.
        let mut data = vec![0_u8; self.com().pg_data_size as usize];
        let flips = self.read_page(block, page, &mut data)?;
        let (tag, _) = self.read_page_spare(block, page)?;

        let mut pool = self.bufs.lock();
        if let Some(buf) = pool.buf_mut(handle) {
            buf.data.copy_from_slice(&data);
            buf.data_len = tag.map_or(0, |t| usize::from(t.data_len).min(data.len()));
            buf.tag = tag;
        }
        drop(pool);
        trace!(
            block = block.0,
            page = page.0,
            serial = serial.0,
            flips,
            "page read into buffer pool"
        );
        Ok(handle)
    }

    /// Stage a write in the buffer pool, marking the buffer dirty in the
    /// group its serial selects. Returns the group index; check
    /// [`Self::group_needs_flush`] afterwards.
    pub fn stage_write(
        &self,
        serial: Serial,
        logical_page: PageId,
        data: &[u8],
        tag: Tag,
    ) -> Result<usize> {
        let _guard = self.lock.lock();
        let pg = self.com().pg_data_size as usize;
        if data.len() > pg {
            return Err(FlashError::Config(format!(
                "staged write of {} bytes exceeds page data region of {pg}",
                data.len()
            )));
        }

        let mut pool = self.bufs.lock();
        let handle = pool.acquire(serial, logical_page)?;
        if let Some(buf) = pool.buf_mut(handle) {
            buf.data.fill(ERASED_BYTE);
            buf.data[..data.len()].copy_from_slice(data);
            buf.data_len = data.len();
            buf.tag = Some(tag);
        }
        let group = pool.mark_dirty(handle)?;
        if pool.needs_flush(group) {
            debug!(group, "dirty group reached flush threshold");
        }
        Ok(group)
    }

    /// Clone of a pooled buffer's current contents.
    #[must_use]
    pub fn buf_snapshot(&self, handle: BufHandle) -> Option<PageBuf> {
        let _guard = self.lock.lock();
        self.bufs.lock().buf(handle).cloned()
    }

    /// True once `group` has reached the flush threshold.
    #[must_use]
    pub fn group_needs_flush(&self, group: usize) -> bool {
        let _guard = self.lock.lock();
        self.bufs.lock().needs_flush(group)
    }

    /// Commit a dirty group to flash and return its buffers to the free
    /// list. `place` chooses the physical destination per buffer (the
    /// index layer's decision). On failure the uncommitted buffers go
    /// back to their dirty group — staged data is never dropped.
    pub fn flush_group<F>(&self, group: usize, mut place: F) -> Result<()>
    where
        F: FnMut(&PageBuf) -> (BlockId, PageId),
    {
        let _guard = self.lock.lock();
        let taken = self.bufs.lock().take_dirty(group);

        for (pos, &handle) in taken.iter().enumerate() {
            let staged = self.bufs.lock().buf(handle).cloned();
            let Some(buf) = staged else { continue };
            let Some(tag) = buf.tag else {
                self.bufs.lock().release(handle);
                continue;
            };

            let (block, page) = place(&buf);
            if let Err(err) = self.write_page_combine(block, page, &buf.data[..buf.data_len], tag)
            {
                // Re-queue this buffer and the untouched rest.
                let mut pool = self.bufs.lock();
                for &rest in &taken[pos..] {
                    let _ = pool.mark_dirty(rest);
                }
                return Err(err);
            }
            self.bufs.lock().release(handle);
        }
        Ok(())
    }
}
