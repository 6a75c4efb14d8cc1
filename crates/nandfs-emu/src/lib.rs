//! In-memory NAND emulator.
//!
//! [`SimNand`] implements the full driver surface against a RAM page
//! array with NAND program semantics (writes can only clear bits, erase
//! sets a whole block to the erased byte). Handles are cheap clones over
//! shared state, so a test can keep one handle for fault injection while
//! the device owns another.
//!
//! Fault injection covers the failure classes the device layer has to
//! handle: transient errors on the next N operations of a kind, bit
//! flips in data or spare, blocks that report bad on erase, and blocks
//! born bad.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use nandfs_flash::{
    ecc_compute, ecc_correct, EccMode, FlashOps, IoError, IoResult, Layout, LayoutMode, OpsCaps,
    StorageAttr, TAG_BYTES,
};
use nandfs_types::{BlockId, PageId, ERASED_BYTE};

/// Operation classes a queued fault can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    ReadData,
    WriteData,
    ReadSpare,
    WriteSpare,
    Erase,
    MarkBad,
}

#[derive(Debug)]
struct Fault {
    op: OpKind,
    err: IoError,
    remaining: u32,
}

#[derive(Debug, Clone)]
struct EmuPage {
    data: Vec<u8>,
    spare: Vec<u8>,
    /// Logical tag bytes for layout mode `Flash`, where the driver owns
    /// the physical packing.
    tag: [u8; TAG_BYTES],
    /// Logical ECC bytes for layout mode `Flash`.
    ecc: Vec<u8>,
}

#[derive(Debug)]
struct EmuState {
    pages: Vec<EmuPage>,
    bad: HashSet<u32>,
    erase_reports_bad: HashSet<u32>,
    erases: Vec<u32>,
    faults: Vec<Fault>,
    init_calls: u32,
    close_calls: u32,
}

impl EmuState {
    fn take_fault(&mut self, op: OpKind) -> Option<IoError> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.op == op && f.remaining > 0)?;
        fault.remaining -= 1;
        let err = fault.err;
        self.faults.retain(|f| f.remaining > 0);
        Some(err)
    }
}

/// A simulated NAND chip. Cloning yields another handle on the same
/// chip; the state lives until the last handle drops.
#[derive(Debug, Clone)]
pub struct SimNand {
    attr: StorageAttr,
    caps: OpsCaps,
    state: Arc<Mutex<EmuState>>,
}

impl SimNand {
    /// Fresh chip in the fully erased state, sized from `attr`.
    #[must_use]
    pub fn new(attr: StorageAttr) -> Self {
        let block_count = attr.total_blocks as usize;
        let page_count = block_count * attr.pages_per_block as usize;
        let blank = EmuPage {
            data: vec![ERASED_BYTE; attr.page_data_size as usize],
            spare: vec![ERASED_BYTE; attr.spare_size as usize],
            tag: [ERASED_BYTE; TAG_BYTES],
            ecc: vec![ERASED_BYTE; attr.ecc_size()],
        };
        Self {
            attr,
            caps: OpsCaps {
                spare_raw: true,
                spare_layout: true,
                bad_block_probe: true,
            },
            state: Arc::new(Mutex::new(EmuState {
                pages: vec![blank; page_count],
                bad: HashSet::new(),
                erase_reports_bad: HashSet::new(),
                erases: vec![0; block_count],
                faults: Vec::new(),
                init_calls: 0,
                close_calls: 0,
            })),
        }
    }

    /// Restrict the advertised driver surface, e.g. to exercise the
    /// status-byte fallback for bad-block checks.
    #[must_use]
    pub fn with_caps(mut self, caps: OpsCaps) -> Self {
        self.caps = caps;
        self
    }

    fn page_index(&self, block: BlockId, page: PageId) -> Option<usize> {
        if block.0 >= self.attr.total_blocks || page.0 >= self.attr.pages_per_block {
            return None;
        }
        Some((block.0 * self.attr.pages_per_block + page.0) as usize)
    }

    // ── fault injection ────────────────────────────────────────────────

    /// Fail the next `count` operations of kind `op` with `err`.
    pub fn fail_next(&self, op: OpKind, err: IoError, count: u32) {
        self.state.lock().faults.push(Fault {
            op,
            err,
            remaining: count,
        });
    }

    /// Flip one bit in a page's stored data region.
    pub fn flip_data_bit(&self, block: BlockId, page: PageId, byte: usize, bit: u8) {
        if let Some(idx) = self.page_index(block, page) {
            let mut state = self.state.lock();
            if let Some(slot) = state.pages[idx].data.get_mut(byte) {
                *slot ^= 1 << bit;
                debug!(block = block.0, page = page.0, byte, bit, "injected data bit flip");
            }
        }
    }

    /// Flip one bit in a page's stored raw spare.
    pub fn flip_spare_bit(&self, block: BlockId, page: PageId, byte: usize, bit: u8) {
        if let Some(idx) = self.page_index(block, page) {
            let mut state = self.state.lock();
            if let Some(slot) = state.pages[idx].spare.get_mut(byte) {
                *slot ^= 1 << bit;
            }
        }
    }

    /// Make `block` report bad-block on its next erase attempts.
    pub fn set_erase_reports_bad(&self, block: BlockId, yes: bool) {
        let mut state = self.state.lock();
        if yes {
            state.erase_reports_bad.insert(block.0);
        } else {
            state.erase_reports_bad.remove(&block.0);
        }
    }

    /// Put `block` in the factory bad-block table.
    pub fn set_born_bad(&self, block: BlockId) {
        self.state.lock().bad.insert(block.0);
    }

    // ── observation helpers ────────────────────────────────────────────

    #[must_use]
    pub fn is_marked_bad(&self, block: BlockId) -> bool {
        self.state.lock().bad.contains(&block.0)
    }

    /// Completed erase cycles for one block.
    #[must_use]
    pub fn erase_count(&self, block: BlockId) -> u32 {
        self.state
            .lock()
            .erases
            .get(block.0 as usize)
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn init_calls(&self) -> u32 {
        self.state.lock().init_calls
    }

    #[must_use]
    pub fn close_calls(&self) -> u32 {
        self.state.lock().close_calls
    }

    /// Raw copy of a page's stored data, bypassing the driver surface.
    #[must_use]
    pub fn raw_data(&self, block: BlockId, page: PageId) -> Vec<u8> {
        self.page_index(block, page)
            .map(|idx| self.state.lock().pages[idx].data.clone())
            .unwrap_or_default()
    }

    /// Raw copy of a page's stored spare, bypassing the driver surface.
    #[must_use]
    pub fn raw_spare(&self, block: BlockId, page: PageId) -> Vec<u8> {
        self.page_index(block, page)
            .map(|idx| self.state.lock().pages[idx].spare.clone())
            .unwrap_or_default()
    }

    /// Stored ECC bytes for a page, honoring the layout mode.
    fn stored_ecc(&self, state: &EmuState, idx: usize) -> Vec<u8> {
        match self.attr.layout_mode {
            LayoutMode::Fs => {
                let mut out = vec![0_u8; self.attr.ecc_size()];
                if self
                    .attr
                    .ecc_layout
                    .unpack_from(&state.pages[idx].spare, &mut out)
                    .is_err()
                {
                    out.fill(ERASED_BYTE);
                }
                out
            }
            LayoutMode::Flash => state.pages[idx].ecc.clone(),
        }
    }
}

/// NAND program semantics: bits can be cleared, never set.
fn program(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d &= s;
    }
}

impl FlashOps for SimNand {
    fn init(&self) -> IoResult<()> {
        self.state.lock().init_calls += 1;
        Ok(())
    }

    fn close(&self) {
        self.state.lock().close_calls += 1;
    }

    fn caps(&self) -> OpsCaps {
        self.caps
    }

    fn read_page_data(
        &self,
        block: BlockId,
        page: PageId,
        data: &mut [u8],
        ecc: Option<&mut [u8]>,
    ) -> IoResult<u32> {
        let Some(idx) = self.page_index(block, page) else {
            return Err(IoError::Retry);
        };
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(OpKind::ReadData) {
            return Err(err);
        }
        let len = data.len().min(state.pages[idx].data.len());
        data[..len].copy_from_slice(&state.pages[idx].data[..len]);

        // An ECC buffer on read means the caller expects driver-side
        // correction (mode `Hw`).
        if let Some(ecc_out) = ecc {
            let stored = self.stored_ecc(&state, idx);
            let flips =
                ecc_correct(&mut data[..len], &stored).map_err(|_| IoError::Uncorrectable)?;
            let copy = ecc_out.len().min(stored.len());
            ecc_out[..copy].copy_from_slice(&stored[..copy]);
            return Ok(flips);
        }
        Ok(0)
    }

    fn write_page_data(
        &self,
        block: BlockId,
        page: PageId,
        data: &[u8],
        ecc: Option<&mut [u8]>,
    ) -> IoResult<()> {
        let Some(idx) = self.page_index(block, page) else {
            return Err(IoError::Retry);
        };
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(OpKind::WriteData) {
            return Err(err);
        }
        program(&mut state.pages[idx].data, data);

        // An ECC buffer on write means the caller wants the driver's
        // computed ECC back for storage (mode `Hw`).
        if let Some(ecc_out) = ecc {
            let computed = ecc_compute(data);
            let copy = ecc_out.len().min(computed.len());
            ecc_out[..copy].copy_from_slice(&computed[..copy]);
        }
        Ok(())
    }

    fn read_page_spare(&self, block: BlockId, page: PageId, spare: &mut [u8]) -> IoResult<u32> {
        let Some(idx) = self.page_index(block, page) else {
            return Err(IoError::Retry);
        };
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(OpKind::ReadSpare) {
            return Err(err);
        }
        let len = spare.len().min(state.pages[idx].spare.len());
        spare[..len].copy_from_slice(&state.pages[idx].spare[..len]);
        Ok(0)
    }

    fn write_page_spare(&self, block: BlockId, page: PageId, spare: &[u8]) -> IoResult<()> {
        let Some(idx) = self.page_index(block, page) else {
            return Err(IoError::Retry);
        };
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(OpKind::WriteSpare) {
            return Err(err);
        }
        program(&mut state.pages[idx].spare, spare);
        Ok(())
    }

    fn read_page_spare_layout(
        &self,
        block: BlockId,
        page: PageId,
        tag: &mut [u8],
        ecc: Option<&mut [u8]>,
    ) -> IoResult<u32> {
        let Some(idx) = self.page_index(block, page) else {
            return Err(IoError::Retry);
        };
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(OpKind::ReadSpare) {
            return Err(err);
        }
        let len = tag.len().min(TAG_BYTES);
        tag[..len].copy_from_slice(&state.pages[idx].tag[..len]);
        if let Some(ecc_out) = ecc {
            let copy = ecc_out.len().min(state.pages[idx].ecc.len());
            ecc_out[..copy].copy_from_slice(&state.pages[idx].ecc[..copy]);
        }
        Ok(0)
    }

    fn write_page_spare_layout(
        &self,
        block: BlockId,
        page: PageId,
        tag: &[u8],
        ecc: Option<&[u8]>,
    ) -> IoResult<()> {
        let Some(idx) = self.page_index(block, page) else {
            return Err(IoError::Retry);
        };
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(OpKind::WriteSpare) {
            return Err(err);
        }
        let len = tag.len().min(TAG_BYTES);
        let mut staged = state.pages[idx].tag;
        program(&mut staged[..len], &tag[..len]);
        state.pages[idx].tag = staged;
        if let Some(ecc_in) = ecc {
            let page = &mut state.pages[idx];
            let copy = ecc_in.len().min(page.ecc.len());
            let mut stored = std::mem::take(&mut page.ecc);
            program(&mut stored[..copy], &ecc_in[..copy]);
            page.ecc = stored;
        }
        Ok(())
    }

    fn is_bad_block(&self, block: BlockId) -> IoResult<bool> {
        let Some(idx) = self.page_index(block, PageId(0)) else {
            return Err(IoError::Retry);
        };
        let state = self.state.lock();
        let status = state.pages[idx]
            .spare
            .get(self.attr.block_status_offs as usize)
            .copied()
            .unwrap_or(ERASED_BYTE);
        Ok(state.bad.contains(&block.0) || status != ERASED_BYTE)
    }

    fn mark_bad_block(&self, block: BlockId) -> IoResult<()> {
        let Some(idx) = self.page_index(block, PageId(0)) else {
            return Err(IoError::Retry);
        };
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(OpKind::MarkBad) {
            return Err(err);
        }
        state.bad.insert(block.0);
        let offs = self.attr.block_status_offs as usize;
        if let Some(slot) = state.pages[idx].spare.get_mut(offs) {
            *slot = 0;
        }
        Ok(())
    }

    fn erase_block(&self, block: BlockId) -> IoResult<()> {
        if block.0 >= self.attr.total_blocks {
            return Err(IoError::Retry);
        }
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(OpKind::Erase) {
            return Err(err);
        }
        if state.erase_reports_bad.contains(&block.0) {
            return Err(IoError::BadBlock);
        }
        let start = (block.0 * self.attr.pages_per_block) as usize;
        let end = start + self.attr.pages_per_block as usize;
        for page in &mut state.pages[start..end] {
            page.data.fill(ERASED_BYTE);
            page.spare.fill(ERASED_BYTE);
            page.tag = [ERASED_BYTE; TAG_BYTES];
            page.ecc.fill(ERASED_BYTE);
        }
        if let Some(count) = state.erases.get_mut(block.0 as usize) {
            *count += 1;
        }
        Ok(())
    }
}

/// Standard small-chip geometry for tests: 64 blocks of 32 pages,
/// 512-byte data + 16-byte spare, soft ECC, filesystem-owned layout.
///
/// Spare map: tag in bytes 0..5 and 6..10, status byte at 5, data ECC
/// in bytes 10..16.
#[must_use]
pub fn sim_attr() -> StorageAttr {
    StorageAttr {
        total_blocks: 64,
        page_data_size: 512,
        spare_size: 16,
        pages_per_block: 32,
        block_status_offs: 5,
        ecc_mode: EccMode::Soft,
        layout_mode: LayoutMode::Fs,
        ecc_layout: fixed_layout(&[(10, 6)]),
        s_ecc_layout: Layout::default(),
        data_layout: fixed_layout(&[(0, 5), (6, 4)]),
    }
}

/// Same chip exposed through the driver-owned spare packing.
#[must_use]
pub fn sim_attr_flash_layout() -> StorageAttr {
    StorageAttr {
        layout_mode: LayoutMode::Flash,
        ecc_layout: Layout::default(),
        data_layout: Layout::default(),
        ..sim_attr()
    }
}

fn fixed_layout(entries: &[(u8, u8)]) -> Layout {
    // Constant entries with no zero-sized run; a rejected table would
    // only produce an empty layout that mount validation refuses.
    Layout::new(entries.to_vec()).unwrap_or_default()
}
