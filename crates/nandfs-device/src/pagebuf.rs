//! Page buffer pool with dirty-group tracking.
//!
//! A bounded pool of page-sized buffers backing read/modify/write cycles
//! before flash commit. Every live buffer is in exactly one place: the
//! arena free list, the clean LRU, or one of the dirty groups. Dirty
//! buffers are never evicted; once a group reaches `dirty_buf_max` the
//! pool signals the caller to flush — the flush itself is driven by the
//! layer above.

use crate::arena::Arena;
use nandfs_error::{FlashError, Result};
use nandfs_flash::Tag;
use nandfs_types::{PageId, Serial, MAX_DIRTY_BUF_GROUPS};
use std::collections::{HashMap, VecDeque};
use tracing::{trace, warn};

/// Handle to one pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufHandle(usize);

/// One page buffer: data region plus its tag, keyed by the logical
/// (serial, page) address the index layer works in.
#[derive(Debug, Clone)]
pub struct PageBuf {
    pub serial: Serial,
    pub page_id: PageId,
    pub data: Vec<u8>,
    pub tag: Option<Tag>,
    /// Bytes of `data` in use.
    pub data_len: usize,
}

#[derive(Debug, Default)]
struct DirtyGroup {
    members: Vec<usize>,
}

/// Bounded page buffer pool with dirty-group classification.
#[derive(Debug)]
pub struct PageBufPool {
    page_size: usize,
    dirty_buf_max: usize,
    arena: Arena<PageBuf>,
    index: HashMap<(Serial, PageId), usize>,
    clean_lru: VecDeque<usize>,
    dirty: [DirtyGroup; MAX_DIRTY_BUF_GROUPS],
}

impl PageBufPool {
    /// `buf_max` bounds the pool, `dirty_buf_max` is the per-group flush
    /// threshold.
    pub fn new(buf_max: usize, dirty_buf_max: usize, page_size: usize) -> Result<Self> {
        if buf_max == 0 || page_size == 0 {
            return Err(FlashError::Config(
                "page buffer pool needs nonzero capacity and page size".into(),
            ));
        }
        if dirty_buf_max == 0 || dirty_buf_max > buf_max {
            return Err(FlashError::Config(format!(
                "dirty_buf_max {dirty_buf_max} outside 1..={buf_max}"
            )));
        }
        Ok(Self {
            page_size,
            dirty_buf_max,
            arena: Arena::new(buf_max),
            index: HashMap::with_capacity(buf_max),
            clean_lru: VecDeque::new(),
            dirty: Default::default(),
        })
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn dirty_buf_max(&self) -> usize {
        self.dirty_buf_max
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.arena.capacity() - self.arena.len()
    }

    /// Find a live buffer by its logical address, refreshing its LRU
    /// position when clean.
    pub fn get(&mut self, serial: Serial, page_id: PageId) -> Option<BufHandle> {
        let slot = *self.index.get(&(serial, page_id))?;
        if let Some(pos) = self.clean_lru.iter().position(|&s| s == slot) {
            let _ = self.clean_lru.remove(pos);
            self.clean_lru.push_back(slot);
        }
        Some(BufHandle(slot))
    }

    /// Find or allocate a buffer for a logical address.
    ///
    /// Allocation prefers the free list, then evicts the oldest clean
    /// buffer. Exhaustion with nothing evictable is a hard failure —
    /// dirty data is never dropped to make room.
    pub fn acquire(&mut self, serial: Serial, page_id: PageId) -> Result<BufHandle> {
        if let Some(handle) = self.get(serial, page_id) {
            return Ok(handle);
        }

        let buf = PageBuf {
            serial,
            page_id,
            data: vec![0xFF; self.page_size],
            tag: None,
            data_len: 0,
        };

        let slot = match self.arena.insert(buf) {
            Some(slot) => slot,
            None => {
                let Some(victim) = self.clean_lru.pop_front() else {
                    warn!(
                        serial = serial.0,
                        page = page_id.0,
                        "page buffer pool exhausted with all buffers dirty"
                    );
                    return Err(FlashError::PoolExhausted("page buffer pool"));
                };
                if let Some(old) = self.arena.remove(victim) {
                    trace!(
                        serial = old.serial.0,
                        page = old.page_id.0,
                        "evicted clean page buffer"
                    );
                    self.index.remove(&(old.serial, old.page_id));
                }
                let buf = PageBuf {
                    serial,
                    page_id,
                    data: vec![0xFF; self.page_size],
                    tag: None,
                    data_len: 0,
                };
                self.arena
                    .insert(buf)
                    .ok_or(FlashError::PoolExhausted("page buffer pool"))?
            }
        };

        self.index.insert((serial, page_id), slot);
        self.clean_lru.push_back(slot);
        Ok(BufHandle(slot))
    }

    #[must_use]
    pub fn buf(&self, handle: BufHandle) -> Option<&PageBuf> {
        self.arena.get(handle.0)
    }

    pub fn buf_mut(&mut self, handle: BufHandle) -> Option<&mut PageBuf> {
        self.arena.get_mut(handle.0)
    }

    /// Move a buffer into the dirty group selected by its serial.
    /// Returns the group index; re-marking an already dirty buffer keeps
    /// its membership.
    pub fn mark_dirty(&mut self, handle: BufHandle) -> Result<usize> {
        let buf = self
            .arena
            .get(handle.0)
            .ok_or(FlashError::PoolExhausted("stale buffer handle"))?;
        let group = buf.serial.dirty_group();

        if self.dirty[group].members.contains(&handle.0) {
            return Ok(group);
        }
        if let Some(pos) = self.clean_lru.iter().position(|&s| s == handle.0) {
            let _ = self.clean_lru.remove(pos);
        }
        self.dirty[group].members.push(handle.0);
        if self.dirty[group].members.len() >= self.dirty_buf_max {
            trace!(group, count = self.dirty[group].members.len(), "dirty group at flush threshold");
        }
        Ok(group)
    }

    #[must_use]
    pub fn group_count(&self, group: usize) -> usize {
        self.dirty.get(group).map_or(0, |g| g.members.len())
    }

    /// True once `group` has reached the flush threshold.
    #[must_use]
    pub fn needs_flush(&self, group: usize) -> bool {
        self.group_count(group) >= self.dirty_buf_max
    }

    /// True when any group has reached the flush threshold.
    #[must_use]
    pub fn any_needs_flush(&self) -> bool {
        (0..MAX_DIRTY_BUF_GROUPS).any(|g| self.needs_flush(g))
    }

    /// Hand a dirty group to the caller for commit. The buffers leave
    /// the group; the caller must [`Self::release`] each one after
    /// flushing it to flash.
    pub fn take_dirty(&mut self, group: usize) -> Vec<BufHandle> {
        self.dirty
            .get_mut(group)
            .map(|g| std::mem::take(&mut g.members))
            .unwrap_or_default()
            .into_iter()
            .map(BufHandle)
            .collect()
    }

    /// Return a flushed (or no longer needed clean) buffer to the free
    /// list.
    pub fn release(&mut self, handle: BufHandle) {
        for group in &mut self.dirty {
            if let Some(pos) = group.members.iter().position(|&s| s == handle.0) {
                let _ = group.members.remove(pos);
            }
        }
        if let Some(pos) = self.clean_lru.iter().position(|&s| s == handle.0) {
            let _ = self.clean_lru.remove(pos);
        }
        if let Some(buf) = self.arena.remove(handle.0) {
            self.index.remove(&(buf.serial, buf.page_id));
        }
    }

    /// Tear down every buffer. Dirty contents are discarded; only the
    /// device teardown path calls this.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.index.clear();
        self.clean_lru.clear();
        for group in &mut self.dirty {
            group.members.clear();
        }
    }
}
