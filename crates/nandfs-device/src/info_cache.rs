//! Block-info cache: per-block snapshots of spare/tag metadata.
//!
//! Avoids re-reading spare for every page access. Entries live in a
//! fixed-capacity arena with a HashMap index and an LRU queue; when the
//! arena is full the least-recently-used entry is evicted as one unit.
//! Erase or bad-block retirement invalidates the affected entry
//! immediately, so the next access re-reads flash.

use crate::arena::Arena;
use nandfs_flash::Tag;
use nandfs_types::{BlockId, PageId};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// Cached spare metadata for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSpare {
    /// `None` for an erased (never programmed) page.
    pub tag: Option<Tag>,
    /// Stored page-data ECC gathered from spare (empty when the ECC mode
    /// keeps ECC out of the filesystem).
    pub ecc: Vec<u8>,
    /// Bits corrected while reading this spare.
    pub bits_corrected: u32,
}

#[derive(Debug)]
struct BlockInfo {
    block: BlockId,
    pages: Vec<Option<PageSpare>>,
}

/// Bounded cache of block spare metadata with LRU eviction.
///
/// Invariant: at most one live entry per block id.
#[derive(Debug)]
pub struct BlockInfoCache {
    arena: Arena<BlockInfo>,
    index: HashMap<BlockId, usize>,
    lru: VecDeque<BlockId>,
    pages_per_block: usize,
}

impl BlockInfoCache {
    #[must_use]
    pub fn new(capacity: usize, pages_per_block: u32) -> Self {
        Self {
            arena: Arena::new(capacity),
            index: HashMap::with_capacity(capacity),
            lru: VecDeque::with_capacity(capacity),
            pages_per_block: pages_per_block as usize,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub fn contains(&self, block: BlockId) -> bool {
        self.index.contains_key(&block)
    }

    fn touch(&mut self, block: BlockId) {
        if let Some(pos) = self.lru.iter().position(|&b| b == block) {
            let _ = self.lru.remove(pos);
        }
        self.lru.push_back(block);
    }

    /// Cached spare for one page, refreshing its block's LRU position.
    pub fn lookup(&mut self, block: BlockId, page: PageId) -> Option<PageSpare> {
        let slot = *self.index.get(&block)?;
        let spare = self
            .arena
            .get(slot)?
            .pages
            .get(page.0 as usize)?
            .clone()?;
        self.touch(block);
        Some(spare)
    }

    /// Record spare metadata for one page, creating the block entry on
    /// first use and evicting the least-recently-used block when full.
    pub fn store(&mut self, block: BlockId, page: PageId, spare: PageSpare) {
        let page = page.0 as usize;
        if page >= self.pages_per_block {
            return;
        }

        let slot = match self.index.get(&block) {
            Some(&slot) => slot,
            None => match self.allocate(block) {
                Some(slot) => slot,
                // Nothing evictable; skip without touching the LRU so
                // the queue only ever names indexed blocks.
                None => return,
            },
        };
        if let Some(info) = self.arena.get_mut(slot) {
            info.pages[page] = Some(spare);
        }
        self.touch(block);
    }

    fn allocate(&mut self, block: BlockId) -> Option<usize> {
        if self.arena.is_full() {
            // Every occupied slot is indexed and LRU-queued, so a full
            // arena always yields a victim here.
            let victim = self.lru.front().copied()?;
            trace!(victim = victim.0, incoming = block.0, "block info cache eviction");
            self.invalidate(victim);
        }

        let info = BlockInfo {
            block,
            pages: vec![None; self.pages_per_block],
        };
        let slot = self.arena.insert(info)?;
        self.index.insert(block, slot);
        Some(slot)
    }

    /// Drop the entry for `block`, if cached. Subsequent access must
    /// re-read spare from flash.
    pub fn invalidate(&mut self, block: BlockId) {
        if let Some(slot) = self.index.remove(&block) {
            debug_assert_eq!(self.arena.get(slot).map(|i| i.block), Some(block));
            let _ = self.arena.remove(slot);
            if let Some(pos) = self.lru.iter().position(|&b| b == block) {
                let _ = self.lru.remove(pos);
            }
        }
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.index.clear();
        self.lru.clear();
    }
}
