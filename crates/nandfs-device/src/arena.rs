//! Fixed-capacity slot arena with a free index list.
//!
//! Backs the block-info cache and the page buffer pool: allocation is
//! pool-based and non-fragmenting, slots are addressed by handle, and the
//! whole arena is released as one unit when dropped.

#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Arena<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Place `value` in a free slot, returning its handle, or `None`
    /// when the arena is full (the caller decides what to evict).
    pub fn insert(&mut self, value: T) -> Option<usize> {
        let idx = self.free.pop()?;
        self.slots[idx] = Some(value);
        Some(idx)
    }

    /// Vacate a slot, returning it to the free list.
    pub fn remove(&mut self, idx: usize) -> Option<T> {
        let value = self.slots.get_mut(idx)?.take();
        if value.is_some() {
            self.free.push(idx);
        }
        value
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&T> {
        self.slots.get(idx)?.as_ref()
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.slots.get_mut(idx)?.as_mut()
    }

    /// Vacate every slot.
    pub fn clear(&mut self) {
        self.free.clear();
        for (idx, slot) in self.slots.iter_mut().enumerate().rev() {
            *slot = None;
            self.free.push(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_until_full_then_recycle() {
        let mut arena: Arena<u8> = Arena::new(2);
        let a = arena.insert(10).expect("slot");
        let b = arena.insert(20).expect("slot");
        assert!(arena.is_full());
        assert_eq!(arena.insert(30), None);

        assert_eq!(arena.remove(a), Some(10));
        let c = arena.insert(30).expect("recycled slot");
        assert_eq!(arena.get(c), Some(&30));
        assert_eq!(arena.get(b), Some(&20));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn remove_vacant_slot_is_none() {
        let mut arena: Arena<u8> = Arena::new(1);
        assert_eq!(arena.remove(0), None);
        assert_eq!(arena.remove(99), None);
    }

    #[test]
    fn clear_returns_all_slots() {
        let mut arena: Arena<u8> = Arena::new(3);
        arena.insert(1);
        arena.insert(2);
        arena.clear();
        assert!(arena.is_empty());
        assert_eq!(arena.capacity(), 3);
        for v in 0..3 {
            assert!(arena.insert(v).is_some());
        }
    }
}
