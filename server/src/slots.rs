//! Slot allocation and slot bitmaps.

use crate::error::CapacityError;
use shared::list::{NodeArena, NodeId};

/// Hands out slot indices below a fixed capacity.
///
/// Fresh slots come from a high-water mark. Released slots sit out one full
/// tick before they reach the free list, so every observer sees the slot
/// vacant at least once before it can be reused.
#[derive(Debug)]
pub struct SlotPool {
    links: NodeArena<usize>,
    free: NodeId,
    retiring: Vec<usize>,
    cooling: Vec<usize>,
    high_water: usize,
    capacity: usize,
    in_use: usize,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        let mut links = NodeArena::with_capacity(capacity + 1);
        for slot in 0..capacity {
            links.add_node(slot);
        }
        let free = links.add_list(usize::MAX);
        Self {
            links,
            free,
            retiring: Vec::new(),
            cooling: Vec::new(),
            high_water: 0,
            capacity,
            in_use: 0,
        }
    }

    pub fn acquire(&mut self) -> Result<usize, CapacityError> {
        let slot = if let Some(node) = self.links.pop_front(self.free) {
            *self.links.value(node)
        } else if self.high_water < self.capacity {
            self.high_water += 1;
            self.high_water - 1
        } else {
            return Err(CapacityError(self.capacity));
        };
        self.in_use += 1;
        Ok(slot)
    }

    pub fn release(&mut self, slot: usize) {
        if slot >= self.high_water || self.retiring.contains(&slot) || self.cooling.contains(&slot) {
            return;
        }
        if let Some(node) = self.links.node(slot) {
            if self.links.is_linked(node) {
                return;
            }
        }
        self.retiring.push(slot);
        self.in_use -= 1;
    }

    /// Advances released slots one stage towards the free list.
    pub fn recycle(&mut self) {
        for slot in self.cooling.drain(..) {
            if let Some(node) = self.links.node(slot) {
                self.links.push_back(self.free, node);
            }
        }
        std::mem::swap(&mut self.cooling, &mut self.retiring);
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Fixed-size bitmap over slot indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSet {
    words: Vec<u64>,
}

impl SlotSet {
    pub fn new(size: usize) -> Self {
        Self {
            words: vec![0; size.div_ceil(64)],
        }
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.words
            .get(slot / 64)
            .is_some_and(|word| word & (1 << (slot % 64)) != 0)
    }

    /// Sets the bit, returning whether it was clear before.
    pub fn insert(&mut self, slot: usize) -> bool {
        let Some(word) = self.words.get_mut(slot / 64) else {
            return false;
        };
        let bit = 1 << (slot % 64);
        let fresh = *word & bit == 0;
        *word |= bit;
        fresh
    }

    pub fn remove(&mut self, slot: usize) {
        if let Some(word) = self.words.get_mut(slot / 64) {
            *word &= !(1 << (slot % 64));
        }
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_water_then_capacity() {
        let mut pool = SlotPool::new(3);
        assert_eq!(pool.acquire(), Ok(0));
        assert_eq!(pool.acquire(), Ok(1));
        assert_eq!(pool.acquire(), Ok(2));
        assert_eq!(pool.acquire(), Err(CapacityError(3)));
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn test_released_slot_waits_a_full_tick() {
        let mut pool = SlotPool::new(2);
        let first = pool.acquire().unwrap();
        pool.acquire().unwrap();
        pool.release(first);
        assert!(pool.acquire().is_err());

        pool.recycle();
        assert!(pool.acquire().is_err());

        pool.recycle();
        assert_eq!(pool.acquire(), Ok(first));
    }

    #[test]
    fn test_double_release_is_ignored() {
        let mut pool = SlotPool::new(4);
        let slot = pool.acquire().unwrap();
        pool.release(slot);
        pool.release(slot);
        pool.recycle();
        pool.recycle();
        pool.release(slot);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.acquire(), Ok(slot));
        assert_eq!(pool.acquire(), Ok(1));
    }

    #[test]
    fn test_free_list_is_first_in_first_out() {
        let mut pool = SlotPool::new(4);
        let slots: Vec<usize> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        pool.release(slots[2]);
        pool.release(slots[0]);
        pool.recycle();
        pool.recycle();
        assert_eq!(pool.acquire(), Ok(2));
        assert_eq!(pool.acquire(), Ok(0));
    }

    #[test]
    fn test_slot_set() {
        let mut set = SlotSet::new(2047);
        assert!(set.insert(2046));
        assert!(!set.insert(2046));
        assert!(set.contains(2046));
        assert!(!set.insert(5000));
        set.remove(2046);
        assert!(!set.contains(2046));
        set.insert(1);
        set.insert(64);
        assert_eq!(set.count(), 2);
        set.clear();
        assert_eq!(set.count(), 0);
    }
}
