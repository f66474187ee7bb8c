//! # Client Manager
//!
//! Tracks which player slots belong to connected clients and the order in
//! which the tick visits them.
//!
//! ## Slot Lifecycle
//!
//! A slot is acquired when a TCP connection is accepted, before the
//! handshake, and released on disconnect. Released slots are recycled
//! through a free list rather than immediately, so a slot index is never
//! handed to a new client while some observer may still list the previous
//! occupant.
//!
//! ## Processing Order
//!
//! Connected slots sit on an intrusive list in admission order. The tick
//! walks a snapshot of that list, so clients that leave mid-tick do not
//! disturb the walk.

use crate::error::CapacityError;
use crate::slots::SlotPool;
use shared::list::{NodeArena, NodeId};

#[derive(Debug)]
pub struct ClientManager {
    pool: SlotPool,
    links: NodeArena<()>,
    active: NodeId,
}

impl ClientManager {
    /// Creates a manager for at most `max_clients` concurrent clients.
    pub fn new(max_clients: usize) -> Self {
        let mut links = NodeArena::with_capacity(max_clients + 1);
        for _ in 0..max_clients {
            links.add_node(());
        }
        let active = links.add_list(());
        Self {
            pool: SlotPool::new(max_clients),
            links,
            active,
        }
    }

    /// Reserves a slot for a new connection.
    ///
    /// Fails with [`CapacityError`] when every slot is taken and the free
    /// list is empty; the caller rejects the connection with the
    /// server-full status.
    pub fn admit(&mut self) -> Result<usize, CapacityError> {
        let slot = self.pool.acquire()?;
        if let Some(node) = self.links.node(slot) {
            self.links.push_back(self.active, node);
        }
        Ok(slot)
    }

    /// Drops a slot from the processing order and hands it back to the pool.
    ///
    /// Releasing a slot that is not connected does nothing.
    pub fn release(&mut self, slot: usize) {
        let Some(node) = self.links.node(slot).filter(|_| slot < self.pool.capacity()) else {
            return;
        };
        if !self.links.is_linked(node) {
            return;
        }
        self.links.remove(node);
        self.pool.release(slot);
    }

    /// Returns true if `slot` currently belongs to a client.
    pub fn contains(&self, slot: usize) -> bool {
        slot < self.pool.capacity()
            && self
                .links
                .node(slot)
                .is_some_and(|node| self.links.is_linked(node))
    }

    /// Snapshot of connected slots in processing order.
    pub fn slots(&self) -> Vec<usize> {
        self.links.iter(self.active).map(NodeId::index).collect()
    }

    /// Moves released slots one stage closer to reuse. Called once at the
    /// end of every tick.
    pub fn recycle(&mut self) {
        self.pool.recycle();
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.pool.in_use()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }
}

/// Tests cover admission order, capacity enforcement and delayed slot reuse.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_manager_creation() {
        let manager = ClientManager::new(5);
        assert_eq!(manager.capacity(), 5);
        assert!(manager.is_empty());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_admit_in_order() {
        let mut manager = ClientManager::new(3);
        assert_eq!(manager.admit(), Ok(0));
        assert_eq!(manager.admit(), Ok(1));
        assert_eq!(manager.slots(), vec![0, 1]);
        assert_eq!(manager.len(), 2);
        assert!(manager.contains(1));
        assert!(!manager.contains(2));
    }

    #[test]
    fn test_admit_max_capacity() {
        let mut manager = ClientManager::new(1);
        assert!(manager.admit().is_ok());
        assert_eq!(manager.admit(), Err(CapacityError(1)));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_release_client() {
        let mut manager = ClientManager::new(2);
        let slot = manager.admit().unwrap();
        manager.release(slot);
        assert!(manager.is_empty());
        assert!(manager.slots().is_empty());
        manager.release(slot);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_released_slot_waits_a_full_tick() {
        let mut manager = ClientManager::new(1);
        let slot = manager.admit().unwrap();
        manager.release(slot);
        assert!(manager.admit().is_err());
        manager.recycle();
        assert!(manager.admit().is_err());
        manager.recycle();
        assert_eq!(manager.admit(), Ok(slot));
    }

    #[test]
    fn test_release_keeps_order_of_others() {
        let mut manager = ClientManager::new(4);
        for _ in 0..4 {
            manager.admit().unwrap();
        }
        manager.release(1);
        assert_eq!(manager.slots(), vec![0, 2, 3]);
    }
}
