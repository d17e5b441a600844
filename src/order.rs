//! Global piece request order.
//!
//! The scheduler walks pieces in strict priority order and may skip many
//! before finding one a given peer can serve, so the index is a sorted
//! structure it can resume from rather than a heap. Multiple torrents may
//! share one order when they share a storage capacity pool; entries then
//! carry the owning torrent's key so competitors are considered together.

use std::collections::btree_set;
use std::collections::{BTreeSet, HashMap};

use crate::layout::PieceIndex;

/// Download priority of a piece. Higher variants are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Not requested at all.
    None = 0,
    #[default]
    Normal = 1,
    High = 2,
    /// Ahead of a reader position.
    Readahead = 3,
    /// Directly after the window a reader is blocked on.
    NextReadahead = 4,
    /// A reader is blocked on this piece right now.
    Now = 5,
}

/// Identifies a piece within a (possibly shared) request order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderKey {
    /// Owning torrent, for shared-capacity orders. Single-torrent orders use 0.
    pub torrent: u64,
    pub piece: PieceIndex,
}

/// The sortable state of a piece in the request order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderState {
    pub priority: Priority,
    /// Some chunks dirty but not all; partial pieces sort first within a
    /// priority so they finish before new pieces start.
    pub partial: bool,
    /// How many peers have the piece. Rarer pieces sort first.
    pub availability: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderItem {
    pub key: OrderKey,
    pub state: OrderState,
}

impl Ord for OrderItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .state
            .priority
            .cmp(&self.state.priority)
            .then(other.state.partial.cmp(&self.state.partial))
            .then(self.state.availability.cmp(&other.state.availability))
            .then(self.key.piece.cmp(&other.key.piece))
            .then(self.key.torrent.cmp(&other.key.torrent))
    }
}

impl PartialOrd for OrderItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered index of requestable pieces.
///
/// The tree holds `(key, state)` pairs sorted by
/// `(priority desc, partial first, availability asc, piece, torrent)`;
/// a side map tracks the live state per key so that `add` and `delete`
/// are idempotent and `update` can relocate an entry.
#[derive(Debug, Default)]
pub struct PieceRequestOrder {
    tree: BTreeSet<OrderItem>,
    keys: HashMap<OrderKey, OrderState>,
}

impl PieceRequestOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert. Returns the previous state if the key was present.
    pub fn add(&mut self, key: OrderKey, state: OrderState) -> Option<OrderState> {
        let prev = self.keys.insert(key, state);
        if let Some(old) = prev {
            if old == state {
                return prev;
            }
            assert!(self.tree.remove(&OrderItem { key, state: old }));
        }
        assert!(self.tree.insert(OrderItem { key, state }));
        prev
    }

    /// Moves an existing entry. Returns true if the state changed.
    ///
    /// Only meaningful under shared-capacity orders, where entries persist
    /// while a piece is complete; panics if the key is absent.
    pub fn update(&mut self, key: OrderKey, state: OrderState) -> bool {
        let old = *self
            .keys
            .get(&key)
            .expect("update of piece not in request order");
        if old == state {
            return false;
        }
        assert!(self.tree.remove(&OrderItem { key, state: old }));
        assert!(self.tree.insert(OrderItem { key, state }));
        self.keys.insert(key, state);
        true
    }

    /// Idempotent removal. Returns true if the key was present.
    pub fn delete(&mut self, key: OrderKey) -> bool {
        match self.keys.remove(&key) {
            Some(state) => {
                assert!(self.tree.remove(&OrderItem { key, state }));
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: OrderKey) -> bool {
        self.keys.contains_key(&key)
    }

    pub fn get(&self, key: OrderKey) -> Option<OrderState> {
        self.keys.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// In-order iteration for scheduling. Callers stop early by breaking.
    pub fn iter(&self) -> btree_set::Iter<'_, OrderItem> {
        self.tree.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(piece: PieceIndex) -> OrderKey {
        OrderKey { torrent: 0, piece }
    }

    fn state(priority: Priority, partial: bool, availability: u32) -> OrderState {
        OrderState {
            priority,
            partial,
            availability,
        }
    }

    #[test]
    fn test_ordering() {
        let mut pro = PieceRequestOrder::new();
        pro.add(key(0), state(Priority::Normal, false, 5));
        pro.add(key(1), state(Priority::Normal, false, 1));
        pro.add(key(2), state(Priority::High, false, 9));
        pro.add(key(3), state(Priority::Normal, true, 5));
        pro.add(key(4), state(Priority::Now, false, 9));

        let order: Vec<_> = pro.iter().map(|i| i.key.piece).collect();
        // Priority desc, then partial first, then availability asc, then index.
        assert_eq!(order, vec![4, 2, 3, 1, 0]);
    }

    #[test]
    fn test_add_is_idempotent_upsert() {
        let mut pro = PieceRequestOrder::new();
        assert_eq!(pro.add(key(7), state(Priority::Normal, false, 2)), None);
        let prev = pro.add(key(7), state(Priority::High, false, 2));
        assert_eq!(prev, Some(state(Priority::Normal, false, 2)));
        assert_eq!(pro.len(), 1);
        assert_eq!(pro.iter().next().unwrap().state.priority, Priority::High);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut pro = PieceRequestOrder::new();
        pro.add(key(3), state(Priority::Normal, false, 0));
        assert!(pro.delete(key(3)));
        assert!(!pro.delete(key(3)));
        assert!(pro.is_empty());
    }

    #[test]
    fn test_update_moves_entry() {
        let mut pro = PieceRequestOrder::new();
        pro.add(key(0), state(Priority::Normal, false, 5));
        pro.add(key(1), state(Priority::Normal, false, 6));
        assert!(pro.update(key(1), state(Priority::Normal, false, 1)));
        assert!(!pro.update(key(1), state(Priority::Normal, false, 1)));
        let order: Vec<_> = pro.iter().map(|i| i.key.piece).collect();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_shared_order_keys_by_torrent() {
        let mut pro = PieceRequestOrder::new();
        pro.add(
            OrderKey {
                torrent: 1,
                piece: 0,
            },
            state(Priority::Normal, false, 3),
        );
        pro.add(
            OrderKey {
                torrent: 2,
                piece: 0,
            },
            state(Priority::Normal, false, 3),
        );
        assert_eq!(pro.len(), 2);
    }
}
