//! Bounded set of flood ids already delivered, so a broadcast reaching a node twice is handled once.

use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

/// Default number of broadcast ids remembered.
pub const DEFAULT_SEEN_CAPACITY: usize = 4096;

/// Oldest ids are evicted first once `capacity` is reached.
#[derive(Debug)]
pub struct SeenIds {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl SeenIds {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SEEN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Mark `id` as seen. Returns true the first time, false for a duplicate.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        self.ids.insert(id);
        self.order.push_back(id);
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for SeenIds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_rejected() {
        let mut seen = SeenIds::new();
        let id = Uuid::new_v4();
        assert!(seen.insert(id));
        assert!(!seen.insert(id));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut seen = SeenIds::with_capacity(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        seen.insert(a);
        seen.insert(b);
        seen.insert(c);
        assert!(!seen.contains(&a));
        assert!(seen.contains(&b));
        assert!(seen.contains(&c));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn zero_capacity_still_dedups_latest() {
        let mut seen = SeenIds::with_capacity(0);
        let id = Uuid::new_v4();
        assert!(seen.insert(id));
        assert!(!seen.insert(id));
    }
}
