//! Bounded recency set of applied message identifiers
//!
//! Guards the dispatch path against at-least-once redelivery from the
//! durable bus. Remembers a fixed number of recently applied identifiers
//! and forgets the oldest ones first, so memory stays bounded no matter
//! how long the chat runs.

use std::collections::{HashSet, VecDeque};

/// Fixed-capacity set of recently seen identifiers with FIFO forgetting.
pub(crate) struct RecencySet {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecencySet {
    /// Create a set remembering at most `capacity` identifiers.
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an identifier, returning false when it is already present.
    ///
    /// Once the capacity is reached the oldest remembered identifier is
    /// forgotten to make room, after which it would be admitted again.
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_owned());
        self.seen.insert(id.to_owned());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_insert_admits() {
        let mut set = RecencySet::new(4);
        assert!(set.insert("a"));
        assert!(set.insert("b"));
    }

    #[test]
    fn test_duplicate_insert_rejects() {
        let mut set = RecencySet::new(4);
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert!(!set.insert("a"));
    }

    #[test]
    fn test_capacity_forgets_oldest_first() {
        let mut set = RecencySet::new(3);
        assert!(set.insert("a"));
        assert!(set.insert("b"));
        assert!(set.insert("c"));
        // "a" falls out to admit "d".
        assert!(set.insert("d"));
        assert!(set.insert("a"));
        // "b" fell out when "a" was readmitted; "d" remains.
        assert!(set.insert("b"));
        assert!(!set.insert("d"));
    }

    #[test]
    fn test_membership_stays_bounded() {
        let mut set = RecencySet::new(2);
        for i in 0..100 {
            assert!(set.insert(&format!("id-{}", i)));
        }
        assert_eq!(set.order.len(), 2);
        assert_eq!(set.seen.len(), 2);
    }

    #[test]
    fn test_zero_capacity_still_remembers_one() {
        let mut set = RecencySet::new(0);
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert!(set.insert("b"));
        assert!(set.insert("a"));
    }
}
