//! Nonce history for replay protection

use std::collections::{HashSet, VecDeque};

use tether_core::Nonce;

/// Default number of nonces remembered per core
pub const DEFAULT_NONCE_CAPACITY: usize = 4096;

/// Bounded set of nonces already accepted from one peer
///
/// The oldest nonce is forgotten once `capacity` is reached.
#[derive(Clone, Debug)]
pub struct NonceHistory {
    seen: HashSet<Nonce>,
    order: VecDeque<Nonce>,
    capacity: usize,
}

impl NonceHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        NonceHistory {
            seen: HashSet::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Check if a nonce is fresh (not yet seen)
    pub fn check(&self, nonce: &Nonce) -> bool {
        !self.seen.contains(nonce)
    }

    /// Record a nonce
    /// Returns true if accepted, false if replay
    pub fn consume(&mut self, nonce: Nonce) -> bool {
        if !self.seen.insert(nonce) {
            return false;
        }

        self.order.push_back(nonce);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

impl Default for NonceHistory {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_CAPACITY)
    }
}
