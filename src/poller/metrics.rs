//! The busy-worker gauge: how many tasks the poller currently has dispatched.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// A cheaply cloneable, shareable count of currently-dispatched tasks.
#[derive(Debug, Clone, Default)]
pub struct BusyWorkers(Arc<AtomicUsize>);

impl BusyWorkers {
    /// Construct a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a task starting.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a task finishing.
    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }

    /// The current count.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_concurrent_increments_and_decrements() {
        let busy = BusyWorkers::new();
        busy.increment();
        busy.increment();
        assert_eq!(busy.get(), 2);
        busy.decrement();
        assert_eq!(busy.get(), 1);
    }

    #[test]
    fn clones_share_the_same_counter() {
        let busy = BusyWorkers::new();
        let clone = busy.clone();
        clone.increment();
        assert_eq!(busy.get(), 1);
    }
}
