//! A reusable rendezvous point for a fixed number of threads.
//!
//! [Barrier] is entered by exactly `threads` cooperating threads. Each caller of [Barrier::enter]
//! blocks until the last one arrives, at which point every waiter is released and the barrier
//! resets itself for the next round.
//!
//! The [crate::cache::SparseCache] keeps two independent instances (one at the start and one at
//! the end of an update) so that, in between them, a single thread is known to be the only one
//! touching shared state.

use std::sync;

/// A reusable barrier for a fixed number of threads.
pub struct Barrier {
    inner: sync::Barrier,
    threads: usize,
}

impl Barrier {
    /// Create a barrier released by `threads` arrivals.
    ///
    /// # Panics
    ///
    /// Panics if `threads` is 0.
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "barrier requires at least one thread");
        Self {
            inner: sync::Barrier::new(threads),
            threads,
        }
    }

    /// The number of arrivals that release the barrier.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Block until `threads` callers (including this one) have entered, then release all of them.
    pub fn enter(&self) {
        self.inner.wait();
    }
}
