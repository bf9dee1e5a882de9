//! Shared utilities
//!
//! Small cross-thread primitives used by the worker threads.

use parking_lot::{Condvar, Mutex};

/// Microseconds on the monotonic clock
pub fn monotonic_time_us() -> i64 {
    let now = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .expect("CLOCK_MONOTONIC is always readable");
    now.tv_sec() * 1_000_000 + now.tv_nsec() / 1_000
}

/// One-shot completion gate between two threads
///
/// The posting side completes the point with a success flag; the waiting
/// side blocks until completion. Completion happens exactly once.
pub struct SyncPoint {
    state: Mutex<SyncState>,
    cond: Condvar,
}

struct SyncState {
    completed: bool,
    success: bool,
}

impl SyncPoint {
    /// Create an uncompleted sync point
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SyncState {
                completed: false,
                success: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Mark the point completed and wake all waiters
    pub fn complete(&self, success: bool) {
        let mut state = self.state.lock();
        assert!(!state.completed, "sync point completed twice");
        state.completed = true;
        state.success = success;
        self.cond.notify_all();
    }

    /// Block until the point completes; returns the success flag
    pub fn wait_for_completion(&self) -> bool {
        let mut state = self.state.lock();
        while !state.completed {
            self.cond.wait(&mut state);
        }
        state.success
    }
}

impl Default for SyncPoint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sync_point_carries_success_across_threads() {
        let point = Arc::new(SyncPoint::new());
        let signaller = Arc::clone(&point);

        let handle = std::thread::spawn(move || {
            signaller.complete(true);
        });

        assert!(point.wait_for_completion());
        handle.join().unwrap();
    }

    #[test]
    fn wait_after_completion_returns_immediately() {
        let point = SyncPoint::new();
        point.complete(false);
        assert!(!point.wait_for_completion());
    }
}
