//! Async wait group
//!
//! Counts outstanding units of work and lets any number of tasks wait until
//! the count drops back to zero.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct WaitGroup {
    count: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `n` outstanding units of work.
    ///
    /// Must happen before the matching `wait` starts for the work to be
    /// observed.
    pub fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    /// Marks one unit as finished, waking waiters when the count hits zero.
    ///
    /// Calling `done` more often than `add` saturates at zero.
    pub fn done(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.notify.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Waits until the count is zero.
    pub async fn wait(&self) {
        loop {
            // Register before checking so a concurrent `done` cannot be missed.
            let notified = self.notify.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}
