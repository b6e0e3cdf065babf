//! Outstanding stream callback accounting
//!
//! Each deferred release registered on a device stream bumps the counter and
//! drops it again when the callback runs. Callbacks only hold a `Weak`
//! reference: once the scheduler that owns the counter is gone, a late
//! callback does nothing.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct CallbackCounter {
    count: Mutex<usize>,
    drained: Condvar,
}

impl CallbackCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn count_guard(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increase(&self) {
        *self.count_guard() += 1;
    }

    pub fn decrease(&self) {
        let mut count = self.count_guard();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        *self.count_guard()
    }

    /// Wait until no callback is outstanding; `false` on timeout
    pub fn wait_drained(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.count_guard();
        while *count > 0 {
            match deadline {
                None => {
                    count = self
                        .drained
                        .wait(count)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    count = self
                        .drained
                        .wait_timeout(count, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        true
    }
}

/// Run `f` and decrement the counter, unless the counter has expired
pub fn run_counted(counter: &Weak<CallbackCounter>, f: impl FnOnce()) {
    if let Some(counter) = counter.upgrade() {
        f();
        counter.decrease();
    }
}
