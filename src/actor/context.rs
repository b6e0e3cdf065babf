//! Per-run op context
//!
//! One `OpContext` exists per graph execution. It carries the run's sequence
//! number, the shared failure flag with the first error recorded, and the
//! count of in-flight actor tasks the scheduler waits on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::error;

use crate::error::RuntimeError;

#[derive(Debug)]
pub struct OpContext {
    sequence: u64,
    failed: AtomicBool,
    error: Mutex<Option<RuntimeError>>,
    in_flight: Mutex<usize>,
    changed: Condvar,
}

impl OpContext {
    pub fn new(sequence: u64) -> Self {
        OpContext {
            sequence,
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
            in_flight: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Mark the run failed; only the first error is kept
    pub fn set_failed(&self, err: RuntimeError) {
        {
            let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                error!(sequence = self.sequence, category = %err.category(), "run failed: {}", err);
                *slot = Some(err);
            }
        }
        self.failed.store(true, Ordering::Release);
        self.notify();
    }

    pub fn error(&self) -> Option<RuntimeError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn in_flight_guard(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a task; the run cannot finish until the guard is dropped
    pub fn begin_task(self: &Arc<Self>) -> InFlightGuard {
        *self.in_flight_guard() += 1;
        InFlightGuard { ctx: self.clone() }
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight_guard()
    }

    /// Wake anyone blocked in [`OpContext::wait_until`]
    pub fn notify(&self) {
        let _state = self.in_flight_guard();
        self.changed.notify_all();
    }

    /// Block until `done(in_flight)` holds or `deadline` passes
    ///
    /// `done` is re-evaluated on every task completion and every
    /// [`OpContext::notify`]. Returns `false` on timeout.
    pub fn wait_until(&self, deadline: Option<Instant>, mut done: impl FnMut(usize) -> bool) -> bool {
        let mut in_flight = self.in_flight_guard();
        loop {
            if done(*in_flight) {
                return true;
            }
            match deadline {
                None => {
                    in_flight = self
                        .changed
                        .wait(in_flight)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    in_flight = self
                        .changed
                        .wait_timeout(in_flight, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}

/// Keeps a task counted as in flight until dropped
#[derive(Debug)]
pub struct InFlightGuard {
    ctx: Arc<OpContext>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.ctx.in_flight_guard();
        *in_flight = in_flight.saturating_sub(1);
        self.ctx.changed.notify_all();
    }
}
