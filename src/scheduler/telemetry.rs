//! Execution telemetry
//!
//! Counters are kept per actor and per run and can be exported as an
//! [`ExecutionSummary`], either as a struct or as JSON.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::actor::ActorPhase;
use crate::error::{RuntimeError, RuntimeResult};

/// Counters for one actor
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ActorStats {
    pub fires: usize,
    pub launches: usize,
    pub skipped_launches: usize,
    /// Firings abandoned because the run had already failed
    pub aborts: usize,
    pub failures: usize,
    pub messages_sent: usize,
    pub input_copies: usize,
    /// Accumulated time per phase, microseconds
    pub phase_time_us: BTreeMap<String, u64>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
struct RunStats {
    runs: usize,
    failed_runs: usize,
    total_time_us: u64,
}

/// Snapshot of everything recorded so far
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub runs: usize,
    pub failed_runs: usize,
    pub total_time_us: u64,
    pub total_fires: usize,
    pub total_launches: usize,
    pub skipped_launches: usize,
    pub actors: BTreeMap<String, ActorStats>,
}

impl ExecutionSummary {
    pub fn to_json(&self) -> RuntimeResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| RuntimeError::InternalError(format!("serialize summary: {}", e)))
    }
}

#[derive(Debug, Default)]
pub struct Telemetry {
    actors: Mutex<BTreeMap<String, ActorStats>>,
    runs: Mutex<RunStats>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_actor(&self, actor: &str, f: impl FnOnce(&mut ActorStats)) {
        let mut actors = self.actors.lock().unwrap_or_else(PoisonError::into_inner);
        match actors.get_mut(actor) {
            Some(stats) => f(stats),
            None => f(actors.entry(actor.to_string()).or_default()),
        }
    }

    fn runs(&self) -> MutexGuard<'_, RunStats> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_fire(&self, actor: &str) {
        self.with_actor(actor, |s| s.fires += 1);
    }

    pub fn record_launch(&self, actor: &str, skipped: bool) {
        self.with_actor(actor, |s| {
            if skipped {
                s.skipped_launches += 1;
            } else {
                s.launches += 1;
            }
        });
    }

    pub fn record_abort(&self, actor: &str) {
        self.with_actor(actor, |s| s.aborts += 1);
    }

    pub fn record_failure(&self, actor: &str) {
        self.with_actor(actor, |s| s.failures += 1);
    }

    pub fn record_messages(&self, actor: &str, count: usize) {
        self.with_actor(actor, |s| s.messages_sent += count);
    }

    pub fn record_copy(&self, actor: &str) {
        self.with_actor(actor, |s| s.input_copies += 1);
    }

    pub fn record_phase(&self, actor: &str, phase: ActorPhase, elapsed: Duration) {
        self.with_actor(actor, |s| {
            *s.phase_time_us.entry(phase.to_string()).or_insert(0) += elapsed.as_micros() as u64;
        });
    }

    pub fn record_run(&self, succeeded: bool, elapsed: Duration) {
        let mut runs = self.runs();
        runs.runs += 1;
        if !succeeded {
            runs.failed_runs += 1;
        }
        runs.total_time_us += elapsed.as_micros() as u64;
    }

    pub fn actor(&self, actor: &str) -> Option<ActorStats> {
        self.actors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(actor)
            .cloned()
    }

    pub fn summary(&self) -> ExecutionSummary {
        let actors = self
            .actors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let runs = self.runs().clone();
        ExecutionSummary {
            runs: runs.runs,
            failed_runs: runs.failed_runs,
            total_time_us: runs.total_time_us,
            total_fires: actors.values().map(|a| a.fires).sum(),
            total_launches: actors.values().map(|a| a.launches).sum(),
            skipped_launches: actors.values().map(|a| a.skipped_launches).sum(),
            actors,
        }
    }

    pub fn reset(&self) {
        self.actors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self.runs() = RunStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_totals() {
        let telemetry = Telemetry::new();
        telemetry.record_fire("a");
        telemetry.record_fire("b");
        telemetry.record_launch("a", false);
        telemetry.record_launch("b", true);
        telemetry.record_phase("a", ActorPhase::Launching, Duration::from_micros(7));
        telemetry.record_run(true, Duration::from_micros(50));
        telemetry.record_run(false, Duration::from_micros(10));

        let summary = telemetry.summary();
        assert_eq!(summary.runs, 2);
        assert_eq!(summary.failed_runs, 1);
        assert_eq!(summary.total_fires, 2);
        assert_eq!(summary.total_launches, 1);
        assert_eq!(summary.skipped_launches, 1);
        assert_eq!(summary.actors["a"].phase_time_us["launching"], 7);
    }

    #[test]
    fn test_summary_json() {
        let telemetry = Telemetry::new();
        telemetry.record_copy("d");
        let json = telemetry.summary().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["actors"]["d"]["input_copies"], 1);

        telemetry.reset();
        assert!(telemetry.actor("d").is_none());
    }
}
