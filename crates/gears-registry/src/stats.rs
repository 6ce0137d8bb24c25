//! Registration run statistics

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a triggered execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure,
    Aborted,
}

/// Counters for one registration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationStats {
    triggered: u64,
    success: u64,
    failures: u64,
    aborted: u64,
    last_error: Option<String>,
    last_run: Duration,
    total_run: Duration,
    last_lag: Duration,
    total_lag: Duration,
}

impl RegistrationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the trigger fired
    pub fn record_trigger(&mut self) {
        self.triggered += 1;
    }

    /// Record a finished run
    pub fn record_run(&mut self, outcome: RunOutcome, duration: Duration) {
        match outcome {
            RunOutcome::Success => self.success += 1,
            RunOutcome::Failure => self.failures += 1,
            RunOutcome::Aborted => self.aborted += 1,
        }
        self.last_run = duration;
        self.total_run += duration;
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    /// Record the delay between a batch's first entry and its completion
    pub fn record_lag(&mut self, lag: Duration) {
        self.last_lag = lag;
        self.total_lag += lag;
    }

    pub fn triggered(&self) -> u64 {
        self.triggered
    }

    pub fn success(&self) -> u64 {
        self.success
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn aborted(&self) -> u64 {
        self.aborted
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Runs that reached an outcome
    pub fn finished(&self) -> u64 {
        self.success + self.failures + self.aborted
    }

    /// Reset all counters
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let finished = self.finished();
        let avg = |total: Duration| {
            if finished == 0 {
                0.0
            } else {
                total.as_secs_f64() * 1000.0 / finished as f64
            }
        };
        StatsSnapshot {
            num_triggered: self.triggered,
            num_success: self.success,
            num_failures: self.failures,
            num_aborted: self.aborted,
            last_error: self.last_error.clone(),
            last_run_duration_ms: self.last_run.as_millis() as u64,
            total_run_duration_ms: self.total_run.as_millis() as u64,
            avg_run_duration_ms: avg(self.total_run),
            last_batch_lag_ms: self.last_lag.as_millis() as u64,
            total_batch_lag_ms: self.total_lag.as_millis() as u64,
            avg_batch_lag_ms: avg(self.total_lag),
        }
    }
}

/// Serializable view of [`RegistrationStats`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub num_triggered: u64,
    pub num_success: u64,
    pub num_failures: u64,
    pub num_aborted: u64,
    pub last_error: Option<String>,
    pub last_run_duration_ms: u64,
    pub total_run_duration_ms: u64,
    pub avg_run_duration_ms: f64,
    pub last_batch_lag_ms: u64,
    pub total_batch_lag_ms: u64,
    pub avg_batch_lag_ms: f64,
}
