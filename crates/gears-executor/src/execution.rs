//! Execution state

use ahash::{AHashMap, AHashSet};
use gears_core::{ExecutionId, Record, RegistrationId, ShardId};
use gears_plan::{Plan, ReaderInput, Segment, Shuffle, StageTiming};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Error recorded when an execution is aborted on request
pub const ABORTED_ERROR: &str = "Execution was aborted";

/// Error recorded when an execution stops making progress
pub const MAX_IDLE_ERROR: &str = "Execution max idle reached";

/// Lifecycle state of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Created,
    Running,
    Done,
    Aborted,
}

impl ExecutionStatus {
    /// Done or aborted
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Done | ExecutionStatus::Aborted)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Created => write!(f, "created"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Done => write!(f, "done"),
            ExecutionStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Where an execution runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Local shard only, inline on the triggering call
    Sync,
    /// Local shard only, on the worker pool
    AsyncLocal,
    /// Every shard of the topology
    #[default]
    Async,
}

impl ExecutionMode {
    pub fn is_local(&self) -> bool {
        !matches!(self, ExecutionMode::Async)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sync => write!(f, "sync"),
            ExecutionMode::AsyncLocal => write!(f, "async_local"),
            ExecutionMode::Async => write!(f, "async"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = gears_core::GearsError;

    fn from_str(s: &str) -> gears_core::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(ExecutionMode::Sync),
            "async_local" | "asynclocal" => Ok(ExecutionMode::AsyncLocal),
            "async" => Ok(ExecutionMode::Async),
            other => Err(gears_core::GearsError::NotFound("execution mode", other.to_string())),
        }
    }
}

/// Per-execution settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionOptions {
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Stop at the first record error and abort the whole execution
    #[serde(default)]
    pub abort_on_error: bool,
    /// Overrides the configured max idle time, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_ms: Option<u64>,
}

impl ExecutionOptions {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn with_abort_on_error(mut self, abort: bool) -> Self {
        self.abort_on_error = abort;
        self
    }

    pub fn with_max_idle(mut self, idle: Duration) -> Self {
        self.max_idle_ms = Some(idle.as_millis() as u64);
        self
    }
}

/// Timing collected while an execution runs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionStats {
    pub total_duration: Option<Duration>,
    pub read_duration: Duration,
    /// Per-stage durations, filled when profiling is enabled
    pub stage_timings: Vec<StageTiming>,
}

/// One run of a plan, as tracked by one shard
///
/// The initiating shard holds the aggregated results and errors; every other
/// participant holds a copy used to drive its share of the work until the
/// initiator tells it to forget the execution.
#[derive(Debug, Clone)]
pub struct Execution {
    pub id: ExecutionId,
    pub plan: Arc<Plan>,
    pub input: ReaderInput,
    pub options: ExecutionOptions,
    pub initiator: ShardId,
    pub participants: Vec<ShardId>,
    pub registration: Option<RegistrationId>,
    pub status: ExecutionStatus,
    pub results: Vec<Record>,
    pub errors: Vec<String>,
    pub stats: ExecutionStats,
    pub created_at: Instant,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub(crate) last_activity: Instant,
    pub(crate) segments: Vec<Segment>,
    /// Step whose local segment finished and now waits on its shuffle barrier
    pub(crate) waiting_step: Option<usize>,
    /// A segment is queued or running on a worker
    pub(crate) busy: bool,
    pub(crate) awaiting_received: AHashSet<ShardId>,
    pub(crate) awaiting_done: AHashSet<ShardId>,
    pub(crate) unreachable: AHashSet<ShardId>,
    pub(crate) inbox: AHashMap<usize, Vec<Record>>,
    pub(crate) shuffle_done: AHashMap<usize, AHashSet<ShardId>>,
    pub(crate) finished_locally: bool,
}

impl Execution {
    pub(crate) fn new(
        id: ExecutionId,
        plan: Arc<Plan>,
        input: ReaderInput,
        options: ExecutionOptions,
        initiator: ShardId,
        participants: Vec<ShardId>,
        registration: Option<RegistrationId>,
    ) -> Self {
        let now = Instant::now();
        let segments = plan.segments();
        Self {
            id,
            plan,
            input,
            options,
            initiator,
            participants,
            registration,
            status: ExecutionStatus::Created,
            results: Vec::new(),
            errors: Vec::new(),
            stats: ExecutionStats::default(),
            created_at: now,
            started_at: None,
            finished_at: None,
            last_activity: now,
            segments,
            waiting_step: None,
            busy: false,
            awaiting_received: AHashSet::new(),
            awaiting_done: AHashSet::new(),
            unreachable: AHashSet::new(),
            inbox: AHashMap::new(),
            shuffle_done: AHashMap::new(),
            finished_locally: false,
        }
    }

    pub fn is_initiator(&self, me: &ShardId) -> bool {
        &self.initiator == me
    }

    /// Participants other than `me`
    pub fn peers(&self, me: &ShardId) -> Vec<ShardId> {
        self.participants
            .iter()
            .filter(|s| *s != me)
            .cloned()
            .collect()
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Instant::now());
        self.touch();
    }

    pub(crate) fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.busy = false;
        self.waiting_step = None;
        let now = Instant::now();
        self.finished_at = Some(now);
        self.stats.total_duration = Some(now.duration_since(self.created_at));
    }

    /// Shards `me` must hear `ShuffleDone` from before leaving `step`
    pub(crate) fn expected_senders(&self, me: &ShardId, step: usize) -> Vec<ShardId> {
        let shuffle = self.segments.get(step).and_then(|s| s.shuffle.as_ref());
        match shuffle {
            Some(Shuffle::Collect) if self.is_initiator(me) => self.peers(me),
            Some(Shuffle::Collect) => Vec::new(),
            Some(Shuffle::Repartition { .. }) => self.peers(me),
            None => Vec::new(),
        }
        .into_iter()
        .filter(|s| !self.unreachable.contains(s))
        .collect()
    }

    /// Idle limit for this execution
    pub(crate) fn max_idle(&self, default: Duration) -> Duration {
        self.options
            .max_idle_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// Snapshot for status queries
    pub fn info(&self) -> ExecutionInfo {
        ExecutionInfo {
            id: self.id.to_string(),
            status: self.status,
            mode: self.options.mode,
            plan: self.plan.to_string(),
            initiator: self.initiator.to_string(),
            registration: self.registration.as_ref().map(|r| r.to_string()),
            shards: self.participants.len(),
            results: self.results.len(),
            errors: self.errors.clone(),
            total_duration_ms: self.stats.total_duration.map(|d| d.as_millis() as u64),
            read_duration_ms: self.stats.read_duration.as_millis() as u64,
            stage_durations: self
                .stats
                .stage_timings
                .iter()
                .map(|t| (t.stage.clone(), t.duration.as_micros() as u64))
                .collect(),
        }
    }
}

/// Serializable view of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub id: String,
    pub status: ExecutionStatus,
    pub mode: ExecutionMode,
    pub plan: String,
    pub initiator: String,
    pub registration: Option<String>,
    pub shards: usize,
    pub results: usize,
    pub errors: Vec<String>,
    pub total_duration_ms: Option<u64>,
    pub read_duration_ms: u64,
    /// Stage name and duration in microseconds
    pub stage_durations: Vec<(String, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_core::RunId;
    use gears_plan::GearsBuilder;

    fn execution(plan: Plan, participants: &[&str]) -> Execution {
        Execution::new(
            ExecutionId::new(RunId::from("r"), 1),
            Arc::new(plan),
            ReaderInput::Full,
            ExecutionOptions::default(),
            ShardId::from("a"),
            participants.iter().map(|s| ShardId::from(*s)).collect(),
            None,
        )
    }

    #[test]
    fn test_expected_senders_for_collect() {
        let ex = execution(GearsBuilder::keys("*").collect().build(), &["a", "b", "c"]);
        let a = ShardId::from("a");
        let b = ShardId::from("b");
        assert_eq!(ex.expected_senders(&a, 0).len(), 2);
        assert!(ex.expected_senders(&b, 0).is_empty());
        // final segment has no barrier
        assert!(ex.expected_senders(&a, 1).is_empty());
    }

    #[test]
    fn test_expected_senders_skip_unreachable() {
        let mut ex = execution(GearsBuilder::keys("*").repartition("k").build(), &["a", "b", "c"]);
        ex.unreachable.insert(ShardId::from("c"));
        assert_eq!(ex.expected_senders(&ShardId::from("b"), 0), vec![ShardId::from("a")]);
    }

    #[test]
    fn test_finish_records_duration() {
        let mut ex = execution(GearsBuilder::keys("*").build(), &["a"]);
        assert_eq!(ex.status, ExecutionStatus::Created);
        ex.start();
        ex.finish(ExecutionStatus::Done);
        assert!(ex.status.is_terminal());
        assert!(ex.stats.total_duration.is_some());
        let info = ex.info();
        assert_eq!(info.status, ExecutionStatus::Done);
        assert_eq!(info.id, "r-1");
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("ASYNC_LOCAL".parse::<ExecutionMode>().unwrap(), ExecutionMode::AsyncLocal);
        assert!(ExecutionMode::Sync.is_local());
        assert!(!ExecutionMode::Async.is_local());
        assert!("bogus".parse::<ExecutionMode>().is_err());
    }
}
