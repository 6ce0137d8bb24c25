//! Registrations: a plan bound to a trigger

use crate::stats::{RegistrationStats, StatsSnapshot};
use crate::stream::{StreamConsumer, StreamInfo};
use crate::trigger::Trigger;
use gears_core::{ExecutionId, RegistrationId};
use gears_executor::{ExecutionMode, ExecutionOptions};
use gears_plan::{Plan, ReaderInput};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle state of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationState {
    Active,
    Paused,
    /// Stopped by its failure policy
    Aborted,
    /// Unregistered
    Dead,
}

impl RegistrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RegistrationState::Aborted | RegistrationState::Dead)
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Active => write!(f, "ACTIVE"),
            RegistrationState::Paused => write!(f, "PAUSED"),
            RegistrationState::Aborted => write!(f, "ABORTED"),
            RegistrationState::Dead => write!(f, "DEAD"),
        }
    }
}

/// A plan bound to a trigger, spawning executions each time it fires
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: RegistrationId,
    pub plan: Arc<Plan>,
    pub trigger: Trigger,
    pub mode: ExecutionMode,
    pub description: Option<String>,
    pub state: RegistrationState,
    pub(crate) stats: RegistrationStats,
    /// Executions created and not yet finished
    pub(crate) live: Vec<ExecutionId>,
    /// Finished executions still held in the execution table, oldest first
    pub(crate) done: VecDeque<ExecutionId>,
    /// Fires handed out and not yet tracked
    pub(crate) reserved: usize,
    /// Key events that fired while the registration was at capacity
    pub(crate) backlog: VecDeque<ReaderInput>,
    pub(crate) streams: BTreeMap<String, StreamConsumer>,
    pub(crate) retry_at: Option<Instant>,
}

impl Registration {
    pub fn new(
        id: RegistrationId,
        plan: Arc<Plan>,
        trigger: Trigger,
        mode: ExecutionMode,
        description: Option<String>,
    ) -> Self {
        Self {
            id,
            plan,
            trigger,
            mode,
            description,
            state: RegistrationState::Active,
            stats: RegistrationStats::new(),
            live: Vec::new(),
            done: VecDeque::new(),
            reserved: 0,
            backlog: VecDeque::new(),
            streams: BTreeMap::new(),
            retry_at: None,
        }
    }

    pub fn stats(&self) -> &RegistrationStats {
        &self.stats
    }

    pub fn is_active(&self) -> bool {
        self.state == RegistrationState::Active
    }

    /// Options of every execution this registration spawns
    pub fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions::new(self.mode)
    }

    /// Executions currently held for this registration
    pub fn tracked(&self) -> usize {
        self.live.len() + self.done.len() + self.reserved
    }

    pub fn executions(&self) -> Vec<ExecutionId> {
        self.live.iter().chain(self.done.iter()).cloned().collect()
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamConsumer> {
        self.streams.values()
    }

    /// Make room for one more execution under `cap`, 0 meaning no cap
    ///
    /// Finished executions beyond the cap are pushed to `drops`. Returns
    /// false when the cap is held by executions still running; with `force`
    /// the reservation is taken anyway.
    pub(crate) fn reserve(&mut self, cap: usize, force: bool, drops: &mut Vec<ExecutionId>) -> bool {
        if cap > 0 {
            while self.tracked() >= cap {
                match self.done.pop_front() {
                    Some(id) => drops.push(id),
                    None => break,
                }
            }
            if self.tracked() >= cap && !force {
                return false;
            }
        }
        self.reserved += 1;
        true
    }

    pub(crate) fn track(&mut self, execution: ExecutionId) {
        self.reserved = self.reserved.saturating_sub(1);
        self.live.push(execution);
    }

    pub(crate) fn unreserve(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }

    /// Move a finished execution to the done list, trimming it to `cap`
    pub(crate) fn finish(&mut self, execution: &ExecutionId, cap: usize, drops: &mut Vec<ExecutionId>) {
        self.live.retain(|e| e != execution);
        self.done.push_back(execution.clone());
        if cap > 0 {
            while self.live.len() + self.done.len() > cap {
                match self.done.pop_front() {
                    Some(id) => drops.push(id),
                    None => break,
                }
            }
        }
    }

    /// Forget in-flight stream batches and counts; acknowledged positions stay
    pub(crate) fn reset_streams(&mut self) {
        for consumer in self.streams.values_mut() {
            consumer.release();
            consumer.reset_pending();
        }
    }

    pub fn info(&self) -> RegistrationInfo {
        RegistrationInfo {
            id: self.id.to_string(),
            reader: self.trigger.kind().to_string(),
            description: self.description.clone(),
            mode: self.mode,
            state: self.state,
            trigger: self.trigger.to_string(),
            plan: self.plan.to_string(),
            stats: self.stats.snapshot(),
            executions: self.executions().iter().map(|e| e.to_string()).collect(),
            streams: self.streams.values().map(StreamConsumer::info).collect(),
        }
    }
}

/// Serializable view of a registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub id: String,
    pub reader: String,
    pub description: Option<String>,
    pub mode: ExecutionMode,
    pub state: RegistrationState,
    pub trigger: String,
    pub plan: String,
    pub stats: StatsSnapshot,
    pub executions: Vec<String>,
    pub streams: Vec<StreamInfo>,
}
