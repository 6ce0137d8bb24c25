//! Registration table of one shard
//!
//! The registry decides when triggers fire and keeps the per-registration
//! bookkeeping. It does not create executions itself: every entry point
//! returns a [`RegistryOutput`] listing the executions to start
//! ([`Fire`]) and the finished executions to drop from the execution table.
//! The shard reports back with [`Registry::track`] once an execution exists
//! and with [`Registry::on_execution_finished`] when it ends.

use crate::persist::RegistrationSnapshot;
use crate::registration::{Registration, RegistrationInfo, RegistrationState};
use crate::stats::RunOutcome;
use crate::stream::StreamConsumer;
use crate::trigger::{OnFailedPolicy, StreamTrigger, Trigger};
use gears_core::{
    ExecutionId, GearsError, IdGenerator, KeyType, RegistrationId, Result, ShardStore,
};
use gears_executor::{ExecutionMode, ExecutionOptions, ExecutionStatus, FinishedExecution};
use gears_plan::{Plan, Reader, ReaderInput};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Errors starting with this prefix pause a stream registration
pub const PAUSE_ERROR_PREFIX: &str = "PAUSE";

/// An execution a trigger asks for
#[derive(Debug, Clone)]
pub struct Fire {
    pub registration: RegistrationId,
    pub plan: Arc<Plan>,
    pub input: ReaderInput,
    pub options: ExecutionOptions,
    /// Stream whose batch the execution consumes
    pub stream: Option<String>,
}

/// Work for the shard after a registry call
#[derive(Debug, Default)]
pub struct RegistryOutput {
    pub fires: Vec<Fire>,
    /// Finished executions to remove from the execution table
    pub drops: Vec<ExecutionId>,
}

impl RegistryOutput {
    pub fn is_empty(&self) -> bool {
        self.fires.is_empty() && self.drops.is_empty()
    }

    pub fn merge(&mut self, other: RegistryOutput) {
        self.fires.extend(other.fires);
        self.drops.extend(other.drops);
    }
}

pub struct Registry {
    ids: Arc<IdGenerator>,
    registrations: Vec<Registration>,
    max_per_registration: usize,
}

impl Registry {
    pub fn new(ids: Arc<IdGenerator>, max_per_registration: usize) -> Self {
        Self {
            ids,
            registrations: Vec::new(),
            max_per_registration,
        }
    }

    pub fn set_max_per_registration(&mut self, max: usize) {
        self.max_per_registration = max;
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn get(&self, id: &RegistrationId) -> Option<&Registration> {
        self.registrations.iter().find(|r| &r.id == id)
    }

    fn get_mut(&mut self, id: &RegistrationId) -> Result<&mut Registration> {
        self.registrations
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| GearsError::NotFound("registration", id.to_string()))
    }

    /// Plan of a registration, used to resolve plans sent by reference
    pub fn plan_of(&self, id: &RegistrationId) -> Option<Arc<Plan>> {
        self.get(id).map(|r| r.plan.clone())
    }

    /// Register a plan on this shard under a new id
    pub fn register(
        &mut self,
        plan: Plan,
        trigger: Trigger,
        mode: ExecutionMode,
        description: Option<String>,
        store: &dyn ShardStore,
        now: Instant,
    ) -> Result<(RegistrationId, RegistryOutput)> {
        let plan = self.bind(plan, &trigger, store)?;
        let id = self.ids.next_registration();
        let reg = Registration::new(id.clone(), Arc::new(plan), trigger, mode, description);
        info!("Registered {} on {}", id, reg.trigger);
        let output = self.insert(reg, store, now);
        Ok((id, output))
    }

    /// Install a registration created elsewhere or restored from a snapshot
    pub fn install(
        &mut self,
        snapshot: RegistrationSnapshot,
        store: &dyn ShardStore,
        now: Instant,
    ) -> Result<RegistryOutput> {
        if self.get(&snapshot.id).is_some() {
            debug!("Registration {} already installed", snapshot.id);
            return Ok(RegistryOutput::default());
        }
        let plan = self.bind(snapshot.plan, &snapshot.trigger, store)?;
        let mut reg = Registration::new(
            snapshot.id,
            Arc::new(plan),
            snapshot.trigger,
            snapshot.mode,
            snapshot.description,
        );
        reg.state = snapshot.state;
        for (stream, acked) in snapshot.stream_acks {
            reg.streams
                .insert(stream.clone(), StreamConsumer::new(stream, Some(acked)));
        }
        info!("Installed registration {} ({})", reg.id, reg.state);
        Ok(self.insert(reg, store, now))
    }

    /// Check a trigger against the plan and the existing registrations, and
    /// bind the plan's reader to the trigger
    fn bind(&self, mut plan: Plan, trigger: &Trigger, store: &dyn ShardStore) -> Result<Plan> {
        let live = || self.registrations.iter().filter(|r| !r.state.is_terminal());
        plan.reader = match (trigger, &plan.reader) {
            (Trigger::Keys(k), Reader::Keys { .. }) => Reader::Keys {
                pattern: k.prefix.clone(),
                read_value: k.read_value,
            },
            (Trigger::Stream(s), Reader::Stream { .. }) => {
                if s.batch_size == 0 {
                    return Err(GearsError::RegistrationError(
                        "batch size must be positive".to_string(),
                    ));
                }
                Reader::Stream {
                    prefix: s.prefix.clone(),
                }
            }
            (Trigger::Command { name }, Reader::Command { .. }) => {
                if live().any(|r| matches!(&r.trigger, Trigger::Command { name: n } if n == name)) {
                    return Err(GearsError::RegistrationError(
                        "trigger already registered".to_string(),
                    ));
                }
                Reader::Command {
                    trigger: name.clone(),
                }
            }
            (Trigger::Hook(hook), Reader::Command { .. }) => {
                hook.validate(store.command_info(&hook.command).as_ref())?;
                if live().any(|r| matches!(&r.trigger, Trigger::Hook(h) if h == hook)) {
                    return Err(GearsError::RegistrationError(format!(
                        "command {} is already hooked",
                        hook.command
                    )));
                }
                Reader::Command {
                    trigger: hook.command.clone(),
                }
            }
            (trigger, reader) => {
                return Err(GearsError::RegistrationError(format!(
                    "{} can not be triggered by {}",
                    reader,
                    trigger.kind()
                )))
            }
        };
        Ok(plan)
    }

    fn insert(&mut self, reg: Registration, store: &dyn ShardStore, now: Instant) -> RegistryOutput {
        let cap = self.max_per_registration;
        self.registrations.push(reg);
        let mut out = RegistryOutput::default();
        if let Some(reg) = self.registrations.last_mut() {
            if reg.is_active() {
                scan_streams(reg, cap, store, now, &mut out);
            }
        }
        out
    }

    /// A key was written or deleted
    pub fn on_key_event(
        &mut self,
        key: &str,
        event: &str,
        key_type: Option<KeyType>,
    ) -> RegistryOutput {
        let cap = self.max_per_registration;
        let mut out = RegistryOutput::default();
        for reg in &mut self.registrations {
            let Trigger::Keys(trigger) = &reg.trigger else {
                continue;
            };
            if !reg.is_active() || !trigger.should_fire(key, event, key_type) {
                continue;
            }
            reg.stats.record_trigger();
            let input = ReaderInput::KeyEvent {
                key: key.to_string(),
                event: event.to_string(),
            };
            if reg.backlog.is_empty() && reg.reserve(cap, false, &mut out.drops) {
                out.fires.push(fire(reg, input, None));
            } else {
                debug!("Registration {} at capacity, queueing event on {}", reg.id, key);
                reg.backlog.push_back(input);
            }
        }
        out
    }

    /// An entry was appended to a stream
    pub fn on_stream_added(
        &mut self,
        stream: &str,
        store: &dyn ShardStore,
        now: Instant,
    ) -> RegistryOutput {
        let cap = self.max_per_registration;
        let mut out = RegistryOutput::default();
        for reg in &mut self.registrations {
            let Trigger::Stream(trigger) = &reg.trigger else {
                continue;
            };
            if !reg.is_active() || reg.retry_at.is_some() || !trigger.matches_stream(stream) {
                continue;
            }
            match reg.streams.get_mut(stream) {
                Some(consumer) => consumer.on_added(now),
                None => {
                    let mut consumer = StreamConsumer::new(stream, None);
                    consumer.discover(store, now);
                    reg.streams.insert(stream.to_string(), consumer);
                }
            }
            pump_stream(reg, stream, cap, store, now, &mut out);
        }
        out
    }

    /// Fire a command-triggered registration by name
    pub fn trigger_command(&mut self, name: &str, args: Vec<String>) -> Result<RegistryOutput> {
        let cap = self.max_per_registration;
        let reg = self
            .registrations
            .iter_mut()
            .find(|r| matches!(&r.trigger, Trigger::Command { name: n } if n == name))
            .ok_or_else(|| GearsError::NotFound("trigger", name.to_string()))?;
        if !reg.is_active() {
            return Err(GearsError::RegistrationError(format!(
                "registration {} is {}",
                reg.id, reg.state
            )));
        }
        let mut out = RegistryOutput::default();
        reg.stats.record_trigger();
        reg.reserve(cap, true, &mut out.drops);
        out.fires.push(fire(reg, ReaderInput::Command { args }, None));
        Ok(out)
    }

    /// The hook intercepting a command invocation, if any
    ///
    /// `args[0]` is the command name.
    pub fn hook_for(&mut self, args: &[String], store: &dyn ShardStore) -> RegistryOutput {
        let cap = self.max_per_registration;
        let mut out = RegistryOutput::default();
        let Some(info) = args.first().and_then(|name| store.command_info(name)) else {
            return out;
        };
        let hooked = self.registrations.iter_mut().find(|r| {
            r.is_active() && matches!(&r.trigger, Trigger::Hook(h) if h.matches(args, &info))
        });
        if let Some(reg) = hooked {
            reg.stats.record_trigger();
            reg.reserve(cap, true, &mut out.drops);
            let input = ReaderInput::Command {
                args: args.to_vec(),
            };
            out.fires.push(fire(reg, input, None));
        }
        out
    }

    /// An execution was created for a fire
    pub fn track(&mut self, fire: &Fire, execution: &ExecutionId) {
        let Ok(reg) = self.get_mut(&fire.registration) else {
            return;
        };
        reg.track(execution.clone());
        if let Some(stream) = &fire.stream {
            if let Some(consumer) = reg.streams.get_mut(stream) {
                consumer.assign(execution.clone());
            }
        }
    }

    /// An execution spawned by a registration reached a terminal state
    pub fn on_execution_finished(
        &mut self,
        finished: &FinishedExecution,
        store: &dyn ShardStore,
        now: Instant,
    ) -> RegistryOutput {
        let cap = self.max_per_registration;
        let mut out = RegistryOutput::default();
        let Some(id) = &finished.registration else {
            return out;
        };
        let Ok(reg) = self.get_mut(id) else {
            debug!("Execution {} finished for unknown registration {}", finished.id, id);
            return out;
        };

        reg.finish(&finished.id, cap, &mut out.drops);
        let outcome = if finished.status == ExecutionStatus::Aborted {
            RunOutcome::Aborted
        } else if !finished.errors.is_empty() {
            RunOutcome::Failure
        } else {
            RunOutcome::Success
        };
        reg.stats.record_run(outcome, finished.duration);
        if let Some(error) = finished.errors.first() {
            reg.stats.record_error(error.clone());
        }

        match &reg.trigger {
            Trigger::Stream(trigger) => {
                let trigger = trigger.clone();
                stream_batch_done(reg, &trigger, finished, outcome, cap, store, now, &mut out);
            }
            Trigger::Keys(_) => drain_backlog(reg, cap, &mut out),
            _ => {}
        }
        out
    }

    pub fn pause(&mut self, id: &RegistrationId) -> Result<()> {
        let reg = self.get_mut(id)?;
        match reg.state {
            RegistrationState::Active => {
                reg.state = RegistrationState::Paused;
                info!("Paused registration {}", id);
                Ok(())
            }
            RegistrationState::Paused => Ok(()),
            state => Err(GearsError::RegistrationError(format!(
                "can not pause a {} registration",
                state
            ))),
        }
    }

    pub fn unpause(
        &mut self,
        id: &RegistrationId,
        store: &dyn ShardStore,
        now: Instant,
    ) -> Result<RegistryOutput> {
        let cap = self.max_per_registration;
        let reg = self.get_mut(id)?;
        let mut out = RegistryOutput::default();
        match reg.state {
            RegistrationState::Paused => {
                reg.state = RegistrationState::Active;
                info!("Unpaused registration {}", id);
                scan_streams(reg, cap, store, now, &mut out);
                drain_backlog(reg, cap, &mut out);
                Ok(out)
            }
            RegistrationState::Active => Ok(out),
            state => Err(GearsError::RegistrationError(format!(
                "can not unpause a {} registration",
                state
            ))),
        }
    }

    /// Remove a registration; its running executions are left to finish
    pub fn unregister(&mut self, id: &RegistrationId) -> Result<Registration> {
        let pos = self
            .registrations
            .iter()
            .position(|r| &r.id == id)
            .ok_or_else(|| GearsError::NotFound("registration", id.to_string()))?;
        let mut reg = self.registrations.remove(pos);
        reg.state = RegistrationState::Dead;
        info!("Unregistered {}", id);
        Ok(reg)
    }

    /// Reset the statistics of one registration, or of all of them
    pub fn clear_stats(&mut self, id: Option<&RegistrationId>) -> Result<()> {
        match id {
            Some(id) => self.get_mut(id)?.stats.clear(),
            None => self.registrations.iter_mut().for_each(|r| r.stats.clear()),
        }
        Ok(())
    }

    /// Run stream timers and failure retries that are due
    pub fn tick(&mut self, store: &dyn ShardStore, now: Instant) -> RegistryOutput {
        let cap = self.max_per_registration;
        let mut out = RegistryOutput::default();
        for reg in &mut self.registrations {
            if !reg.is_active() || !matches!(reg.trigger, Trigger::Stream(_)) {
                continue;
            }
            if reg.retry_at.is_some_and(|at| now >= at) {
                info!("Retrying stream registration {}", reg.id);
                reg.retry_at = None;
                scan_streams(reg, cap, store, now, &mut out);
            } else if reg.retry_at.is_none() {
                let due: Vec<String> = reg
                    .streams
                    .values()
                    .filter(|c| c.deadline().is_some_and(|d| now >= d))
                    .map(|c| c.stream().to_string())
                    .collect();
                for stream in due {
                    pump_stream(reg, &stream, cap, store, now, &mut out);
                }
            }
        }
        out
    }

    pub fn dump(&self) -> Vec<RegistrationInfo> {
        self.registrations.iter().map(Registration::info).collect()
    }

    pub fn snapshot(&self) -> Vec<RegistrationSnapshot> {
        self.registrations
            .iter()
            .map(RegistrationSnapshot::from)
            .collect()
    }

    /// Reinstall registrations after a restart
    pub fn restore(
        &mut self,
        snapshots: Vec<RegistrationSnapshot>,
        store: &dyn ShardStore,
        now: Instant,
    ) -> Result<RegistryOutput> {
        let mut out = RegistryOutput::default();
        for snapshot in snapshots {
            out.merge(self.install(snapshot, store, now)?);
        }
        Ok(out)
    }
}

fn fire(reg: &Registration, input: ReaderInput, stream: Option<String>) -> Fire {
    Fire {
        registration: reg.id.clone(),
        plan: reg.plan.clone(),
        input,
        options: reg.execution_options(),
        stream,
    }
}

/// Fire queued key events while there is room
fn drain_backlog(reg: &mut Registration, cap: usize, out: &mut RegistryOutput) {
    while reg.is_active() && !reg.backlog.is_empty() {
        if !reg.reserve(cap, false, &mut out.drops) {
            break;
        }
        if let Some(input) = reg.backlog.pop_front() {
            out.fires.push(fire(reg, input, None));
        }
    }
}

/// Recount every matching stream from its acknowledged position and start due batches
fn scan_streams(
    reg: &mut Registration,
    cap: usize,
    store: &dyn ShardStore,
    now: Instant,
    out: &mut RegistryOutput,
) {
    let Trigger::Stream(trigger) = &reg.trigger else {
        return;
    };
    let pattern = format!("{}*", trigger.prefix.trim_end_matches('*'));
    let streams: Vec<String> = store
        .scan(&pattern)
        .into_iter()
        .filter(|k| store.key_type(k) == Some(KeyType::Stream))
        .collect();
    for stream in streams {
        let consumer = reg
            .streams
            .entry(stream.clone())
            .or_insert_with(|| StreamConsumer::new(stream.clone(), None));
        if consumer.is_running() {
            continue;
        }
        consumer.rescan(store);
        pump_stream(reg, &stream, cap, store, now, out);
    }
}

/// Start the next batch of `stream` if it is due and the registration has room
fn pump_stream(
    reg: &mut Registration,
    stream: &str,
    cap: usize,
    store: &dyn ShardStore,
    now: Instant,
    out: &mut RegistryOutput,
) {
    if !reg.is_active() {
        return;
    }
    let Trigger::Stream(trigger) = &reg.trigger else {
        return;
    };
    let batch_size = trigger.batch_size;
    let duration = Duration::from_millis(trigger.duration_ms);
    let due = match reg.streams.get_mut(stream) {
        Some(consumer) if consumer.is_due(batch_size, now) => true,
        Some(consumer) => {
            consumer.arm_timer(duration, now);
            false
        }
        None => false,
    };
    if !due || !reg.reserve(cap, false, &mut out.drops) {
        return;
    }
    let batch = reg
        .streams
        .get_mut(stream)
        .and_then(|c| match c.start_batch(store, batch_size, now) {
            Some(records) => Some(records),
            None => {
                c.reset_pending();
                None
            }
        });
    match batch {
        Some(records) => {
            reg.stats.record_trigger();
            debug!(
                "Registration {} read {} entries from {}",
                reg.id,
                records.len(),
                stream
            );
            out.fires.push(fire(
                reg,
                ReaderInput::Records { records },
                Some(stream.to_string()),
            ));
        }
        None => reg.unreserve(),
    }
}

/// Apply the outcome of a stream batch, then start whatever is due
#[allow(clippy::too_many_arguments)]
fn stream_batch_done(
    reg: &mut Registration,
    trigger: &StreamTrigger,
    finished: &FinishedExecution,
    outcome: RunOutcome,
    cap: usize,
    store: &dyn ShardStore,
    now: Instant,
    out: &mut RegistryOutput,
) {
    let stream = reg
        .streams
        .values()
        .find(|c| c.runs(&finished.id))
        .map(|c| c.stream().to_string());

    let ack = match outcome {
        RunOutcome::Success => true,
        RunOutcome::Aborted => false,
        RunOutcome::Failure => {
            let pause = finished
                .errors
                .first()
                .is_some_and(|e| e.starts_with(PAUSE_ERROR_PREFIX));
            if pause || reg.state == RegistrationState::Paused {
                info!("Registration {} paused by a failed batch", reg.id);
                reg.state = RegistrationState::Paused;
                reg.reset_streams();
                return;
            }
            match trigger.on_failed_policy {
                OnFailedPolicy::Continue => true,
                OnFailedPolicy::Abort => {
                    warn!("Registration {} aborted by a failed batch", reg.id);
                    reg.state = RegistrationState::Aborted;
                    reg.reset_streams();
                    return;
                }
                OnFailedPolicy::Retry => {
                    warn!(
                        "Registration {} failed a batch, retrying in {} ms",
                        reg.id, trigger.retry_interval_ms
                    );
                    reg.reset_streams();
                    reg.retry_at = Some(now + Duration::from_millis(trigger.retry_interval_ms));
                    return;
                }
            }
        }
    };

    if let Some(consumer) = stream.as_ref().and_then(|s| reg.streams.get_mut(s)) {
        if ack {
            if let Some(lag) = consumer.ack(store, trigger.trim_stream, now) {
                reg.stats.record_lag(lag);
            }
        } else {
            consumer.release();
        }
    }

    let streams: Vec<String> = reg.streams.keys().cloned().collect();
    for stream in streams {
        pump_stream(reg, &stream, cap, store, now, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{CommandHook, KeyTrigger};
    use gears_core::{MemoryStore, RunId};
    use gears_plan::GearsBuilder;

    fn registry(cap: usize) -> Registry {
        Registry::new(Arc::new(IdGenerator::new(RunId::from("run"))), cap)
    }

    fn key_plan() -> Plan {
        GearsBuilder::keys("*").for_each("count_hits").build()
    }

    fn done(fire: &Fire, id: &ExecutionId, errors: Vec<String>, status: ExecutionStatus) -> FinishedExecution {
        FinishedExecution {
            id: id.clone(),
            registration: Some(fire.registration.clone()),
            status,
            errors,
            duration: Duration::from_millis(1),
        }
    }

    fn eid(seq: u64) -> ExecutionId {
        ExecutionId::new(RunId::from("run"), seq)
    }

    fn add(store: &MemoryStore, stream: &str, reg: &mut Registry, now: Instant) -> RegistryOutput {
        store.stream_add(stream, vec![("v".to_string(), "1".to_string())]);
        reg.on_stream_added(stream, store, now)
    }

    #[test]
    fn test_key_trigger_binds_reader() {
        let store = MemoryStore::new();
        let mut reg = registry(0);
        let trigger = Trigger::Keys(KeyTrigger::new("person:*").with_read_value(false));
        let (id, _) = reg
            .register(key_plan(), trigger, ExecutionMode::Sync, None, &store, Instant::now())
            .unwrap();
        assert_eq!(
            reg.get(&id).unwrap().plan.reader,
            Reader::Keys {
                pattern: "person:*".to_string(),
                read_value: false
            }
        );

        let out = reg.on_key_event("person:1", "set", Some(KeyType::String));
        assert_eq!(out.fires.len(), 1);
        assert_eq!(out.fires[0].options.mode, ExecutionMode::Sync);
        assert!(reg.on_key_event("animal:1", "set", None).fires.is_empty());
    }

    #[test]
    fn test_mismatched_reader_rejected() {
        let store = MemoryStore::new();
        let mut reg = registry(0);
        let err = reg.register(
            key_plan(),
            Trigger::Stream(StreamTrigger::new("s")),
            ExecutionMode::Async,
            None,
            &store,
            Instant::now(),
        );
        assert!(matches!(err, Err(GearsError::RegistrationError(_))));
    }

    #[test]
    fn test_duplicate_command_trigger_rejected() {
        let store = MemoryStore::new();
        let mut reg = registry(0);
        let plan = GearsBuilder::command("x").build();
        let trigger = Trigger::Command { name: "hello".into() };
        reg.register(plan.clone(), trigger.clone(), ExecutionMode::Sync, None, &store, Instant::now())
            .unwrap();
        let err = reg
            .register(plan, trigger, ExecutionMode::Sync, None, &store, Instant::now())
            .unwrap_err();
        assert!(err.to_string().contains("trigger already registered"));

        let out = reg.trigger_command("hello", vec!["a".into()]).unwrap();
        assert_eq!(
            out.fires[0].input,
            ReaderInput::Command {
                args: vec!["a".to_string()]
            }
        );
        assert!(reg.trigger_command("nope", vec![]).is_err());
    }

    #[test]
    fn test_hook_fires_only_for_prefix() {
        let store = MemoryStore::new();
        let mut reg = registry(0);
        let plan = GearsBuilder::command("set").build();
        let hook = Trigger::Hook(CommandHook::new("set", Some("user:".into())));
        reg.register(plan.clone(), hook.clone(), ExecutionMode::Sync, None, &store, Instant::now())
            .unwrap();
        assert!(reg
            .register(plan, hook, ExecutionMode::Sync, None, &store, Instant::now())
            .is_err());

        let hit = vec!["set".to_string(), "user:1".to_string(), "v".to_string()];
        let miss = vec!["set".to_string(), "other".to_string(), "v".to_string()];
        assert_eq!(reg.hook_for(&hit, &store).fires.len(), 1);
        assert!(reg.hook_for(&miss, &store).fires.is_empty());
    }

    #[test]
    fn test_duplicate_hook_ignores_command_case() {
        let store = MemoryStore::new();
        let mut reg = registry(0);
        let plan = GearsBuilder::command("set").build();
        let lower: Trigger = serde_json::from_str(r#"{"type":"hook","command":"set"}"#).unwrap();
        let upper: Trigger =
            serde_json::from_str(r#"{"type":"hook","command":"SET","key_prefix":"*"}"#).unwrap();
        reg.register(plan.clone(), lower, ExecutionMode::Sync, None, &store, Instant::now())
            .unwrap();
        assert!(reg
            .register(plan, upper, ExecutionMode::Sync, None, &store, Instant::now())
            .is_err());

        let call = vec!["SET".to_string(), "user:1".to_string(), "v".to_string()];
        assert_eq!(reg.hook_for(&call, &store).fires.len(), 1);
    }

    #[test]
    fn test_pause_blocks_triggers_and_unpause_resumes() {
        let store = MemoryStore::new();
        let mut reg = registry(0);
        let (id, _) = reg
            .register(
                key_plan(),
                Trigger::Keys(KeyTrigger::new("*")),
                ExecutionMode::Async,
                None,
                &store,
                Instant::now(),
            )
            .unwrap();
        reg.pause(&id).unwrap();
        assert!(reg.on_key_event("a", "set", None).fires.is_empty());
        assert_eq!(reg.get(&id).unwrap().stats().triggered(), 0);
        reg.unpause(&id, &store, Instant::now()).unwrap();
        assert_eq!(reg.on_key_event("a", "set", None).fires.len(), 1);

        let dead = reg.unregister(&id).unwrap();
        assert_eq!(dead.state, RegistrationState::Dead);
        assert!(reg.pause(&id).is_err());
    }

    #[test]
    fn test_capacity_queues_key_events() {
        let store = MemoryStore::new();
        let mut reg = registry(1);
        let (id, _) = reg
            .register(
                key_plan(),
                Trigger::Keys(KeyTrigger::new("*")),
                ExecutionMode::Async,
                None,
                &store,
                Instant::now(),
            )
            .unwrap();
        let first = reg.on_key_event("a", "set", None).fires.remove(0);
        reg.track(&first, &eid(1));
        for key in ["b", "c"] {
            assert!(reg.on_key_event(key, "set", None).fires.is_empty());
        }

        let out = reg.on_execution_finished(
            &done(&first, &eid(1), vec![], ExecutionStatus::Done),
            &store,
            Instant::now(),
        );
        assert_eq!(out.fires.len(), 1);
        assert_eq!(out.drops, vec![eid(1)]);
        assert_eq!(reg.get(&id).unwrap().tracked(), 1);
        assert_eq!(reg.get(&id).unwrap().stats().triggered(), 3);
    }

    #[test]
    fn test_stream_batches_and_acks() {
        let store = MemoryStore::new();
        let mut reg = registry(0);
        let now = Instant::now();
        let plan = GearsBuilder::stream("s").build();
        let trigger = Trigger::Stream(StreamTrigger::new("s").with_batch_size(3));
        let (id, out) = reg
            .register(plan, trigger, ExecutionMode::AsyncLocal, None, &store, now)
            .unwrap();
        assert!(out.fires.is_empty());

        assert!(add(&store, "s1", &mut reg, now).fires.is_empty());
        assert!(add(&store, "s1", &mut reg, now).fires.is_empty());
        let out = add(&store, "s1", &mut reg, now);
        assert_eq!(out.fires.len(), 1);
        let batch = &out.fires[0];
        match &batch.input {
            ReaderInput::Records { records } => assert_eq!(records.len(), 3),
            other => panic!("unexpected input {:?}", other),
        }
        reg.track(batch, &eid(7));

        reg.on_execution_finished(&done(batch, &eid(7), vec![], ExecutionStatus::Done), &store, now);
        assert_eq!(store.stream_len_after("s1", None), 0);
        let snap = reg.snapshot();
        assert_eq!(snap[0].stream_acks.len(), 1);
        assert_eq!(reg.get(&id).unwrap().stats().success(), 1);
    }

    #[test]
    fn test_stream_retry_rereads_after_interval() {
        let store = MemoryStore::new();
        let mut reg = registry(0);
        let now = Instant::now();
        let trigger = Trigger::Stream(
            StreamTrigger::new("s")
                .with_on_failed_policy(OnFailedPolicy::Retry)
                .with_retry_interval_ms(100),
        );
        reg.register(GearsBuilder::stream("s").build(), trigger, ExecutionMode::AsyncLocal, None, &store, now)
            .unwrap();
        let out = add(&store, "s1", &mut reg, now);
        let batch = out.fires[0].clone();
        reg.track(&batch, &eid(1));
        let out = reg.on_execution_finished(
            &done(&batch, &eid(1), vec!["boom".into()], ExecutionStatus::Done),
            &store,
            now,
        );
        assert!(out.fires.is_empty());
        assert_eq!(store.stream_len_after("s1", None), 1);

        assert!(reg.tick(&store, now).fires.is_empty());
        let out = reg.tick(&store, now + Duration::from_millis(200));
        assert_eq!(out.fires.len(), 1);
        assert_eq!(out.fires[0].input, batch.input);
    }

    #[test]
    fn test_pause_error_pauses_stream_registration() {
        let store = MemoryStore::new();
        let mut reg = registry(0);
        let now = Instant::now();
        let (id, _) = reg
            .register(
                GearsBuilder::stream("s").build(),
                Trigger::Stream(StreamTrigger::new("s")),
                ExecutionMode::AsyncLocal,
                None,
                &store,
                now,
            )
            .unwrap();
        let batch = add(&store, "s1", &mut reg, now).fires.remove(0);
        reg.track(&batch, &eid(1));
        reg.on_execution_finished(
            &done(&batch, &eid(1), vec!["PAUSE please".into()], ExecutionStatus::Done),
            &store,
            now,
        );
        assert_eq!(reg.get(&id).unwrap().state, RegistrationState::Paused);

        // backlog is picked up again on unpause
        add(&store, "s1", &mut reg, now);
        let out = reg.unpause(&id, &store, now).unwrap();
        match &out.fires[0].input {
            ReaderInput::Records { records } => assert_eq!(records.len(), 1),
            other => panic!("unexpected input {:?}", other),
        }
    }

    #[test]
    fn test_restore_resumes_after_ack() {
        let store = MemoryStore::new();
        let now = Instant::now();
        let mut reg = registry(0);
        reg.register(
            GearsBuilder::stream("s").build(),
            Trigger::Stream(StreamTrigger::new("s").with_trim_stream(false)),
            ExecutionMode::AsyncLocal,
            None,
            &store,
            now,
        )
        .unwrap();
        let batch = add(&store, "s1", &mut reg, now).fires.remove(0);
        reg.track(&batch, &eid(1));
        reg.on_execution_finished(&done(&batch, &eid(1), vec![], ExecutionStatus::Done), &store, now);
        store.stream_add("s1", vec![("v".to_string(), "2".to_string())]);

        let mut restored = registry(0);
        let out = restored.restore(reg.snapshot(), &store, now).unwrap();
        assert_eq!(out.fires.len(), 1);
        match &out.fires[0].input {
            ReaderInput::Records { records } => assert_eq!(records.len(), 1),
            other => panic!("unexpected input {:?}", other),
        }
    }
}
