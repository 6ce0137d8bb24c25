//! Execution coordinator
//!
//! The coordinator owns a shard's execution table and drives every
//! execution through `CREATED -> RUNNING -> {DONE, ABORTED}`. It performs no
//! I/O: each entry point returns the [`Action`]s the shard must carry out,
//! such as messages to send to peers or segments to hand to the worker pool.
//! Results of those actions come back through [`Coordinator::on_segment_done`],
//! [`Coordinator::on_message`] and [`Coordinator::on_delivery_failure`].
//!
//! Distributed protocol, initiator `I`, peers `P`:
//!
//! 1. `I` sends `Distribute` to every `P` and waits for all `Received`.
//! 2. `I` sends `Run`; every shard runs segment 0 over its local data.
//! 3. A segment ending in a shuffle routes its records (`ShuffleRecords`)
//!    and tells every receiver it is done (`ShuffleDone`). A shard moves to
//!    the next segment once every expected sender is done.
//! 4. Each `P` reports its errors with `ShardDone` after its last segment.
//!    `I` completes once its own last segment ran and every `P` reported,
//!    then sends `Terminate` so peers forget their copy.

use crate::execution::{
    Execution, ExecutionInfo, ExecutionMode, ExecutionOptions, ExecutionStatus, ABORTED_ERROR,
    MAX_IDLE_ERROR,
};
use crate::protocol::{ExecutionMessage, PlanSource};
use crate::table::ExecutionTable;
use crate::worker::{SegmentInput, SegmentResult, SegmentTask};
use ahash::AHashMap;
use gears_cluster::{key_hash_slot, ClusterTopology};
use gears_core::{
    ExecutionId, GearsConfig, GearsError, IdGenerator, Record, RegistrationId, Result, ShardId,
};
use gears_plan::{Plan, ReaderInput, Shuffle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Coordinator settings taken from the shard configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub max_executions: usize,
    pub max_idle: Duration,
    pub profile: bool,
}

impl From<&GearsConfig> for CoordinatorConfig {
    fn from(config: &GearsConfig) -> Self {
        Self {
            max_executions: config.max_executions,
            max_idle: config.execution_max_idle(),
            profile: config.profile_executions,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&GearsConfig::default())
    }
}

/// Outcome of an execution, reported on the initiating shard
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedExecution {
    pub id: ExecutionId,
    pub registration: Option<RegistrationId>,
    pub status: ExecutionStatus,
    pub errors: Vec<String>,
    pub duration: Duration,
}

/// Work the shard must carry out on behalf of the coordinator
#[derive(Debug, Clone)]
pub enum Action {
    Send {
        target: ShardId,
        message: ExecutionMessage,
    },
    RunSegment(SegmentTask),
    Finished(FinishedExecution),
}

/// Looks up the plan of a registration held by this shard
pub type PlanResolver<'a> = &'a dyn Fn(&RegistrationId) -> Option<Arc<Plan>>;

pub struct Coordinator {
    me: ShardId,
    ids: Arc<IdGenerator>,
    table: ExecutionTable,
    config: CoordinatorConfig,
    topology: Option<Arc<ClusterTopology>>,
}

impl Coordinator {
    pub fn new(me: ShardId, ids: Arc<IdGenerator>, config: CoordinatorConfig) -> Self {
        Self {
            me,
            ids,
            table: ExecutionTable::new(config.max_executions),
            config,
            topology: None,
        }
    }

    pub fn me(&self) -> &ShardId {
        &self.me
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: CoordinatorConfig) {
        self.table.set_max(config.max_executions);
        self.config = config;
    }

    pub fn set_topology(&mut self, topology: Arc<ClusterTopology>) {
        self.topology = Some(topology);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get(&self, id: &ExecutionId) -> Option<&Execution> {
        self.table.get(id)
    }

    pub fn status(&self, id: &ExecutionId) -> Option<ExecutionStatus> {
        self.table.get(id).map(|e| e.status)
    }

    /// Start a new execution initiated by this shard
    pub fn create(
        &mut self,
        plan: Arc<Plan>,
        input: ReaderInput,
        options: ExecutionOptions,
        registration: Option<RegistrationId>,
    ) -> (ExecutionId, Vec<Action>) {
        let participants = self.participants(options.mode);
        let id = self.ids.next_execution();
        let mut actions = self.make_room();

        let mut ex = Execution::new(
            id.clone(),
            plan,
            input,
            options,
            self.me.clone(),
            participants,
            registration,
        );

        let peers = ex.peers(&self.me);
        if peers.is_empty() {
            ex.start();
            actions.push(self.first_segment(&mut ex));
        } else {
            let source = match &ex.registration {
                Some(registration) => PlanSource::Registration(registration.clone()),
                None => PlanSource::Inline(ex.plan.as_ref().clone()),
            };
            let peer_input = match &ex.input {
                ReaderInput::Full => ReaderInput::Full,
                _ => ReaderInput::Records {
                    records: Vec::new(),
                },
            };
            for peer in &peers {
                ex.awaiting_received.insert(peer.clone());
                ex.awaiting_done.insert(peer.clone());
                actions.push(Action::Send {
                    target: peer.clone(),
                    message: ExecutionMessage::Distribute {
                        id: id.clone(),
                        plan: source.clone(),
                        input: peer_input.clone(),
                        options: ex.options.clone(),
                        participants: ex.participants.clone(),
                    },
                });
            }
        }

        debug!(
            "Created execution {} over {} shards ({})",
            id,
            ex.participants.len(),
            ex.options.mode
        );
        self.table.insert(ex);
        (id, actions)
    }

    fn participants(&self, mode: ExecutionMode) -> Vec<ShardId> {
        if mode.is_local() {
            return vec![self.me.clone()];
        }
        match &self.topology {
            Some(topology) if topology.contains(&self.me) => topology.shard_ids(),
            _ => vec![self.me.clone()],
        }
    }

    fn first_segment(&self, ex: &mut Execution) -> Action {
        ex.busy = true;
        Action::RunSegment(SegmentTask {
            id: ex.id.clone(),
            step: 0,
            plan: ex.plan.clone(),
            input: SegmentInput::Read(ex.input.clone()),
            abort_on_error: ex.options.abort_on_error,
            profile: self.config.profile,
        })
    }

    fn make_room(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        for mut evicted in self.table.make_room() {
            if evicted.status == ExecutionStatus::Created {
                warn!("Execution table full, aborting created execution {}", evicted.id);
                actions.extend(self.abort_evicted(&mut evicted));
            }
        }
        actions
    }

    fn abort_evicted(&self, ex: &mut Execution) -> Vec<Action> {
        let mut actions = Vec::new();
        abort_in_place(&self.me, ex, Some(ABORTED_ERROR), &mut actions);
        actions
    }

    /// Feed a message received from `from`
    pub fn on_message(
        &mut self,
        from: &ShardId,
        message: ExecutionMessage,
        resolve: PlanResolver<'_>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        match message {
            ExecutionMessage::Distribute {
                id,
                plan,
                input,
                options,
                participants,
            } => {
                if self.table.contains(&id) {
                    debug!("Execution {} already distributed here", id);
                    return actions;
                }
                let (plan, registration) = match plan {
                    PlanSource::Inline(plan) => (Arc::new(plan), None),
                    PlanSource::Registration(registration) => match resolve(&registration) {
                        Some(plan) => (plan, Some(registration)),
                        None => {
                            warn!(
                                "Execution {} references unknown registration {}",
                                id, registration
                            );
                            actions.push(Action::Send {
                                target: from.clone(),
                                message: ExecutionMessage::ShardDone {
                                    id,
                                    errors: vec![format!(
                                        "registration {} not found on shard {}",
                                        registration, self.me
                                    )],
                                    aborted: true,
                                },
                            });
                            return actions;
                        }
                    },
                };
                actions.extend(self.make_room());
                let ex = Execution::new(
                    id.clone(),
                    plan,
                    input,
                    options,
                    from.clone(),
                    participants,
                    registration,
                );
                self.table.insert(ex);
                actions.push(Action::Send {
                    target: from.clone(),
                    message: ExecutionMessage::Received { id },
                });
            }

            ExecutionMessage::Received { id } => {
                let me = self.me.clone();
                let profile = self.config.profile;
                let Some(ex) = self.live(&id, from) else {
                    return actions;
                };
                ex.awaiting_received.remove(from);
                ex.touch();
                maybe_start(&me, ex, profile, &mut actions);
            }

            ExecutionMessage::Run { id } => {
                let Some(ex) = self.live(&id, from) else {
                    return actions;
                };
                if ex.status == ExecutionStatus::Created {
                    ex.start();
                    let action = self.first_segment_for(&id);
                    actions.extend(action);
                }
            }

            ExecutionMessage::ShuffleRecords { id, step, records } => {
                let Some(ex) = self.live(&id, from) else {
                    return actions;
                };
                ex.inbox.entry(step).or_default().extend(records);
                ex.touch();
            }

            ExecutionMessage::ShuffleDone { id, step } => {
                let me = self.me.clone();
                let profile = self.config.profile;
                let Some(ex) = self.live(&id, from) else {
                    return actions;
                };
                ex.shuffle_done.entry(step).or_default().insert(from.clone());
                ex.touch();
                advance(&me, ex, profile, &mut actions);
            }

            ExecutionMessage::ShardDone {
                id,
                errors,
                aborted,
            } => {
                let me = self.me.clone();
                let profile = self.config.profile;
                let Some(ex) = self.live(&id, from) else {
                    return actions;
                };
                if !ex.is_initiator(&me) {
                    return actions;
                }
                ex.errors.extend(errors);
                ex.awaiting_received.remove(from);
                ex.awaiting_done.remove(from);
                ex.touch();
                if aborted {
                    info!("Shard {} aborted its part of execution {}", from, id);
                    abort_in_place(&me, ex, None, &mut actions);
                } else {
                    maybe_start(&me, ex, profile, &mut actions);
                    complete_if_ready(&me, ex, &mut actions);
                }
            }

            ExecutionMessage::Terminate { id } | ExecutionMessage::Drop { id } => {
                if self.table.get(&id).is_some_and(|e| !e.is_initiator(&self.me)) {
                    self.table.remove(&id);
                    debug!("Forgot execution {} on request of {}", id, from);
                }
            }

            ExecutionMessage::Abort { id } => {
                let me = self.me.clone();
                let Some(ex) = self.table.get_mut(&id) else {
                    debug!("Abort for unknown execution {} ignored", id);
                    return actions;
                };
                if ex.is_initiator(&me) {
                    if !ex.status.is_terminal() {
                        info!("Execution {} aborted by shard {}", id, from);
                        abort_in_place(&me, ex, Some(ABORTED_ERROR), &mut actions);
                    }
                } else {
                    self.table.remove(&id);
                    debug!("Execution {} aborted by initiator {}", id, from);
                }
            }
        }
        actions
    }

    fn first_segment_for(&mut self, id: &ExecutionId) -> Option<Action> {
        let profile = self.config.profile;
        let ex = self.table.get_mut(id)?;
        ex.busy = true;
        Some(Action::RunSegment(SegmentTask {
            id: ex.id.clone(),
            step: 0,
            plan: ex.plan.clone(),
            input: SegmentInput::Read(ex.input.clone()),
            abort_on_error: ex.options.abort_on_error,
            profile,
        }))
    }

    /// Non-terminal execution, or `None` with the message logged as ignored
    fn live(&mut self, id: &ExecutionId, from: &ShardId) -> Option<&mut Execution> {
        match self.table.get_mut(id) {
            Some(ex) if !ex.status.is_terminal() => Some(ex),
            Some(ex) => {
                debug!(
                    "Message from {} for {} execution {} ignored",
                    from, ex.status, id
                );
                None
            }
            None => {
                debug!("Message from {} for unknown execution {} ignored", from, id);
                None
            }
        }
    }

    /// Feed the result of a segment that ran on this shard
    pub fn on_segment_done(&mut self, result: SegmentResult) -> Vec<Action> {
        let mut actions = Vec::new();
        let me = self.me.clone();
        let profile = self.config.profile;
        let topology = self.topology.clone();

        let Some(ex) = self.table.get_mut(&result.id) else {
            debug!("Segment result for unknown execution {} dropped", result.id);
            return actions;
        };
        if ex.status.is_terminal() {
            debug!("Segment result for {} execution {} dropped", ex.status, ex.id);
            return actions;
        }

        ex.busy = false;
        ex.touch();
        if result.step == 0 {
            ex.stats.read_duration = result.read_duration;
        }
        ex.stats.stage_timings.extend(result.output.timings);
        ex.errors.extend(result.output.errors);

        if result.output.aborted {
            if ex.is_initiator(&me) {
                abort_in_place(&me, ex, None, &mut actions);
            } else {
                actions.push(Action::Send {
                    target: ex.initiator.clone(),
                    message: ExecutionMessage::ShardDone {
                        id: ex.id.clone(),
                        errors: ex.errors.clone(),
                        aborted: true,
                    },
                });
                let id = ex.id.clone();
                self.table.remove(&id);
            }
            return actions;
        }

        let step = result.step;
        let shuffle = ex.segments.get(step).and_then(|s| s.shuffle.clone());
        match shuffle {
            None => {
                if ex.is_initiator(&me) {
                    ex.results = result.output.records;
                    ex.finished_locally = true;
                    complete_if_ready(&me, ex, &mut actions);
                } else {
                    actions.push(Action::Send {
                        target: ex.initiator.clone(),
                        message: ExecutionMessage::ShardDone {
                            id: ex.id.clone(),
                            errors: ex.errors.clone(),
                            aborted: false,
                        },
                    });
                    ex.finish(ExecutionStatus::Done);
                }
            }
            Some(Shuffle::Collect) => {
                if ex.is_initiator(&me) {
                    ex.inbox.entry(step).or_default().extend(result.output.records);
                } else {
                    let records = result.output.records;
                    if !records.is_empty() {
                        actions.push(Action::Send {
                            target: ex.initiator.clone(),
                            message: ExecutionMessage::ShuffleRecords {
                                id: ex.id.clone(),
                                step,
                                records,
                            },
                        });
                    }
                    actions.push(Action::Send {
                        target: ex.initiator.clone(),
                        message: ExecutionMessage::ShuffleDone {
                            id: ex.id.clone(),
                            step,
                        },
                    });
                }
                ex.waiting_step = Some(step);
                advance(&me, ex, profile, &mut actions);
            }
            Some(Shuffle::Repartition { .. }) => {
                let mut routed: AHashMap<ShardId, Vec<Record>> = AHashMap::new();
                for (key, record) in result.keyed {
                    let target = route(topology.as_deref(), ex, &me, &key);
                    routed.entry(target).or_default().push(record);
                }
                if let Some(local) = routed.remove(&me) {
                    ex.inbox.entry(step).or_default().extend(local);
                }
                for peer in ex.peers(&me) {
                    if ex.unreachable.contains(&peer) {
                        continue;
                    }
                    if let Some(records) = routed.remove(&peer) {
                        actions.push(Action::Send {
                            target: peer.clone(),
                            message: ExecutionMessage::ShuffleRecords {
                                id: ex.id.clone(),
                                step,
                                records,
                            },
                        });
                    }
                    actions.push(Action::Send {
                        target: peer,
                        message: ExecutionMessage::ShuffleDone {
                            id: ex.id.clone(),
                            step,
                        },
                    });
                }
                ex.waiting_step = Some(step);
                advance(&me, ex, profile, &mut actions);
            }
        }
        actions
    }

    /// A message to `target` could not be delivered
    pub fn on_delivery_failure(&mut self, target: &ShardId, message: &ExecutionMessage) -> Vec<Action> {
        let mut actions = Vec::new();
        let me = self.me.clone();
        let profile = self.config.profile;
        let id = message.id().clone();
        let Some(ex) = self.table.get_mut(&id) else {
            return actions;
        };
        if ex.status.is_terminal() {
            return actions;
        }

        if ex.is_initiator(&me) {
            if !ex.unreachable.insert(target.clone()) {
                return actions;
            }
            warn!("Execution {} continues without shard {}", id, target);
            ex.errors.push(format!("shard {} unreachable", target));
            ex.awaiting_received.remove(target);
            ex.awaiting_done.remove(target);
            maybe_start(&me, ex, profile, &mut actions);
            advance(&me, ex, profile, &mut actions);
            complete_if_ready(&me, ex, &mut actions);
        } else if *target == ex.initiator {
            warn!(
                "Lost contact with initiator {} of execution {}, dropping local part",
                target, id
            );
            self.table.remove(&id);
        } else {
            if !ex.unreachable.insert(target.clone()) {
                return actions;
            }
            // the initiator aborts and releases the remaining peers
            warn!(
                "Execution {} lost peer {}, reporting to initiator {}",
                id, target, ex.initiator
            );
            ex.errors.push(format!("shard {} unreachable", target));
            actions.push(Action::Send {
                target: ex.initiator.clone(),
                message: ExecutionMessage::ShardDone {
                    id: id.clone(),
                    errors: ex.errors.clone(),
                    aborted: true,
                },
            });
            self.table.remove(&id);
        }
        actions
    }

    /// Abort an execution on request
    pub fn abort(&mut self, id: &ExecutionId) -> Result<Vec<Action>> {
        let me = self.me.clone();
        let ex = self
            .table
            .get_mut(id)
            .ok_or_else(|| GearsError::NotFound("execution", id.to_string()))?;
        if ex.status.is_terminal() {
            return Err(GearsError::ExecutionError(format!(
                "execution {} already {}",
                id, ex.status
            )));
        }
        let mut actions = Vec::new();
        if ex.is_initiator(&me) {
            info!("Aborting execution {}", id);
            abort_in_place(&me, ex, Some(ABORTED_ERROR), &mut actions);
        } else {
            actions.push(Action::Send {
                target: ex.initiator.clone(),
                message: ExecutionMessage::Abort { id: id.clone() },
            });
            ex.errors.push(ABORTED_ERROR.to_string());
            ex.finish(ExecutionStatus::Aborted);
        }
        Ok(actions)
    }

    /// Remove a finished execution
    pub fn drop_execution(&mut self, id: &ExecutionId) -> Result<Vec<Action>> {
        let status = self
            .status(id)
            .ok_or_else(|| GearsError::NotFound("execution", id.to_string()))?;
        if !status.is_terminal() {
            return Err(GearsError::ExecutionError(format!(
                "can not drop a {} execution, abort it first",
                status
            )));
        }
        let mut actions = Vec::new();
        if let Some(ex) = self.table.remove(id) {
            if ex.is_initiator(&self.me) {
                for peer in ex.peers(&self.me) {
                    actions.push(Action::Send {
                        target: peer,
                        message: ExecutionMessage::Drop { id: id.clone() },
                    });
                }
            }
            debug!("Dropped execution {}", id);
        }
        Ok(actions)
    }

    /// Abort and remove the not-yet-started executions of a registration
    pub fn drop_created(&mut self, registration: &RegistrationId) -> Vec<Action> {
        let ids: Vec<ExecutionId> = self
            .table
            .iter()
            .filter(|e| {
                e.registration.as_ref() == Some(registration)
                    && e.status == ExecutionStatus::Created
                    && e.is_initiator(&self.me)
            })
            .map(|e| e.id.clone())
            .collect();
        let mut actions = Vec::new();
        for id in ids {
            if let Some(mut ex) = self.table.remove(&id) {
                abort_in_place(&self.me, &mut ex, Some(ABORTED_ERROR), &mut actions);
            }
        }
        actions
    }

    /// Results and errors of a finished execution
    pub fn results(&self, id: &ExecutionId) -> Result<(Vec<Record>, Vec<String>)> {
        let ex = self
            .table
            .get(id)
            .ok_or_else(|| GearsError::NotFound("execution", id.to_string()))?;
        if !ex.status.is_terminal() {
            return Err(GearsError::ExecutionError(format!(
                "execution {} is still {}",
                id, ex.status
            )));
        }
        Ok((ex.results.clone(), ex.errors.clone()))
    }

    pub fn info(&self, id: &ExecutionId) -> Result<ExecutionInfo> {
        self.table
            .get(id)
            .map(Execution::info)
            .ok_or_else(|| GearsError::NotFound("execution", id.to_string()))
    }

    /// Every tracked execution, oldest first
    pub fn dump(&self) -> Vec<ExecutionInfo> {
        self.table.iter().map(Execution::info).collect()
    }

    /// Abort running executions that made no progress for too long
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let default_idle = self.config.max_idle;
        let idle: Vec<ExecutionId> = self
            .table
            .iter()
            .filter(|e| {
                e.status == ExecutionStatus::Running
                    && !e.busy
                    && now.saturating_duration_since(e.last_activity) > e.max_idle(default_idle)
            })
            .map(|e| e.id.clone())
            .collect();

        let mut actions = Vec::new();
        for id in idle {
            let me = self.me.clone();
            let Some(ex) = self.table.get_mut(&id) else {
                continue;
            };
            warn!("Execution {} idle for too long, aborting", id);
            if ex.is_initiator(&me) {
                abort_in_place(&me, ex, Some(MAX_IDLE_ERROR), &mut actions);
            } else {
                ex.errors.push(MAX_IDLE_ERROR.to_string());
                actions.push(Action::Send {
                    target: ex.initiator.clone(),
                    message: ExecutionMessage::ShardDone {
                        id: id.clone(),
                        errors: ex.errors.clone(),
                        aborted: true,
                    },
                });
                self.table.remove(&id);
            }
        }
        actions
    }
}

/// Start a distributed execution once every peer holds it
fn maybe_start(me: &ShardId, ex: &mut Execution, profile: bool, actions: &mut Vec<Action>) {
    if ex.status != ExecutionStatus::Created
        || !ex.is_initiator(me)
        || !ex.awaiting_received.is_empty()
    {
        return;
    }
    ex.start();
    for peer in ex.peers(me) {
        if ex.unreachable.contains(&peer) || !ex.awaiting_done.contains(&peer) {
            continue;
        }
        actions.push(Action::Send {
            target: peer,
            message: ExecutionMessage::Run { id: ex.id.clone() },
        });
    }
    ex.busy = true;
    actions.push(Action::RunSegment(SegmentTask {
        id: ex.id.clone(),
        step: 0,
        plan: ex.plan.clone(),
        input: SegmentInput::Read(ex.input.clone()),
        abort_on_error: ex.options.abort_on_error,
        profile,
    }));
}

/// Run the next segment once the shuffle barrier of the waiting step is met
fn advance(me: &ShardId, ex: &mut Execution, profile: bool, actions: &mut Vec<Action>) {
    let Some(step) = ex.waiting_step else {
        return;
    };
    if ex.busy {
        return;
    }
    let expected = ex.expected_senders(me, step);
    let ready = match ex.shuffle_done.get(&step) {
        Some(done) => expected.iter().all(|s| done.contains(s)),
        None => expected.is_empty(),
    };
    if !ready {
        return;
    }
    ex.waiting_step = None;
    ex.busy = true;
    let records = ex.inbox.remove(&step).unwrap_or_default();
    ex.shuffle_done.remove(&step);
    actions.push(Action::RunSegment(SegmentTask {
        id: ex.id.clone(),
        step: step + 1,
        plan: ex.plan.clone(),
        input: SegmentInput::Records(records),
        abort_on_error: ex.options.abort_on_error,
        profile,
    }));
}

/// Complete on the initiator once its last segment ran and all peers reported
fn complete_if_ready(me: &ShardId, ex: &mut Execution, actions: &mut Vec<Action>) {
    if !ex.is_initiator(me)
        || ex.status != ExecutionStatus::Running
        || !ex.finished_locally
        || !ex.awaiting_done.is_empty()
    {
        return;
    }
    ex.finish(ExecutionStatus::Done);
    for peer in ex.peers(me) {
        if ex.unreachable.contains(&peer) {
            continue;
        }
        actions.push(Action::Send {
            target: peer,
            message: ExecutionMessage::Terminate { id: ex.id.clone() },
        });
    }
    debug!(
        "Execution {} done with {} results and {} errors",
        ex.id,
        ex.results.len(),
        ex.errors.len()
    );
    actions.push(finished(ex));
}

/// Abort on this shard; the initiator also tells every peer
fn abort_in_place(
    me: &ShardId,
    ex: &mut Execution,
    reason: Option<&str>,
    actions: &mut Vec<Action>,
) {
    if ex.status.is_terminal() {
        return;
    }
    if let Some(reason) = reason {
        ex.errors.push(reason.to_string());
    }
    ex.finish(ExecutionStatus::Aborted);
    if ex.is_initiator(me) {
        for peer in ex.peers(me) {
            if ex.unreachable.contains(&peer) {
                continue;
            }
            actions.push(Action::Send {
                target: peer,
                message: ExecutionMessage::Abort { id: ex.id.clone() },
            });
        }
        actions.push(finished(ex));
    }
}

fn finished(ex: &Execution) -> Action {
    Action::Finished(FinishedExecution {
        id: ex.id.clone(),
        registration: ex.registration.clone(),
        status: ex.status,
        errors: ex.errors.clone(),
        duration: ex.stats.total_duration.unwrap_or_default(),
    })
}

/// Shard a repartitioned record goes to
fn route(topology: Option<&ClusterTopology>, ex: &Execution, me: &ShardId, key: &str) -> ShardId {
    if ex.participants.len() <= 1 {
        return me.clone();
    }
    let owner = topology
        .and_then(|t| t.owner_of_slot(key_hash_slot(key)))
        .map(|n| n.id.clone());
    match owner {
        Some(owner) if ex.participants.contains(&owner) && !ex.unreachable.contains(&owner) => {
            owner
        }
        _ => ex.initiator.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_core::{CallbackRegistry, MemoryStore, RunId, ShardStore};
    use gears_plan::{register_builtins, GearsBuilder};
    use std::collections::VecDeque;

    /// A cluster of coordinators wired together in memory
    struct Harness {
        shards: Vec<(Coordinator, MemoryStore)>,
        registry: CallbackRegistry,
        finished: Vec<FinishedExecution>,
        mail: VecDeque<(ShardId, ShardId, ExecutionMessage)>,
        work: VecDeque<(usize, SegmentTask)>,
    }

    fn shard_id(i: usize) -> ShardId {
        ShardId::new(format!("s{}", i))
    }

    impl Harness {
        fn new(n: usize) -> Self {
            let ids: Vec<ShardId> = (0..n).map(shard_id).collect();
            let topology = Arc::new(ClusterTopology::even(&ids, "mem", 1));
            let shards = ids
                .iter()
                .map(|id| {
                    let mut c = Coordinator::new(
                        id.clone(),
                        Arc::new(IdGenerator::new(RunId::from(id.as_str()))),
                        CoordinatorConfig::default(),
                    );
                    c.set_topology(topology.clone());
                    (c, MemoryStore::new())
                })
                .collect();
            let registry = CallbackRegistry::new();
            register_builtins(&registry);
            Self {
                shards,
                registry,
                finished: Vec::new(),
                mail: VecDeque::new(),
                work: VecDeque::new(),
            }
        }

        fn index(&self, id: &ShardId) -> usize {
            self.shards
                .iter()
                .position(|(c, _)| c.me() == id)
                .unwrap()
        }

        fn apply(&mut self, from: usize, actions: Vec<Action>) {
            let from_id = shard_id(from);
            for action in actions {
                match action {
                    Action::Send { target, message } => {
                        self.mail.push_back((from_id.clone(), target, message))
                    }
                    Action::RunSegment(task) => self.work.push_back((from, task)),
                    Action::Finished(f) => self.finished.push(f),
                }
            }
        }

        /// Deliver messages and run segments until nothing is left
        fn settle(&mut self) {
            loop {
                if let Some((from, to, message)) = self.mail.pop_front() {
                    let i = self.index(&to);
                    let actions = self.shards[i].0.on_message(&from, message, &|_| None);
                    self.apply(i, actions);
                } else if let Some((i, task)) = self.work.pop_front() {
                    let (coordinator, store) = &self.shards[i];
                    let result = task.run(&self.registry, store, coordinator.me());
                    let actions = self.shards[i].0.on_segment_done(result);
                    self.apply(i, actions);
                } else {
                    break;
                }
            }
        }

        fn execute(&mut self, at: usize, plan: Plan, options: ExecutionOptions) -> ExecutionId {
            let (id, actions) =
                self.shards[at]
                    .0
                    .create(Arc::new(plan), ReaderInput::Full, options, None);
            self.apply(at, actions);
            self.settle();
            id
        }
    }

    fn populate(h: &mut Harness, keys: usize) {
        for k in 0..keys {
            let key = format!("key:{}", k);
            let owner = {
                let topology = h.shards[0].0.topology.clone().unwrap();
                topology.owner_of_key(&key).unwrap().id.clone()
            };
            let i = h.index(&owner);
            h.shards[i].1.set(&key, Record::Int(k as i64));
        }
    }

    #[test]
    fn test_distributed_count() {
        let mut h = Harness::new(3);
        populate(&mut h, 50);
        let plan = GearsBuilder::keys("key:*").count().build().with_trailing_collect();
        let id = h.execute(1, plan, ExecutionOptions::default());

        let (results, errors) = h.shards[1].0.results(&id).unwrap();
        assert_eq!(results, vec![Record::Int(50)]);
        assert!(errors.is_empty());
        assert_eq!(h.finished.len(), 1);
        assert_eq!(h.finished[0].status, ExecutionStatus::Done);
        // peers forgot their copies after terminate
        assert!(h.shards[0].0.get(&id).is_none());
        assert!(h.shards[2].0.get(&id).is_none());
    }

    #[test]
    fn test_repartition_group_by_count() {
        let mut h = Harness::new(3);
        for (i, key) in ["a:1", "a:2", "b:1", "a:3", "b:2"].iter().enumerate() {
            h.shards[i % 3].1.set(key, Record::Int(1));
        }
        h.registry.register_extractor("prefix", |_, r| {
            let key = r.key_name().unwrap_or_default();
            Ok(key.split(':').next().unwrap_or_default().to_string())
        });
        let plan = GearsBuilder::keys("*")
            .count_by("prefix")
            .build()
            .with_trailing_collect();
        let id = h.execute(0, plan, ExecutionOptions::default());

        let (mut results, errors) = h.shards[0].0.results(&id).unwrap();
        assert!(errors.is_empty(), "{:?}", errors);
        results.sort_by_key(|r| r.get("key").map(|k| k.group_key()));
        assert_eq!(
            results,
            vec![
                Record::map([("key", Record::from("a")), ("value", Record::Int(3))]),
                Record::map([("key", Record::from("b")), ("value", Record::Int(2))]),
            ]
        );
    }

    #[test]
    fn test_local_mode_reads_only_local_shard() {
        let mut h = Harness::new(2);
        populate(&mut h, 20);
        let local = h.shards[0].1.scan("key:*").len() as i64;
        let plan = GearsBuilder::keys("key:*").count().build();
        let id = h.execute(0, plan, ExecutionOptions::new(ExecutionMode::AsyncLocal));
        let (results, _) = h.shards[0].0.results(&id).unwrap();
        assert_eq!(results, vec![Record::Int(local)]);
        assert!(h.mail.is_empty());
    }

    #[test]
    fn test_record_errors_do_not_abort() {
        let mut h = Harness::new(2);
        populate(&mut h, 10);
        h.registry.register_map("fail_odd", |_, r| {
            let odd = matches!(&r, Record::Key { value, .. } if value.as_int().is_some_and(|v| v % 2 == 1));
            if odd {
                Err(gears_core::CallbackError::new("odd"))
            } else {
                Ok(r)
            }
        });
        let plan = GearsBuilder::keys("key:*")
            .map("fail_odd")
            .build()
            .with_trailing_collect();
        let id = h.execute(0, plan, ExecutionOptions::default());
        let (results, errors) = h.shards[0].0.results(&id).unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(errors.len(), 5);
        assert_eq!(h.shards[0].0.status(&id), Some(ExecutionStatus::Done));
    }

    #[test]
    fn test_abort_on_error_aborts_everywhere() {
        let mut h = Harness::new(2);
        populate(&mut h, 10);
        h.registry
            .register_map("boom", |_, _| Err(gears_core::CallbackError::new("boom")));
        let plan = GearsBuilder::keys("key:*").map("boom").build().with_trailing_collect();
        let id = h.execute(
            0,
            plan,
            ExecutionOptions::default().with_abort_on_error(true),
        );
        assert_eq!(h.shards[0].0.status(&id), Some(ExecutionStatus::Aborted));
        assert_eq!(h.finished[0].status, ExecutionStatus::Aborted);
        assert!(h.shards[1].0.get(&id).is_none());
    }

    #[test]
    fn test_unreachable_peer_is_reported() {
        let mut h = Harness::new(2);
        populate(&mut h, 10);
        let plan = GearsBuilder::keys("key:*").count().build().with_trailing_collect();
        let (id, actions) = h.shards[0].0.create(
            Arc::new(plan),
            ReaderInput::Full,
            ExecutionOptions::default(),
            None,
        );
        // the distribute message never arrives
        let mut failed = Vec::new();
        for action in actions {
            if let Action::Send { target, message } = action {
                failed.extend(h.shards[0].0.on_delivery_failure(&target, &message));
            }
        }
        h.apply(0, failed);
        h.settle();

        let (results, errors) = h.shards[0].0.results(&id).unwrap();
        let local = h.shards[0].1.scan("key:*").len() as i64;
        assert_eq!(results, vec![Record::Int(local)]);
        assert_eq!(errors, vec!["shard s1 unreachable".to_string()]);
    }

    #[test]
    fn test_lost_shuffle_peer_aborts_execution() {
        let mut h = Harness::new(3);
        for (i, key) in ["a:1", "a:2", "b:1", "a:3", "b:2", "b:3"].iter().enumerate() {
            h.shards[i % 3].1.set(key, Record::Int(1));
        }
        h.registry.register_extractor("prefix", |_, r| {
            let key = r.key_name().unwrap_or_default();
            Ok(key.split(':').next().unwrap_or_default().to_string())
        });
        let plan = GearsBuilder::keys("*")
            .count_by("prefix")
            .build()
            .with_trailing_collect();
        let (id, actions) = h.shards[0].0.create(
            Arc::new(plan),
            ReaderInput::Full,
            ExecutionOptions::default(),
            None,
        );
        h.apply(0, actions);

        // s1 cannot reach s2 while shuffling
        let (s1, s2) = (shard_id(1), shard_id(2));
        let mut dropped = 0;
        loop {
            if let Some((from, to, message)) = h.mail.pop_front() {
                let shuffle = matches!(
                    message,
                    ExecutionMessage::ShuffleRecords { .. } | ExecutionMessage::ShuffleDone { .. }
                );
                if from == s1 && to == s2 && shuffle {
                    dropped += 1;
                    let actions = h.shards[1].0.on_delivery_failure(&to, &message);
                    h.apply(1, actions);
                    continue;
                }
                let i = h.index(&to);
                let actions = h.shards[i].0.on_message(&from, message, &|_| None);
                h.apply(i, actions);
            } else if let Some((i, task)) = h.work.pop_front() {
                let (coordinator, store) = &h.shards[i];
                let result = task.run(&h.registry, store, coordinator.me());
                let actions = h.shards[i].0.on_segment_done(result);
                h.apply(i, actions);
            } else {
                break;
            }
        }

        assert!(dropped > 0);
        assert_eq!(h.shards[0].0.status(&id), Some(ExecutionStatus::Aborted));
        assert_eq!(h.finished.len(), 1);
        assert_eq!(h.finished[0].status, ExecutionStatus::Aborted);
        assert!(h.finished[0]
            .errors
            .contains(&"shard s2 unreachable".to_string()));
        assert!(h.shards[1].0.get(&id).is_none());
        assert!(h.shards[2].0.get(&id).is_none());
    }

    #[test]
    fn test_drop_and_abort_rules() {
        let mut h = Harness::new(2);
        let plan = GearsBuilder::keys("*").build().with_trailing_collect();
        let (id, actions) = h.shards[0].0.create(
            Arc::new(plan),
            ReaderInput::Full,
            ExecutionOptions::default(),
            None,
        );
        h.apply(0, actions);
        assert!(h.shards[0].0.drop_execution(&id).is_err());
        assert!(h.shards[0].0.results(&id).is_err());

        let actions = h.shards[0].0.abort(&id).unwrap();
        assert!(actions.iter().any(|a| matches!(a, Action::Finished(_))));
        assert_eq!(h.shards[0].0.status(&id), Some(ExecutionStatus::Aborted));
        assert!(h.shards[0].0.abort(&id).is_err());

        let actions = h.shards[0].0.drop_execution(&id).unwrap();
        assert_eq!(actions.len(), 1);
        assert!(h.shards[0].0.get(&id).is_none());
    }

    #[test]
    fn test_idle_running_execution_is_aborted() {
        let mut h = Harness::new(2);
        let plan = GearsBuilder::keys("*").build().with_trailing_collect();
        let options = ExecutionOptions::default().with_max_idle(Duration::from_millis(1));
        let (id, actions) =
            h.shards[0]
                .0
                .create(Arc::new(plan), ReaderInput::Full, options, None);
        h.apply(0, actions);
        // deliver Distribute and Received but never run segments
        while let Some((from, to, message)) = h.mail.pop_front() {
            let i = h.index(&to);
            let actions = h.shards[i].0.on_message(&from, message, &|_| None);
            h.apply(i, actions);
        }
        h.work.clear();
        if let Some(ex) = h.shards[0].0.table.get_mut(&id) {
            ex.busy = false;
        }
        let later = Instant::now() + Duration::from_millis(50);
        let actions = h.shards[0].0.tick(later);
        assert!(!actions.is_empty());
        let (_, errors) = h.shards[0].0.results(&id).unwrap();
        assert_eq!(errors, vec![MAX_IDLE_ERROR.to_string()]);
    }

    #[test]
    fn test_capacity_evicts_oldest_done() {
        let mut h = Harness::new(1);
        let mut config = CoordinatorConfig::default();
        config.max_executions = 2;
        h.shards[0].0.set_config(config);
        let plan = GearsBuilder::shard_id().build();
        let first = h.execute(0, plan.clone(), ExecutionOptions::default());
        let second = h.execute(0, plan.clone(), ExecutionOptions::default());
        let third = h.execute(0, plan, ExecutionOptions::default());
        assert!(h.shards[0].0.get(&first).is_none());
        assert!(h.shards[0].0.get(&second).is_some());
        assert!(h.shards[0].0.get(&third).is_some());
        assert_eq!(h.shards[0].0.len(), 2);
    }

    #[test]
    fn test_registration_plan_resolved_by_reference() {
        let mut h = Harness::new(2);
        let registration = RegistrationId::new(RunId::from("r"), 1);
        let plan = Arc::new(GearsBuilder::shard_id().build());
        let (id, actions) = h.shards[0].0.create(
            plan.clone(),
            ReaderInput::Full,
            ExecutionOptions::default(),
            Some(registration.clone()),
        );
        let mut sent = None;
        for action in actions {
            if let Action::Send { target, message } = action {
                match &message {
                    ExecutionMessage::Distribute { plan: source, .. } => {
                        assert_eq!(source, &PlanSource::Registration(registration.clone()));
                    }
                    other => panic!("unexpected {:?}", other),
                }
                sent = Some((target, message));
            }
        }
        let (target, message) = sent.unwrap();
        let resolver = |r: &RegistrationId| (r == &registration).then(|| plan.clone());
        let actions = h.shards[1].0.on_message(&shard_id(0), message, &resolver);
        assert_eq!(target, shard_id(1));
        assert!(matches!(
            &actions[0],
            Action::Send { message: ExecutionMessage::Received { .. }, .. }
        ));
        assert_eq!(
            h.shards[1].0.get(&id).unwrap().registration.as_ref(),
            Some(&registration)
        );
    }
}
