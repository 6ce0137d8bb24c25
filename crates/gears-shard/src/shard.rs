//! A shard node
//!
//! [`Shard`] ties one shard's keyspace, execution coordinator, registration
//! table and transport together. Coordinator and registry are plain state
//! machines behind one mutex: they return the work to carry out, and the
//! shard performs it after releasing the lock. Segments run on a blocking
//! worker pool bounded by `ExecutionThreads`, except for `Sync` executions,
//! which run inline on the call that triggered them.

use crate::commands::{CommandReply, GearsCommand};
use crate::keyspace::{Keyspace, StoreEvent};
use ahash::AHashMap;
use gears_cluster::{
    ClusterInfo, ClusterTopology, Connector, DeliveryFailure, Transport, TransportConfig,
};
use gears_core::{
    CallbackRegistry, ExecutionId, GearsConfig, GearsError, IdGenerator, Record, RegistrationId,
    Result, RunId, ShardId, ShardStore, StreamEntryId,
};
use gears_executor::{
    Action, Coordinator, CoordinatorConfig, ExecutionInfo, ExecutionMessage, ExecutionMode,
    ExecutionOptions, FinishedExecution, SegmentTask, EXECUTION_COMMAND,
};
use gears_plan::{Plan, ReaderInput};
use gears_registry::{
    persist, RegistrationInfo, RegistrationSnapshot, Registry, RegistryMessage, RegistryOutput,
    Trigger, REGISTRY_COMMAND,
};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, warn};

/// How often idle executions, stream timers and retries are checked
pub const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Results and errors of a finished execution
pub type Outcome = Result<(Vec<Record>, Vec<String>)>;

struct ShardState {
    coordinator: Coordinator,
    registry: Registry,
    waiters: AHashMap<ExecutionId, Vec<oneshot::Sender<Outcome>>>,
}

impl ShardState {
    /// Carry out a registry decision; returns the started executions and
    /// the coordinator's follow-up work
    fn apply_output(&mut self, output: RegistryOutput) -> (Vec<ExecutionId>, Vec<Action>) {
        let mut actions = Vec::new();
        for id in output.drops {
            match self.coordinator.drop_execution(&id) {
                Ok(more) => actions.extend(more),
                Err(e) => debug!("Could not drop execution {}: {}", id, e),
            }
        }
        let mut started = Vec::new();
        for fire in output.fires {
            let (id, more) = self.coordinator.create(
                fire.plan.clone(),
                fire.input.clone(),
                fire.options.clone(),
                Some(fire.registration.clone()),
            );
            self.registry.track(&fire, &id);
            actions.extend(more);
            started.push(id);
        }
        (started, actions)
    }

    /// Channel resolved when an execution initiated here finishes
    fn wait(&mut self, id: &ExecutionId) -> Result<oneshot::Receiver<Outcome>> {
        let ex = self
            .coordinator
            .get(id)
            .ok_or_else(|| GearsError::NotFound("execution", id.to_string()))?;
        if !ex.is_initiator(self.coordinator.me()) {
            return Err(GearsError::ExecutionError(format!(
                "execution {} belongs to shard {}",
                id, ex.initiator
            )));
        }
        let terminal = ex.status.is_terminal();
        let (tx, rx) = oneshot::channel();
        if terminal {
            let _ = tx.send(self.coordinator.results(id));
        } else {
            self.waiters.entry(id.clone()).or_default().push(tx);
        }
        Ok(rx)
    }

    fn unregister(&mut self, id: &RegistrationId, abort_pending: bool) -> Result<Vec<Action>> {
        self.registry.unregister(id)?;
        if abort_pending {
            Ok(self.coordinator.drop_created(id))
        } else {
            Ok(Vec::new())
        }
    }
}

struct ShardInner {
    id: ShardId,
    run_id: RunId,
    config: RwLock<GearsConfig>,
    store: Arc<Keyspace>,
    callbacks: Arc<CallbackRegistry>,
    transport: Transport,
    state: Mutex<ShardState>,
    workers: Arc<Semaphore>,
    runtime: Handle,
}

/// Handle to a running shard; cheap to clone
#[derive(Clone)]
pub struct Shard {
    inner: Arc<ShardInner>,
}

async fn receive(rx: oneshot::Receiver<Outcome>) -> Outcome {
    rx.await.map_err(|_| {
        GearsError::ExecutionError("execution was dropped before it finished".to_string())
    })?
}

impl Shard {
    /// Start a shard with an empty keyspace; must be called within a tokio runtime
    pub fn new(
        id: ShardId,
        config: GearsConfig,
        callbacks: Arc<CallbackRegistry>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        Self::with_store(id, config, callbacks, connector, Arc::new(Keyspace::new()))
    }

    /// Start a shard over an existing keyspace
    pub fn with_store(
        id: ShardId,
        config: GearsConfig,
        callbacks: Arc<CallbackRegistry>,
        connector: Arc<dyn Connector>,
        store: Arc<Keyspace>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| GearsError::ExecutionError(format!("no async runtime: {}", e)))?;
        let run_id = RunId::generate();
        let ids = Arc::new(IdGenerator::new(run_id.clone()));
        let transport = Transport::new(
            id.clone(),
            run_id.clone(),
            TransportConfig::from(&config),
            connector,
        )?;
        let state = ShardState {
            coordinator: Coordinator::new(id.clone(), ids.clone(), CoordinatorConfig::from(&config)),
            registry: Registry::new(ids, config.max_executions_per_registration),
            waiters: AHashMap::new(),
        };

        let shard = Shard {
            inner: Arc::new(ShardInner {
                id: id.clone(),
                run_id: run_id.clone(),
                workers: Arc::new(Semaphore::new(config.execution_threads)),
                config: RwLock::new(config),
                store,
                callbacks,
                transport,
                state: Mutex::new(state),
                runtime,
            }),
        };
        shard.install_handlers();
        shard.spawn_ticker();
        info!("Started shard {} with run id {}", id, run_id);
        Ok(shard)
    }

    fn upgrade(weak: &Weak<ShardInner>) -> Option<Shard> {
        weak.upgrade().map(|inner| Shard { inner })
    }

    fn install_handlers(&self) {
        let transport = &self.inner.transport;

        let weak = Arc::downgrade(&self.inner);
        transport.register_handler(
            EXECUTION_COMMAND,
            Arc::new(move |sender: &ShardId, payload: &str| {
                if let Some(shard) = Shard::upgrade(&weak) {
                    shard.on_execution_message(sender, payload);
                }
            }),
        );

        let weak = Arc::downgrade(&self.inner);
        transport.register_handler(
            REGISTRY_COMMAND,
            Arc::new(move |sender: &ShardId, payload: &str| {
                if let Some(shard) = Shard::upgrade(&weak) {
                    shard.on_registry_message(sender, payload);
                }
            }),
        );

        let weak = Arc::downgrade(&self.inner);
        transport.set_failure_handler(Arc::new(move |failure: DeliveryFailure| {
            if let Some(shard) = Shard::upgrade(&weak) {
                shard.on_delivery_failure(failure);
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        transport.set_topology_handler(Arc::new(move |topology: Arc<ClusterTopology>| {
            if let Some(shard) = Shard::upgrade(&weak) {
                shard.inner.state.lock().coordinator.set_topology(topology);
            }
        }));
    }

    fn spawn_ticker(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                match Shard::upgrade(&weak) {
                    Some(shard) => shard.tick(Instant::now()),
                    None => break,
                }
            }
        });
    }

    pub fn id(&self) -> &ShardId {
        &self.inner.id
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.run_id
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn store(&self) -> &Arc<Keyspace> {
        &self.inner.store
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.inner.callbacks
    }

    fn store_ref(&self) -> &dyn ShardStore {
        self.inner.store.as_ref()
    }

    /// Apply a full cluster topology
    pub fn set_topology(&self, topology: ClusterTopology) {
        self.inner.transport.set_topology(topology);
    }

    pub fn cluster_info(&self) -> ClusterInfo {
        self.inner.transport.cluster_info()
    }

    // ----- driving the state machines -----

    /// Carry out coordinator work until nothing is left to do inline
    fn apply(&self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        loop {
            while let Some(action) = queue.pop_front() {
                match action {
                    Action::Send { target, message } => queue.extend(self.send(&target, message)),
                    Action::RunSegment(task) => {
                        if self.runs_inline(&task) {
                            queue.extend(self.run_segment(task));
                        } else {
                            self.spawn_segment(task);
                        }
                    }
                    Action::Finished(finished) => queue.extend(self.on_finished(finished)),
                }
            }
            let more = self.process_store_events();
            if more.is_empty() {
                break;
            }
            queue.extend(more);
        }
    }

    fn send(&self, target: &ShardId, message: ExecutionMessage) -> Vec<Action> {
        let sent = message
            .encode()
            .and_then(|payload| self.inner.transport.send(target, EXECUTION_COMMAND, payload));
        match sent {
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(
                    "Could not send {} for execution {} to {}: {}",
                    message.name(),
                    message.id(),
                    target,
                    e
                );
                self.inner
                    .state
                    .lock()
                    .coordinator
                    .on_delivery_failure(target, &message)
            }
        }
    }

    fn runs_inline(&self, task: &SegmentTask) -> bool {
        self.inner
            .state
            .lock()
            .coordinator
            .get(&task.id)
            .is_some_and(|e| e.options.mode == ExecutionMode::Sync)
    }

    fn run_segment(&self, task: SegmentTask) -> Vec<Action> {
        let result = task.run(&self.inner.callbacks, self.store_ref(), &self.inner.id);
        self.inner.state.lock().coordinator.on_segment_done(result)
    }

    fn spawn_segment(&self, task: SegmentTask) {
        let shard = self.clone();
        let workers = self.inner.workers.clone();
        self.inner.runtime.spawn(async move {
            let Ok(permit) = workers.acquire_owned().await else {
                return;
            };
            let id = task.id.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let actions = shard.run_segment(task);
                shard.apply(actions);
            })
            .await;
            if let Err(e) = joined {
                error!("Worker running execution {} failed: {}", id, e);
            }
        });
    }

    fn on_finished(&self, finished: FinishedExecution) -> Vec<Action> {
        let mut state = self.inner.state.lock();
        if let Some(waiters) = state.waiters.remove(&finished.id) {
            let outcome = state.coordinator.results(&finished.id);
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
        if finished.registration.is_none() {
            return Vec::new();
        }
        let output =
            state
                .registry
                .on_execution_finished(&finished, self.store_ref(), Instant::now());
        state.apply_output(output).1
    }

    /// Feed recorded keyspace changes to the registry
    fn process_store_events(&self) -> Vec<Action> {
        let events = self.inner.store.take_events();
        if events.is_empty() {
            return Vec::new();
        }
        let store = self.store_ref();
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let mut output = RegistryOutput::default();
        for event in events {
            let more = match event {
                StoreEvent::Key { key, event } => {
                    state.registry.on_key_event(&key, &event, store.key_type(&key))
                }
                StoreEvent::StreamAdded { stream } => {
                    state.registry.on_stream_added(&stream, store, now)
                }
            };
            output.merge(more);
        }
        state.apply_output(output).1
    }

    /// Run timers that are due
    pub fn tick(&self, now: Instant) {
        let actions = {
            let mut state = self.inner.state.lock();
            let mut actions = state.coordinator.tick(now);
            let output = state.registry.tick(self.store_ref(), now);
            actions.extend(state.apply_output(output).1);
            actions
        };
        self.apply(actions);
    }

    fn on_execution_message(&self, sender: &ShardId, payload: &str) {
        let message = match ExecutionMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable execution message from {}: {}", sender, e);
                return;
            }
        };
        let actions = {
            let mut state = self.inner.state.lock();
            let ShardState {
                coordinator,
                registry,
                ..
            } = &mut *state;
            coordinator.on_message(sender, message, &|id| registry.plan_of(id))
        };
        self.apply(actions);
    }

    fn on_registry_message(&self, sender: &ShardId, payload: &str) {
        let message = match RegistryMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable registry message from {}: {}", sender, e);
                return;
            }
        };
        let store = self.store_ref();
        let now = Instant::now();
        let result = {
            let mut state = self.inner.state.lock();
            match message {
                RegistryMessage::Register { registration } => state
                    .registry
                    .install(registration, store, now)
                    .map(|output| state.apply_output(output).1),
                RegistryMessage::Pause { id } => state.registry.pause(&id).map(|_| Vec::new()),
                RegistryMessage::Unpause { id } => state
                    .registry
                    .unpause(&id, store, now)
                    .map(|output| state.apply_output(output).1),
                RegistryMessage::Unregister { id, abort_pending } => {
                    state.unregister(&id, abort_pending)
                }
            }
        };
        match result {
            Ok(actions) => self.apply(actions),
            Err(e) => warn!("Registry message from {} failed: {}", sender, e),
        }
    }

    fn on_delivery_failure(&self, failure: DeliveryFailure) {
        if failure.command != EXECUTION_COMMAND {
            warn!(
                "Shard {} never received {} message {}",
                failure.target, failure.command, failure.msg_id
            );
            return;
        }
        let message = match ExecutionMessage::decode(&failure.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable failed message to {}: {}", failure.target, e);
                return;
            }
        };
        let actions = self
            .inner
            .state
            .lock()
            .coordinator
            .on_delivery_failure(&failure.target, &message);
        self.apply(actions);
    }

    fn broadcast_registry(&self, message: &RegistryMessage) -> Result<()> {
        if !self.inner.transport.is_initialized() {
            return Ok(());
        }
        let payload = message.encode()?;
        let shards = self.inner.transport.broadcast(REGISTRY_COMMAND, &payload)?;
        debug!("Sent registry message to {} shards", shards);
        Ok(())
    }

    // ----- keyspace -----

    fn check_owner(&self, key: &str) -> Result<()> {
        match self.inner.transport.topology() {
            Some(topology) => topology.check_key_owner(&self.inner.id, key),
            None => Ok(()),
        }
    }

    pub fn set(&self, key: &str, value: impl Into<Record>) -> Result<()> {
        self.check_owner(key)?;
        self.inner.store.set(key, value.into());
        self.apply(Vec::new());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Record>> {
        self.check_owner(key)?;
        Ok(self.inner.store.get(key))
    }

    pub fn del(&self, key: &str) -> Result<bool> {
        self.check_owner(key)?;
        let removed = self.inner.store.del(key);
        self.apply(Vec::new());
        Ok(removed)
    }

    pub fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.check_owner(key)?;
        let value = self.inner.store.incr_by(key, delta)?;
        self.apply(Vec::new());
        Ok(value)
    }

    pub fn stream_add(&self, stream: &str, fields: Vec<(String, String)>) -> Result<StreamEntryId> {
        self.check_owner(stream)?;
        let id = self.inner.store.stream_add(stream, fields);
        self.apply(Vec::new());
        Ok(id)
    }

    /// Run a keyspace command, letting a command hook take it over
    pub async fn call(&self, args: &[String]) -> Result<CommandReply> {
        let hooked = {
            let mut state = self.inner.state.lock();
            let output = state.registry.hook_for(args, self.store_ref());
            if output.fires.is_empty() {
                None
            } else {
                let (started, actions) = state.apply_output(output);
                let rx = match started.first() {
                    Some(id) => Some(state.wait(id)?),
                    None => None,
                };
                Some((actions, rx))
            }
        };

        if let Some((actions, rx)) = hooked {
            self.apply(actions);
            if let Some(rx) = rx {
                let (records, errors) = receive(rx).await?;
                if let Some(error) = errors.first() {
                    return Ok(CommandReply::Error(error.clone()));
                }
                return Ok(match records.as_slice() {
                    [one] => CommandReply::record(one),
                    many => CommandReply::Array(many.iter().map(CommandReply::record).collect()),
                });
            }
        }
        self.store_command(args)
    }

    fn store_command(&self, args: &[String]) -> Result<CommandReply> {
        let Some((name, rest)) = args.split_first() else {
            return Err(GearsError::ExecutionError("empty command".to_string()));
        };
        let not_integer = || GearsError::ExecutionError("value is not an integer".to_string());
        match (name.to_ascii_lowercase().as_str(), rest) {
            ("get", [key]) => Ok(self
                .get(key)?
                .map(|r| CommandReply::record(&r))
                .unwrap_or(CommandReply::Nil)),
            ("set", [key, value]) => {
                self.set(key, value.as_str())?;
                Ok(CommandReply::Ok)
            }
            ("del", keys) if !keys.is_empty() => {
                let mut removed = 0;
                for key in keys {
                    if self.del(key)? {
                        removed += 1;
                    }
                }
                Ok(CommandReply::Int(removed))
            }
            ("incr", [key]) => Ok(CommandReply::Int(self.incr_by(key, 1)?)),
            ("incrby", [key, delta]) => {
                let delta = delta.parse::<i64>().map_err(|_| not_integer())?;
                Ok(CommandReply::Int(self.incr_by(key, delta)?))
            }
            ("xadd", [stream, fields @ ..]) if !fields.is_empty() && fields.len() % 2 == 0 => {
                let fields = fields
                    .chunks(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                Ok(CommandReply::Str(self.stream_add(stream, fields)?.to_string()))
            }
            _ => Err(GearsError::ExecutionError(format!(
                "unknown command '{}' with {} arguments",
                name,
                rest.len()
            ))),
        }
    }

    // ----- executions -----

    fn start(
        &self,
        plan: Plan,
        options: ExecutionOptions,
        wait: bool,
    ) -> Result<(ExecutionId, Option<oneshot::Receiver<Outcome>>)> {
        plan.validate(&self.inner.callbacks)?;
        let plan = Arc::new(plan.with_trailing_collect());
        let (id, actions, rx) = {
            let mut state = self.inner.state.lock();
            let (id, actions) = state.coordinator.create(plan, ReaderInput::Full, options, None);
            let rx = if wait { Some(state.wait(&id)?) } else { None };
            (id, actions, rx)
        };
        self.apply(actions);
        Ok((id, rx))
    }

    /// Start a one-shot execution and return its id right away
    pub fn execute(&self, plan: Plan, options: ExecutionOptions) -> Result<ExecutionId> {
        Ok(self.start(plan, options, false)?.0)
    }

    /// Run a one-shot execution to completion
    pub async fn execute_blocking(&self, plan: Plan, options: ExecutionOptions) -> Outcome {
        match self.start(plan, options, true)? {
            (_, Some(rx)) => receive(rx).await,
            (id, None) => self.get_results(&id),
        }
    }

    pub fn get_execution(&self, id: &ExecutionId) -> Result<ExecutionInfo> {
        self.inner.state.lock().coordinator.info(id)
    }

    /// Results of a finished execution; an error while it still runs
    pub fn get_results(&self, id: &ExecutionId) -> Outcome {
        self.inner.state.lock().coordinator.results(id)
    }

    pub async fn get_results_blocking(&self, id: &ExecutionId) -> Outcome {
        let rx = self.inner.state.lock().wait(id)?;
        receive(rx).await
    }

    pub fn drop_execution(&self, id: &ExecutionId) -> Result<()> {
        let actions = self.inner.state.lock().coordinator.drop_execution(id)?;
        self.apply(actions);
        Ok(())
    }

    pub fn abort_execution(&self, id: &ExecutionId) -> Result<()> {
        let actions = self.inner.state.lock().coordinator.abort(id)?;
        self.apply(actions);
        Ok(())
    }

    pub fn dump_executions(&self) -> Vec<ExecutionInfo> {
        self.inner.state.lock().coordinator.dump()
    }

    // ----- registrations -----

    /// Register a plan on every shard of the cluster
    pub fn register(
        &self,
        plan: Plan,
        trigger: Trigger,
        mode: ExecutionMode,
        description: Option<String>,
    ) -> Result<RegistrationId> {
        plan.validate(&self.inner.callbacks)?;
        let (id, snapshot, actions) = {
            let mut state = self.inner.state.lock();
            let (id, output) = state.registry.register(
                plan,
                trigger,
                mode,
                description,
                self.store_ref(),
                Instant::now(),
            )?;
            let snapshot = state.registry.get(&id).map(RegistrationSnapshot::from);
            let (_, actions) = state.apply_output(output);
            (id, snapshot, actions)
        };
        if let Some(mut registration) = snapshot {
            // stream positions are local to each shard
            registration.stream_acks.clear();
            self.broadcast_registry(&RegistryMessage::Register { registration })?;
        }
        self.apply(actions);
        Ok(id)
    }

    pub fn dump_registrations(&self) -> Vec<RegistrationInfo> {
        self.inner.state.lock().registry.dump()
    }

    pub fn registration(&self, id: &RegistrationId) -> Option<RegistrationInfo> {
        self.inner.state.lock().registry.get(id).map(|r| r.info())
    }

    pub fn pause_registration(&self, id: &RegistrationId) -> Result<()> {
        self.inner.state.lock().registry.pause(id)?;
        self.broadcast_registry(&RegistryMessage::Pause { id: id.clone() })
    }

    pub fn unpause_registration(&self, id: &RegistrationId) -> Result<()> {
        let actions = {
            let mut state = self.inner.state.lock();
            let output = state
                .registry
                .unpause(id, self.store_ref(), Instant::now())?;
            state.apply_output(output).1
        };
        self.broadcast_registry(&RegistryMessage::Unpause { id: id.clone() })?;
        self.apply(actions);
        Ok(())
    }

    /// Remove a registration everywhere
    ///
    /// Running executions are left to finish. With `abort_pending`, the ones
    /// not started yet are aborted and dropped.
    pub fn unregister(&self, id: &RegistrationId, abort_pending: bool) -> Result<()> {
        let actions = self.inner.state.lock().unregister(id, abort_pending)?;
        self.broadcast_registry(&RegistryMessage::Unregister {
            id: id.clone(),
            abort_pending,
        })?;
        self.apply(actions);
        Ok(())
    }

    pub fn clear_registration_stats(&self, id: Option<&RegistrationId>) -> Result<()> {
        self.inner.state.lock().registry.clear_stats(id)
    }

    /// Fire a command-triggered registration and wait for its execution
    pub async fn trigger(&self, name: &str, args: Vec<String>) -> Outcome {
        let (actions, rx) = {
            let mut state = self.inner.state.lock();
            let output = state.registry.trigger_command(name, args)?;
            let (started, actions) = state.apply_output(output);
            let id = started
                .first()
                .cloned()
                .ok_or_else(|| GearsError::ExecutionError(format!("trigger {} did not fire", name)))?;
            (actions, state.wait(&id)?)
        };
        self.apply(actions);
        receive(rx).await
    }

    pub fn snapshot(&self) -> Vec<RegistrationSnapshot> {
        self.inner.state.lock().registry.snapshot()
    }

    /// Reinstall registrations, e.g. after a restart
    pub fn restore(&self, snapshots: Vec<RegistrationSnapshot>) -> Result<()> {
        let actions = {
            let mut state = self.inner.state.lock();
            let output = state
                .registry
                .restore(snapshots, self.store_ref(), Instant::now())?;
            state.apply_output(output).1
        };
        self.apply(actions);
        Ok(())
    }

    pub fn save_registrations(&self, path: &Path) -> Result<()> {
        let snapshots = self.snapshot();
        persist::save(path, &snapshots)?;
        info!("Saved {} registrations to {:?}", snapshots.len(), path);
        Ok(())
    }

    pub fn load_registrations(&self, path: &Path) -> Result<usize> {
        let snapshots = persist::load(path)?;
        let count = snapshots.len();
        self.restore(snapshots)?;
        info!("Restored {} registrations from {:?}", count, path);
        Ok(count)
    }

    // ----- configuration -----

    pub fn config(&self) -> GearsConfig {
        self.inner.config.read().clone()
    }

    pub fn config_get(&self, name: &str) -> Result<String> {
        self.inner.config.read().get(name)
    }

    /// Change a setting at runtime
    pub fn config_set(&self, name: &str, value: &str) -> Result<()> {
        let config = {
            let mut current = self.inner.config.write();
            let mut next = current.clone();
            next.set(name, value)?;
            *current = next.clone();
            next
        };
        {
            let mut state = self.inner.state.lock();
            state
                .coordinator
                .set_config(CoordinatorConfig::from(&config));
            state
                .registry
                .set_max_per_registration(config.max_executions_per_registration);
        }
        self.inner
            .transport
            .update_config(TransportConfig::from(&config));
        info!("Set {} to {} on shard {}", name, value, self.inner.id);
        Ok(())
    }

    // ----- command surface -----

    /// Parse and run an admin or keyspace command
    pub async fn dispatch(&self, args: &[String]) -> CommandReply {
        match GearsCommand::parse(args) {
            Ok(command) => self
                .run_command(command)
                .await
                .unwrap_or_else(CommandReply::from),
            Err(e) => e.into(),
        }
    }

    async fn run_command(&self, command: GearsCommand) -> Result<CommandReply> {
        let reply = match command {
            GearsCommand::Execute {
                plan,
                unblocking: true,
                options,
            } => CommandReply::Str(self.execute(plan, options)?.to_string()),
            GearsCommand::Execute { plan, options, .. } => {
                let (records, errors) = self.execute_blocking(plan, options).await?;
                CommandReply::results(&records, &errors)
            }
            GearsCommand::GetExecution(id) => CommandReply::json(&self.get_execution(&id)?),
            GearsCommand::GetResults(id) => {
                let (records, errors) = self.get_results(&id)?;
                CommandReply::results(&records, &errors)
            }
            GearsCommand::GetResultsBlocking(id) => {
                let (records, errors) = self.get_results_blocking(&id).await?;
                CommandReply::results(&records, &errors)
            }
            GearsCommand::DropExecution(id) => {
                self.drop_execution(&id)?;
                CommandReply::Ok
            }
            GearsCommand::AbortExecution(id) => {
                self.abort_execution(&id)?;
                CommandReply::Ok
            }
            GearsCommand::DumpExecutions => CommandReply::Array(
                self.dump_executions()
                    .iter()
                    .map(CommandReply::json)
                    .collect(),
            ),
            GearsCommand::Register {
                plan,
                trigger,
                mode,
                description,
            } => CommandReply::Str(self.register(plan, trigger, mode, description)?.to_string()),
            GearsCommand::DumpRegistrations => CommandReply::Array(
                self.dump_registrations()
                    .iter()
                    .map(CommandReply::json)
                    .collect(),
            ),
            GearsCommand::PauseRegistrations(ids) => {
                for id in &ids {
                    self.pause_registration(id)?;
                }
                CommandReply::Ok
            }
            GearsCommand::UnpauseRegistrations(ids) => {
                for id in &ids {
                    self.unpause_registration(id)?;
                }
                CommandReply::Ok
            }
            GearsCommand::Unregister { id, abort_pending } => {
                self.unregister(&id, abort_pending)?;
                CommandReply::Ok
            }
            GearsCommand::ClearRegistrationsStats(id) => {
                self.clear_registration_stats(id.as_ref())?;
                CommandReply::Ok
            }
            GearsCommand::ConfigGet(names) => CommandReply::Array(
                names
                    .iter()
                    .map(|name| match self.config_get(name) {
                        Ok(value) => CommandReply::Str(value),
                        Err(e) => e.into(),
                    })
                    .collect(),
            ),
            GearsCommand::ConfigSet(pairs) => {
                for (name, value) in &pairs {
                    self.config_set(name, value)?;
                }
                CommandReply::Ok
            }
            GearsCommand::InfoCluster => CommandReply::json(&self.cluster_info()),
            GearsCommand::Trigger { name, args } => {
                let (records, errors) = self.trigger(&name, args).await?;
                CommandReply::results(&records, &errors)
            }
            GearsCommand::Store(args) => self.call(&args).await?,
        };
        Ok(reply)
    }
}
