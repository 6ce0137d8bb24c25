//! Inter-shard messaging transport
//!
//! The transport gives each shard exactly-once, in-order delivery of named
//! messages to every other shard of the topology, as long as the receiving
//! process stays up. Outbound traffic to each peer is driven by one tokio task
//! wrapping a [`PeerConnection`]; inbound frames are served by the
//! [`FrameHandler`] implementation on [`Transport`].

use crate::dedup::DedupTable;
use crate::frame::{Frame, Reply, NOAUTH, UNINITIALIZED_CLUSTER, UNKNOWN_COMMAND};
use crate::link::{Connector, FrameHandler, InboundSession, InnerHandler, Link};
use crate::peer::{AckOutcome, DeliveryFailure, HandshakeOutcome, PeerConnection, PeerStatus};
use crate::topology::{ClusterTopology, NodeInfo, TopologyDelta};
use dashmap::DashMap;
use gears_core::{GearsConfig, GearsError, Result, RunId, ShardId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Transport settings taken from the shard configuration
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub password: Option<String>,
    /// Resends allowed per message, 0 for unlimited
    pub send_msg_retries: u32,
    pub hello_retry_interval: Duration,
    pub reconnect_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&GearsConfig::default())
    }
}

impl From<&GearsConfig> for TransportConfig {
    fn from(config: &GearsConfig) -> Self {
        Self {
            password: config.cluster_password.clone(),
            send_msg_retries: config.send_msg_retries,
            hello_retry_interval: config.hello_retry_delay(),
            reconnect_interval: config.reconnect_delay(),
        }
    }
}

/// Callback told about messages the transport gave up on
pub type FailureHandler = Arc<dyn Fn(DeliveryFailure) + Send + Sync>;

/// Callback told about every applied topology
pub type TopologyHandler = Arc<dyn Fn(Arc<ClusterTopology>) + Send + Sync>;

/// Status of one topology node as seen from this shard
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub id: ShardId,
    pub address: String,
    pub run_id: Option<RunId>,
    pub min_slot: u16,
    pub max_slot: u16,
    pub pending_messages: usize,
    /// `None` for this shard itself
    pub status: Option<String>,
}

/// Snapshot of the cluster from this shard's point of view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterInfo {
    pub my_id: ShardId,
    pub my_run_id: RunId,
    pub nodes: Vec<NodeStatus>,
}

struct Peer {
    node: NodeInfo,
    state: Arc<Mutex<PeerConnection>>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

struct TransportInner {
    my_id: ShardId,
    run_id: RunId,
    config: RwLock<TransportConfig>,
    connector: Arc<dyn Connector>,
    topology: RwLock<Option<Arc<ClusterTopology>>>,
    peers: DashMap<ShardId, Peer>,
    dedup: Mutex<DedupTable>,
    handlers: DashMap<String, Arc<dyn InnerHandler>>,
    on_failure: RwLock<Option<FailureHandler>>,
    on_topology: RwLock<Option<TopologyHandler>>,
    runtime: Handle,
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        for peer in self.peers.iter() {
            peer.task.abort();
        }
    }
}

/// Handle to a shard's transport; cheap to clone
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Create a transport; must be called within a tokio runtime
    pub fn new(
        my_id: ShardId,
        run_id: RunId,
        config: TransportConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| GearsError::TransportError(format!("no async runtime: {}", e)))?;
        Ok(Self {
            inner: Arc::new(TransportInner {
                my_id,
                run_id,
                config: RwLock::new(config),
                connector,
                topology: RwLock::new(None),
                peers: DashMap::new(),
                dedup: Mutex::new(DedupTable::new()),
                handlers: DashMap::new(),
                on_failure: RwLock::new(None),
                on_topology: RwLock::new(None),
                runtime,
            }),
        })
    }

    pub fn my_id(&self) -> &ShardId {
        &self.inner.my_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.run_id
    }

    pub fn topology(&self) -> Option<Arc<ClusterTopology>> {
        self.inner.topology.read().clone()
    }

    /// Whether a topology has been applied
    pub fn is_initialized(&self) -> bool {
        self.inner.topology.read().is_some()
    }

    /// Register the handler for messages named `command`
    pub fn register_handler(&self, command: impl Into<String>, handler: Arc<dyn InnerHandler>) {
        let command = command.into();
        debug!("Registered message handler {}", command);
        self.inner.handlers.insert(command, handler);
    }

    pub fn set_failure_handler(&self, handler: FailureHandler) {
        *self.inner.on_failure.write() = Some(handler);
    }

    pub fn set_topology_handler(&self, handler: TopologyHandler) {
        *self.inner.on_topology.write() = Some(handler);
    }

    /// Apply new settings; the retry budget takes effect immediately
    pub fn update_config(&self, config: TransportConfig) {
        for peer in self.inner.peers.iter() {
            peer.state.lock().set_max_retries(config.send_msg_retries);
        }
        *self.inner.config.write() = config;
    }

    /// Queue a message for `target`, returning its per-peer id
    ///
    /// Returns as soon as the message is queued. Delivery happens in the
    /// background; a message the transport gives up on is reported to the
    /// failure handler.
    pub fn send(&self, target: &ShardId, command: &str, payload: impl Into<String>) -> Result<u64> {
        let topology = self
            .topology()
            .ok_or_else(|| GearsError::ClusterError("Uninitialized cluster state".to_string()))?;
        if target == &self.inner.my_id {
            return Err(GearsError::TransportError(
                "cannot send a message to this shard".to_string(),
            ));
        }
        let node = topology
            .node(target)
            .ok_or_else(|| GearsError::NotFound("shard", target.to_string()))?;

        let peer = self
            .inner
            .peers
            .entry(target.clone())
            .or_insert_with(|| self.spawn_peer(node.clone()));
        let msg_id = peer.state.lock().enqueue(command, payload);
        peer.wake.notify_one();
        debug!("Queued {} message {} for {}", command, msg_id, target);
        Ok(msg_id)
    }

    /// Queue a message for every other shard of the topology
    pub fn broadcast(&self, command: &str, payload: &str) -> Result<usize> {
        let topology = self
            .topology()
            .ok_or_else(|| GearsError::ClusterError("Uninitialized cluster state".to_string()))?;
        let peers = topology.peers_of(&self.inner.my_id);
        for peer in &peers {
            self.send(peer, command, payload)?;
        }
        Ok(peers.len())
    }

    /// Replace the topology atomically
    ///
    /// Peers missing from the new topology are torn down and their queued
    /// messages reported as failed. Peers whose endpoint changed reconnect
    /// and keep their queue.
    pub fn set_topology(&self, topology: ClusterTopology) {
        let topology = Arc::new(topology);
        let mut failures = Vec::new();
        {
            let mut current = self.inner.topology.write();

            let known: Vec<ShardId> = self.inner.peers.iter().map(|p| p.key().clone()).collect();
            for id in known {
                match topology.node(&id) {
                    None => {
                        if let Some((_, peer)) = self.inner.peers.remove(&id) {
                            peer.task.abort();
                            info!("Shard {} left the topology", id);
                            failures.extend(peer.state.lock().drain("shard removed from topology"));
                        }
                    }
                    Some(node) => {
                        let changed = self
                            .inner
                            .peers
                            .get(&id)
                            .map(|p| p.node != *node)
                            .unwrap_or(false);
                        if changed {
                            if let Some(mut peer) = self.inner.peers.get_mut(&id) {
                                info!("Shard {} moved to {}", id, node.address());
                                peer.task.abort();
                                peer.state.lock().connection_lost();
                                peer.node = node.clone();
                                peer.task = self.spawn_task(
                                    node.clone(),
                                    peer.state.clone(),
                                    peer.wake.clone(),
                                );
                            }
                        }
                    }
                }
            }

            info!(
                "Applied cluster topology with {} shards on {}",
                topology.len(),
                self.inner.my_id
            );
            *current = Some(topology.clone());
        }

        self.report(failures);
        let handler = self.inner.on_topology.read().clone();
        if let Some(handler) = handler {
            handler(topology);
        }
    }

    /// Apply an incremental topology change
    pub fn apply_delta(&self, delta: &TopologyDelta) -> Result<()> {
        let current = self
            .topology()
            .ok_or_else(|| GearsError::ClusterError("Uninitialized cluster state".to_string()))?;
        self.set_topology(current.apply(delta));
        Ok(())
    }

    pub fn peer_status(&self, target: &ShardId) -> Option<PeerStatus> {
        self.inner.peers.get(target).map(|p| p.state.lock().status())
    }

    pub fn pending_count(&self, target: &ShardId) -> usize {
        self.inner
            .peers
            .get(target)
            .map(|p| p.state.lock().pending_len())
            .unwrap_or(0)
    }

    /// Messages still waiting for an ack, over all peers
    pub fn total_pending(&self) -> usize {
        self.inner
            .peers
            .iter()
            .map(|p| p.state.lock().pending_len())
            .sum()
    }

    /// Describe every node of the topology
    pub fn cluster_info(&self) -> ClusterInfo {
        let nodes = self
            .topology()
            .map(|topology| {
                topology
                    .nodes
                    .iter()
                    .map(|node| self.node_status(node))
                    .collect()
            })
            .unwrap_or_default();
        ClusterInfo {
            my_id: self.inner.my_id.clone(),
            my_run_id: self.inner.run_id.clone(),
            nodes,
        }
    }

    fn node_status(&self, node: &NodeInfo) -> NodeStatus {
        let mut status = NodeStatus {
            id: node.id.clone(),
            address: node.address(),
            run_id: None,
            min_slot: node.min_slot,
            max_slot: node.max_slot,
            pending_messages: 0,
            status: None,
        };
        if node.id == self.inner.my_id {
            status.run_id = Some(self.inner.run_id.clone());
        } else if let Some(peer) = self.inner.peers.get(&node.id) {
            let state = peer.state.lock();
            status.run_id = state.peer_run_id().cloned();
            status.pending_messages = state.pending_len();
            status.status = Some(state.status().to_string());
        } else {
            status.status = Some(PeerStatus::Disconnected.to_string());
        }
        status
    }

    fn spawn_peer(&self, node: NodeInfo) -> Peer {
        let max_retries = self.inner.config.read().send_msg_retries;
        let state = Arc::new(Mutex::new(PeerConnection::new(
            node.id.clone(),
            self.inner.my_id.clone(),
            self.inner.run_id.clone(),
            max_retries,
        )));
        let wake = Arc::new(Notify::new());
        let task = self.spawn_task(node.clone(), state.clone(), wake.clone());
        Peer {
            node,
            state,
            wake,
            task,
        }
    }

    fn spawn_task(
        &self,
        node: NodeInfo,
        state: Arc<Mutex<PeerConnection>>,
        wake: Arc<Notify>,
    ) -> JoinHandle<()> {
        let ctx = PeerTask {
            node,
            state,
            wake,
            connector: self.inner.connector.clone(),
            shared: Arc::downgrade(&self.inner),
        };
        self.inner.runtime.spawn(ctx.run())
    }

    fn report(&self, failures: Vec<DeliveryFailure>) {
        report_failures(&self.inner, failures);
    }
}

fn report_failures(inner: &TransportInner, failures: Vec<DeliveryFailure>) {
    if failures.is_empty() {
        return;
    }
    let handler = inner.on_failure.read().clone();
    for failure in failures {
        warn!(
            "Gave up on {} message {} to {}: {}",
            failure.command, failure.msg_id, failure.target, failure.reason
        );
        if let Some(handler) = &handler {
            handler(failure);
        }
    }
}

impl FrameHandler for Transport {
    fn handle(&self, session: &mut InboundSession, frame: Frame) -> Reply {
        let password = self.inner.config.read().password.clone();
        if password.is_some() && !session.authenticated && !matches!(frame, Frame::Auth { .. }) {
            return Reply::error(NOAUTH);
        }

        match frame {
            Frame::Auth { password: given } => match password {
                Some(expected) if expected != given => {
                    Reply::error("WRONGPASS invalid cluster password")
                }
                _ => {
                    session.authenticated = true;
                    Reply::Ok
                }
            },
            Frame::Hello => {
                if !self.is_initialized() {
                    return Reply::error(UNINITIALIZED_CLUSTER);
                }
                Reply::RunId(self.inner.run_id.clone())
            }
            Frame::ClusterSet {
                topology,
                from_shard,
            } => {
                if from_shard && self.is_initialized() {
                    debug!("Ignoring topology pushed by a peer, already initialized");
                    return Reply::Ok;
                }
                self.set_topology(topology);
                Reply::Ok
            }
            Frame::ClusterDelta { delta } => match self.apply_delta(&delta) {
                Ok(()) => Reply::Ok,
                Err(_) => Reply::error(UNINITIALIZED_CLUSTER),
            },
            Frame::InnerMsg {
                sender,
                sender_run_id,
                msg_id,
                command,
                payload,
            } => {
                if !self.is_initialized() {
                    return Reply::error(UNINITIALIZED_CLUSTER);
                }
                let handler = match self.inner.handlers.get(&command) {
                    Some(handler) => handler.clone(),
                    None => {
                        warn!("Message {} from {} names unknown command {}", msg_id, sender, command);
                        return Reply::error(UNKNOWN_COMMAND);
                    }
                };
                {
                    let mut dedup = self.inner.dedup.lock();
                    if dedup.is_duplicate(&sender, &sender_run_id, msg_id) {
                        debug!("Duplicate message {} from {} ignored", msg_id, sender);
                        return Reply::Duplicate;
                    }
                    dedup.record(&sender, &sender_run_id, msg_id);
                }
                handler.on_message(&sender, &payload);
                Reply::Ok
            }
        }
    }
}

struct PeerTask {
    node: NodeInfo,
    state: Arc<Mutex<PeerConnection>>,
    wake: Arc<Notify>,
    connector: Arc<dyn Connector>,
    shared: Weak<TransportInner>,
}

enum LinkEnd {
    /// Connection failed; reconnect after the reconnect interval
    Lost,
    /// Handshake asked for a fresh connection; retry after the hello interval
    Rehandshake,
    /// The transport is gone
    Shutdown,
}

impl PeerTask {
    async fn run(self) {
        loop {
            let end = match self.connector.connect(&self.node).await {
                Ok(mut link) => self.drive(link.as_mut()).await,
                Err(e) => {
                    debug!("Connecting to shard {} failed: {}", self.node.id, e);
                    LinkEnd::Lost
                }
            };
            self.state.lock().connection_lost();

            let config = match self.shared.upgrade() {
                Some(inner) => inner.config.read().clone(),
                None => return,
            };
            match end {
                LinkEnd::Lost => tokio::time::sleep(config.reconnect_interval).await,
                LinkEnd::Rehandshake => tokio::time::sleep(config.hello_retry_interval).await,
                LinkEnd::Shutdown => return,
            }
        }
    }

    async fn drive(&self, link: &mut dyn Link) -> LinkEnd {
        match self.handshake(link).await {
            Ok(None) => {}
            Ok(Some(end)) => return end,
            Err(e) => {
                debug!("Handshake with shard {} failed: {}", self.node.id, e);
                return LinkEnd::Lost;
            }
        }

        loop {
            let frame = self.state.lock().next_frame();
            let Some(frame) = frame else {
                self.wake.notified().await;
                continue;
            };
            match link.call(frame).await {
                Ok(reply) => {
                    let outcome = self.state.lock().on_reply(&reply);
                    if outcome == AckOutcome::Disconnect {
                        return LinkEnd::Lost;
                    }
                }
                Err(e) => {
                    debug!("Sending to shard {} failed: {}", self.node.id, e);
                    return LinkEnd::Lost;
                }
            }
        }
    }

    /// `Ok(None)` once messages may flow
    async fn handshake(&self, link: &mut dyn Link) -> Result<Option<LinkEnd>> {
        loop {
            let frames = {
                let Some(inner) = self.shared.upgrade() else {
                    return Ok(Some(LinkEnd::Shutdown));
                };
                let password = inner.config.read().password.clone();
                let topology = inner.topology.read().clone();
                self.state
                    .lock()
                    .connection_opened(password.as_deref(), topology.as_deref())
            };

            for frame in frames {
                let is_hello = matches!(frame, Frame::Hello);
                let name = frame.name();
                let reply = link.call(frame).await?;
                if !is_hello {
                    if let Reply::Error(e) = &reply {
                        warn!("Shard {} rejected {}: {}", self.node.id, name, e);
                    }
                    continue;
                }

                let outcome = self.state.lock().on_handshake_reply(&reply);
                match outcome {
                    HandshakeOutcome::Established { failed } => {
                        if let Some(inner) = self.shared.upgrade() {
                            report_failures(&inner, failed);
                        }
                        return Ok(None);
                    }
                    HandshakeOutcome::Retry { reconnect: true } => {
                        return Ok(Some(LinkEnd::Rehandshake));
                    }
                    HandshakeOutcome::Retry { reconnect: false } => {
                        let delay = match self.shared.upgrade() {
                            Some(inner) => inner.config.read().hello_retry_interval,
                            None => return Ok(Some(LinkEnd::Shutdown)),
                        };
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}
