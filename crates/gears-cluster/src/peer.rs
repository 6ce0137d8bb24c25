//! Outbound connection state machine for one directed shard pair
//!
//! `PeerConnection` performs no I/O. The transport's peer task feeds it
//! connection events and replies and writes whatever frames it hands back,
//! so every ordering and retry rule lives here and can be tested without a
//! network.

use crate::frame::{Frame, Reply};
use crate::topology::ClusterTopology;
use gears_core::{RunId, ShardId};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, warn};

/// Connection status of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// No connection; one will be opened when needed
    Disconnected,
    /// Connected and waiting for the handshake reply
    HelloSent,
    /// Handshake done, application messages flow
    Connected,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Disconnected => write!(f, "Disconnected"),
            PeerStatus::HelloSent => write!(f, "HelloSent"),
            PeerStatus::Connected => write!(f, "Connected"),
        }
    }
}

/// An application message waiting for its ack
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub msg_id: u64,
    pub command: String,
    pub payload: String,
    /// Number of times the message was resent after a reconnect
    pub retries: u32,
    /// Written on some connection at least once
    sent: bool,
}

/// A message the transport gave up on
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryFailure {
    pub target: ShardId,
    pub msg_id: u64,
    pub command: String,
    pub payload: String,
    pub reason: String,
}

/// Result of feeding a handshake reply
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeOutcome {
    /// Messages may flow; `failed` lists messages dropped on the way
    Established { failed: Vec<DeliveryFailure> },
    /// Handshake must be retried, over a fresh connection if `reconnect`
    Retry { reconnect: bool },
}

/// Result of feeding the reply to an application message
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// The head message was acknowledged and removed
    Acked(u64),
    /// The connection must be closed; the message stays queued
    Disconnect,
}

/// Outbound side of one shard pair
#[derive(Debug)]
pub struct PeerConnection {
    target: ShardId,
    my_id: ShardId,
    my_run_id: RunId,
    status: PeerStatus,
    pending: VecDeque<PendingMessage>,
    next_msg_id: u64,
    peer_run_id: Option<RunId>,
    in_flight: bool,
    send_topology_on_connect: bool,
    max_retries: u32,
}

impl PeerConnection {
    /// Create a disconnected peer; `max_retries == 0` means unlimited
    pub fn new(target: ShardId, my_id: ShardId, my_run_id: RunId, max_retries: u32) -> Self {
        Self {
            target,
            my_id,
            my_run_id,
            status: PeerStatus::Disconnected,
            pending: VecDeque::new(),
            next_msg_id: 1,
            peer_run_id: None,
            in_flight: false,
            send_topology_on_connect: false,
            max_retries,
        }
    }

    pub fn target(&self) -> &ShardId {
        &self.target
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    /// Run id learned from the last successful handshake
    pub fn peer_run_id(&self) -> Option<&RunId> {
        self.peer_run_id.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingMessage> {
        self.pending.iter()
    }

    /// Whether the next connection will push the topology before the hello
    pub fn will_send_topology(&self) -> bool {
        self.send_topology_on_connect
    }

    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
    }

    /// Queue a message, returning its id
    pub fn enqueue(&mut self, command: impl Into<String>, payload: impl Into<String>) -> u64 {
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;
        self.pending.push_back(PendingMessage {
            msg_id,
            command: command.into(),
            payload: payload.into(),
            retries: 0,
            sent: false,
        });
        msg_id
    }

    /// A new connection is open; returns the frames to write before messages flow
    pub fn connection_opened(
        &mut self,
        password: Option<&str>,
        topology: Option<&ClusterTopology>,
    ) -> Vec<Frame> {
        self.status = PeerStatus::HelloSent;
        self.in_flight = false;

        let mut frames = Vec::new();
        if let Some(password) = password {
            frames.push(Frame::Auth {
                password: password.to_string(),
            });
        }
        if self.send_topology_on_connect {
            if let Some(topology) = topology {
                debug!("Sending cluster topology to {} before hello", self.target);
                frames.push(Frame::ClusterSet {
                    topology: topology.clone(),
                    from_shard: true,
                });
                self.send_topology_on_connect = false;
            }
        }
        frames.push(Frame::Hello);
        frames
    }

    /// Feed the reply to the hello frame
    pub fn on_handshake_reply(&mut self, reply: &Reply) -> HandshakeOutcome {
        let run_id = match reply {
            Reply::RunId(run_id) => run_id.clone(),
            other => {
                let reconnect = other.is_cluster_error();
                if reconnect {
                    self.send_topology_on_connect = true;
                }
                warn!(
                    "Handshake with {} failed: {}, will retry{}",
                    self.target,
                    other,
                    if reconnect { " with topology" } else { "" }
                );
                return HandshakeOutcome::Retry { reconnect };
            }
        };

        let mut failed = Vec::new();
        match &self.peer_run_id {
            Some(old) if *old != run_id => {
                info!(
                    "Shard {} restarted (run id {} -> {}), resequencing messages",
                    self.target, old, run_id
                );
                self.next_msg_id = 1;
                let pending = std::mem::take(&mut self.pending);
                for msg in pending {
                    if msg.sent {
                        failed.push(self.failure(msg, "peer restarted before acknowledging"));
                    } else {
                        self.enqueue(msg.command, msg.payload);
                    }
                }
            }
            _ => {
                let max_retries = self.max_retries;
                let pending = std::mem::take(&mut self.pending);
                for mut msg in pending {
                    if msg.sent {
                        if max_retries > 0 && msg.retries >= max_retries {
                            warn!(
                                "Dropping message {} to {} after {} retries",
                                msg.msg_id, self.target, msg.retries
                            );
                            failed.push(self.failure(msg, "retry budget exhausted"));
                            continue;
                        }
                        msg.retries += 1;
                        msg.sent = false;
                    }
                    self.pending.push_back(msg);
                }
            }
        }

        self.peer_run_id = Some(run_id);
        self.status = PeerStatus::Connected;
        info!(
            "Connected to shard {} ({} pending messages)",
            self.target,
            self.pending.len()
        );
        HandshakeOutcome::Established { failed }
    }

    /// Next frame to write, if messages may flow and none is awaiting its ack
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.status != PeerStatus::Connected || self.in_flight {
            return None;
        }
        let msg = self.pending.front_mut()?;
        msg.sent = true;
        self.in_flight = true;
        Some(Frame::InnerMsg {
            sender: self.my_id.clone(),
            sender_run_id: self.my_run_id.clone(),
            msg_id: msg.msg_id,
            command: msg.command.clone(),
            payload: msg.payload.clone(),
        })
    }

    /// Feed the reply to the in-flight message
    pub fn on_reply(&mut self, reply: &Reply) -> AckOutcome {
        self.in_flight = false;
        match reply {
            Reply::Ok | Reply::Duplicate => {
                if matches!(reply, Reply::Duplicate) {
                    debug!("Shard {} already applied our message", self.target);
                }
                match self.pending.pop_front() {
                    Some(msg) => AckOutcome::Acked(msg.msg_id),
                    None => AckOutcome::Disconnect,
                }
            }
            other => {
                if other.is_cluster_error() {
                    self.send_topology_on_connect = true;
                }
                warn!(
                    "Unexpected reply from shard {}: {}, reconnecting",
                    self.target, other
                );
                AckOutcome::Disconnect
            }
        }
    }

    /// The connection closed or failed
    pub fn connection_lost(&mut self) {
        if self.status != PeerStatus::Disconnected {
            warn!("Lost connection to shard {}", self.target);
        }
        self.status = PeerStatus::Disconnected;
        self.in_flight = false;
    }

    /// Give up on every queued message
    pub fn drain(&mut self, reason: &str) -> Vec<DeliveryFailure> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .map(|msg| self.failure(msg, reason))
            .collect()
    }

    fn failure(&self, msg: PendingMessage, reason: &str) -> DeliveryFailure {
        DeliveryFailure {
            target: self.target.clone(),
            msg_id: msg.msg_id,
            command: msg.command,
            payload: msg.payload,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::UNINITIALIZED_CLUSTER;

    fn peer(max_retries: u32) -> PeerConnection {
        PeerConnection::new(
            ShardId::from("b"),
            ShardId::from("a"),
            RunId::from("run-a"),
            max_retries,
        )
    }

    fn connect(p: &mut PeerConnection, run: &str) -> HandshakeOutcome {
        let frames = p.connection_opened(None, None);
        assert_eq!(frames.last(), Some(&Frame::Hello));
        p.on_handshake_reply(&Reply::RunId(RunId::from(run)))
    }

    fn msg_id(frame: Option<Frame>) -> u64 {
        match frame {
            Some(Frame::InnerMsg { msg_id, .. }) => msg_id,
            other => panic!("expected inner message, got {:?}", other),
        }
    }

    #[test]
    fn test_messages_wait_for_handshake() {
        let mut p = peer(3);
        assert_eq!(p.enqueue("cmd", "x"), 1);
        assert!(p.next_frame().is_none());

        p.connection_opened(None, None);
        assert_eq!(p.status(), PeerStatus::HelloSent);
        assert!(p.next_frame().is_none());

        let outcome = p.on_handshake_reply(&Reply::RunId(RunId::from("run-b")));
        assert_eq!(outcome, HandshakeOutcome::Established { failed: vec![] });
        assert_eq!(msg_id(p.next_frame()), 1);
    }

    #[test]
    fn test_fifo_one_in_flight() {
        let mut p = peer(3);
        connect(&mut p, "run-b");
        p.enqueue("cmd", "1");
        p.enqueue("cmd", "2");
        assert_eq!(msg_id(p.next_frame()), 1);
        assert!(p.next_frame().is_none());
        assert_eq!(p.on_reply(&Reply::Ok), AckOutcome::Acked(1));
        assert_eq!(msg_id(p.next_frame()), 2);
        assert_eq!(p.on_reply(&Reply::Duplicate), AckOutcome::Acked(2));
        assert_eq!(p.pending_len(), 0);
    }

    #[test]
    fn test_resend_after_reconnect_keeps_ids() {
        let mut p = peer(3);
        connect(&mut p, "run-b");
        p.enqueue("cmd", "1");
        p.enqueue("cmd", "2");
        assert_eq!(msg_id(p.next_frame()), 1);
        p.connection_lost();
        assert_eq!(p.status(), PeerStatus::Disconnected);

        connect(&mut p, "run-b");
        let retries: Vec<u32> = p.pending().map(|m| m.retries).collect();
        assert_eq!(retries, vec![1, 0]);
        assert_eq!(msg_id(p.next_frame()), 1);
        p.on_reply(&Reply::Duplicate);
        assert_eq!(msg_id(p.next_frame()), 2);
        assert_eq!(p.enqueue("cmd", "3"), 3);
    }

    #[test]
    fn test_retry_budget_exhaustion() {
        let mut p = peer(2);
        connect(&mut p, "run-b");
        p.enqueue("cmd", "payload");
        for _ in 0..2 {
            p.next_frame();
            p.connection_lost();
            match connect(&mut p, "run-b") {
                HandshakeOutcome::Established { failed } => assert!(failed.is_empty()),
                other => panic!("unexpected {:?}", other),
            }
        }
        p.next_frame();
        p.connection_lost();
        match connect(&mut p, "run-b") {
            HandshakeOutcome::Established { failed } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].payload, "payload");
                assert_eq!(failed[0].reason, "retry budget exhausted");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(p.pending_len(), 0);
    }

    #[test]
    fn test_unlimited_retries() {
        let mut p = peer(0);
        connect(&mut p, "run-b");
        p.enqueue("cmd", "x");
        for _ in 0..10 {
            p.next_frame();
            p.connection_lost();
            connect(&mut p, "run-b");
        }
        assert_eq!(p.pending_len(), 1);
    }

    #[test]
    fn test_peer_restart_resequences() {
        let mut p = peer(3);
        connect(&mut p, "run-b");
        p.enqueue("cmd", "sent");
        p.next_frame();
        p.connection_lost();
        p.enqueue("cmd", "unsent");

        match connect(&mut p, "run-b2") {
            HandshakeOutcome::Established { failed } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].payload, "sent");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(p.peer_run_id(), Some(&RunId::from("run-b2")));
        assert_eq!(msg_id(p.next_frame()), 1);
        assert_eq!(p.enqueue("cmd", "next"), 2);
    }

    #[test]
    fn test_cluster_error_sends_topology_next_time() {
        let mut p = peer(3);
        p.connection_opened(Some("secret"), None);
        let outcome = p.on_handshake_reply(&Reply::error(UNINITIALIZED_CLUSTER));
        assert_eq!(outcome, HandshakeOutcome::Retry { reconnect: true });
        assert!(p.will_send_topology());

        let topo = ClusterTopology::default();
        let frames = p.connection_opened(Some("secret"), Some(&topo));
        assert_eq!(
            frames,
            vec![
                Frame::Auth {
                    password: "secret".into()
                },
                Frame::ClusterSet {
                    topology: topo,
                    from_shard: true
                },
                Frame::Hello,
            ]
        );
        assert!(!p.will_send_topology());
    }

    #[test]
    fn test_error_reply_disconnects_and_keeps_message() {
        let mut p = peer(3);
        connect(&mut p, "run-b");
        p.enqueue("cmd", "x");
        p.next_frame();
        assert_eq!(
            p.on_reply(&Reply::error(UNINITIALIZED_CLUSTER)),
            AckOutcome::Disconnect
        );
        assert_eq!(p.pending_len(), 1);
        assert!(p.will_send_topology());
    }

    #[test]
    fn test_handshake_error_without_cluster_prefix() {
        let mut p = peer(3);
        p.connection_opened(None, None);
        assert_eq!(
            p.on_handshake_reply(&Reply::error("LOADING")),
            HandshakeOutcome::Retry { reconnect: false }
        );
        assert_eq!(p.status(), PeerStatus::HelloSent);
    }

    #[test]
    fn test_drain() {
        let mut p = peer(3);
        p.enqueue("a", "1");
        p.enqueue("b", "2");
        let failed = p.drain("removed");
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[1].command, "b");
        assert_eq!(p.pending_len(), 0);
    }
}
