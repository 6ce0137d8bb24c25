//! Inter-shard control surface

use crate::topology::{ClusterTopology, TopologyDelta};
use gears_core::{RunId, ShardId, ERR_CLUSTER_PREFIX};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reply text for a message that was already applied
pub const DUPLICATE_IGNORED: &str = "duplicate message ignored";

/// Error text for an inner message naming an unknown command
pub const UNKNOWN_COMMAND: &str = "can not find the callback requested";

/// Error text for a message arriving before any topology is known
pub const UNINITIALIZED_CLUSTER: &str = "ERRCLUSTER Uninitialized cluster state";

/// Error text for a frame sent before authenticating
pub const NOAUTH: &str = "NOAUTH Authentication required.";

/// A request sent from one shard to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Present the cluster password
    Auth { password: String },
    /// Handshake; the reply carries the receiver's run id
    Hello,
    /// Replace the receiver's topology
    ClusterSet {
        topology: ClusterTopology,
        /// Only apply when the receiver has no topology yet
        #[serde(default)]
        from_shard: bool,
    },
    /// Incrementally change the receiver's topology
    ClusterDelta { delta: TopologyDelta },
    /// Application message addressed to a named command
    InnerMsg {
        sender: ShardId,
        sender_run_id: RunId,
        msg_id: u64,
        command: String,
        payload: String,
    },
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Auth { .. } => "auth",
            Frame::Hello => "hello",
            Frame::ClusterSet { .. } => "clusterset",
            Frame::ClusterDelta { .. } => "clusterdelta",
            Frame::InnerMsg { .. } => "innermsg",
        }
    }
}

/// Response to a [`Frame`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    /// Handshake reply
    RunId(RunId),
    /// The message id was already applied
    Duplicate,
    Error(String),
}

impl Reply {
    pub fn error(msg: impl Into<String>) -> Self {
        Reply::Error(msg.into())
    }

    /// Error reply signalling that the receiver lacks a usable topology
    pub fn is_cluster_error(&self) -> bool {
        matches!(self, Reply::Error(e) if e.starts_with(ERR_CLUSTER_PREFIX))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => write!(f, "OK"),
            Reply::RunId(id) => write!(f, "{}", id),
            Reply::Duplicate => write!(f, "{}", DUPLICATE_IGNORED),
            Reply::Error(e) => write!(f, "(error) {}", e),
        }
    }
}
