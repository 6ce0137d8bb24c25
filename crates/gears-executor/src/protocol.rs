//! Messages exchanged between shards taking part in an execution

use crate::execution::ExecutionOptions;
use gears_core::{ExecutionId, Record, RegistrationId, Result, ShardId};
use gears_plan::{Plan, ReaderInput};
use serde::{Deserialize, Serialize};

/// Transport command carrying [`ExecutionMessage`] payloads
pub const EXECUTION_COMMAND: &str = "gears.execution";

/// How a peer obtains the plan to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Inline(Plan),
    /// Plan of a registration every shard already holds
    Registration(RegistrationId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionMessage {
    /// Initiator asks a peer to create the execution
    Distribute {
        id: ExecutionId,
        plan: PlanSource,
        input: ReaderInput,
        options: ExecutionOptions,
        participants: Vec<ShardId>,
    },
    /// Peer created the execution
    Received { id: ExecutionId },
    /// Every peer holds the execution; start the first segment
    Run { id: ExecutionId },
    /// Records routed to the receiver at the end of segment `step`
    ShuffleRecords {
        id: ExecutionId,
        step: usize,
        records: Vec<Record>,
    },
    /// Sender finished shuffling segment `step`
    ShuffleDone { id: ExecutionId, step: usize },
    /// Peer finished its last segment
    ShardDone {
        id: ExecutionId,
        errors: Vec<String>,
        #[serde(default)]
        aborted: bool,
    },
    /// Initiator finished; peers forget the execution
    Terminate { id: ExecutionId },
    Abort { id: ExecutionId },
    Drop { id: ExecutionId },
}

impl ExecutionMessage {
    pub fn id(&self) -> &ExecutionId {
        match self {
            ExecutionMessage::Distribute { id, .. }
            | ExecutionMessage::Received { id }
            | ExecutionMessage::Run { id }
            | ExecutionMessage::ShuffleRecords { id, .. }
            | ExecutionMessage::ShuffleDone { id, .. }
            | ExecutionMessage::ShardDone { id, .. }
            | ExecutionMessage::Terminate { id }
            | ExecutionMessage::Abort { id }
            | ExecutionMessage::Drop { id } => id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionMessage::Distribute { .. } => "distribute",
            ExecutionMessage::Received { .. } => "received",
            ExecutionMessage::Run { .. } => "run",
            ExecutionMessage::ShuffleRecords { .. } => "shuffle_records",
            ExecutionMessage::ShuffleDone { .. } => "shuffle_done",
            ExecutionMessage::ShardDone { .. } => "shard_done",
            ExecutionMessage::Terminate { .. } => "terminate",
            ExecutionMessage::Abort { .. } => "abort",
            ExecutionMessage::Drop { .. } => "drop",
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}
