//! Gears Executor
//!
//! Runs plans across the shards of a cluster:
//!
//! - `execution`: per-execution state, modes and options
//! - `table`: capacity-bounded execution table
//! - `protocol`: messages exchanged between participating shards
//! - `worker`: a single segment of work against the local store
//! - `coordinator`: the state machine tying the above together

pub mod coordinator;
pub mod execution;
pub mod protocol;
pub mod table;
pub mod worker;

pub use coordinator::{Action, Coordinator, CoordinatorConfig, FinishedExecution, PlanResolver};
pub use execution::{
    Execution, ExecutionInfo, ExecutionMode, ExecutionOptions, ExecutionStats, ExecutionStatus,
    ABORTED_ERROR, MAX_IDLE_ERROR,
};
pub use protocol::{ExecutionMessage, PlanSource, EXECUTION_COMMAND};
pub use table::ExecutionTable;
pub use worker::{SegmentInput, SegmentResult, SegmentTask};
