//! Gears Plan
//!
//! Plans describe what an execution does, independent of where it runs:
//!
//! - `reader`: where the first records come from
//! - `stage`: the tagged-union stage list
//! - `plan`: immutable plans and their split into shuffle-bounded segments
//! - `builder`: fluent construction, including two-phase aggregation helpers
//! - `builtins`: callbacks backing those helpers
//! - `pipeline`: evaluation of a segment on one shard

pub mod builder;
pub mod builtins;
pub mod pipeline;
pub mod plan;
pub mod reader;
pub mod stage;

pub use builder::GearsBuilder;
pub use builtins::register_builtins;
pub use pipeline::{Evaluator, SegmentOutput, StageTiming};
pub use plan::{Plan, Segment};
pub use reader::{Reader, ReaderInput};
pub use stage::{Shuffle, Stage};
