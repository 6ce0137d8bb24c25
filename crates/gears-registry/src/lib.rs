//! Gears Registry
//!
//! Binds plans to triggers and decides when they fire:
//!
//! - `trigger`: key, stream, command and hook triggers
//! - `registration`: a plan bound to a trigger and its lifecycle state
//! - `stream`: per-stream batching and acknowledgement
//! - `stats`: run counters per registration
//! - `registry`: the registration table of a shard
//! - `persist`: snapshots surviving a restart
//! - `protocol`: lifecycle messages broadcast to other shards

pub mod persist;
pub mod protocol;
pub mod registration;
pub mod registry;
pub mod stats;
pub mod stream;
pub mod trigger;

pub use persist::RegistrationSnapshot;
pub use protocol::{RegistryMessage, REGISTRY_COMMAND};
pub use registration::{Registration, RegistrationInfo, RegistrationState};
pub use registry::{Fire, Registry, RegistryOutput, PAUSE_ERROR_PREFIX};
pub use stats::{RegistrationStats, RunOutcome, StatsSnapshot};
pub use stream::{StreamConsumer, StreamInfo};
pub use trigger::{CommandHook, KeyTrigger, OnFailedPolicy, StreamTrigger, Trigger};
