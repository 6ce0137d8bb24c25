//! Gears Shard
//!
//! A complete shard node built from the engine crates:
//!
//! - `keyspace`: the local store with write notifications
//! - `shard`: coordinator, registry and transport wired together
//! - `commands`: the admin command surface
//! - `local`: several shards in one process over a memory network
//! - `logging`: tracing subscriber setup

pub mod commands;
pub mod keyspace;
pub mod local;
pub mod logging;
pub mod shard;

pub use commands::{CommandReply, GearsCommand};
pub use keyspace::{Keyspace, StoreEvent};
pub use local::LocalCluster;
pub use logging::init_logging;
pub use shard::{Outcome, Shard, TICK_INTERVAL};
