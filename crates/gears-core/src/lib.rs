//! Gears Core
//!
//! Shared building blocks for the gears distributed dataflow engine:
//!
//! - `error`: engine-wide error type and result alias
//! - `ids`: typed ids for shards, runs, executions and registrations
//! - `record`: the value type flowing through plan stages
//! - `config`: per-shard engine configuration
//! - `callback`: named user callbacks and panic isolation
//! - `store`: the storage seam and an in-memory store
//! - `pattern`: glob matching for key patterns

pub mod callback;
pub mod config;
pub mod error;
pub mod ids;
pub mod pattern;
pub mod record;
pub mod store;

pub use callback::{
    isolate, Callback, CallbackContext, CallbackError, CallbackRef, CallbackRegistry,
    CallbackResult,
};
pub use config::GearsConfig;
pub use error::{GearsError, Result, ERR_CLUSTER_PREFIX};
pub use ids::{ExecutionId, IdGenerator, RegistrationId, RunId, ShardId};
pub use pattern::glob_match;
pub use record::Record;
pub use store::{
    CommandInfo, KeyType, MemoryStore, ShardStore, StreamEntry, StreamEntryId,
};
