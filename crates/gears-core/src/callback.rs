//! User callback infrastructure
//!
//! Stages never hold live closures. They carry a [`CallbackRef`] naming a
//! function in the shard's [`CallbackRegistry`], so a plan can be serialized
//! and shipped to other shards that resolve the same names locally. The
//! registry is the seam where a scripting sandbox plugs in: whatever runs the
//! user's code registers typed functions here.

use crate::ids::ShardId;
use crate::record::Record;
use crate::store::ShardStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// Failure of one callback invocation on one input
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Result of a callback invocation
pub type CallbackResult<T> = std::result::Result<T, CallbackError>;

/// Serializable reference to a registered callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackRef {
    /// Registered function name
    pub name: String,
    /// Argument bound at plan construction time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<Record>,
}

impl CallbackRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arg: None,
        }
    }

    /// Reference with a bound argument
    pub fn with_arg(name: impl Into<String>, arg: Record) -> Self {
        Self {
            name: name.into(),
            arg: Some(arg),
        }
    }
}

impl From<&str> for CallbackRef {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for CallbackRef {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for CallbackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.arg {
            Some(arg) => write!(f, "{}({})", self.name, arg),
            None => write!(f, "{}", self.name),
        }
    }
}

/// What a callback sees besides its input
pub struct CallbackContext<'a> {
    /// Shard running the callback
    pub shard: &'a ShardId,
    /// Local keyspace of that shard
    pub store: &'a dyn ShardStore,
    /// Argument bound in the [`CallbackRef`]
    pub arg: Option<&'a Record>,
}

pub type MapFn = Arc<dyn Fn(&CallbackContext<'_>, Record) -> CallbackResult<Record> + Send + Sync>;
pub type FilterFn = Arc<dyn Fn(&CallbackContext<'_>, &Record) -> CallbackResult<bool> + Send + Sync>;
pub type FlatMapFn =
    Arc<dyn Fn(&CallbackContext<'_>, Record) -> CallbackResult<Vec<Record>> + Send + Sync>;
pub type AccumulateFn =
    Arc<dyn Fn(&CallbackContext<'_>, Record, Record) -> CallbackResult<Record> + Send + Sync>;
pub type ExtractorFn =
    Arc<dyn Fn(&CallbackContext<'_>, &Record) -> CallbackResult<String> + Send + Sync>;
pub type ReducerFn =
    Arc<dyn Fn(&CallbackContext<'_>, &str, Record, Record) -> CallbackResult<Record> + Send + Sync>;
pub type ForEachFn = Arc<dyn Fn(&CallbackContext<'_>, &Record) -> CallbackResult<()> + Send + Sync>;

/// A registered callback of one of the stage shapes
#[derive(Clone)]
pub enum Callback {
    Map(MapFn),
    Filter(FilterFn),
    FlatMap(FlatMapFn),
    /// `(accumulator, record) -> accumulator`
    Accumulate(AccumulateFn),
    /// Record to grouping key
    Extractor(ExtractorFn),
    /// `(key, accumulator, record) -> accumulator`
    Reducer(ReducerFn),
    ForEach(ForEachFn),
}

impl Callback {
    /// Name of the callback shape
    pub fn kind(&self) -> &'static str {
        match self {
            Callback::Map(_) => "map",
            Callback::Filter(_) => "filter",
            Callback::FlatMap(_) => "flatmap",
            Callback::Accumulate(_) => "accumulate",
            Callback::Extractor(_) => "extractor",
            Callback::Reducer(_) => "reducer",
            Callback::ForEach(_) => "foreach",
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback::{}", self.kind())
    }
}

/// Registry mapping names to callbacks
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<HashMap<String, Callback>>,
}

impl CallbackRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback, replacing any previous one with the same name
    pub fn register(&self, name: impl Into<String>, callback: Callback) {
        let name = name.into();
        tracing::debug!("Registered {} callback {}", callback.kind(), name);
        self.callbacks.write().insert(name, callback);
    }

    pub fn register_map<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&CallbackContext<'_>, Record) -> CallbackResult<Record> + Send + Sync + 'static,
    {
        self.register(name, Callback::Map(Arc::new(f)));
    }

    pub fn register_filter<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&CallbackContext<'_>, &Record) -> CallbackResult<bool> + Send + Sync + 'static,
    {
        self.register(name, Callback::Filter(Arc::new(f)));
    }

    pub fn register_flat_map<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&CallbackContext<'_>, Record) -> CallbackResult<Vec<Record>> + Send + Sync + 'static,
    {
        self.register(name, Callback::FlatMap(Arc::new(f)));
    }

    pub fn register_accumulate<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&CallbackContext<'_>, Record, Record) -> CallbackResult<Record> + Send + Sync + 'static,
    {
        self.register(name, Callback::Accumulate(Arc::new(f)));
    }

    pub fn register_extractor<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&CallbackContext<'_>, &Record) -> CallbackResult<String> + Send + Sync + 'static,
    {
        self.register(name, Callback::Extractor(Arc::new(f)));
    }

    pub fn register_reducer<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&CallbackContext<'_>, &str, Record, Record) -> CallbackResult<Record>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, Callback::Reducer(Arc::new(f)));
    }

    pub fn register_for_each<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&CallbackContext<'_>, &Record) -> CallbackResult<()> + Send + Sync + 'static,
    {
        self.register(name, Callback::ForEach(Arc::new(f)));
    }

    /// Look up a callback by name
    pub fn get(&self, name: &str) -> Option<Callback> {
        self.callbacks.read().get(name).cloned()
    }

    /// Check if a callback exists
    pub fn contains(&self, name: &str) -> bool {
        self.callbacks.read().contains_key(name)
    }

    /// Registered callback names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.callbacks.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }
}

/// Run a callback invocation, converting a panic into a [`CallbackError`]
pub fn isolate<T>(f: impl FnOnce() -> CallbackResult<T>) -> CallbackResult<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            tracing::error!("Callback panicked: {}", msg);
            Err(CallbackError(format!("callback panicked: {}", msg)))
        }
    }
}
