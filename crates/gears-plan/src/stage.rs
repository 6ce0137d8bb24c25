//! Stage descriptors

use gears_core::{CallbackRef, Record};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of a plan
///
/// Stages run in declaration order. `Collect` and `Repartition` are the only
/// stages that move records between shards; everything else works on the
/// records currently held by one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Stage {
    /// 1:1 transform
    Map { callback: CallbackRef },
    /// Drop records for which the predicate is false
    Filter { callback: CallbackRef },
    /// 1:N transform
    FlatMap { callback: CallbackRef },
    /// Fold the shard's records into one accumulator starting at `zero`
    Accumulate {
        callback: CallbackRef,
        #[serde(default)]
        zero: Record,
    },
    /// Keyed fold over the shard's records, emitting `{key, value}` per key
    LocalGroupBy {
        extractor: CallbackRef,
        reducer: CallbackRef,
        #[serde(default)]
        zero: Record,
        /// Feed the reducer `record["value"]` instead of the record itself
        #[serde(default)]
        values_only: bool,
    },
    /// Shuffle every record to the shard owning its extracted key
    Repartition { extractor: CallbackRef },
    /// Shuffle every record to the initiating shard
    Collect,
    /// Keep `len` records after skipping `offset`
    Limit { offset: usize, len: usize },
    /// Side effect per record, records pass through unchanged
    ForEach { callback: CallbackRef },
}

impl Stage {
    /// Short name of the stage kind
    pub fn kind(&self) -> &'static str {
        match self {
            Stage::Map { .. } => "map",
            Stage::Filter { .. } => "filter",
            Stage::FlatMap { .. } => "flatmap",
            Stage::Accumulate { .. } => "accumulate",
            Stage::LocalGroupBy { .. } => "localgroupby",
            Stage::Repartition { .. } => "repartition",
            Stage::Collect => "collect",
            Stage::Limit { .. } => "limit",
            Stage::ForEach { .. } => "foreach",
        }
    }

    /// Whether the stage moves records across shards
    pub fn is_shuffle(&self) -> bool {
        matches!(self, Stage::Collect | Stage::Repartition { .. })
    }

    /// Callbacks referenced by the stage with the shape each must have
    pub fn callbacks(&self) -> Vec<(&CallbackRef, &'static str)> {
        match self {
            Stage::Map { callback } => vec![(callback, "map")],
            Stage::Filter { callback } => vec![(callback, "filter")],
            Stage::FlatMap { callback } => vec![(callback, "flatmap")],
            Stage::Accumulate { callback, .. } => vec![(callback, "accumulate")],
            Stage::LocalGroupBy {
                extractor, reducer, ..
            } => vec![(extractor, "extractor"), (reducer, "reducer")],
            Stage::Repartition { extractor } => vec![(extractor, "extractor")],
            Stage::ForEach { callback } => vec![(callback, "foreach")],
            Stage::Collect | Stage::Limit { .. } => Vec::new(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Map { callback }
            | Stage::Filter { callback }
            | Stage::FlatMap { callback }
            | Stage::ForEach { callback }
            | Stage::Accumulate { callback, .. } => write!(f, "{}({})", self.kind(), callback),
            Stage::LocalGroupBy {
                extractor, reducer, ..
            } => write!(f, "localgroupby({}, {})", extractor, reducer),
            Stage::Repartition { extractor } => write!(f, "repartition({})", extractor),
            Stage::Collect => write!(f, "collect()"),
            Stage::Limit { offset, len } => write!(f, "limit({}, {})", len, offset),
        }
    }
}

/// Cross-shard step that ends a plan segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Shuffle {
    /// Everything goes to the initiator
    Collect,
    /// Records go to the owner of their extracted key
    Repartition { extractor: CallbackRef },
}
