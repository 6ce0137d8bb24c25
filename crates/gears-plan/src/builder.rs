//! Fluent plan builder

use crate::builtins;
use crate::plan::Plan;
use crate::reader::Reader;
use crate::stage::Stage;
use gears_core::{CallbackRef, Record};

/// Builds a [`Plan`] one stage at a time
///
/// ```
/// use gears_plan::GearsBuilder;
///
/// let plan = GearsBuilder::keys("person:*").map("to_name").count().build();
/// assert_eq!(plan.stages.len(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct GearsBuilder {
    reader: Reader,
    stages: Vec<Stage>,
    description: Option<String>,
}

impl GearsBuilder {
    /// Create a builder over an arbitrary reader
    pub fn new(reader: Reader) -> Self {
        Self {
            reader,
            stages: Vec::new(),
            description: None,
        }
    }

    /// Keyspace reader over keys matching `pattern`
    pub fn keys(pattern: impl Into<String>) -> Self {
        Self::new(Reader::Keys {
            pattern: pattern.into(),
            read_value: true,
        })
    }

    /// Stream reader over streams starting with `prefix`
    pub fn stream(prefix: impl Into<String>) -> Self {
        Self::new(Reader::Stream {
            prefix: prefix.into(),
        })
    }

    /// Command reader fired by a named trigger
    pub fn command(trigger: impl Into<String>) -> Self {
        Self::new(Reader::Command {
            trigger: trigger.into(),
        })
    }

    /// Reader producing each shard's id
    pub fn shard_id() -> Self {
        Self::new(Reader::ShardId)
    }

    fn push(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn map(self, callback: impl Into<CallbackRef>) -> Self {
        self.push(Stage::Map {
            callback: callback.into(),
        })
    }

    pub fn filter(self, callback: impl Into<CallbackRef>) -> Self {
        self.push(Stage::Filter {
            callback: callback.into(),
        })
    }

    pub fn flat_map(self, callback: impl Into<CallbackRef>) -> Self {
        self.push(Stage::FlatMap {
            callback: callback.into(),
        })
    }

    /// Fold with an accumulator starting at `None`
    pub fn accumulate(self, callback: impl Into<CallbackRef>) -> Self {
        self.accumulate_from(Record::Null, callback)
    }

    /// Fold with an explicit starting accumulator
    pub fn accumulate_from(self, zero: Record, callback: impl Into<CallbackRef>) -> Self {
        self.push(Stage::Accumulate {
            callback: callback.into(),
            zero,
        })
    }

    pub fn local_group_by(
        self,
        extractor: impl Into<CallbackRef>,
        reducer: impl Into<CallbackRef>,
    ) -> Self {
        self.push(Stage::LocalGroupBy {
            extractor: extractor.into(),
            reducer: reducer.into(),
            zero: Record::Null,
            values_only: false,
        })
    }

    pub fn repartition(self, extractor: impl Into<CallbackRef>) -> Self {
        self.push(Stage::Repartition {
            extractor: extractor.into(),
        })
    }

    /// Shuffle by key, then reduce each key on its owning shard
    pub fn group_by(
        self,
        extractor: impl Into<CallbackRef>,
        reducer: impl Into<CallbackRef>,
    ) -> Self {
        let extractor = extractor.into();
        self.repartition(extractor.clone())
            .local_group_by(extractor, reducer)
    }

    pub fn collect(self) -> Self {
        self.push(Stage::Collect)
    }

    pub fn limit(self, len: usize, offset: usize) -> Self {
        self.push(Stage::Limit { offset, len })
    }

    pub fn for_each(self, callback: impl Into<CallbackRef>) -> Self {
        self.push(Stage::ForEach {
            callback: callback.into(),
        })
    }

    /// Cluster-wide record count
    pub fn count(self) -> Self {
        self.accumulate_from(Record::Int(0), builtins::COUNT_LOCAL)
            .collect()
            .accumulate_from(Record::Int(0), builtins::SUM)
    }

    /// Cluster-wide count per extracted key, as `{key, value}` records
    pub fn count_by(self, extractor: impl Into<CallbackRef>) -> Self {
        self.aggregate_by(
            extractor,
            Record::Int(0),
            builtins::COUNT_REDUCER,
            builtins::SUM_REDUCER,
        )
    }

    /// Cluster-wide mean of the values produced by a map callback
    pub fn avg(self, value: impl Into<CallbackRef>) -> Self {
        self.map(value)
            .accumulate(builtins::AVG_LOCAL)
            .collect()
            .accumulate(builtins::AVG_MERGE)
            .map(builtins::AVG_FINISH)
    }

    /// Two-phase fold: `local` per shard, `global` over the collected partials
    pub fn aggregate(
        self,
        zero: Record,
        local: impl Into<CallbackRef>,
        global: impl Into<CallbackRef>,
    ) -> Self {
        self.accumulate_from(zero.clone(), local)
            .collect()
            .accumulate_from(zero, global)
    }

    /// Two-phase keyed fold; `global` receives the per-shard partial values
    pub fn aggregate_by(
        self,
        extractor: impl Into<CallbackRef>,
        zero: Record,
        local: impl Into<CallbackRef>,
        global: impl Into<CallbackRef>,
    ) -> Self {
        self.push(Stage::LocalGroupBy {
            extractor: extractor.into(),
            reducer: local.into(),
            zero: zero.clone(),
            values_only: false,
        })
        .repartition(builtins::KEY_FIELD)
        .push(Stage::LocalGroupBy {
            extractor: builtins::KEY_FIELD.into(),
            reducer: global.into(),
            zero,
            values_only: true,
        })
    }

    /// Cluster-wide distinct records
    pub fn distinct(self) -> Self {
        self.accumulate(builtins::DISTINCT_LOCAL)
            .collect()
            .accumulate(builtins::DISTINCT_MERGE)
            .flat_map(builtins::FLATTEN)
    }

    /// Finish the plan
    pub fn build(self) -> Plan {
        Plan {
            reader: self.reader,
            stages: self.stages,
            description: self.description,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Shuffle;

    #[test]
    fn test_count_expands_to_two_phase_accumulate() {
        let plan = GearsBuilder::keys("*").count().build();
        let kinds: Vec<_> = plan.stages.iter().map(Stage::kind).collect();
        assert_eq!(kinds, vec!["accumulate", "collect", "accumulate"]);
        assert!(!plan.ends_with_collect());
    }

    #[test]
    fn test_group_by_repartitions_first() {
        let plan = GearsBuilder::keys("*").group_by("ext", "red").build();
        let segments = plan.segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(
            segments[0].shuffle,
            Some(Shuffle::Repartition {
                extractor: "ext".into()
            })
        );
    }

    #[test]
    fn test_aggregate_by_shape() {
        let plan = GearsBuilder::keys("*")
            .aggregate_by("ext", Record::Int(0), "local", "global")
            .build();
        match &plan.stages[2] {
            Stage::LocalGroupBy {
                values_only,
                extractor,
                ..
            } => {
                assert!(*values_only);
                assert_eq!(extractor.name, builtins::KEY_FIELD);
            }
            other => panic!("unexpected stage {}", other),
        }
    }

    #[test]
    fn test_description_and_reader() {
        let plan = GearsBuilder::stream("events:")
            .for_each("log")
            .description("log events")
            .build();
        assert_eq!(plan.description.as_deref(), Some("log events"));
        assert_eq!(
            plan.reader,
            Reader::Stream {
                prefix: "events:".into()
            }
        );
    }
}
