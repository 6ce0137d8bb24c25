//! Units of local work handed to a shard's worker pool

use gears_core::{CallbackRegistry, ExecutionId, Record, ShardId, ShardStore};
use gears_plan::{Evaluator, Plan, ReaderInput, SegmentOutput, Shuffle};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Records a segment starts from
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentInput {
    /// First segment: read from the plan's reader
    Read(ReaderInput),
    /// Later segments: records gathered by the previous shuffle
    Records(Vec<Record>),
}

/// One segment of one execution, ready to run on this shard
#[derive(Debug, Clone)]
pub struct SegmentTask {
    pub id: ExecutionId,
    pub step: usize,
    pub plan: Arc<Plan>,
    pub input: SegmentInput,
    pub abort_on_error: bool,
    pub profile: bool,
}

/// What a segment produced
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentResult {
    pub id: ExecutionId,
    pub step: usize,
    pub output: SegmentOutput,
    /// Records with their routing key when the segment ends in a repartition
    pub keyed: Vec<(String, Record)>,
    pub read_duration: Duration,
}

impl SegmentTask {
    /// Run the segment against the local store
    pub fn run(
        self,
        registry: &CallbackRegistry,
        store: &dyn ShardStore,
        shard: &ShardId,
    ) -> SegmentResult {
        let segments = self.plan.segments();
        let Some(segment) = segments.get(self.step) else {
            return SegmentResult {
                id: self.id,
                step: self.step,
                output: SegmentOutput {
                    errors: vec![format!("plan has no segment {}", self.step)],
                    aborted: true,
                    ..Default::default()
                },
                keyed: Vec::new(),
                read_duration: Duration::ZERO,
            };
        };

        let read_started = Instant::now();
        let records = match self.input {
            SegmentInput::Read(input) => self.plan.reader.read(&input, store, shard),
            SegmentInput::Records(records) => records,
        };
        let read_duration = read_started.elapsed();

        let evaluator = Evaluator::new(registry, store, shard)
            .with_abort_on_error(self.abort_on_error)
            .with_profile(self.profile);
        let mut output = evaluator.run(&self.plan.stages[segment.stages.clone()], records);

        let mut keyed = Vec::new();
        if let (Some(Shuffle::Repartition { extractor }), false) =
            (&segment.shuffle, output.aborted)
        {
            for record in std::mem::take(&mut output.records) {
                match evaluator.extract_key(extractor, &record) {
                    Ok(key) => keyed.push((key, record)),
                    Err(e) => {
                        output.errors.push(e.0);
                        if self.abort_on_error {
                            output.aborted = true;
                            break;
                        }
                    }
                }
            }
        }

        SegmentResult {
            id: self.id,
            step: self.step,
            output,
            keyed,
            read_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_core::{CallbackError, MemoryStore, RunId};
    use gears_plan::{register_builtins, GearsBuilder};

    fn setup() -> (CallbackRegistry, MemoryStore) {
        let registry = CallbackRegistry::new();
        register_builtins(&registry);
        registry.register_extractor("first_char", |_, r| {
            r.key_name()
                .and_then(|k| k.chars().next())
                .map(|c| c.to_string())
                .ok_or_else(|| CallbackError::new("no key"))
        });
        let store = MemoryStore::new();
        store.set("apple", Record::from(1));
        store.set("avocado", Record::from(2));
        store.set("banana", Record::from(3));
        (registry, store)
    }

    fn task(plan: Plan, step: usize, input: SegmentInput) -> SegmentTask {
        SegmentTask {
            id: ExecutionId::new(RunId::from("r"), 1),
            step,
            plan: Arc::new(plan),
            input,
            abort_on_error: false,
            profile: false,
        }
    }

    #[test]
    fn test_first_segment_reads_and_counts() {
        let (registry, store) = setup();
        let plan = GearsBuilder::keys("*").count().build();
        let result = task(plan, 0, SegmentInput::Read(ReaderInput::Full)).run(
            &registry,
            &store,
            &ShardId::from("a"),
        );
        assert_eq!(result.output.records, vec![Record::Int(3)]);
        assert!(result.keyed.is_empty());
    }

    #[test]
    fn test_repartition_segment_extracts_keys() {
        let (registry, store) = setup();
        let plan = GearsBuilder::keys("*").repartition("first_char").build();
        let result = task(plan, 0, SegmentInput::Read(ReaderInput::Full)).run(
            &registry,
            &store,
            &ShardId::from("a"),
        );
        assert!(result.output.records.is_empty());
        let keys: Vec<&str> = result.keyed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "a", "b"]);
    }

    #[test]
    fn test_later_segment_uses_given_records() {
        let (registry, store) = setup();
        let plan = GearsBuilder::keys("*").count().build();
        let input = SegmentInput::Records(vec![Record::Int(2), Record::Int(5)]);
        let result = task(plan, 1, input).run(&registry, &store, &ShardId::from("a"));
        assert_eq!(result.output.records, vec![Record::Int(7)]);
    }

    #[test]
    fn test_missing_segment_aborts() {
        let (registry, store) = setup();
        let plan = GearsBuilder::keys("*").build();
        let result = task(plan, 4, SegmentInput::Records(vec![])).run(
            &registry,
            &store,
            &ShardId::from("a"),
        );
        assert!(result.output.aborted);
    }
}
