//! Local stage evaluation
//!
//! The evaluator runs one segment of a plan over the records a shard holds.
//! Every callback call goes through [`isolate`], so a failing or panicking
//! callback turns into a per-record error instead of unwinding into the
//! worker.

use crate::stage::Stage;
use ahash::AHashMap;
use gears_core::{
    isolate, Callback, CallbackContext, CallbackError, CallbackRef, CallbackRegistry,
    CallbackResult, Record, ShardId, ShardStore,
};
use std::time::{Duration, Instant};

/// Wall time spent in one stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageTiming {
    pub stage: String,
    pub duration: Duration,
}

/// Records and errors left after running a segment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentOutput {
    pub records: Vec<Record>,
    pub errors: Vec<String>,
    /// Filled only when profiling is enabled
    pub timings: Vec<StageTiming>,
    /// Set when an error stopped evaluation under abort-on-error
    pub aborted: bool,
}

/// Evaluates stages against one shard's records
pub struct Evaluator<'a> {
    registry: &'a CallbackRegistry,
    store: &'a dyn ShardStore,
    shard: &'a ShardId,
    abort_on_error: bool,
    profile: bool,
}

impl<'a> Evaluator<'a> {
    pub fn new(registry: &'a CallbackRegistry, store: &'a dyn ShardStore, shard: &'a ShardId) -> Self {
        Self {
            registry,
            store,
            shard,
            abort_on_error: false,
            profile: false,
        }
    }

    /// Stop at the first record error
    pub fn with_abort_on_error(mut self, abort: bool) -> Self {
        self.abort_on_error = abort;
        self
    }

    /// Record per-stage durations
    pub fn with_profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }

    /// Run `stages` in order over `input`
    pub fn run(&self, stages: &[Stage], input: Vec<Record>) -> SegmentOutput {
        let mut output = SegmentOutput {
            records: input,
            ..Default::default()
        };
        for stage in stages {
            let started = Instant::now();
            let records = std::mem::take(&mut output.records);
            match self.apply(stage, records, &mut output.errors) {
                Ok(records) => output.records = records,
                Err(()) => {
                    output.aborted = true;
                    tracing::debug!("Segment aborted at {} on shard {}", stage, self.shard);
                    return output;
                }
            }
            if self.profile {
                output.timings.push(StageTiming {
                    stage: stage.to_string(),
                    duration: started.elapsed(),
                });
            }
        }
        output
    }

    /// Extract a routing key with an extractor callback
    pub fn extract_key(&self, extractor: &CallbackRef, record: &Record) -> CallbackResult<String> {
        match self.lookup(extractor)? {
            Callback::Extractor(f) => isolate(|| f(&self.ctx(extractor), record)),
            other => Err(wrong_shape(extractor, &other, "extractor")),
        }
    }

    fn ctx<'c>(&'c self, callback: &'c CallbackRef) -> CallbackContext<'c> {
        CallbackContext {
            shard: self.shard,
            store: self.store,
            arg: callback.arg.as_ref(),
        }
    }

    fn lookup(&self, callback: &CallbackRef) -> CallbackResult<Callback> {
        self.registry
            .get(&callback.name)
            .ok_or_else(|| CallbackError(format!("can not find callback {}", callback.name)))
    }

    /// Record an error; returns true when evaluation must stop
    fn fail(&self, errors: &mut Vec<String>, err: CallbackError) -> bool {
        errors.push(err.0);
        self.abort_on_error
    }

    fn apply(
        &self,
        stage: &Stage,
        records: Vec<Record>,
        errors: &mut Vec<String>,
    ) -> Result<Vec<Record>, ()> {
        match stage {
            Stage::Map { callback } => {
                let f = match self.lookup(callback) {
                    Ok(Callback::Map(f)) => f,
                    other => return self.fail_all(callback, other, "map", records, errors),
                };
                let ctx = self.ctx(callback);
                let mut out = Vec::with_capacity(records.len());
                for record in records {
                    match isolate(|| f(&ctx, record)) {
                        Ok(r) => out.push(r),
                        Err(e) => {
                            if self.fail(errors, e) {
                                return Err(());
                            }
                        }
                    }
                }
                Ok(out)
            }
            Stage::Filter { callback } => {
                let f = match self.lookup(callback) {
                    Ok(Callback::Filter(f)) => f,
                    other => return self.fail_all(callback, other, "filter", records, errors),
                };
                let ctx = self.ctx(callback);
                let mut out = Vec::new();
                for record in records {
                    match isolate(|| f(&ctx, &record)) {
                        Ok(true) => out.push(record),
                        Ok(false) => {}
                        Err(e) => {
                            if self.fail(errors, e) {
                                return Err(());
                            }
                        }
                    }
                }
                Ok(out)
            }
            Stage::FlatMap { callback } => {
                let f = match self.lookup(callback) {
                    Ok(Callback::FlatMap(f)) => f,
                    other => return self.fail_all(callback, other, "flatmap", records, errors),
                };
                let ctx = self.ctx(callback);
                let mut out = Vec::new();
                for record in records {
                    match isolate(|| f(&ctx, record)) {
                        Ok(items) => out.extend(items),
                        Err(e) => {
                            if self.fail(errors, e) {
                                return Err(());
                            }
                        }
                    }
                }
                Ok(out)
            }
            Stage::Accumulate { callback, zero } => {
                let f = match self.lookup(callback) {
                    Ok(Callback::Accumulate(f)) => f,
                    other => return self.fail_all(callback, other, "accumulate", records, errors),
                };
                let ctx = self.ctx(callback);
                let mut acc = zero.clone();
                let mut touched = false;
                for record in records {
                    let prev = acc.clone();
                    match isolate(|| f(&ctx, prev, record)) {
                        Ok(next) => {
                            acc = next;
                            touched = true;
                        }
                        Err(e) => {
                            if self.fail(errors, e) {
                                return Err(());
                            }
                        }
                    }
                }
                Ok(if touched { vec![acc] } else { Vec::new() })
            }
            Stage::LocalGroupBy {
                extractor,
                reducer,
                zero,
                values_only,
            } => {
                let reduce = match self.lookup(reducer) {
                    Ok(Callback::Reducer(f)) => f,
                    other => return self.fail_all(reducer, other, "reducer", records, errors),
                };
                let ctx = self.ctx(reducer);
                let mut order: Vec<String> = Vec::new();
                let mut groups: AHashMap<String, Record> = AHashMap::new();
                for record in records {
                    let key = match self.extract_key(extractor, &record) {
                        Ok(k) => k,
                        Err(e) => {
                            if self.fail(errors, e) {
                                return Err(());
                            }
                            continue;
                        }
                    };
                    let value = if *values_only {
                        record.get("value").cloned().unwrap_or_default()
                    } else {
                        record
                    };
                    let acc = match groups.remove(&key) {
                        Some(acc) => acc,
                        None => {
                            order.push(key.clone());
                            zero.clone()
                        }
                    };
                    let prev = acc.clone();
                    match isolate(|| reduce(&ctx, &key, prev, value)) {
                        Ok(next) => {
                            groups.insert(key, next);
                        }
                        Err(e) => {
                            groups.insert(key, acc);
                            if self.fail(errors, e) {
                                return Err(());
                            }
                        }
                    }
                }
                Ok(order
                    .into_iter()
                    .filter_map(|key| {
                        let value = groups.remove(&key)?;
                        Some(Record::map([("key", Record::Str(key)), ("value", value)]))
                    })
                    .collect())
            }
            Stage::Limit { offset, len } => {
                Ok(records.into_iter().skip(*offset).take(*len).collect())
            }
            Stage::ForEach { callback } => {
                let f = match self.lookup(callback) {
                    Ok(Callback::ForEach(f)) => f,
                    other => return self.fail_all(callback, other, "foreach", records, errors),
                };
                let ctx = self.ctx(callback);
                let mut out = Vec::with_capacity(records.len());
                for record in records {
                    match isolate(|| f(&ctx, &record)) {
                        Ok(()) => out.push(record),
                        Err(e) => {
                            if self.fail(errors, e) {
                                return Err(());
                            }
                        }
                    }
                }
                Ok(out)
            }
            // Shuffles are handled by the coordinator between segments
            Stage::Collect | Stage::Repartition { .. } => Ok(records),
        }
    }

    /// Every record fails when the stage's callback cannot be resolved
    fn fail_all(
        &self,
        callback: &CallbackRef,
        found: CallbackResult<Callback>,
        shape: &str,
        records: Vec<Record>,
        errors: &mut Vec<String>,
    ) -> Result<Vec<Record>, ()> {
        let err = match found {
            Ok(other) => wrong_shape(callback, &other, shape),
            Err(e) => e,
        };
        for _ in &records {
            if self.fail(errors, err.clone()) {
                return Err(());
            }
        }
        Ok(Vec::new())
    }
}

fn wrong_shape(callback: &CallbackRef, found: &Callback, shape: &str) -> CallbackError {
    CallbackError(format!(
        "callback {} is a {}, expected {}",
        callback.name,
        found.kind(),
        shape
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_core::MemoryStore;

    fn registry() -> CallbackRegistry {
        let registry = CallbackRegistry::new();
        registry.register_map("double", |_, r| match r.as_int() {
            Some(v) => Ok(Record::Int(v * 2)),
            None => Err(CallbackError::new("not a number")),
        });
        registry.register_filter("even", |_, r| Ok(r.as_int().unwrap_or(1) % 2 == 0));
        registry.register_flat_map("explode", |_, r| match r {
            Record::List(items) => Ok(items),
            other => Ok(vec![other]),
        });
        registry.register_accumulate("sum", |_, a, r| {
            Ok(Record::Int(a.as_int().unwrap_or(0) + r.as_int().unwrap_or(0)))
        });
        registry.register_extractor("parity", |_, r| {
            Ok(if r.as_int().unwrap_or(0) % 2 == 0 { "even" } else { "odd" }.to_string())
        });
        registry.register_reducer("count", |_, _, a, _| Ok(Record::Int(a.as_int().unwrap_or(0) + 1)));
        registry.register_map("boom", |_, _| panic!("kaboom"));
        registry.register_for_each("incr", |ctx, _| {
            let key = ctx.arg.and_then(Record::as_str).unwrap_or("counter");
            ctx.store
                .incr_by(key, 1)
                .map(|_| ())
                .map_err(|e| CallbackError::new(e.to_string()))
        });
        registry
    }

    fn ints(values: &[i64]) -> Vec<Record> {
        values.iter().map(|v| Record::Int(*v)).collect()
    }

    #[test]
    fn test_map_filter_chain() {
        let registry = registry();
        let store = MemoryStore::new();
        let shard = ShardId::from("s1");
        let eval = Evaluator::new(&registry, &store, &shard);
        let stages = vec![
            Stage::Filter {
                callback: "even".into(),
            },
            Stage::Map {
                callback: "double".into(),
            },
        ];
        let out = eval.run(&stages, ints(&[1, 2, 3, 4]));
        assert_eq!(out.records, ints(&[4, 8]));
        assert!(out.errors.is_empty());
    }

    #[test]
    fn test_record_errors_do_not_stop_pipeline() {
        let registry = registry();
        let store = MemoryStore::new();
        let shard = ShardId::from("s1");
        let eval = Evaluator::new(&registry, &store, &shard);
        let stages = vec![Stage::Map {
            callback: "double".into(),
        }];
        let input = vec![Record::Int(1), Record::from("x"), Record::Int(3)];
        let out = eval.run(&stages, input);
        assert_eq!(out.records, ints(&[2, 6]));
        assert_eq!(out.errors, vec!["not a number".to_string()]);
        assert!(!out.aborted);
    }

    #[test]
    fn test_abort_on_error_stops() {
        let registry = registry();
        let store = MemoryStore::new();
        let shard = ShardId::from("s1");
        let eval = Evaluator::new(&registry, &store, &shard).with_abort_on_error(true);
        let stages = vec![Stage::Map {
            callback: "double".into(),
        }];
        let out = eval.run(&stages, vec![Record::from("x"), Record::Int(3)]);
        assert!(out.aborted);
        assert_eq!(out.errors.len(), 1);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let registry = registry();
        let store = MemoryStore::new();
        let shard = ShardId::from("s1");
        let eval = Evaluator::new(&registry, &store, &shard);
        let out = eval.run(
            &[Stage::Map {
                callback: "boom".into(),
            }],
            ints(&[1]),
        );
        assert!(out.records.is_empty());
        assert_eq!(out.errors, vec!["callback panicked: kaboom".to_string()]);
    }

    #[test]
    fn test_accumulate_and_flatmap() {
        let registry = registry();
        let store = MemoryStore::new();
        let shard = ShardId::from("s1");
        let eval = Evaluator::new(&registry, &store, &shard);
        let stages = vec![
            Stage::FlatMap {
                callback: "explode".into(),
            },
            Stage::Accumulate {
                callback: "sum".into(),
                zero: Record::Int(0),
            },
        ];
        let out = eval.run(&stages, vec![Record::List(ints(&[1, 2])), Record::Int(3)]);
        assert_eq!(out.records, ints(&[6]));

        let empty = eval.run(&stages, Vec::new());
        assert!(empty.records.is_empty());
    }

    #[test]
    fn test_local_group_by() {
        let registry = registry();
        let store = MemoryStore::new();
        let shard = ShardId::from("s1");
        let eval = Evaluator::new(&registry, &store, &shard);
        let stages = vec![Stage::LocalGroupBy {
            extractor: "parity".into(),
            reducer: "count".into(),
            zero: Record::Int(0),
            values_only: false,
        }];
        let out = eval.run(&stages, ints(&[1, 2, 3, 5]));
        assert_eq!(
            out.records,
            vec![
                Record::map([("key", Record::from("odd")), ("value", Record::Int(3))]),
                Record::map([("key", Record::from("even")), ("value", Record::Int(1))]),
            ]
        );
    }

    #[test]
    fn test_limit_and_foreach() {
        let registry = registry();
        let store = MemoryStore::new();
        let shard = ShardId::from("s1");
        let eval = Evaluator::new(&registry, &store, &shard).with_profile(true);
        let stages = vec![
            Stage::Limit { offset: 1, len: 2 },
            Stage::ForEach {
                callback: CallbackRef::with_arg("incr", Record::from("hits")),
            },
        ];
        let out = eval.run(&stages, ints(&[1, 2, 3, 4]));
        assert_eq!(out.records, ints(&[2, 3]));
        assert_eq!(store.get("hits"), Some(Record::Int(2)));
        assert_eq!(out.timings.len(), 2);
    }

    #[test]
    fn test_unknown_callback_is_record_error() {
        let registry = registry();
        let store = MemoryStore::new();
        let shard = ShardId::from("s1");
        let eval = Evaluator::new(&registry, &store, &shard);
        let out = eval.run(
            &[Stage::Map {
                callback: "missing".into(),
            }],
            ints(&[1, 2]),
        );
        assert!(out.records.is_empty());
        assert_eq!(out.errors.len(), 2);
        assert!(out.errors[0].contains("missing"));
    }
}
