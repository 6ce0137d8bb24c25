//! Immutable execution plans

use crate::reader::Reader;
use crate::stage::{Shuffle, Stage};
use gears_core::{Callback, CallbackRegistry, GearsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// A reader followed by an ordered list of stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub reader: Reader,
    pub stages: Vec<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Stages between two shuffles, plus the shuffle that ends them
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Index range into [`Plan::stages`]
    pub stages: Range<usize>,
    /// Shuffle after the last stage of the segment, `None` for the final one
    pub shuffle: Option<Shuffle>,
}

impl Plan {
    /// Create a new plan
    pub fn new(reader: Reader, stages: Vec<Stage>) -> Self {
        Self {
            reader,
            stages,
            description: None,
        }
    }

    /// Whether the final stage is a collect
    pub fn ends_with_collect(&self) -> bool {
        matches!(self.stages.last(), Some(Stage::Collect))
    }

    /// Copy of the plan whose results end up on the initiator
    pub fn with_trailing_collect(&self) -> Plan {
        let mut plan = self.clone();
        if !plan.ends_with_collect() {
            plan.stages.push(Stage::Collect);
        }
        plan
    }

    /// Whether running the plan requires any cross-shard step
    pub fn has_shuffle(&self) -> bool {
        self.stages.iter().any(Stage::is_shuffle)
    }

    /// Split the plan at its shuffle stages
    ///
    /// There is always at least one segment. A plan with `k` shuffles has
    /// `k + 1` segments; the last may be empty.
    pub fn segments(&self) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut start = 0;
        for (i, stage) in self.stages.iter().enumerate() {
            let shuffle = match stage {
                Stage::Collect => Shuffle::Collect,
                Stage::Repartition { extractor } => Shuffle::Repartition {
                    extractor: extractor.clone(),
                },
                _ => continue,
            };
            segments.push(Segment {
                stages: start..i,
                shuffle: Some(shuffle),
            });
            start = i + 1;
        }
        segments.push(Segment {
            stages: start..self.stages.len(),
            shuffle: None,
        });
        segments
    }

    /// Check that every referenced callback exists with the right shape
    pub fn validate(&self, registry: &CallbackRegistry) -> Result<()> {
        for stage in &self.stages {
            for (callback, shape) in stage.callbacks() {
                let found = registry.get(&callback.name).ok_or_else(|| {
                    GearsError::PlanError(format!(
                        "{} stage references unknown callback {}",
                        stage.kind(),
                        callback.name
                    ))
                })?;
                if !shape_matches(&found, shape) {
                    return Err(GearsError::PlanError(format!(
                        "callback {} is a {}, {} stage needs a {}",
                        callback.name,
                        found.kind(),
                        stage.kind(),
                        shape
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn shape_matches(callback: &Callback, shape: &str) -> bool {
    callback.kind() == shape
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reader)?;
        for stage in &self.stages {
            write!(f, ".{}", stage)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_core::Record;

    fn keys() -> Reader {
        Reader::Keys {
            pattern: "*".into(),
            read_value: true,
        }
    }

    #[test]
    fn test_segments_without_shuffle() {
        let plan = Plan::new(keys(), vec![Stage::Map { callback: "m".into() }]);
        let segments = plan.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].stages, 0..1);
        assert!(segments[0].shuffle.is_none());
        assert!(!plan.has_shuffle());
    }

    #[test]
    fn test_segments_split_at_shuffles() {
        let plan = Plan::new(
            keys(),
            vec![
                Stage::Map { callback: "m".into() },
                Stage::Repartition {
                    extractor: "e".into(),
                },
                Stage::Filter {
                    callback: "f".into(),
                },
                Stage::Collect,
            ],
        );
        let segments = plan.segments();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].stages, 0..1);
        assert!(matches!(
            segments[0].shuffle,
            Some(Shuffle::Repartition { .. })
        ));
        assert_eq!(segments[1].stages, 2..3);
        assert_eq!(segments[1].shuffle, Some(Shuffle::Collect));
        assert_eq!(segments[2].stages, 4..4);
    }

    #[test]
    fn test_trailing_collect_added_once() {
        let plan = Plan::new(keys(), vec![]);
        let collected = plan.with_trailing_collect();
        assert!(collected.ends_with_collect());
        assert_eq!(collected.with_trailing_collect().stages.len(), 1);
    }

    #[test]
    fn test_validate_callbacks() {
        let registry = CallbackRegistry::new();
        registry.register_map("m", |_, r| Ok(r));
        registry.register_filter("f", |_, _| Ok(true));

        let ok = Plan::new(keys(), vec![Stage::Map { callback: "m".into() }]);
        assert!(ok.validate(&registry).is_ok());

        let missing = Plan::new(keys(), vec![Stage::Map { callback: "x".into() }]);
        assert!(missing.validate(&registry).is_err());

        let wrong_shape = Plan::new(keys(), vec![Stage::Map { callback: "f".into() }]);
        let err = wrong_shape.validate(&registry).unwrap_err();
        assert!(err.to_string().contains("needs a map"));
    }

    #[test]
    fn test_json_roundtrip() {
        let plan = Plan::new(
            keys(),
            vec![Stage::Accumulate {
                callback: "a".into(),
                zero: Record::Int(0),
            }],
        );
        let back = Plan::from_json(&plan.to_json().unwrap()).unwrap();
        assert_eq!(back, plan);
    }
}
