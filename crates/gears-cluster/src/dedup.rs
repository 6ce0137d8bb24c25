//! Receiver-side duplicate suppression

use gears_core::{RunId, ShardId};
use std::collections::HashMap;

/// Last applied message id per (sender, sender run id)
///
/// A restarted sender draws a new run id and numbers from 1 again, so its
/// entries never collide with the previous run's.
#[derive(Debug, Default)]
pub struct DedupTable {
    last_seen: HashMap<(ShardId, RunId), u64>,
}

impl DedupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `msg_id` from this sender run was already applied
    pub fn is_duplicate(&self, sender: &ShardId, run_id: &RunId, msg_id: u64) -> bool {
        self.last_seen
            .get(&(sender.clone(), run_id.clone()))
            .is_some_and(|last| msg_id <= *last)
    }

    /// Record `msg_id` as applied
    pub fn record(&mut self, sender: &ShardId, run_id: &RunId, msg_id: u64) {
        let last = self
            .last_seen
            .entry((sender.clone(), run_id.clone()))
            .or_insert(0);
        if msg_id > *last {
            *last = msg_id;
        }
    }

    /// Last applied id for a sender run
    pub fn last_seen(&self, sender: &ShardId, run_id: &RunId) -> Option<u64> {
        self.last_seen.get(&(sender.clone(), run_id.clone())).copied()
    }

    /// Forget every run of a sender
    pub fn forget(&mut self, sender: &ShardId) {
        self.last_seen.retain(|(s, _), _| s != sender);
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detection() {
        let mut table = DedupTable::new();
        let a = ShardId::from("a");
        let run = RunId::from("r1");
        assert!(!table.is_duplicate(&a, &run, 1));
        table.record(&a, &run, 1);
        assert!(table.is_duplicate(&a, &run, 1));
        assert!(!table.is_duplicate(&a, &run, 2));
        table.record(&a, &run, 2);
        assert_eq!(table.last_seen(&a, &run), Some(2));
    }

    #[test]
    fn test_new_run_starts_fresh() {
        let mut table = DedupTable::new();
        let a = ShardId::from("a");
        table.record(&a, &RunId::from("r1"), 5);
        assert!(!table.is_duplicate(&a, &RunId::from("r2"), 1));
        table.forget(&a);
        assert!(table.is_empty());
    }
}
