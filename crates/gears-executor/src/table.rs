//! Capacity-bounded execution table

use crate::execution::{Execution, ExecutionStatus};
use ahash::AHashMap;
use gears_core::ExecutionId;
use std::collections::VecDeque;
use tracing::debug;

/// Executions tracked by one shard, in creation order
#[derive(Debug)]
pub struct ExecutionTable {
    executions: AHashMap<ExecutionId, Execution>,
    order: VecDeque<ExecutionId>,
    max: usize,
}

impl ExecutionTable {
    pub fn new(max: usize) -> Self {
        Self {
            executions: AHashMap::new(),
            order: VecDeque::new(),
            max: max.max(1),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn set_max(&mut self, max: usize) {
        self.max = max.max(1);
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    pub fn contains(&self, id: &ExecutionId) -> bool {
        self.executions.contains_key(id)
    }

    pub fn get(&self, id: &ExecutionId) -> Option<&Execution> {
        self.executions.get(id)
    }

    pub fn get_mut(&mut self, id: &ExecutionId) -> Option<&mut Execution> {
        self.executions.get_mut(id)
    }

    /// Track a new execution; callers make room first
    pub fn insert(&mut self, execution: Execution) {
        let id = execution.id.clone();
        if self.executions.insert(id.clone(), execution).is_none() {
            self.order.push_back(id);
        }
    }

    pub fn remove(&mut self, id: &ExecutionId) -> Option<Execution> {
        let removed = self.executions.remove(id)?;
        self.order.retain(|o| o != id);
        Some(removed)
    }

    /// Evict until one more execution fits
    ///
    /// Terminal executions go first, oldest first. When only live ones remain,
    /// the oldest CREATED execution is evicted and returned so the caller can
    /// abort it. RUNNING executions are never evicted; the table may then
    /// exceed its cap.
    pub fn make_room(&mut self) -> Vec<Execution> {
        let mut evicted = Vec::new();
        while self.executions.len() >= self.max {
            let victim = self
                .oldest_with(|s| s.is_terminal())
                .or_else(|| self.oldest_with(|s| s == ExecutionStatus::Created));
            match victim.and_then(|id| self.remove(&id)) {
                Some(execution) => {
                    debug!("Evicted execution {} ({})", execution.id, execution.status);
                    evicted.push(execution);
                }
                None => break,
            }
        }
        evicted
    }

    fn oldest_with(&self, pred: impl Fn(ExecutionStatus) -> bool) -> Option<ExecutionId> {
        self.order
            .iter()
            .find(|id| self.executions.get(*id).is_some_and(|e| pred(e.status)))
            .cloned()
    }

    /// Executions in creation order
    pub fn iter(&self) -> impl Iterator<Item = &Execution> {
        self.order.iter().filter_map(|id| self.executions.get(id))
    }

    pub fn ids(&self) -> Vec<ExecutionId> {
        self.order.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionOptions;
    use gears_core::{RunId, ShardId};
    use gears_plan::{GearsBuilder, ReaderInput};
    use std::sync::Arc;

    fn execution(seq: u64, status: ExecutionStatus) -> Execution {
        let mut ex = Execution::new(
            ExecutionId::new(RunId::from("r"), seq),
            Arc::new(GearsBuilder::keys("*").build()),
            ReaderInput::Full,
            ExecutionOptions::default(),
            ShardId::from("a"),
            vec![ShardId::from("a")],
            None,
        );
        ex.status = status;
        ex
    }

    fn id(seq: u64) -> ExecutionId {
        ExecutionId::new(RunId::from("r"), seq)
    }

    #[test]
    fn test_evicts_oldest_terminal_first() {
        let mut table = ExecutionTable::new(3);
        table.insert(execution(1, ExecutionStatus::Created));
        table.insert(execution(2, ExecutionStatus::Done));
        table.insert(execution(3, ExecutionStatus::Aborted));
        let evicted = table.make_room();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, id(2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_evicts_created_when_no_terminal() {
        let mut table = ExecutionTable::new(2);
        table.insert(execution(1, ExecutionStatus::Running));
        table.insert(execution(2, ExecutionStatus::Created));
        let evicted = table.make_room();
        assert_eq!(evicted[0].id, id(2));
        assert!(table.contains(&id(1)));
    }

    #[test]
    fn test_running_never_evicted() {
        let mut table = ExecutionTable::new(1);
        table.insert(execution(1, ExecutionStatus::Running));
        assert!(table.make_room().is_empty());
        table.insert(execution(2, ExecutionStatus::Running));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_iteration_keeps_creation_order() {
        let mut table = ExecutionTable::new(10);
        for seq in [3, 1, 2] {
            table.insert(execution(seq, ExecutionStatus::Done));
        }
        let order: Vec<u64> = table.iter().map(|e| e.id.seq).collect();
        assert_eq!(order, vec![3, 1, 2]);
        table.remove(&id(1));
        assert_eq!(table.ids(), vec![id(3), id(2)]);
    }
}
