//! Per-stream consumer state of a stream registration
//!
//! Each stream matching a registration's prefix gets a [`StreamConsumer`].
//! It counts unconsumed entries, decides when a batch is due, and moves its
//! acknowledged position forward when a batch completes. Entries are only
//! acknowledged after their execution succeeded, so a failed or aborted
//! batch is read again.

use gears_core::{ExecutionId, Record, ShardStore, StreamEntryId};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// A batch handed to an execution and not yet acknowledged
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightBatch {
    pub execution: Option<ExecutionId>,
    /// Last entry id in the batch
    pub through: StreamEntryId,
    pub count: usize,
    /// Arrival of the oldest entry, unknown for backlog entries
    pub first_arrival: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct StreamConsumer {
    stream: String,
    last_acked: Option<StreamEntryId>,
    pending: usize,
    /// Entries found by a scan rather than by an event; run without waiting
    backlog: usize,
    first_arrival: Option<Instant>,
    deadline: Option<Instant>,
    in_flight: Option<InFlightBatch>,
}

impl StreamConsumer {
    pub fn new(stream: impl Into<String>, last_acked: Option<StreamEntryId>) -> Self {
        Self {
            stream: stream.into(),
            last_acked,
            pending: 0,
            backlog: 0,
            first_arrival: None,
            deadline: None,
            in_flight: None,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn last_acked(&self) -> Option<StreamEntryId> {
        self.last_acked
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn in_flight(&self) -> Option<&InFlightBatch> {
        self.in_flight.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Recount unconsumed entries from the store, treating them as backlog
    pub fn rescan(&mut self, store: &dyn ShardStore) {
        self.pending = store.stream_len_after(&self.stream, self.last_acked);
        self.backlog = self.pending;
        self.first_arrival = None;
        self.deadline = None;
        self.in_flight = None;
    }

    /// Start watching a stream that just received its first entry
    pub fn discover(&mut self, store: &dyn ShardStore, now: Instant) {
        self.pending = store.stream_len_after(&self.stream, self.last_acked);
        self.backlog = 0;
        self.first_arrival = Some(now);
    }

    /// An entry was appended
    pub fn on_added(&mut self, now: Instant) {
        self.pending += 1;
        if self.first_arrival.is_none() {
            self.first_arrival = Some(now);
        }
    }

    /// Whether a batch should start now
    pub fn is_due(&self, batch_size: usize, now: Instant) -> bool {
        if self.in_flight.is_some() || self.pending == 0 {
            return false;
        }
        self.backlog > 0
            || self.pending >= batch_size.max(1)
            || self.deadline.is_some_and(|d| now >= d)
    }

    /// Set the partial-batch deadline if one is needed and not already set
    pub fn arm_timer(&mut self, duration: Duration, now: Instant) {
        if duration.is_zero() || self.in_flight.is_some() || self.pending == 0 {
            return;
        }
        if self.deadline.is_none() {
            self.deadline = Some(self.first_arrival.unwrap_or(now) + duration);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Read the next batch; `None` when the stream holds nothing new
    pub fn start_batch(
        &mut self,
        store: &dyn ShardStore,
        batch_size: usize,
        now: Instant,
    ) -> Option<Vec<Record>> {
        let entries = store.stream_read(&self.stream, self.last_acked, batch_size.max(1));
        let last = entries.last()?.id;
        let count = entries.len();
        let first_arrival = if self.backlog > 0 {
            None
        } else {
            self.first_arrival.take()
        };
        if self.pending > count {
            // the rest arrived before now
            self.first_arrival.get_or_insert(now);
        }
        self.deadline = None;
        self.in_flight = Some(InFlightBatch {
            execution: None,
            through: last,
            count,
            first_arrival,
        });
        Some(
            entries
                .iter()
                .map(|e| e.to_record(&self.stream))
                .collect(),
        )
    }

    /// Nothing readable although entries were counted
    pub fn reset_pending(&mut self) {
        self.pending = 0;
        self.backlog = 0;
        self.first_arrival = None;
        self.deadline = None;
    }

    pub fn assign(&mut self, execution: ExecutionId) {
        if let Some(batch) = &mut self.in_flight {
            batch.execution = Some(execution);
        }
    }

    pub fn runs(&self, execution: &ExecutionId) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|b| b.execution.as_ref() == Some(execution))
    }

    /// Acknowledge the in-flight batch, returning its lag when known
    pub fn ack(&mut self, store: &dyn ShardStore, trim: bool, now: Instant) -> Option<Duration> {
        let batch = self.in_flight.take()?;
        self.last_acked = Some(batch.through);
        self.pending = self.pending.saturating_sub(batch.count);
        self.backlog = self.backlog.saturating_sub(batch.count);
        if trim {
            store.stream_trim(&self.stream, batch.through);
        }
        batch.first_arrival.map(|t| now.saturating_duration_since(t))
    }

    /// Give the in-flight batch up without acknowledging it
    pub fn release(&mut self) {
        if let Some(batch) = self.in_flight.take() {
            // its entries are read again, without waiting for a full batch
            self.backlog = self.backlog.max(batch.count);
        }
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            stream: self.stream.clone(),
            last_acked: self.last_acked.map(|id| id.to_string()),
            pending: self.pending,
            running: self.in_flight.is_some(),
        }
    }
}

/// Serializable view of a stream consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub stream: String,
    pub last_acked: Option<String>,
    pub pending: usize,
    pub running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_core::MemoryStore;

    fn add(store: &MemoryStore, stream: &str, n: usize) {
        for i in 0..n {
            store.stream_add(stream, vec![("n".to_string(), i.to_string())]);
        }
    }

    #[test]
    fn test_batch_waits_for_size() {
        let store = MemoryStore::new();
        let now = Instant::now();
        let mut c = StreamConsumer::new("s", None);
        add(&store, "s", 1);
        c.discover(&store, now);
        for i in 1..5 {
            assert!(!c.is_due(5, now), "due after {} entries", i);
            add(&store, "s", 1);
            c.on_added(now);
        }
        assert!(c.is_due(5, now));
        let batch = c.start_batch(&store, 5, now).unwrap();
        assert_eq!(batch.len(), 5);
        assert!(!c.is_due(5, now));
    }

    #[test]
    fn test_ack_moves_position_and_trims() {
        let store = MemoryStore::new();
        let now = Instant::now();
        add(&store, "s", 3);
        let mut c = StreamConsumer::new("s", None);
        c.rescan(&store);
        assert!(c.is_due(10, now));
        c.start_batch(&store, 2, now).unwrap();
        c.ack(&store, true, now);
        assert_eq!(c.pending(), 1);
        assert_eq!(store.stream_len_after("s", None), 1);
        // backlog still runs without a full batch
        assert!(c.is_due(10, now));
    }

    #[test]
    fn test_release_rereads_batch() {
        let store = MemoryStore::new();
        let now = Instant::now();
        add(&store, "s", 2);
        let mut c = StreamConsumer::new("s", None);
        c.discover(&store, now);
        let first = c.start_batch(&store, 2, now).unwrap();
        c.release();
        assert!(c.is_due(2, now));
        let again = c.start_batch(&store, 2, now).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_timer_makes_partial_batch_due() {
        let store = MemoryStore::new();
        let now = Instant::now();
        add(&store, "s", 1);
        let mut c = StreamConsumer::new("s", None);
        c.discover(&store, now);
        c.arm_timer(Duration::from_millis(100), now);
        assert!(!c.is_due(5, now));
        assert!(c.is_due(5, now + Duration::from_millis(150)));
    }
}
