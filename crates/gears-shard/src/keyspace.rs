//! Local keyspace with write notifications
//!
//! [`Keyspace`] wraps the in-memory store and records an event for every
//! write, whether it comes from a client command or from a callback running
//! inside an execution. The shard drains the events after each unit of work
//! and feeds them to the registry.

use gears_core::{
    CommandInfo, KeyType, MemoryStore, Record, Result, ShardStore, StreamEntry, StreamEntryId,
};
use parking_lot::Mutex;

/// A keyspace change worth telling the registry about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Keyspace notification, e.g. `set` or `del`
    Key { key: String, event: String },
    /// An entry was appended to a stream
    StreamAdded { stream: String },
}

#[derive(Debug, Default)]
pub struct Keyspace {
    store: MemoryStore,
    events: Mutex<Vec<StoreEvent>>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the events recorded since the last call
    pub fn take_events(&self) -> Vec<StoreEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn has_events(&self) -> bool {
        !self.events.lock().is_empty()
    }

    fn notify(&self, key: &str, event: &str) {
        self.events.lock().push(StoreEvent::Key {
            key: key.to_string(),
            event: event.to_string(),
        });
    }
}

impl ShardStore for Keyspace {
    fn get(&self, key: &str) -> Option<Record> {
        self.store.get(key)
    }

    fn set(&self, key: &str, value: Record) -> KeyType {
        let key_type = self.store.set(key, value);
        self.notify(key, "set");
        key_type
    }

    fn del(&self, key: &str) -> bool {
        let removed = self.store.del(key);
        if removed {
            self.notify(key, "del");
        }
        removed
    }

    fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let value = self.store.incr_by(key, delta)?;
        self.notify(key, "incrby");
        Ok(value)
    }

    fn key_type(&self, key: &str) -> Option<KeyType> {
        self.store.key_type(key)
    }

    fn scan(&self, pattern: &str) -> Vec<String> {
        self.store.scan(pattern)
    }

    fn stream_add(&self, stream: &str, fields: Vec<(String, String)>) -> StreamEntryId {
        let id = self.store.stream_add(stream, fields);
        let mut events = self.events.lock();
        events.push(StoreEvent::Key {
            key: stream.to_string(),
            event: "xadd".to_string(),
        });
        events.push(StoreEvent::StreamAdded {
            stream: stream.to_string(),
        });
        id
    }

    fn stream_read(
        &self,
        stream: &str,
        after: Option<StreamEntryId>,
        count: usize,
    ) -> Vec<StreamEntry> {
        self.store.stream_read(stream, after, count)
    }

    fn stream_len_after(&self, stream: &str, after: Option<StreamEntryId>) -> usize {
        self.store.stream_len_after(stream, after)
    }

    // trimming consumed entries is not a change consumers react to
    fn stream_trim(&self, stream: &str, through: StreamEntryId) -> usize {
        self.store.stream_trim(stream, through)
    }

    fn command_info(&self, name: &str) -> Option<CommandInfo> {
        self.store.command_info(name)
    }
}
