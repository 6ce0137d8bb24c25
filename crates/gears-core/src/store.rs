//! Storage seam
//!
//! The engine reads keys and streams through [`ShardStore`] and never owns
//! the keyspace itself. [`MemoryStore`] is an in-process implementation used
//! by local clusters and tests.

use crate::error::{GearsError, Result};
use crate::pattern::glob_match;
use crate::record::Record;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Type of a value stored under a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    String,
    Hash,
    List,
    Set,
    Zset,
    Stream,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyType::String => "string",
            KeyType::Hash => "hash",
            KeyType::List => "list",
            KeyType::Set => "set",
            KeyType::Zset => "zset",
            KeyType::Stream => "stream",
        };
        f.write_str(name)
    }
}

impl FromStr for KeyType {
    type Err = GearsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "string" => Ok(KeyType::String),
            "hash" => Ok(KeyType::Hash),
            "list" => Ok(KeyType::List),
            "set" => Ok(KeyType::Set),
            "zset" => Ok(KeyType::Zset),
            "stream" => Ok(KeyType::Stream),
            other => Err(GearsError::RegistrationError(format!(
                "Unknown key type: {}",
                other
            ))),
        }
    }
}

/// Id of a stream entry, ordered by time then sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamEntryId {
    pub ms: u64,
    pub seq: u64,
}

impl fmt::Display for StreamEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// One entry of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: StreamEntryId,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    /// Convert to the record shape produced by the stream reader
    pub fn to_record(&self, stream: &str) -> Record {
        let value = Record::map(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), Record::Str(v.clone()))),
        );
        Record::map([
            ("key", Record::Str(stream.to_string())),
            ("id", Record::Str(self.id.to_string())),
            ("value", value),
        ])
    }
}

/// Static description of a store command, used to validate command hooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInfo {
    pub name: String,
    /// Key positions cannot be derived from first/last/step
    pub movable_keys: bool,
    /// Not allowed inside scripts or multi/exec
    pub no_script: bool,
    /// Position of the first key argument, 0 when the command takes no keys
    pub first_key: i32,
    /// Position of the last key argument, negative counts from the end
    pub last_key: i32,
    /// Step between key arguments
    pub step: i32,
}

impl CommandInfo {
    pub fn new(name: &str, first_key: i32, last_key: i32, step: i32) -> Self {
        Self {
            name: name.to_string(),
            movable_keys: false,
            no_script: false,
            first_key,
            last_key,
            step,
        }
    }

    pub fn movable_keys(mut self) -> Self {
        self.movable_keys = true;
        self
    }

    pub fn no_script(mut self) -> Self {
        self.no_script = true;
        self
    }

    /// Argument positions holding keys for an invocation with `argc` arguments
    pub fn key_positions(&self, argc: usize) -> Vec<usize> {
        if self.first_key <= 0 || self.step <= 0 {
            return Vec::new();
        }
        let last = if self.last_key < 0 {
            argc as i32 + self.last_key
        } else {
            self.last_key
        };
        let mut positions = Vec::new();
        let mut pos = self.first_key;
        while pos <= last && (pos as usize) < argc {
            positions.push(pos as usize);
            pos += self.step;
        }
        positions
    }
}

/// Access to one shard's local keyspace and streams
pub trait ShardStore: Send + Sync {
    /// Read a key's value
    fn get(&self, key: &str) -> Option<Record>;

    /// Write a key's value, returning its resulting type
    fn set(&self, key: &str, value: Record) -> KeyType;

    /// Delete a key
    fn del(&self, key: &str) -> bool;

    /// Increment an integer key, creating it at zero
    fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// Type of the value stored at a key
    fn key_type(&self, key: &str) -> Option<KeyType>;

    /// Keys matching a glob pattern, in lexical order
    fn scan(&self, pattern: &str) -> Vec<String>;

    /// Append an entry to a stream
    fn stream_add(&self, stream: &str, fields: Vec<(String, String)>) -> StreamEntryId;

    /// Entries strictly after `after`, at most `count` of them
    fn stream_read(&self, stream: &str, after: Option<StreamEntryId>, count: usize)
        -> Vec<StreamEntry>;

    /// Number of entries strictly after `after`
    fn stream_len_after(&self, stream: &str, after: Option<StreamEntryId>) -> usize;

    /// Remove entries up to and including `through`, returning how many were removed
    fn stream_trim(&self, stream: &str, through: StreamEntryId) -> usize;

    /// Description of a command by name
    fn command_info(&self, name: &str) -> Option<CommandInfo>;
}

#[derive(Debug, Clone, Default)]
struct StreamData {
    entries: Vec<StreamEntry>,
    last_id: Option<StreamEntryId>,
}

/// In-memory [`ShardStore`]
#[derive(Debug)]
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, (Record, KeyType)>>,
    streams: RwLock<BTreeMap<String, StreamData>>,
    commands: HashMap<String, CommandInfo>,
}

impl MemoryStore {
    /// Create an empty store with the default command table
    pub fn new() -> Self {
        let commands = default_command_table()
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();
        Self {
            values: RwLock::new(BTreeMap::new()),
            streams: RwLock::new(BTreeMap::new()),
            commands,
        }
    }

    /// Number of keys, streams included
    pub fn len(&self) -> usize {
        self.values.read().len() + self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn type_of(value: &Record) -> KeyType {
    match value {
        Record::Map(_) => KeyType::Hash,
        Record::List(_) => KeyType::List,
        _ => KeyType::String,
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ShardStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Record> {
        if let Some((value, _)) = self.values.read().get(key) {
            return Some(value.clone());
        }
        self.streams
            .read()
            .get(key)
            .map(|s| Record::Int(s.entries.len() as i64))
    }

    fn set(&self, key: &str, value: Record) -> KeyType {
        let key_type = type_of(&value);
        self.streams.write().remove(key);
        self.values
            .write()
            .insert(key.to_string(), (value, key_type));
        key_type
    }

    fn del(&self, key: &str) -> bool {
        let value = self.values.write().remove(key).is_some();
        let stream = self.streams.write().remove(key).is_some();
        value || stream
    }

    fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        if self.streams.read().contains_key(key) {
            return Err(GearsError::CallbackError(
                "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
            ));
        }
        let mut values = self.values.write();
        let current = match values.get(key) {
            None => 0,
            Some((v, _)) => v.as_int().ok_or_else(|| {
                GearsError::CallbackError("value is not an integer".to_string())
            })?,
        };
        let next = current + delta;
        values.insert(key.to_string(), (Record::Int(next), KeyType::String));
        Ok(next)
    }

    fn key_type(&self, key: &str) -> Option<KeyType> {
        if let Some((_, t)) = self.values.read().get(key) {
            return Some(*t);
        }
        self.streams.read().get(key).map(|_| KeyType::Stream)
    }

    fn scan(&self, pattern: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .values
            .read()
            .keys()
            .chain(self.streams.read().keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn stream_add(&self, stream: &str, fields: Vec<(String, String)>) -> StreamEntryId {
        self.values.write().remove(stream);
        let mut streams = self.streams.write();
        let data = streams.entry(stream.to_string()).or_default();
        let now = now_ms();
        let id = match data.last_id {
            Some(last) if now <= last.ms => StreamEntryId {
                ms: last.ms,
                seq: last.seq + 1,
            },
            _ => StreamEntryId { ms: now, seq: 0 },
        };
        data.last_id = Some(id);
        data.entries.push(StreamEntry { id, fields });
        id
    }

    fn stream_read(
        &self,
        stream: &str,
        after: Option<StreamEntryId>,
        count: usize,
    ) -> Vec<StreamEntry> {
        match self.streams.read().get(stream) {
            Some(data) => data
                .entries
                .iter()
                .filter(|e| after.map_or(true, |a| e.id > a))
                .take(count)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    fn stream_len_after(&self, stream: &str, after: Option<StreamEntryId>) -> usize {
        match self.streams.read().get(stream) {
            Some(data) => data
                .entries
                .iter()
                .filter(|e| after.map_or(true, |a| e.id > a))
                .count(),
            None => 0,
        }
    }

    fn stream_trim(&self, stream: &str, through: StreamEntryId) -> usize {
        match self.streams.write().get_mut(stream) {
            Some(data) => {
                let before = data.entries.len();
                data.entries.retain(|e| e.id > through);
                before - data.entries.len()
            }
            None => 0,
        }
    }

    fn command_info(&self, name: &str) -> Option<CommandInfo> {
        self.commands.get(&name.to_ascii_lowercase()).cloned()
    }
}

fn default_command_table() -> Vec<CommandInfo> {
    vec![
        CommandInfo::new("get", 1, 1, 1),
        CommandInfo::new("set", 1, 1, 1),
        CommandInfo::new("del", 1, -1, 1),
        CommandInfo::new("incrby", 1, 1, 1),
        CommandInfo::new("hset", 1, 1, 1),
        CommandInfo::new("hgetall", 1, 1, 1),
        CommandInfo::new("lpush", 1, 1, 1),
        CommandInfo::new("mset", 1, -1, 2),
        CommandInfo::new("mget", 1, -1, 1),
        CommandInfo::new("xadd", 1, 1, 1),
        CommandInfo::new("ping", 0, 0, 0),
        CommandInfo::new("eval", 0, 0, 0).movable_keys().no_script(),
        CommandInfo::new("zunionstore", 1, 1, 1).movable_keys(),
        CommandInfo::new("multi", 0, 0, 0).no_script(),
        CommandInfo::new("exec", 0, 0, 0).no_script(),
        CommandInfo::new("subscribe", 0, 0, 0).no_script(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_and_type() {
        let store = MemoryStore::new();
        assert_eq!(store.set("a", Record::from("1")), KeyType::String);
        assert_eq!(
            store.set("h", Record::map([("f", Record::from("v"))])),
            KeyType::Hash
        );
        assert_eq!(store.get("a"), Some(Record::from("1")));
        assert_eq!(store.key_type("h"), Some(KeyType::Hash));
        assert!(store.del("a"));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_incr_by() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("counter", 1).unwrap(), 1);
        assert_eq!(store.incr_by("counter", 2).unwrap(), 3);
        store.set("text", Record::from("abc"));
        assert!(store.incr_by("text", 1).is_err());
    }

    #[test]
    fn test_scan_pattern() {
        let store = MemoryStore::new();
        store.set("person:1", Record::Null);
        store.set("person:2", Record::Null);
        store.set("other", Record::Null);
        assert_eq!(store.scan("person:*"), vec!["person:1", "person:2"]);
        assert_eq!(store.scan("*").len(), 3);
    }

    #[test]
    fn test_stream_read_and_trim() {
        let store = MemoryStore::new();
        let ids: Vec<_> = (0..4)
            .map(|i| store.stream_add("s", vec![("n".into(), i.to_string())]))
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(store.stream_len_after("s", None), 4);
        assert_eq!(store.stream_read("s", Some(ids[1]), 10).len(), 2);
        assert_eq!(store.stream_trim("s", ids[1]), 2);
        assert_eq!(store.stream_len_after("s", None), 2);
        assert_eq!(store.key_type("s"), Some(KeyType::Stream));
    }

    #[test]
    fn test_command_key_positions() {
        let store = MemoryStore::new();
        let mset = store.command_info("MSET").unwrap();
        assert_eq!(mset.key_positions(5), vec![1, 3]);
        let del = store.command_info("del").unwrap();
        assert_eq!(del.key_positions(4), vec![1, 2, 3]);
        assert!(store.command_info("eval").unwrap().movable_keys);
        assert!(store.command_info("nosuch").is_none());
    }

    #[test]
    fn test_stream_entry_record() {
        let entry = StreamEntry {
            id: StreamEntryId { ms: 5, seq: 1 },
            fields: vec![("name".into(), "x".into())],
        };
        let rec = entry.to_record("events");
        assert_eq!(rec.get("id"), Some(&Record::from("5-1")));
        assert_eq!(rec.get("key"), Some(&Record::from("events")));
    }
}
