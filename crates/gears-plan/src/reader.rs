//! Readers bind a plan to its source data

use gears_core::{KeyType, Record, ShardId, ShardStore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Source of the records fed into a plan's first stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reader {
    /// Keyspace scan over keys matching a glob pattern
    Keys {
        pattern: String,
        #[serde(default = "default_true")]
        read_value: bool,
    },
    /// Entries of streams whose name starts with a prefix
    Stream { prefix: String },
    /// Arguments of an ad-hoc trigger command
    Command { trigger: String },
    /// One record holding the shard id
    ShardId,
}

fn default_true() -> bool {
    true
}

impl fmt::Display for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reader::Keys { pattern, .. } => write!(f, "KeysReader({})", pattern),
            Reader::Stream { prefix } => write!(f, "StreamReader({})", prefix),
            Reader::Command { trigger } => write!(f, "CommandReader({})", trigger),
            Reader::ShardId => write!(f, "ShardIDReader"),
        }
    }
}

/// Trigger-supplied input that narrows what a reader produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReaderInput {
    /// Read everything the reader covers on the local shard
    #[default]
    Full,
    /// A single keyspace event
    KeyEvent { key: String, event: String },
    /// Records already materialized by the trigger, e.g. a stream batch
    Records { records: Vec<Record> },
    /// Arguments of the triggering command
    Command { args: Vec<String> },
}

impl Reader {
    /// Produce the local records for this reader
    pub fn read(&self, input: &ReaderInput, store: &dyn ShardStore, shard: &ShardId) -> Vec<Record> {
        match (self, input) {
            (_, ReaderInput::Records { records }) => records.clone(),
            (Reader::Keys { read_value, .. }, ReaderInput::KeyEvent { key, .. }) => {
                vec![key_record(store, key, *read_value)]
            }
            (Reader::Keys { pattern, read_value }, _) => store
                .scan(pattern)
                .iter()
                .filter(|k| store.key_type(k) != Some(KeyType::Stream))
                .map(|k| key_record(store, k, *read_value))
                .collect(),
            (Reader::Stream { prefix }, _) => {
                let pattern = format!("{}*", prefix.trim_end_matches('*'));
                let mut records = Vec::new();
                for stream in store.scan(&pattern) {
                    if store.key_type(&stream) != Some(KeyType::Stream) {
                        continue;
                    }
                    records.extend(
                        store
                            .stream_read(&stream, None, usize::MAX)
                            .iter()
                            .map(|e| e.to_record(&stream)),
                    );
                }
                records
            }
            (Reader::Command { .. }, ReaderInput::Command { args }) => {
                vec![Record::List(args.iter().cloned().map(Record::Str).collect())]
            }
            (Reader::Command { .. }, _) => Vec::new(),
            (Reader::ShardId, _) => vec![Record::Str(shard.to_string())],
        }
    }
}

fn key_record(store: &dyn ShardStore, key: &str, read_value: bool) -> Record {
    let value = if read_value {
        store.get(key).unwrap_or_default()
    } else {
        Record::Null
    };
    Record::key(key, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_core::MemoryStore;

    #[test]
    fn test_keys_scan() {
        let store = MemoryStore::new();
        store.set("person:1", Record::from("a"));
        store.set("person:2", Record::from("b"));
        store.set("city:1", Record::from("c"));
        let reader = Reader::Keys {
            pattern: "person:*".into(),
            read_value: true,
        };
        let records = reader.read(&ReaderInput::Full, &store, &ShardId::from("s"));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], Record::key("person:1", Record::from("a")));
    }

    #[test]
    fn test_keys_event_reads_single_key() {
        let store = MemoryStore::new();
        store.set("person:1", Record::from("a"));
        let reader = Reader::Keys {
            pattern: "*".into(),
            read_value: false,
        };
        let input = ReaderInput::KeyEvent {
            key: "person:1".into(),
            event: "set".into(),
        };
        let records = reader.read(&input, &store, &ShardId::from("s"));
        assert_eq!(records, vec![Record::key("person:1", Record::Null)]);
    }

    #[test]
    fn test_stream_reader_reads_matching_streams() {
        let store = MemoryStore::new();
        store.stream_add("events:a", vec![("x".into(), "1".into())]);
        store.stream_add("events:b", vec![("x".into(), "2".into())]);
        store.stream_add("other", vec![("x".into(), "3".into())]);
        let reader = Reader::Stream {
            prefix: "events:".into(),
        };
        let records = reader.read(&ReaderInput::Full, &store, &ShardId::from("s"));
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_shard_id_and_command_readers() {
        let store = MemoryStore::new();
        let shard = ShardId::from("shard-1");
        assert_eq!(
            Reader::ShardId.read(&ReaderInput::Full, &store, &shard),
            vec![Record::from("shard-1")]
        );
        let reader = Reader::Command {
            trigger: "t".into(),
        };
        let input = ReaderInput::Command {
            args: vec!["t".into(), "x".into()],
        };
        assert_eq!(
            reader.read(&input, &store, &shard),
            vec![Record::List(vec![Record::from("t"), Record::from("x")])]
        );
    }
}
