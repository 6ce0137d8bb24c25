//! Record values flowing through a plan

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single value flowing between stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Record {
    /// Absence of a value; also the zero value of accumulators
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Ordered list of records
    List(Vec<Record>),
    /// String-keyed map of records
    Map(BTreeMap<String, Record>),
    /// A keyspace entry as produced by the keys reader
    Key {
        /// Key name
        key: String,
        /// Key value, `Null` when the reader does not read values
        value: Box<Record>,
    },
}

impl Record {
    /// Build a keyspace record
    pub fn key(key: impl Into<String>, value: Record) -> Self {
        Record::Key {
            key: key.into(),
            value: Box::new(value),
        }
    }

    /// Build a map record from key/value pairs
    pub fn map<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Record)>) -> Self {
        Record::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Record::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Record::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Record::Int(v) => Some(*v),
            Record::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Numeric view of the record; integers and numeric strings widen
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Record::Int(v) => Some(*v as f64),
            Record::Float(v) => Some(*v),
            Record::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Key name of a keyspace record
    pub fn key_name(&self) -> Option<&str> {
        match self {
            Record::Key { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Field lookup on map records and on the value of keyspace records
    pub fn get(&self, field: &str) -> Option<&Record> {
        match self {
            Record::Map(m) => m.get(field),
            Record::Key { value, .. } => value.get(field),
            _ => None,
        }
    }

    /// Stable string form used as a grouping and routing key
    pub fn group_key(&self) -> String {
        match self {
            Record::Null => String::new(),
            Record::Bool(b) => b.to_string(),
            Record::Int(v) => v.to_string(),
            Record::Float(v) => v.to_string(),
            Record::Str(s) => s.clone(),
            Record::Key { key, .. } => key.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Null => write!(f, "None"),
            Record::Bool(b) => write!(f, "{}", b),
            Record::Int(v) => write!(f, "{}", v),
            Record::Float(v) => write!(f, "{}", v),
            Record::Str(s) => write!(f, "{}", s),
            Record::Key { key, value } => write!(f, "{{'key': '{}', 'value': {}}}", key, value),
            Record::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Record::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "'{}': {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<&str> for Record {
    fn from(s: &str) -> Self {
        Record::Str(s.to_string())
    }
}

impl From<String> for Record {
    fn from(s: String) -> Self {
        Record::Str(s)
    }
}

impl From<i64> for Record {
    fn from(v: i64) -> Self {
        Record::Int(v)
    }
}

impl From<f64> for Record {
    fn from(v: f64) -> Self {
        Record::Float(v)
    }
}

impl From<bool> for Record {
    fn from(v: bool) -> Self {
        Record::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_views() {
        assert_eq!(Record::Int(4).as_float(), Some(4.0));
        assert_eq!(Record::from("12").as_int(), Some(12));
        assert_eq!(Record::from("x").as_int(), None);
        assert_eq!(Record::Null.as_float(), None);
    }

    #[test]
    fn test_group_key() {
        assert_eq!(Record::key("person:1", Record::Null).group_key(), "person:1");
        assert_eq!(Record::Int(3).group_key(), "3");
        assert_eq!(Record::from("a").group_key(), "a");
    }

    #[test]
    fn test_map_field_lookup() {
        let rec = Record::map([("name", Record::from("bob")), ("age", Record::Int(3))]);
        assert_eq!(rec.get("name"), Some(&Record::from("bob")));
        let keyed = Record::key("person:1", rec);
        assert_eq!(keyed.get("age"), Some(&Record::Int(3)));
        assert_eq!(keyed.key_name(), Some("person:1"));
    }

    #[test]
    fn test_display() {
        let rec = Record::List(vec![Record::Int(1), Record::from("b")]);
        assert_eq!(rec.to_string(), "[1, b]");
    }
}
