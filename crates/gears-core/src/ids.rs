//! Typed identifiers for shards, runs, executions and registrations

use crate::error::{GearsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Identity of a shard in the cluster topology
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub String);

impl ShardId {
    /// Create a shard id from any string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of one process lifetime of a shard
///
/// A shard draws a fresh run id every time it starts. Peers compare run ids
/// during the handshake to detect restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random run id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

macro_rules! sequenced_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            /// Run id of the shard that allocated the id
            pub run: RunId,
            /// Sequence number within that run
            pub seq: u64,
        }

        impl $name {
            /// Create an id from its parts
            pub fn new(run: RunId, seq: u64) -> Self {
                Self { run, seq }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", self.run, self.seq)
            }
        }

        impl FromStr for $name {
            type Err = GearsError;

            fn from_str(s: &str) -> Result<Self> {
                let (run, seq) = s
                    .rsplit_once('-')
                    .ok_or_else(|| GearsError::NotFound($label, s.to_string()))?;
                let seq = seq
                    .parse::<u64>()
                    .map_err(|_| GearsError::NotFound($label, s.to_string()))?;
                if run.is_empty() {
                    return Err(GearsError::NotFound($label, s.to_string()));
                }
                Ok(Self::new(RunId(run.to_string()), seq))
            }
        }
    };
}

sequenced_id!(
    /// Cluster-wide identifier of one execution
    ExecutionId,
    "execution"
);

sequenced_id!(
    /// Cluster-wide identifier of one registration
    RegistrationId,
    "registration"
);

/// Allocates execution and registration ids for one run of a shard
///
/// Sequences start at 1 and are only reset by creating a generator for a
/// new run id.
#[derive(Debug)]
pub struct IdGenerator {
    run: RunId,
    next_execution: AtomicU64,
    next_registration: AtomicU64,
}

impl IdGenerator {
    /// Create a generator scoped to a run id
    pub fn new(run: RunId) -> Self {
        Self {
            run,
            next_execution: AtomicU64::new(1),
            next_registration: AtomicU64::new(1),
        }
    }

    /// The run id the generator allocates under
    pub fn run_id(&self) -> &RunId {
        &self.run
    }

    /// Allocate the next execution id
    pub fn next_execution(&self) -> ExecutionId {
        let seq = self.next_execution.fetch_add(1, Ordering::Relaxed);
        ExecutionId::new(self.run.clone(), seq)
    }

    /// Allocate the next registration id
    pub fn next_registration(&self) -> RegistrationId {
        let seq = self.next_registration.fetch_add(1, Ordering::Relaxed);
        RegistrationId::new(self.run.clone(), seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_id_roundtrip_string() {
        let id = ExecutionId::new(RunId::from("abc123"), 7);
        assert_eq!(id.to_string(), "abc123-7");
        let parsed: ExecutionId = "abc123-7".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("nodash".parse::<ExecutionId>().is_err());
        assert!("run-notanumber".parse::<RegistrationId>().is_err());
        assert!("-3".parse::<ExecutionId>().is_err());
    }

    #[test]
    fn test_generator_sequences_start_at_one() {
        let gen = IdGenerator::new(RunId::from("r1"));
        assert_eq!(gen.next_execution().seq, 1);
        assert_eq!(gen.next_execution().seq, 2);
        assert_eq!(gen.next_registration().seq, 1);
    }

    #[test]
    fn test_new_run_restarts_sequence() {
        let first = IdGenerator::new(RunId::generate());
        first.next_execution();
        let a = first.next_execution();

        let second = IdGenerator::new(RunId::generate());
        let b = second.next_execution();
        assert_eq!(b.seq, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(RunId::generate(), RunId::generate());
    }
}
