//! Trigger sources a registration can bind a plan to

use gears_core::{CommandInfo, GearsError, KeyType, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Keyspace notification trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyTrigger {
    /// Exact key, or a prefix when it ends with `*`
    pub prefix: String,
    /// Only fire on these events, e.g. `set` or `del`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<String>>,
    /// Only fire for keys of these types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_types: Option<Vec<KeyType>>,
    #[serde(default = "default_true")]
    pub read_value: bool,
}

fn default_true() -> bool {
    true
}

impl KeyTrigger {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            event_types: None,
            key_types: None,
            read_value: true,
        }
    }

    pub fn with_event_types(mut self, events: Vec<String>) -> Self {
        self.event_types = Some(events);
        self
    }

    pub fn with_key_types(mut self, types: Vec<KeyType>) -> Self {
        self.key_types = Some(types);
        self
    }

    pub fn with_read_value(mut self, read_value: bool) -> Self {
        self.read_value = read_value;
        self
    }

    pub fn matches_key(&self, key: &str) -> bool {
        match self.prefix.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => self.prefix == key,
        }
    }

    /// Whether an event on `key` fires this trigger
    ///
    /// `key_type` is `None` when the key no longer exists, in which case the
    /// key type filter does not apply.
    pub fn should_fire(&self, key: &str, event: &str, key_type: Option<KeyType>) -> bool {
        if let Some(events) = &self.event_types {
            if !events.iter().any(|e| e == event) {
                return false;
            }
        }
        if let (Some(types), Some(key_type)) = (&self.key_types, key_type) {
            if !types.contains(&key_type) {
                return false;
            }
        }
        self.matches_key(key)
    }
}

/// What a stream registration does after a failed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailedPolicy {
    /// Acknowledge the batch and carry on
    #[default]
    Continue,
    /// Stop the registration
    Abort,
    /// Re-read the batch after the retry interval
    Retry,
}

impl fmt::Display for OnFailedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnFailedPolicy::Continue => write!(f, "continue"),
            OnFailedPolicy::Abort => write!(f, "abort"),
            OnFailedPolicy::Retry => write!(f, "retry"),
        }
    }
}

impl std::str::FromStr for OnFailedPolicy {
    type Err = GearsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "continue" => Ok(OnFailedPolicy::Continue),
            "abort" => Ok(OnFailedPolicy::Abort),
            "retry" => Ok(OnFailedPolicy::Retry),
            other => Err(GearsError::RegistrationError(format!(
                "Unknown failure policy: {}",
                other
            ))),
        }
    }
}

/// Stream consumer trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamTrigger {
    pub prefix: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Run a partial batch after this long, 0 disables the timer
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub on_failed_policy: OnFailedPolicy,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_true")]
    pub trim_stream: bool,
}

fn default_batch_size() -> usize {
    1
}

fn default_retry_interval() -> u64 {
    5000
}

impl StreamTrigger {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            batch_size: default_batch_size(),
            duration_ms: 0,
            on_failed_policy: OnFailedPolicy::default(),
            retry_interval_ms: default_retry_interval(),
            trim_stream: true,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_on_failed_policy(mut self, policy: OnFailedPolicy) -> Self {
        self.on_failed_policy = policy;
        self
    }

    pub fn with_retry_interval_ms(mut self, interval: u64) -> Self {
        self.retry_interval_ms = interval;
        self
    }

    pub fn with_trim_stream(mut self, trim: bool) -> Self {
        self.trim_stream = trim;
        self
    }

    pub fn matches_stream(&self, stream: &str) -> bool {
        stream.starts_with(self.prefix.trim_end_matches('*'))
    }
}

/// Hook replacing a store command
///
/// Deserialized hooks go through [`CommandHook::new`], so the command name is
/// lowercased and a `*` prefix means every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "HookSpec")]
pub struct CommandHook {
    pub command: String,
    /// Only invocations touching a key with this prefix; `None` hooks every call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
}

#[derive(Deserialize)]
struct HookSpec {
    command: String,
    #[serde(default)]
    key_prefix: Option<String>,
}

impl From<HookSpec> for CommandHook {
    fn from(spec: HookSpec) -> Self {
        CommandHook::new(spec.command, spec.key_prefix)
    }
}

impl CommandHook {
    pub fn new(command: impl Into<String>, key_prefix: Option<String>) -> Self {
        let key_prefix = key_prefix.filter(|p| p != "*");
        Self {
            command: command.into().to_ascii_lowercase(),
            key_prefix,
        }
    }

    /// Check the hook against the command's description
    pub fn validate(&self, info: Option<&CommandInfo>) -> Result<()> {
        let info = info.ok_or_else(|| {
            GearsError::RegistrationError(format!("Unknown command: {}", self.command))
        })?;
        if info.no_script {
            return Err(GearsError::RegistrationError(
                "Can not hook a command which is not allowed inside a script".to_string(),
            ));
        }
        if let Some(prefix) = &self.key_prefix {
            if info.movable_keys {
                return Err(GearsError::RegistrationError(
                    "Can not hook a command with movable keys by key prefix".to_string(),
                ));
            }
            if info.first_key <= 0 || info.step <= 0 {
                return Err(GearsError::RegistrationError(
                    "Can not hook a command without key arguments by key prefix".to_string(),
                ));
            }
            if prefix.is_empty() {
                return Err(GearsError::RegistrationError(
                    "Empty prefix given to command hook".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Whether an invocation is intercepted; `args[0]` is the command name
    pub fn matches(&self, args: &[String], info: &CommandInfo) -> bool {
        let Some(name) = args.first() else {
            return false;
        };
        if !name.eq_ignore_ascii_case(&self.command) {
            return false;
        }
        match &self.key_prefix {
            None => true,
            Some(prefix) => info
                .key_positions(args.len())
                .into_iter()
                .any(|pos| args[pos].starts_with(prefix.as_str())),
        }
    }
}

/// The event source of a registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Keys(KeyTrigger),
    Stream(StreamTrigger),
    /// Fired explicitly by name
    Command { name: String },
    Hook(CommandHook),
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Keys(_) => "KeysReader",
            Trigger::Stream(_) => "StreamReader",
            Trigger::Command { .. } => "CommandReader",
            Trigger::Hook(_) => "CommandHook",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Keys(k) => write!(f, "keys({})", k.prefix),
            Trigger::Stream(s) => write!(f, "stream({}, batch={})", s.prefix, s.batch_size),
            Trigger::Command { name } => write!(f, "command({})", name),
            Trigger::Hook(h) => match &h.key_prefix {
                Some(prefix) => write!(f, "hook({}, {})", h.command, prefix),
                None => write!(f, "hook({})", h.command),
            },
        }
    }
}
