//! Engine configuration

use crate::error::{GearsError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Names accepted by [`GearsConfig::get`] and [`GearsConfig::set`]
pub const CONFIG_KEYS: &[&str] = &[
    "MaxExecutions",
    "MaxExecutionsPerRegistration",
    "ProfileExecutions",
    "ExecutionThreads",
    "ExecutionMaxIdleTime",
    "SendMsgRetries",
    "HelloRetryInterval",
    "ReconnectInterval",
    "ClusterPassword",
];

/// Per-shard engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GearsConfig {
    /// Cap on executions tracked by one shard
    pub max_executions: usize,
    /// Cap on executions tracked per registration
    pub max_executions_per_registration: usize,
    /// Record per-stage durations
    pub profile_executions: bool,
    /// Worker pool size
    pub execution_threads: usize,
    /// Idle time after which a non-progressing execution is aborted (ms)
    pub execution_max_idle_time: u64,
    /// Per-message resend budget, 0 means unlimited
    pub send_msg_retries: u32,
    /// Delay before retrying a failed handshake (ms)
    pub hello_retry_interval: u64,
    /// Delay before reconnecting a lost peer connection (ms)
    pub reconnect_interval: u64,
    /// Password sent to peers before the handshake
    pub cluster_password: Option<String>,
}

impl Default for GearsConfig {
    fn default() -> Self {
        Self {
            max_executions: 1000,
            max_executions_per_registration: 100,
            profile_executions: false,
            execution_threads: 3,
            execution_max_idle_time: 5000,
            send_msg_retries: 3,
            hello_retry_interval: 1000,
            reconnect_interval: 1000,
            cluster_password: None,
        }
    }
}

impl GearsConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GearsConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Set the execution-table cap
    pub fn with_max_executions(mut self, max: usize) -> Self {
        self.max_executions = max;
        self
    }

    /// Set the per-registration execution cap
    pub fn with_max_executions_per_registration(mut self, max: usize) -> Self {
        self.max_executions_per_registration = max;
        self
    }

    /// Enable or disable per-stage profiling
    pub fn with_profile_executions(mut self, enabled: bool) -> Self {
        self.profile_executions = enabled;
        self
    }

    /// Set the worker pool size
    pub fn with_execution_threads(mut self, threads: usize) -> Self {
        self.execution_threads = threads;
        self
    }

    /// Set the idle-abort timeout
    pub fn with_execution_max_idle_time(mut self, idle: Duration) -> Self {
        self.execution_max_idle_time = idle.as_millis() as u64;
        self
    }

    /// Set the per-message resend budget
    pub fn with_send_msg_retries(mut self, retries: u32) -> Self {
        self.send_msg_retries = retries;
        self
    }

    /// Set handshake retry and reconnect delays
    pub fn with_retry_intervals(mut self, hello: Duration, reconnect: Duration) -> Self {
        self.hello_retry_interval = hello.as_millis() as u64;
        self.reconnect_interval = reconnect.as_millis() as u64;
        self
    }

    /// Set the password presented to peers
    pub fn with_cluster_password(mut self, password: impl Into<String>) -> Self {
        self.cluster_password = Some(password.into());
        self
    }

    pub fn execution_max_idle(&self) -> Duration {
        Duration::from_millis(self.execution_max_idle_time)
    }

    pub fn hello_retry_delay(&self) -> Duration {
        Duration::from_millis(self.hello_retry_interval)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval)
    }

    /// Check invariants the engine relies on
    pub fn validate(&self) -> Result<()> {
        if self.execution_threads == 0 {
            return Err(GearsError::ConfigError(
                "ExecutionThreads must be at least 1".into(),
            ));
        }
        if self.max_executions == 0 {
            return Err(GearsError::ConfigError(
                "MaxExecutions must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Read a value by its configuration name
    pub fn get(&self, name: &str) -> Result<String> {
        let value = match canonical(name)? {
            "MaxExecutions" => self.max_executions.to_string(),
            "MaxExecutionsPerRegistration" => self.max_executions_per_registration.to_string(),
            "ProfileExecutions" => (self.profile_executions as u8).to_string(),
            "ExecutionThreads" => self.execution_threads.to_string(),
            "ExecutionMaxIdleTime" => self.execution_max_idle_time.to_string(),
            "SendMsgRetries" => self.send_msg_retries.to_string(),
            "HelloRetryInterval" => self.hello_retry_interval.to_string(),
            "ReconnectInterval" => self.reconnect_interval.to_string(),
            _ => self.cluster_password.clone().unwrap_or_default(),
        };
        Ok(value)
    }

    /// Update a value by its configuration name
    ///
    /// `ExecutionThreads` only takes effect for worker pools created after
    /// the change.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let key = canonical(name)?;
        match key {
            "MaxExecutions" => self.max_executions = parse(key, value)?,
            "MaxExecutionsPerRegistration" => {
                self.max_executions_per_registration = parse(key, value)?
            }
            "ProfileExecutions" => self.profile_executions = parse::<u8>(key, value)? != 0,
            "ExecutionThreads" => self.execution_threads = parse(key, value)?,
            "ExecutionMaxIdleTime" => self.execution_max_idle_time = parse(key, value)?,
            "SendMsgRetries" => self.send_msg_retries = parse(key, value)?,
            "HelloRetryInterval" => self.hello_retry_interval = parse(key, value)?,
            "ReconnectInterval" => self.reconnect_interval = parse(key, value)?,
            _ => {
                self.cluster_password = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
        }
        self.validate()
    }
}

fn canonical(name: &str) -> Result<&'static str> {
    CONFIG_KEYS
        .iter()
        .copied()
        .find(|k| k.eq_ignore_ascii_case(name))
        .ok_or_else(|| GearsError::ConfigError(format!("Unsupported config parameter: {}", name)))
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| GearsError::ConfigError(format!("Bad value for {}: {}", key, value)))
}
