//! Error types for the gears engine

use thiserror::Error;

/// Prefix used on replies when the receiving shard has no usable topology
pub const ERR_CLUSTER_PREFIX: &str = "ERRCLUSTER";

/// Errors that can occur anywhere in the engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GearsError {
    /// Plan construction or validation error
    #[error("Plan error: {0}")]
    PlanError(String),

    /// Execution lifecycle error
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// Registration rejected or failed
    #[error("Registration error: {0}")]
    RegistrationError(String),

    /// Messaging transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Key routed to a shard that does not own its slot
    #[error("MOVED {slot} {owner}")]
    Moved {
        /// Hash slot of the key
        slot: u16,
        /// Shard that owns the slot under the current topology
        owner: String,
    },

    /// Cluster topology missing or inconsistent
    #[error("ERRCLUSTER {0}")]
    ClusterError(String),

    /// Entity lookup failed
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// User callback failed
    #[error("Callback error: {0}")]
    CallbackError(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("IO error: {0}")]
    IoError(String),
}

impl GearsError {
    /// Whether this error belongs to the cluster-consistency class
    pub fn is_cluster_error(&self) -> bool {
        matches!(self, GearsError::Moved { .. } | GearsError::ClusterError(_))
    }
}

impl From<serde_json::Error> for GearsError {
    fn from(err: serde_json::Error) -> Self {
        GearsError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for GearsError {
    fn from(err: std::io::Error) -> Self {
        GearsError::IoError(err.to_string())
    }
}

/// Result type for gears operations
pub type Result<T> = std::result::Result<T, GearsError>;
