//! Registration lifecycle messages broadcast to every shard

use crate::persist::RegistrationSnapshot;
use gears_core::{RegistrationId, Result};
use serde::{Deserialize, Serialize};

/// Transport command carrying [`RegistryMessage`] payloads
pub const REGISTRY_COMMAND: &str = "gears.registry";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryMessage {
    Register { registration: RegistrationSnapshot },
    Pause { id: RegistrationId },
    Unpause { id: RegistrationId },
    Unregister {
        id: RegistrationId,
        #[serde(default)]
        abort_pending: bool,
    },
}

impl RegistryMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}
