//! Registration snapshots for restart recovery
//!
//! Only registrations survive a restart. In-flight executions are lost;
//! stream consumers resume after their last acknowledged entry.

use crate::registration::{Registration, RegistrationState};
use crate::trigger::Trigger;
use gears_core::{RegistrationId, Result, StreamEntryId};
use gears_executor::ExecutionMode;
use gears_plan::Plan;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationSnapshot {
    pub id: RegistrationId,
    pub plan: Plan,
    pub trigger: Trigger,
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub state: RegistrationState,
    /// Last acknowledged entry per stream
    #[serde(default)]
    pub stream_acks: Vec<(String, StreamEntryId)>,
}

impl From<&Registration> for RegistrationSnapshot {
    fn from(reg: &Registration) -> Self {
        Self {
            id: reg.id.clone(),
            plan: reg.plan.as_ref().clone(),
            trigger: reg.trigger.clone(),
            mode: reg.mode,
            description: reg.description.clone(),
            state: reg.state,
            stream_acks: reg
                .streams()
                .filter_map(|c| c.last_acked().map(|id| (c.stream().to_string(), id)))
                .collect(),
        }
    }
}

impl RegistrationSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Write snapshots to a JSON file
pub fn save(path: &Path, snapshots: &[RegistrationSnapshot]) -> Result<()> {
    let contents = serde_json::to_string_pretty(snapshots)?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Read snapshots written by [`save`]
pub fn load(path: &Path) -> Result<Vec<RegistrationSnapshot>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}
