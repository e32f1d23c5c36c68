//! Resource change records and their incremental updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Planned action for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAction {
    Create,
    Update,
    Delete,
    Replace,
    #[serde(other)]
    Unknown,
}

/// Apply progress of a single resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    #[default]
    Pending,
    Applying,
    Completed,
    Failed,
}

/// One resource affected by a task, as parsed from the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    /// Database surrogate key.
    pub id: u64,
    /// Unique within a task; primary reconciliation key.
    pub resource_address: String,
    pub resource_type: String,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub module_address: String,
    pub action: ResourceAction,
    #[serde(default)]
    pub apply_status: ApplyStatus,
    #[serde(default)]
    pub apply_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub apply_completed_at: Option<DateTime<Utc>>,
    /// Identifier assigned by the cloud provider, known after apply.
    #[serde(default)]
    pub resource_id: Option<String>,
}

impl ResourceChange {
    pub fn new(
        id: u64,
        resource_address: impl Into<String>,
        resource_type: impl Into<String>,
        action: ResourceAction,
    ) -> Self {
        Self {
            id,
            resource_address: resource_address.into(),
            resource_type: resource_type.into(),
            resource_name: String::new(),
            module_address: String::new(),
            action,
            apply_status: ApplyStatus::Pending,
            apply_started_at: None,
            apply_completed_at: None,
            resource_id: None,
        }
    }
}

/// Payload of a `resource_status_update` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatusPayload {
    pub resource_address: String,
    /// Database surrogate key of the record (not the cloud id).
    #[serde(default)]
    pub resource_id: Option<u64>,
    pub apply_status: ApplyStatus,
    #[serde(default)]
    pub apply_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub apply_completed_at: Option<DateTime<Utc>>,
}

/// Payload of a `resource_id_update` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIdPayload {
    pub resource_address: String,
    /// Database surrogate key of the record.
    #[serde(default)]
    pub id: Option<u64>,
    /// Cloud provider identifier.
    #[serde(default)]
    pub resource_id: Option<String>,
}

/// Counts from the plan summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    #[serde(default)]
    pub add: u32,
    #[serde(default)]
    pub change: u32,
    #[serde(default)]
    pub destroy: u32,
}

/// Response of the resource-changes endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceChangesResponse {
    #[serde(default)]
    pub summary: ChangeSummary,
    #[serde(default)]
    pub resources: Vec<ResourceChange>,
}
