//! Task snapshot types as returned by the task service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of run a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Plan,
    Apply,
    PlanAndApply,
}

impl TaskType {
    /// Whether this task type ever enters the apply phase.
    pub fn includes_apply(self) -> bool {
        matches!(self, TaskType::Apply | TaskType::PlanAndApply)
    }
}

/// Task status in the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, not yet picked up by an executor.
    Pending,
    /// An executor is working on the task.
    Running,
    /// Plan finished, apply not yet requested.
    PlanCompleted,
    /// Plan finished and apply is waiting for confirmation or a runner.
    ApplyPending,
    Success,
    Applied,
    /// Plan finished with no changes; apply will not run.
    PlannedAndFinished,
    Failed,
    Cancelled,
    /// A status introduced by a newer server.
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    /// Terminal statuses stop polling and streaming.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success
                | TaskStatus::Applied
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::PlannedAndFinished
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::PlanCompleted => "plan_completed",
            TaskStatus::ApplyPending => "apply_pending",
            TaskStatus::Success => "success",
            TaskStatus::Applied => "applied",
            TaskStatus::PlannedAndFinished => "planned_and_finished",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the task executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Local,
    Agent,
    K8s,
    #[serde(other)]
    Unknown,
}

/// Read-only copy of a task as last fetched from the task service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: u64,
    #[serde(default)]
    pub workspace_id: Option<String>,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Backend-reported substage. Free text, best effort.
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub apply_confirmed_by: Option<String>,
    #[serde(default)]
    pub apply_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_mode: Option<ExecutionMode>,
    /// Semantic id of the remote agent running the task, e.g. `agent-7f3a`.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub changes_add: Option<u32>,
    #[serde(default)]
    pub changes_change: Option<u32>,
    #[serde(default)]
    pub changes_destroy: Option<u32>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    /// Minimal snapshot, mostly useful for tests and placeholders.
    pub fn new(id: u64, task_type: TaskType, status: TaskStatus) -> Self {
        Self {
            id,
            workspace_id: None,
            task_type,
            status,
            stage: None,
            apply_confirmed_by: None,
            apply_confirmed_at: None,
            execution_mode: None,
            agent_id: None,
            error_message: None,
            changes_add: None,
            changes_change: None,
            changes_destroy: None,
            created_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Apply has been authorized by a user.
    pub fn is_apply_confirmed(&self) -> bool {
        self.apply_confirmed_by.is_some() || self.apply_confirmed_at.is_some()
    }

    /// Cancelled by status, or failed with a cancellation message (agent mode
    /// reports cancellations as failures).
    pub fn is_cancelled(&self) -> bool {
        if self.status == TaskStatus::Cancelled {
            return true;
        }
        self.error_message
            .as_deref()
            .is_some_and(|msg| msg.to_lowercase().contains("cancelled"))
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Executed by a remote agent rather than locally on the server. Older
    /// servers omit `execution_mode`; an assigned agent implies it then.
    pub fn is_agent_mode(&self) -> bool {
        match self.execution_mode {
            Some(mode) => mode == ExecutionMode::Agent,
            None => self.agent_id.is_some(),
        }
    }

    /// The plan reported at least one resource change. The server fills
    /// zero counts before planning, so presence alone means nothing.
    pub fn has_planned_changes(&self) -> bool {
        [self.changes_add, self.changes_change, self.changes_destroy]
            .into_iter()
            .flatten()
            .any(|count| count > 0)
    }

    /// Normalized stage name, lowercase and trimmed.
    pub fn stage_name(&self) -> Option<String> {
        self.stage
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    }
}

/// The task endpoint returns either `{"task": {...}}` or the bare task.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TaskEnvelope {
    Wrapped { task: TaskSnapshot },
    Bare(TaskSnapshot),
}

impl TaskEnvelope {
    pub fn into_task(self) -> TaskSnapshot {
        match self {
            TaskEnvelope::Wrapped { task } => task,
            TaskEnvelope::Bare(task) => task,
        }
    }
}
