//! Read-only view combining stage tracking and resource reconciliation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use runlens_types::{ApplyStatus, MarkerStatus, ResourceChange, TaskStatus};
use serde::Serialize;

use crate::catalog::{self, Phase};
use crate::reconciler::ResourceReconciler;
use crate::stage_machine::{CurrentStage, PhaseStatus, StageProgress, StageTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Planning,
    Applying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Icon {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Icon {
    pub fn glyph(self) -> &'static str {
        match self {
            Icon::Pending => "○",
            Icon::Running => "◐",
            Icon::Completed => "✓",
            Icon::Failed => "✗",
            Icon::Cancelled => "⊘",
        }
    }
}

/// One visible card of the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    pub kind: SectionKind,
    pub status: PhaseStatus,
    pub label: &'static str,
    pub icon: Icon,
    pub stages: Vec<StageProgress>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceCounts {
    pub pending: usize,
    pub applying: usize,
    pub completed: usize,
    pub failed: usize,
}

impl ResourceCounts {
    fn tally(resources: &[Arc<ResourceChange>]) -> Self {
        resources.iter().fold(Self::default(), |mut acc, r| {
            match r.apply_status {
                ApplyStatus::Pending => acc.pending += 1,
                ApplyStatus::Applying => acc.applying += 1,
                ApplyStatus::Completed => acc.completed += 1,
                ApplyStatus::Failed => acc.failed += 1,
            }
            acc
        })
    }

    pub fn total(&self) -> usize {
        self.pending + self.applying + self.completed + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryKind {
    TaskCreated,
    TaskStarted,
    TaskFinished { status: TaskStatus },
    StageBegan { stage: String, display_name: String },
    StageEnded { stage: String, display_name: String },
    ResourceStarted { address: String },
    ResourceFinished { address: String, status: ApplyStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EntryKind,
}

/// Everything a renderer needs for one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineView {
    pub task_id: Option<u64>,
    pub status: Option<TaskStatus>,
    pub current_stage: Option<CurrentStage>,
    pub planning: Section,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applying: Option<Section>,
    pub resource_counts: ResourceCounts,
    #[serde(skip)]
    pub resources: Vec<Arc<ResourceChange>>,
    /// Timestamped events in time order.
    pub entries: Vec<TimelineEntry>,
    pub stalled: bool,
}

impl TimelineView {
    /// Build the view from the current reducer state.
    pub fn build(tracker: &StageTracker, reconciler: &ResourceReconciler, stalled: bool) -> Self {
        let cancelled = tracker.is_cancelled();
        let current_stage = tracker.current_stage();

        let planning_status = tracker.planning_status();
        let planning = Section {
            kind: SectionKind::Planning,
            status: planning_status,
            label: planning_label(planning_status, cancelled),
            icon: icon_for(planning_status, cancelled),
            stages: tracker.stage_progress(Phase::Plan),
        };

        let applying = tracker.applying_status().map(|status| {
            let post_apply = current_stage
                .as_ref()
                .is_some_and(|stage| matches!(stage.name.as_str(), "post_apply" | "saving_state"));
            Section {
                kind: SectionKind::Applying,
                status,
                label: applying_label(status, cancelled, post_apply),
                icon: icon_for(status, cancelled),
                stages: tracker.stage_progress(Phase::Apply),
            }
        });

        let resources = reconciler.resources().to_vec();
        Self {
            task_id: tracker.snapshot().map(|s| s.id),
            status: tracker.snapshot().map(|s| s.status),
            current_stage,
            planning,
            applying,
            resource_counts: ResourceCounts::tally(&resources),
            entries: collect_entries(tracker, &resources),
            resources,
            stalled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(TaskStatus::is_terminal)
    }
}

fn planning_label(status: PhaseStatus, cancelled: bool) -> &'static str {
    match status {
        PhaseStatus::Pending => "Plan pending",
        PhaseStatus::Running => "Planning...",
        PhaseStatus::Completed => "Planned",
        PhaseStatus::Error if cancelled => "Plan cancelled",
        PhaseStatus::Error => "Plan failed",
        PhaseStatus::Skipped => "Plan skipped",
    }
}

fn applying_label(status: PhaseStatus, cancelled: bool, post_apply: bool) -> &'static str {
    match status {
        PhaseStatus::Pending => "Apply pending",
        PhaseStatus::Running if post_apply => "Post apply...",
        PhaseStatus::Running => "Applying...",
        PhaseStatus::Completed => "Applied",
        PhaseStatus::Error if cancelled => "Apply cancelled",
        PhaseStatus::Error => "Apply failed",
        PhaseStatus::Skipped => "Apply skipped",
    }
}

fn icon_for(status: PhaseStatus, cancelled: bool) -> Icon {
    match status {
        PhaseStatus::Pending => Icon::Pending,
        PhaseStatus::Running => Icon::Running,
        PhaseStatus::Completed => Icon::Completed,
        PhaseStatus::Error if cancelled => Icon::Cancelled,
        PhaseStatus::Error => Icon::Failed,
        PhaseStatus::Skipped => Icon::Cancelled,
    }
}

fn collect_entries(tracker: &StageTracker, resources: &[Arc<ResourceChange>]) -> Vec<TimelineEntry> {
    let mut entries = Vec::new();

    if let Some(snapshot) = tracker.snapshot() {
        if let Some(at) = snapshot.created_at {
            entries.push(TimelineEntry { at, kind: EntryKind::TaskCreated });
        }
        if let Some(at) = snapshot.started_at {
            entries.push(TimelineEntry { at, kind: EntryKind::TaskStarted });
        }
        if let Some(at) = snapshot.completed_at.filter(|_| snapshot.is_terminal()) {
            entries.push(TimelineEntry {
                at,
                kind: EntryKind::TaskFinished { status: snapshot.status },
            });
        }
    }

    for marker in tracker.markers() {
        let Some(at) = marker.timestamp else {
            continue;
        };
        let stage = marker.stage_name();
        let display_name = catalog::display_name(&stage);
        let kind = match marker.status {
            MarkerStatus::Begin => EntryKind::StageBegan { stage, display_name },
            MarkerStatus::End => EntryKind::StageEnded { stage, display_name },
        };
        entries.push(TimelineEntry { at, kind });
    }

    for resource in resources {
        if let Some(at) = resource.apply_started_at {
            entries.push(TimelineEntry {
                at,
                kind: EntryKind::ResourceStarted {
                    address: resource.resource_address.clone(),
                },
            });
        }
        if let Some(at) = resource.apply_completed_at {
            entries.push(TimelineEntry {
                at,
                kind: EntryKind::ResourceFinished {
                    address: resource.resource_address.clone(),
                    status: resource.apply_status,
                },
            });
        }
    }

    // Stable: equal timestamps keep insertion order.
    entries.sort_by_key(|entry| entry.at);
    entries
}
