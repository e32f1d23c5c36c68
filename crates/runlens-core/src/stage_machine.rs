//! Stage tracking for a single run.
//!
//! Combines two sources of truth:
//! - Polled task snapshots, which own the coarse lifecycle (status, phase
//!   boundary, terminal outcome)
//! - Live stage markers from the output stream, which are fresher while a
//!   stage is actively running
//!
//! The derived stage index only moves forward while markers arrive. A running
//! snapshot's stage raises the floor too, so replayed history cannot pull the
//! view back. It may drop back only when a snapshot reports the run as failed
//! or cancelled.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use runlens_types::{MarkerStatus, StageMarker, TaskSnapshot, TaskStatus, TaskType};
use serde::Serialize;
use tracing::debug;

use crate::catalog::{self, Phase, StageCatalog};

/// Status of a coarse phase (planning or applying).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Error,
    Skipped,
}

/// Status of one stage in a progress list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Active,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageProgress {
    pub id: &'static str,
    pub label: &'static str,
    pub status: StageStatus,
}

/// Where the current stage came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageSource {
    Live,
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentStage {
    pub name: String,
    pub display_name: String,
    /// Index into the task type's catalog, if the name is known.
    pub index: Option<usize>,
    pub source: StageSource,
    /// False once the stage has ended or the run is no longer running.
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct LiveStage {
    name: String,
    index: Option<usize>,
    active: bool,
    started_at: Option<DateTime<Utc>>,
}

/// Reconciles snapshots and markers into one current-stage view.
#[derive(Debug)]
pub struct StageTracker {
    catalog: StageCatalog,
    snapshot: Option<TaskSnapshot>,
    markers: Vec<StageMarker>,
    live: Option<LiveStage>,
    /// Highest catalog index reached by a begin marker.
    high_index: Option<usize>,
    /// Highest catalog index reported by a running snapshot.
    snapshot_floor: Option<usize>,
    /// Catalog indices whose END marker has been seen.
    completed: BTreeSet<usize>,
    /// Furthest phase observed from either source.
    furthest_phase: Option<Phase>,
    disagreement_since: Option<Instant>,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    /// A tracker with no snapshot yet. Markers are resolved against the
    /// plan-and-apply catalog until the task type is known.
    pub fn new() -> Self {
        Self {
            catalog: StageCatalog::for_task_type(TaskType::PlanAndApply),
            snapshot: None,
            markers: Vec::new(),
            live: None,
            high_index: None,
            snapshot_floor: None,
            completed: BTreeSet::new(),
            furthest_phase: None,
            disagreement_since: None,
        }
    }

    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    pub fn snapshot(&self) -> Option<&TaskSnapshot> {
        self.snapshot.as_ref()
    }

    /// Markers in arrival order.
    pub fn markers(&self) -> &[StageMarker] {
        &self.markers
    }

    /// Record a new polled snapshot.
    pub fn apply_snapshot(&mut self, snapshot: TaskSnapshot) {
        let type_changed = snapshot.task_type != self.catalog.task_type();
        if type_changed {
            self.catalog = StageCatalog::for_task_type(snapshot.task_type);
        }

        if let Some(prev) = &self.snapshot {
            if prev.status != snapshot.status {
                debug!(
                    target: "runlens::stage",
                    task_id = snapshot.id,
                    from = %prev.status,
                    to = %snapshot.status,
                    "Task status changed"
                );
            }
        }

        self.snapshot = Some(snapshot);
        if type_changed {
            self.replay_markers();
        } else {
            self.observe_snapshot_phase();
        }
    }

    /// Record a live stage marker.
    pub fn apply_marker(&mut self, marker: StageMarker) {
        self.absorb(&marker);
        self.markers.push(marker);
    }

    fn replay_markers(&mut self) {
        self.live = None;
        self.high_index = None;
        self.snapshot_floor = None;
        self.completed.clear();
        self.furthest_phase = None;
        self.observe_snapshot_phase();
        let markers = std::mem::take(&mut self.markers);
        for marker in &markers {
            self.absorb(marker);
        }
        self.markers = markers;
    }

    fn observe_snapshot_phase(&mut self) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        let mut phase = snapshot
            .stage_name()
            .and_then(|stage| self.catalog.phase_of(&stage));
        if snapshot.is_apply_confirmed() && self.catalog.task_type().includes_apply() {
            phase = Some(Phase::Apply);
        }
        let running = snapshot.status == TaskStatus::Running;
        if let Some(phase) = phase {
            self.raise_phase(phase);
        }
        if running {
            if let Some(index) = self.snapshot_index() {
                if self.snapshot_floor.is_none_or(|floor| index > floor) {
                    self.snapshot_floor = Some(index);
                }
            }
        }
    }

    /// Catalog index of the snapshot's stage, searched from the start of the
    /// furthest phase seen.
    fn snapshot_index(&self) -> Option<usize> {
        let name = self.snapshot.as_ref()?.stage_name()?;
        let from = self.furthest_phase.and_then(|phase| self.phase_start(phase));
        self.catalog.position(&name, from)
    }

    /// Lowest index a begin marker may resolve to.
    fn floor(&self) -> Option<usize> {
        self.high_index.max(self.snapshot_floor)
    }

    fn raise_phase(&mut self, phase: Phase) {
        if self.furthest_phase.is_none_or(|current| phase > current) {
            self.furthest_phase = Some(phase);
        }
    }

    fn absorb(&mut self, marker: &StageMarker) {
        let name = marker.stage_name();
        match marker.status {
            MarkerStatus::Begin => match self.catalog.position(&name, self.floor()) {
                Some(index) if self.floor().is_none_or(|floor| index >= floor) => {
                    self.high_index = Some(index);
                    if let Some(entry) = self.catalog.get(index) {
                        let phase = entry.phase;
                        self.raise_phase(phase);
                    }
                    self.live = Some(LiveStage {
                        name,
                        index: Some(index),
                        active: true,
                        started_at: marker.timestamp,
                    });
                }
                Some(index) => {
                    debug!(
                        target: "runlens::stage",
                        stage = %name,
                        index,
                        floor = ?self.floor(),
                        "Ignoring stage marker behind current stage"
                    );
                }
                None => {
                    // Unknown stage: show it, keep the index where it is.
                    self.live = Some(LiveStage {
                        name,
                        index: self.high_index,
                        active: true,
                        started_at: marker.timestamp,
                    });
                }
            },
            MarkerStatus::End => {
                let index = match &self.live {
                    Some(live) if live.name == name => live.index,
                    _ => self.catalog.position(&name, None).filter(|idx| {
                        self.high_index.is_none_or(|high| *idx <= high)
                    }),
                };
                if let Some(live) = self.live.as_mut() {
                    if live.name == name {
                        live.active = false;
                    }
                }
                if let Some(index) = index {
                    self.completed.insert(index);
                }
            }
        }
    }

    fn is_running(&self) -> bool {
        self.snapshot
            .as_ref()
            .is_none_or(|s| s.status == TaskStatus::Running)
    }

    fn is_failed(snapshot: &TaskSnapshot) -> bool {
        matches!(snapshot.status, TaskStatus::Failed | TaskStatus::Cancelled)
            || snapshot.is_cancelled()
    }

    /// First catalog index of a phase.
    fn phase_start(&self, phase: Phase) -> Option<usize> {
        self.catalog.entries().iter().position(|e| e.phase == phase)
    }

    /// Live marker while the run is running, otherwise the snapshot stage,
    /// otherwise the last marker seen. A live stage behind the running
    /// snapshot's stage never replaces it.
    pub fn current_stage(&self) -> Option<CurrentStage> {
        let running = self.is_running();
        if running {
            if let Some(live) = &self.live {
                let behind = self
                    .snapshot_floor
                    .is_some_and(|floor| live.index.is_none_or(|index| index < floor));
                if !behind {
                    return Some(self.live_view(live, live.active));
                }
            }
        }

        if let Some(snapshot) = &self.snapshot {
            if let Some(name) = snapshot.stage_name() {
                let index = self.snapshot_index();
                return Some(CurrentStage {
                    display_name: catalog::display_name(&name),
                    name,
                    index,
                    source: StageSource::Snapshot,
                    active: snapshot.status == TaskStatus::Running,
                    started_at: None,
                });
            }
        }

        self.live.as_ref().map(|live| self.live_view(live, false))
    }

    fn live_view(&self, live: &LiveStage, active: bool) -> CurrentStage {
        CurrentStage {
            name: live.name.clone(),
            display_name: catalog::display_name(&live.name),
            index: live.index,
            source: StageSource::Live,
            active,
            started_at: live.started_at,
        }
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_stage().and_then(|stage| stage.index)
    }

    /// Phase the run has reached. Apply confirmation or any apply-phase
    /// stage means the plan is behind us.
    pub fn current_phase(&self) -> Phase {
        self.furthest_phase.unwrap_or(Phase::Plan)
    }

    fn in_apply(&self, snapshot: &TaskSnapshot) -> bool {
        snapshot.is_apply_confirmed() || self.current_phase() == Phase::Apply
    }

    /// With no usable stage from either source, change counts from a
    /// finished plan mean planning is over.
    fn plan_done_by_counts(&self, snapshot: &TaskSnapshot) -> bool {
        let stage_known = snapshot
            .stage_name()
            .is_some_and(|stage| self.catalog.phase_of(&stage).is_some());
        !stage_known && self.live.is_none() && snapshot.has_planned_changes()
    }

    fn failed_at_gate(snapshot: &TaskSnapshot) -> bool {
        snapshot
            .stage_name()
            .is_some_and(|stage| catalog::is_run_task_gate(&stage))
    }

    pub fn planning_status(&self) -> PhaseStatus {
        let Some(snapshot) = &self.snapshot else {
            return if self.live.is_some() {
                PhaseStatus::Running
            } else {
                PhaseStatus::Pending
            };
        };

        if Self::is_failed(snapshot) {
            // A failure during a gate or during the apply leaves the plan intact.
            if Self::failed_at_gate(snapshot) || self.in_apply(snapshot) {
                return PhaseStatus::Completed;
            }
            return PhaseStatus::Error;
        }

        match snapshot.status {
            TaskStatus::Pending => PhaseStatus::Pending,
            TaskStatus::Success
            | TaskStatus::PlanCompleted
            | TaskStatus::ApplyPending
            | TaskStatus::Applied
            | TaskStatus::PlannedAndFinished => PhaseStatus::Completed,
            TaskStatus::Running => {
                if self.in_apply(snapshot) || self.plan_done_by_counts(snapshot) {
                    PhaseStatus::Completed
                } else {
                    PhaseStatus::Running
                }
            }
            TaskStatus::Unknown => {
                if snapshot.is_apply_confirmed() {
                    PhaseStatus::Completed
                } else {
                    PhaseStatus::Pending
                }
            }
            TaskStatus::Failed | TaskStatus::Cancelled => PhaseStatus::Error,
        }
    }

    /// `None` when the applying section should not be shown.
    pub fn applying_status(&self) -> Option<PhaseStatus> {
        let snapshot = self.snapshot.as_ref()?;
        if !snapshot.task_type.includes_apply() {
            return None;
        }
        let in_apply = self.in_apply(snapshot);

        if Self::is_failed(snapshot) {
            if Self::failed_at_gate(snapshot) || !in_apply {
                return None;
            }
            return Some(PhaseStatus::Error);
        }

        match snapshot.status {
            TaskStatus::PlannedAndFinished => Some(PhaseStatus::Skipped),
            TaskStatus::Applied => Some(PhaseStatus::Completed),
            TaskStatus::Success => {
                (in_apply || snapshot.task_type == TaskType::Apply).then_some(PhaseStatus::Completed)
            }
            TaskStatus::Running => in_apply.then_some(PhaseStatus::Running),
            TaskStatus::ApplyPending => Some(PhaseStatus::Pending),
            TaskStatus::PlanCompleted | TaskStatus::Pending | TaskStatus::Unknown => None,
            TaskStatus::Failed | TaskStatus::Cancelled => None,
        }
    }

    /// Whether the task failed or was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.snapshot.as_ref().is_some_and(TaskSnapshot::is_cancelled)
    }

    /// Per-stage progress for one phase. Empty when the task type has no
    /// such phase.
    pub fn stage_progress(&self, phase: Phase) -> Vec<StageProgress> {
        let phase_status = match phase {
            Phase::Plan => Some(self.planning_status()),
            Phase::Apply => self.applying_status(),
        };
        let current = self.current_index();
        let failed = self.snapshot.as_ref().is_some_and(Self::is_failed);

        self.catalog
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.phase == phase)
            .map(|(index, entry)| {
                let status = match phase_status {
                    Some(PhaseStatus::Completed) => StageStatus::Completed,
                    Some(PhaseStatus::Error) if failed => match current {
                        Some(cur) if index < cur => StageStatus::Completed,
                        Some(cur) if index == cur => StageStatus::Error,
                        _ => StageStatus::Pending,
                    },
                    Some(PhaseStatus::Running) => match current {
                        _ if self.completed.contains(&index) => StageStatus::Completed,
                        Some(cur) if index < cur => StageStatus::Completed,
                        Some(cur) if index == cur => StageStatus::Active,
                        _ => StageStatus::Pending,
                    },
                    _ => StageStatus::Pending,
                };
                StageProgress {
                    id: entry.def.id,
                    label: entry.def.label,
                    status,
                }
            })
            .collect()
    }

    /// True while the snapshot stage and the live stage have disagreed for
    /// at least `threshold`. Call periodically.
    pub fn check_stall(&mut self, now: Instant, threshold: Duration) -> bool {
        let disagrees = match (&self.snapshot, &self.live) {
            (Some(snapshot), Some(live)) if snapshot.status == TaskStatus::Running => snapshot
                .stage_name()
                .is_some_and(|stage| stage != live.name),
            _ => false,
        };

        if !disagrees {
            self.disagreement_since = None;
            return false;
        }
        let since = *self.disagreement_since.get_or_insert(now);
        now.saturating_duration_since(since) >= threshold
    }
}
