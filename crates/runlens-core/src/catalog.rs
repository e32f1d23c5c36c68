//! Static catalog of execution stages per task type.

use runlens_types::TaskType;

/// The two coarse phases of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Apply,
}

/// A named stage with its display label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDef {
    pub id: &'static str,
    pub label: &'static str,
}

const fn stage(id: &'static str, label: &'static str) -> StageDef {
    StageDef { id, label }
}

pub const PLAN_STAGES: &[StageDef] = &[
    stage("pending", "Pending"),
    stage("fetching", "Fetching"),
    stage("pre_plan", "Pre-Plan"),
    stage("init", "Init"),
    stage("planning", "Planning"),
    stage("post_plan", "Post-Plan"),
    stage("cost_estimation", "Cost Estimation"),
    stage("policy_check", "Policy Check"),
    stage("saving_plan", "Saving Plan"),
];

pub const APPLY_STAGES: &[StageDef] = &[
    stage("pending", "Pending"),
    stage("fetching", "Fetching"),
    stage("init", "Init"),
    stage("restoring_plan", "Restoring Plan"),
    stage("pre_apply", "Pre-Apply"),
    stage("applying", "Applying"),
    stage("post_apply", "Post-Apply"),
    stage("saving_state", "Saving State"),
];

/// Run-task gate evaluated after the plan.
pub const POST_PLAN_RUN_TASKS: &str = "post_plan_run_tasks";
/// Run-task gate evaluated before the apply.
pub const PRE_APPLY_RUN_TASKS: &str = "pre_apply_run_tasks";

/// Stage names the backend reports in the task `stage` field that are not
/// part of the marker catalog.
const EXTRA_STAGES: &[(StageDef, Phase)] = &[
    (stage(POST_PLAN_RUN_TASKS, "Post-Plan Run Tasks"), Phase::Plan),
    (stage(PRE_APPLY_RUN_TASKS, "Pre-Apply Run Tasks"), Phase::Apply),
    (stage("apply_pending", "Apply Pending"), Phase::Apply),
    (stage("applied", "Applied"), Phase::Apply),
];

/// Stages shared by both phases. Ambiguous without context.
const SHARED_STAGES: &[&str] = &["pending", "fetching", "init"];

/// Ordered stages for a single phase.
pub fn stages(phase: Phase) -> &'static [StageDef] {
    match phase {
        Phase::Plan => PLAN_STAGES,
        Phase::Apply => APPLY_STAGES,
    }
}

/// Human-readable name for a stage. Unknown names pass through unchanged.
pub fn display_name(name: &str) -> String {
    let key = name.trim().to_lowercase();
    PLAN_STAGES
        .iter()
        .chain(APPLY_STAGES)
        .chain(EXTRA_STAGES.iter().map(|(def, _)| def))
        .find(|def| def.id == key)
        .map(|def| def.label.to_string())
        .unwrap_or_else(|| name.to_string())
}

/// Phase a stage name belongs to, resolving shared names to the plan phase.
pub fn phase_of(name: &str) -> Option<Phase> {
    let key = name.trim().to_lowercase();
    if SHARED_STAGES.contains(&key.as_str()) {
        return Some(Phase::Plan);
    }
    if PLAN_STAGES.iter().any(|def| def.id == key) {
        return Some(Phase::Plan);
    }
    if APPLY_STAGES.iter().any(|def| def.id == key) {
        return Some(Phase::Apply);
    }
    EXTRA_STAGES
        .iter()
        .find(|(def, _)| def.id == key)
        .map(|(_, phase)| *phase)
}

/// Whether a failure recorded at this stage belongs to a run-task gate
/// rather than to the plan or apply itself.
pub fn is_run_task_gate(name: &str) -> bool {
    let key = name.trim().to_lowercase();
    key == POST_PLAN_RUN_TASKS || key == PRE_APPLY_RUN_TASKS
}

/// One entry of a task type's ordered stage list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub phase: Phase,
    pub def: StageDef,
}

/// Ordered stage list for a task type. For plan-and-apply runs the apply
/// stages follow the plan stages, so shared names appear twice.
#[derive(Debug, Clone)]
pub struct StageCatalog {
    task_type: TaskType,
    entries: Vec<CatalogEntry>,
}

impl StageCatalog {
    pub fn for_task_type(task_type: TaskType) -> Self {
        let phases: &[Phase] = match task_type {
            TaskType::Plan => &[Phase::Plan],
            TaskType::Apply => &[Phase::Apply],
            TaskType::PlanAndApply => &[Phase::Plan, Phase::Apply],
        };
        let entries = phases
            .iter()
            .flat_map(|phase| {
                stages(*phase)
                    .iter()
                    .map(move |def| CatalogEntry { phase: *phase, def: *def })
            })
            .collect();
        Self { task_type, entries }
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CatalogEntry> {
        self.entries.get(index)
    }

    /// Resolve a stage name to an index, preferring the first occurrence at
    /// or after `from`. Falls back to the first occurrence anywhere, which
    /// callers treat as a regression.
    pub fn position(&self, name: &str, from: Option<usize>) -> Option<usize> {
        let key = name.trim().to_lowercase();
        let start = from.unwrap_or(0);
        self.entries
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, entry)| entry.def.id == key)
            .or_else(|| self.entries.iter().enumerate().find(|(_, entry)| entry.def.id == key))
            .map(|(idx, _)| idx)
    }

    /// Phase of a stage name in the context of this task type.
    pub fn phase_of(&self, name: &str) -> Option<Phase> {
        match self.task_type {
            TaskType::Plan => phase_of(name).map(|_| Phase::Plan),
            TaskType::Apply => phase_of(name).map(|_| Phase::Apply),
            TaskType::PlanAndApply => phase_of(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_and_apply_order() {
        let catalog = StageCatalog::for_task_type(TaskType::PlanAndApply);
        assert_eq!(catalog.len(), PLAN_STAGES.len() + APPLY_STAGES.len());
        assert_eq!(catalog.get(0).unwrap().def.id, "pending");
        assert_eq!(catalog.get(8).unwrap().def.id, "saving_plan");
        assert_eq!(catalog.get(9).unwrap().phase, Phase::Apply);
    }

    #[test]
    fn test_position_prefers_forward_occurrence() {
        let catalog = StageCatalog::for_task_type(TaskType::PlanAndApply);
        assert_eq!(catalog.position("fetching", None), Some(1));
        // After saving_plan the next "fetching" is the apply one.
        assert_eq!(catalog.position("fetching", Some(8)), Some(10));
        // Nothing forward: fall back to the first occurrence.
        assert_eq!(catalog.position("planning", Some(12)), Some(4));
        assert_eq!(catalog.position("FETCHING", None), Some(1));
        assert_eq!(catalog.position("drift_check", None), None);
    }

    #[test]
    fn test_display_name_passthrough() {
        assert_eq!(display_name("cost_estimation"), "Cost Estimation");
        assert_eq!(display_name("PRE_PLAN"), "Pre-Plan");
        assert_eq!(display_name("post_plan_run_tasks"), "Post-Plan Run Tasks");
        assert_eq!(display_name("drift_check"), "drift_check");
    }

    #[test]
    fn test_phase_of() {
        assert_eq!(phase_of("planning"), Some(Phase::Plan));
        assert_eq!(phase_of("init"), Some(Phase::Plan));
        assert_eq!(phase_of("restoring_plan"), Some(Phase::Apply));
        assert_eq!(phase_of("pre_apply_run_tasks"), Some(Phase::Apply));
        assert_eq!(phase_of("post_plan_run_tasks"), Some(Phase::Plan));
        assert_eq!(phase_of("mystery"), None);

        let apply_only = StageCatalog::for_task_type(TaskType::Apply);
        assert_eq!(apply_only.phase_of("init"), Some(Phase::Apply));
    }

    #[test]
    fn test_run_task_gates() {
        assert!(is_run_task_gate("post_plan_run_tasks"));
        assert!(is_run_task_gate("pre_apply_run_tasks"));
        assert!(!is_run_task_gate("post_plan"));
    }
}
