//! Run tracking core for Runlens: stage catalog, log partitioning, stage
//! tracking and resource reconciliation.

mod backoff;
pub mod catalog;
mod error;
mod event_log;
mod partition;
mod reconciler;
mod stage_machine;
mod timeline;

pub use backoff::{Backoff, ReconnectPolicy};
pub use catalog::{Phase, StageCatalog, StageDef};
pub use error::RunlensError;
pub use event_log::{AppendOutcome, EventLog, SequencedEvent, DEFAULT_MAX_EVENTS};
pub use partition::{join_stages, partition_text, LogPartitioner, StageLog};
pub use reconciler::{MergeOutcome, ResourceReconciler};
pub use stage_machine::{
    CurrentStage, PhaseStatus, StageProgress, StageSource, StageStatus, StageTracker,
};
pub use timeline::{
    EntryKind, Icon, ResourceCounts, Section, SectionKind, TimelineEntry, TimelineView,
};

/// Result type for Runlens core operations.
pub type Result<T> = std::result::Result<T, RunlensError>;
