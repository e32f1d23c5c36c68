//! Merges live per-resource updates into the fetched resource-change list.

use std::sync::Arc;

use runlens_types::{ResourceChange, ResourceIdPayload, ResourceStatusPayload, StreamMessage};
use tracing::{debug, trace};

use crate::{Result, RunlensError};

/// Outcome of applying one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Entry at this index was replaced with a merged copy.
    Updated(usize),
    /// Matched an entry but nothing changed.
    Unchanged(usize),
    /// No entry matched; the update was dropped.
    Missed,
}

/// Resource-change list with live merges.
///
/// Entries are shared via `Arc`. A merge that changes an entry swaps in a new
/// `Arc`; untouched entries keep their identity so consumers can skip them.
#[derive(Debug, Clone, Default)]
pub struct ResourceReconciler {
    resources: Vec<Arc<ResourceChange>>,
    /// Match by database id when the address misses. Only valid when the
    /// run executes locally; agent-mode ids are not comparable.
    id_fallback: bool,
}

impl ResourceReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_id_fallback(&mut self, enabled: bool) {
        self.id_fallback = enabled;
    }

    pub fn id_fallback(&self) -> bool {
        self.id_fallback
    }

    /// Replace the list with a freshly fetched one.
    pub fn replace_all(&mut self, resources: Vec<ResourceChange>) {
        self.resources = resources.into_iter().map(Arc::new).collect();
    }

    pub fn resources(&self) -> &[Arc<ResourceChange>] {
        &self.resources
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn find(&self, address: &str, db_id: Option<u64>) -> Option<usize> {
        self.resources
            .iter()
            .position(|r| r.resource_address == address)
            .or_else(|| {
                let id = db_id.filter(|_| self.id_fallback)?;
                self.resources.iter().position(|r| r.id == id)
            })
    }

    fn merge(&mut self, index: usize, update: impl FnOnce(&mut ResourceChange)) -> MergeOutcome {
        let mut merged = ResourceChange::clone(&self.resources[index]);
        update(&mut merged);
        if merged == *self.resources[index] {
            return MergeOutcome::Unchanged(index);
        }
        self.resources[index] = Arc::new(merged);
        MergeOutcome::Updated(index)
    }

    /// Apply a per-resource apply-status update.
    pub fn apply_status(&mut self, payload: &ResourceStatusPayload) -> MergeOutcome {
        let Some(index) = self.find(&payload.resource_address, payload.resource_id) else {
            debug!(
                target: "runlens::reconcile",
                address = %payload.resource_address,
                "Status update matched no resource"
            );
            return MergeOutcome::Missed;
        };
        self.merge(index, |r| {
            r.apply_status = payload.apply_status;
            if payload.apply_started_at.is_some() {
                r.apply_started_at = payload.apply_started_at;
            }
            if payload.apply_completed_at.is_some() {
                r.apply_completed_at = payload.apply_completed_at;
            }
        })
    }

    /// Apply a cloud resource-id update.
    pub fn apply_id(&mut self, payload: &ResourceIdPayload) -> MergeOutcome {
        let Some(index) = self.find(&payload.resource_address, payload.id) else {
            debug!(
                target: "runlens::reconcile",
                address = %payload.resource_address,
                "Id update matched no resource"
            );
            return MergeOutcome::Missed;
        };
        self.merge(index, |r| {
            if payload.resource_id.is_some() {
                r.resource_id = payload.resource_id.clone();
            }
        })
    }

    /// Decode and apply a stream message. Non-resource messages are ignored.
    pub fn apply_message(&mut self, message: &StreamMessage) -> Result<Option<MergeOutcome>> {
        let outcome = match message {
            StreamMessage::ResourceStatusUpdate(payload) => {
                let update = payload
                    .status_update()
                    .map_err(|source| RunlensError::PayloadError {
                        kind: "resource_status_update",
                        source,
                    })?;
                self.apply_status(&update)
            }
            StreamMessage::ResourceIdUpdate(payload) => {
                let update = payload.id_update().map_err(|source| RunlensError::PayloadError {
                    kind: "resource_id_update",
                    source,
                })?;
                self.apply_id(&update)
            }
            _ => return Ok(None),
        };
        trace!(target: "runlens::reconcile", ?outcome, "Applied resource update");
        Ok(Some(outcome))
    }
}
