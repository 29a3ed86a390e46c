//! Reconcilers for the parts of a server.
//!
//! Each reconciler compares desired state with what the control plane
//! reports, issues the mutations needed to converge, and waits for them.
//! Converged sub-steps are committed through [`Progress`] before the next
//! one starts.

pub mod compute;
pub mod disk;
pub mod lifecycle;
pub mod snapshot;
pub mod tag;
pub mod waiter;

use tracing::debug;

use crate::error::{ReconcileError, Result};
use crate::record::{Checkpoint, ServerRecord};
use crate::store::StateStore;

pub use lifecycle::{ServerLifecycle, UpdatePlan};
pub use waiter::{OperationHandle, OperationWaiter};

/// The persisted record of one reconciliation run, advanced one checkpoint
/// at a time.
pub struct Progress<'a> {
    record: ServerRecord,
    store: &'a dyn StateStore,
}

impl<'a> Progress<'a> {
    pub fn new(record: ServerRecord, store: &'a dyn StateStore) -> Self {
        Self { record, store }
    }

    pub fn record(&self) -> &ServerRecord {
        &self.record
    }

    /// Apply the checkpoint and persist the result. The in-memory record
    /// only advances once the store has accepted it.
    pub async fn commit(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let label = checkpoint.label();
        let next = self.record.clone().apply(checkpoint)?;
        self.store
            .save(&next)
            .await
            .map_err(|source| ReconcileError::Checkpoint {
                server_id: next.id.clone(),
                source,
            })?;
        debug!(
            server_id = next.id.as_deref().unwrap_or("-"),
            checkpoint = label,
            "Committed checkpoint"
        );
        self.record = next;
        Ok(())
    }

    pub fn into_record(self) -> ServerRecord {
        self.record
    }
}
