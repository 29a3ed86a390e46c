//! Reconciliation error types.

use std::time::Duration;

use thiserror::Error;

use crate::clients::{ClientError, ResourceType};
use crate::record::LifecyclePhase;
use crate::store::StoreError;

/// Errors surfaced by a reconciliation pass.
///
/// Nothing in this crate retries automatically: every variant is handed
/// back to the caller, which decides whether to re-run the whole lifecycle
/// operation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Network or authentication failure talking to the control plane.
    #[error("control plane request failed (server {}): {source}", display_id(.server_id))]
    Transport {
        server_id: Option<String>,
        source: ClientError,
    },

    /// Resource does not exist on the remote side.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// The control plane accepted an operation and then reported it failed.
    #[error("{action} failed for {resource_type} '{resource_id}': {reason}")]
    RemoteOperationFailed {
        resource_type: ResourceType,
        resource_id: String,
        action: String,
        reason: String,
    },

    /// Convergence was not observed within the configured ceiling.
    #[error("timed out after {elapsed:?} waiting for {action} on {resource_type} '{resource_id}'")]
    OperationTimeout {
        resource_type: ResourceType,
        resource_id: String,
        action: String,
        elapsed: Duration,
    },

    #[error(
        "cannot shrink disk '{disk_id}' (SCSI unit {scsi_unit_id}) of server '{server_id}' from {current_gb}GB to {desired_gb}GB; disks can only be expanded"
    )]
    DiskShrinkNotSupported {
        server_id: String,
        scsi_unit_id: u32,
        disk_id: String,
        current_gb: u32,
        desired_gb: u32,
    },

    #[error("no disk was found with SCSI unit {scsi_unit_id} on server '{server_id}'")]
    UnknownDisk { server_id: String, scsi_unit_id: u32 },

    #[error(
        "changing '{field}' of server '{server_id}' is not supported ('{current}' -> '{desired}')"
    )]
    ImmutableField {
        server_id: String,
        field: &'static str,
        current: String,
        desired: String,
    },

    #[error("{feature} is not supported (server {})", display_id(.server_id))]
    UnsupportedFeature {
        server_id: Option<String>,
        feature: String,
    },

    #[error(
        "no OS image named '{name}' in data centre '{datacenter_id}' (where network domain '{network_domain_id}' is located)"
    )]
    ImageNotFound {
        name: String,
        datacenter_id: String,
        network_domain_id: String,
    },

    /// Desired state rejected at the boundary.
    #[error("invalid server configuration: {field}: {reason}")]
    InvalidSpec { field: String, reason: String },

    #[error("failed to apply tags {names:?} to server '{server_id}' (response code '{code}'): {message}")]
    TagApply {
        server_id: String,
        names: Vec<String>,
        code: String,
        message: String,
    },

    #[error("failed to remove tags {names:?} from server '{server_id}' (response code '{code}'): {message}")]
    TagRemove {
        server_id: String,
        names: Vec<String>,
        code: String,
        message: String,
    },

    #[error("unexpected result '{result}' resizing disk '{disk_id}' of server '{server_id}': {message}")]
    DiskResizeRejected {
        server_id: String,
        disk_id: String,
        result: String,
        message: String,
    },

    #[error("server {} cannot move from {from} to {to}", display_id(.server_id))]
    InvalidTransition {
        server_id: Option<String>,
        from: LifecyclePhase,
        to: LifecyclePhase,
    },

    /// The caller's durable record could not be written.
    #[error("failed to persist checkpoint for server {}: {source}", display_id(.server_id))]
    Checkpoint {
        server_id: Option<String>,
        source: StoreError,
    },
}

impl ReconcileError {
    /// Caller-correctable errors; re-running without changing the
    /// configuration will fail the same way.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ReconcileError::DiskShrinkNotSupported { .. }
                | ReconcileError::UnknownDisk { .. }
                | ReconcileError::ImmutableField { .. }
                | ReconcileError::UnsupportedFeature { .. }
                | ReconcileError::ImageNotFound { .. }
                | ReconcileError::InvalidSpec { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::NotFound { .. })
    }
}

fn display_id(id: &Option<String>) -> &str {
    id.as_deref().unwrap_or("<unassigned>")
}

/// Result type for reconciliation.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Attach the server id to a raw client failure.
pub(crate) trait ClientResultExt<T> {
    fn for_server(self, server_id: &str) -> Result<T>;
    fn unassigned(self) -> Result<T>;
}

impl<T> ClientResultExt<T> for std::result::Result<T, ClientError> {
    fn for_server(self, server_id: &str) -> Result<T> {
        self.map_err(|source| ReconcileError::Transport {
            server_id: Some(server_id.to_string()),
            source,
        })
    }

    fn unassigned(self) -> Result<T> {
        self.map_err(|source| ReconcileError::Transport {
            server_id: None,
            source,
        })
    }
}
