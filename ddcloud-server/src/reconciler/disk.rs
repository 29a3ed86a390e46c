//! Disk reconciler - grows and adds disks, keyed by SCSI unit id.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use super::waiter::{OperationHandle, OperationWaiter};
use super::Progress;
use crate::clients::{ComputeClient, Server};
use crate::error::{ClientResultExt, ReconcileError, Result};
use crate::model::{disks_by_unit, Disk};
use crate::record::Checkpoint;

/// Image disks come with the image and can only be grown; additional disks
/// are created on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskGroup {
    Image,
    Additional,
}

impl DiskGroup {
    fn checkpoint(self, disks: Vec<Disk>) -> Checkpoint {
        match self {
            DiskGroup::Image => Checkpoint::ImageDisks(disks),
            DiskGroup::Additional => Checkpoint::AdditionalDisks(disks),
        }
    }

    fn recorded(self, progress: &Progress<'_>) -> Vec<Disk> {
        let spec = &progress.record().spec;
        match self {
            DiskGroup::Image => spec.image_disks.clone(),
            DiskGroup::Additional => spec.additional_disks.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DiskAction {
    Add {
        scsi_unit_id: u32,
        size_gb: u32,
        speed: String,
    },
    Resize {
        scsi_unit_id: u32,
        disk_id: String,
        from_gb: u32,
        to_gb: u32,
    },
}

/// Compute the actions that move `observed` toward `desired`.
///
/// Every pair is checked before anything is returned, so a shrink request
/// anywhere in the group means no action at all is issued.
pub fn plan_disks(
    server_id: &str,
    group: DiskGroup,
    desired: &[Disk],
    observed: &BTreeMap<u32, Disk>,
) -> Result<Vec<DiskAction>> {
    let mut actions = Vec::new();

    for disk in desired {
        let Some(current) = observed.get(&disk.scsi_unit_id) else {
            match group {
                DiskGroup::Image => {
                    return Err(ReconcileError::UnknownDisk {
                        server_id: server_id.to_string(),
                        scsi_unit_id: disk.scsi_unit_id,
                    })
                }
                DiskGroup::Additional => {
                    actions.push(DiskAction::Add {
                        scsi_unit_id: disk.scsi_unit_id,
                        size_gb: disk.size_gb,
                        speed: disk.speed.clone(),
                    });
                    continue;
                }
            }
        };

        let disk_id = current.id.clone().ok_or_else(|| ReconcileError::UnknownDisk {
            server_id: server_id.to_string(),
            scsi_unit_id: disk.scsi_unit_id,
        })?;

        // Speed is fixed once a disk exists.
        if disk.speed != current.speed {
            warn!(
                server_id = %server_id,
                disk_id = %disk_id,
                "Ignoring speed change from {} to {}",
                current.speed,
                disk.speed
            );
        }

        if disk.size_gb < current.size_gb {
            return Err(ReconcileError::DiskShrinkNotSupported {
                server_id: server_id.to_string(),
                scsi_unit_id: disk.scsi_unit_id,
                disk_id,
                current_gb: current.size_gb,
                desired_gb: disk.size_gb,
            });
        }

        if disk.size_gb > current.size_gb {
            actions.push(DiskAction::Resize {
                scsi_unit_id: disk.scsi_unit_id,
                disk_id,
                from_gb: current.size_gb,
                to_gb: disk.size_gb,
            });
        }
    }

    Ok(actions)
}

/// The declared disks of a group as the control plane reports them.
/// Declared disks that do not exist yet are left out.
fn converged_view(desired: &[Disk], observed: &[Disk]) -> Vec<Disk> {
    let observed = disks_by_unit(observed);
    desired
        .iter()
        .filter_map(|d| observed.get(&d.scsi_unit_id).cloned())
        .collect()
}

/// Applies disk plans one operation at a time.
pub struct DiskReconciler {
    client: Arc<dyn ComputeClient>,
    waiter: OperationWaiter,
    timeout: Duration,
}

impl DiskReconciler {
    pub fn new(client: Arc<dyn ComputeClient>, waiter: OperationWaiter, timeout: Duration) -> Self {
        Self {
            client,
            waiter,
            timeout,
        }
    }

    /// Plan and apply in one go.
    pub async fn reconcile(
        &self,
        server: &mut Server,
        group: DiskGroup,
        desired: &[Disk],
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let actions = plan_disks(&server.id, group, desired, &disks_by_unit(&server.disks))?;
        self.apply(server, group, desired, &actions, progress).await
    }

    /// Issue each action and wait for it before starting the next; the
    /// control plane does not support concurrent disk operations on one
    /// server. `server` is replaced by each converged payload and the
    /// group is committed after every step.
    pub async fn apply(
        &self,
        server: &mut Server,
        group: DiskGroup,
        desired: &[Disk],
        actions: &[DiskAction],
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        for action in actions {
            match action {
                DiskAction::Add {
                    scsi_unit_id,
                    size_gb,
                    speed,
                } => {
                    info!(
                        "Adding {}GB {} disk at SCSI unit {} to server '{}'...",
                        size_gb, speed, scsi_unit_id, server.id
                    );
                    let disk_id = self
                        .client
                        .add_disk(&server.id, *scsi_unit_id, *size_gb, speed)
                        .await
                        .for_server(&server.id)?;
                    info!(
                        "Disk at SCSI unit {} of server '{}' will have id '{}'",
                        scsi_unit_id, server.id, disk_id
                    );

                    *server = self.wait(&server.id, "Add disk").await?;
                }
                DiskAction::Resize {
                    disk_id,
                    from_gb,
                    to_gb,
                    ..
                } => {
                    info!(
                        "Expanding disk '{}' of server '{}' (from {} GB to {} GB)...",
                        disk_id, server.id, from_gb, to_gb
                    );
                    let response = self
                        .client
                        .resize_disk(&server.id, disk_id, *to_gb)
                        .await
                        .for_server(&server.id)?;
                    if !response.is_success() {
                        return Err(ReconcileError::DiskResizeRejected {
                            server_id: server.id.clone(),
                            disk_id: disk_id.clone(),
                            result: response.result,
                            message: response.message,
                        });
                    }

                    *server = self.wait(&server.id, "Resize disk").await?;
                }
            }

            progress
                .commit(group.checkpoint(converged_view(desired, &server.disks)))
                .await?;
        }

        // Capture remote ids of disks that needed no operation.
        let view = converged_view(desired, &server.disks);
        if view != group.recorded(progress) {
            progress.commit(group.checkpoint(view)).await?;
        }

        Ok(())
    }

    async fn wait(&self, server_id: &str, action: &str) -> Result<Server> {
        let handle = OperationHandle::server(server_id, action);
        let resource = self.waiter.wait(&handle, self.timeout).await?;
        resource.into_server().ok_or_else(|| ReconcileError::NotFound {
            kind: "server",
            id: server_id.to_string(),
        })
    }
}
