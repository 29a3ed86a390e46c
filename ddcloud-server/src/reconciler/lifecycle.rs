//! Server lifecycle: create, read, update and delete.
//!
//! Every entry point runs its sub-steps strictly in order. After each
//! sub-step converges the persisted record is advanced through
//! [`Progress::commit`], so an interrupted run leaves a record describing
//! exactly what is known to be done. Overlapping runs against the same
//! server are not supported.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::compute::{AddressChange, ComputeChange, ComputeReconciler};
use super::disk::{plan_disks, DiskAction, DiskGroup, DiskReconciler};
use super::snapshot::SnapshotReader;
use super::tag::{diff_tags, tags_differ, TagDiff, TagReconciler};
use super::waiter::{OperationHandle, OperationWaiter};
use super::Progress;
use crate::clients::{ComputeClient, DeploymentConfig, OsImage as CatalogImage, Server};
use crate::config::ReconcilerConfig;
use crate::error::{ClientResultExt, ReconcileError, Result};
use crate::model::{disks_by_unit, Disk, OsImage, ServerObservedState, ServerSpec};
use crate::record::{Checkpoint, LifecyclePhase, ServerRecord};
use crate::store::StateStore;

/// What an update would do, branch by branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdatePlan {
    pub compute: ComputeChange,
    pub image_disks: Vec<DiskAction>,
    pub additional_disks: Vec<DiskAction>,
    pub address: AddressChange,
    /// `None` when the tag sets already match.
    pub tags: Option<TagDiff>,
}

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.compute.is_empty()
            && self.image_disks.is_empty()
            && self.additional_disks.is_empty()
            && self.address.is_empty()
            && self.tags.is_none()
    }
}

/// Drives one server at a time through its lifecycle. The client is shared;
/// the store passed to each call belongs to that call's server.
pub struct ServerLifecycle {
    client: Arc<dyn ComputeClient>,
    config: ReconcilerConfig,
    waiter: OperationWaiter,
    snapshot: SnapshotReader,
    disks: DiskReconciler,
    tags: TagReconciler,
    compute: ComputeReconciler,
}

impl ServerLifecycle {
    pub fn new(client: Arc<dyn ComputeClient>, config: ReconcilerConfig) -> Self {
        let waiter = OperationWaiter::new(Arc::clone(&client), config.poll_interval());
        Self {
            snapshot: SnapshotReader::new(Arc::clone(&client)),
            disks: DiskReconciler::new(
                Arc::clone(&client),
                waiter.clone(),
                config.update_timeout(),
            ),
            tags: TagReconciler::new(Arc::clone(&client)),
            compute: ComputeReconciler::new(
                Arc::clone(&client),
                waiter.clone(),
                config.update_timeout(),
                config.adapter_update_timeout(),
            ),
            waiter,
            client,
            config,
        }
    }

    /// Deploy a new server and bring its disks and tags to the declared
    /// state.
    pub async fn create(&self, desired: ServerSpec, store: &dyn StateStore) -> Result<ServerRecord> {
        desired.validate()?;
        info!(
            "Create server '{}' in network domain '{}'",
            desired.name, desired.network_domain_id
        );

        let mut progress = Progress::new(ServerRecord::new(desired.clone()), store);
        progress.commit(Checkpoint::Phase(LifecyclePhase::Creating)).await?;

        let domain = self
            .client
            .get_network_domain(&desired.network_domain_id)
            .await
            .unassigned()?
            .ok_or_else(|| ReconcileError::NotFound {
                kind: "network domain",
                id: desired.network_domain_id.clone(),
            })?;
        info!("Server will be deployed in data centre '{}'", domain.datacenter_id);

        let image = self
            .resolve_image(&desired, &domain.datacenter_id)
            .await?;
        progress
            .commit(Checkpoint::ImageResolved {
                image_id: image.id.clone(),
                datacenter_id: domain.datacenter_id.clone(),
            })
            .await?;

        let config = deployment_config(&desired, &image);
        if desired.memory_gb.is_none() || desired.cpu_count.is_none() {
            progress
                .commit(Checkpoint::Compute {
                    memory_gb: desired.memory_gb.is_none().then_some(config.memory_gb),
                    cpu_count: desired.cpu_count.is_none().then_some(config.cpu_count),
                })
                .await?;
        }

        let server_id = self.client.deploy_server(&config).await.unassigned()?;
        progress
            .commit(Checkpoint::ServerDeployed {
                server_id: server_id.clone(),
            })
            .await?;
        info!("Server '{}' is being provisioned as '{}'...", desired.name, server_id);

        let handle = OperationHandle::server(&server_id, "Deploy server");
        let mut server = self
            .waiter
            .wait(&handle, self.config.create_timeout())
            .await?
            .into_server()
            .ok_or_else(|| ReconcileError::NotFound {
                kind: "server",
                id: server_id.clone(),
            })?;

        progress
            .commit(Checkpoint::PrimaryAddress {
                ipv4: Some(server.primary_adapter.private_ipv4.clone()),
                ipv6: server.primary_adapter.private_ipv6.clone(),
            })
            .await?;

        info!("Configuring image disks for server '{}'...", server_id);
        if desired.image_disks.is_empty() {
            // Nothing declared: record what the image gave us.
            progress
                .commit(Checkpoint::ImageDisks(server.disks.clone()))
                .await?;
        } else {
            self.disks
                .reconcile(&mut server, DiskGroup::Image, &desired.image_disks, &mut progress)
                .await?;
        }

        if !desired.additional_disks.is_empty() {
            info!("Configuring additional disks for server '{}'...", server_id);
            self.disks
                .reconcile(
                    &mut server,
                    DiskGroup::Additional,
                    &desired.additional_disks,
                    &mut progress,
                )
                .await?;
        }

        if !desired.tags.is_empty() {
            self.tags.reconcile(&server_id, &desired.tags).await?;
            progress.commit(Checkpoint::Tags(desired.tags.clone())).await?;
        }

        progress.commit(Checkpoint::Phase(LifecyclePhase::Present)).await?;
        info!("Server '{}' created", server_id);
        Ok(progress.into_record())
    }

    /// Refresh the record from the control plane. `None` means the server is
    /// gone and the record has been dropped.
    pub async fn read(
        &self,
        record: ServerRecord,
        store: &dyn StateStore,
    ) -> Result<Option<ServerRecord>> {
        let Some(server_id) = record.id.clone() else {
            return Ok(None);
        };

        let observed = match self.snapshot.read(&server_id).await {
            Ok(observed) => observed,
            Err(e) if e.is_not_found() => {
                info!("Server '{}' has been deleted", server_id);
                store.clear().await.map_err(|source| ReconcileError::Checkpoint {
                    server_id: Some(server_id.clone()),
                    source,
                })?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let refreshed = refresh(record, &observed);
        store
            .save(&refreshed)
            .await
            .map_err(|source| ReconcileError::Checkpoint {
                server_id: Some(server_id),
                source,
            })?;
        Ok(Some(refreshed))
    }

    /// Compute what `update` would do without mutating anything.
    pub async fn plan(&self, record: &ServerRecord, desired: &ServerSpec) -> Result<UpdatePlan> {
        desired.validate()?;
        let server_id = existing_id(record)?;
        let observed = self.snapshot.read(server_id).await?;
        plan_update(desired, &observed)
    }

    /// Move an existing server to the declared state.
    ///
    /// Branches run in a fixed order (compute, image disks, additional
    /// disks, addresses, tags), each committing its own progress. The first
    /// failing branch stops the update.
    pub async fn update(
        &self,
        record: ServerRecord,
        desired: ServerSpec,
        store: &dyn StateStore,
    ) -> Result<ServerRecord> {
        desired.validate()?;
        let server_id = existing_id(&record)?.to_string();
        info!("Update server '{}'", server_id);

        let observed = self.snapshot.read(&server_id).await?;
        let plan = plan_update(&desired, &observed)?;

        let mut progress = Progress::new(record, store);
        progress.commit(Checkpoint::Phase(LifecyclePhase::Updating)).await?;

        if plan.is_empty() {
            info!("Server '{}' is up to date", server_id);
        }

        let mut server = observed.server;

        if !plan.compute.is_empty() {
            info!("Server CPU / memory configuration change detected");
            server = self.compute.reconfigure(&server_id, plan.compute).await?;
            progress
                .commit(Checkpoint::Compute {
                    memory_gb: plan.compute.memory_gb,
                    cpu_count: plan.compute.cpu_count,
                })
                .await?;
        }

        if !plan.image_disks.is_empty() {
            self.disks
                .apply(
                    &mut server,
                    DiskGroup::Image,
                    &desired.image_disks,
                    &plan.image_disks,
                    &mut progress,
                )
                .await?;
        }

        if !plan.additional_disks.is_empty() {
            self.disks
                .apply(
                    &mut server,
                    DiskGroup::Additional,
                    &desired.additional_disks,
                    &plan.additional_disks,
                    &mut progress,
                )
                .await?;
        }

        if !plan.address.is_empty() {
            info!("Server network configuration change detected");
            self.compute.readdress(&server, &plan.address).await?;
            progress
                .commit(Checkpoint::PrimaryAddress {
                    ipv4: plan.address.ipv4.clone(),
                    ipv6: plan.address.ipv6.clone(),
                })
                .await?;
        }

        if plan.tags.is_some() {
            self.tags.reconcile(&server_id, &desired.tags).await?;
            progress.commit(Checkpoint::Tags(desired.tags.clone())).await?;
        }

        progress.commit(Checkpoint::Phase(LifecyclePhase::Present)).await?;
        Ok(progress.into_record())
    }

    /// Power off (if running) and delete. A server the control plane no
    /// longer knows about counts as deleted.
    pub async fn delete(&self, record: ServerRecord, store: &dyn StateStore) -> Result<()> {
        let Some(server_id) = record.id.clone() else {
            return clear(store, None).await;
        };
        info!("Delete server '{}' ('{}')", server_id, record.spec.name);

        let server = self
            .client
            .get_server(&server_id)
            .await
            .for_server(&server_id)?;
        let Some(server) = server else {
            info!(
                "Server '{}' not found; treating it as already deleted",
                server_id
            );
            return clear(store, Some(&server_id)).await;
        };

        let mut progress = Progress::new(record, store);
        progress.commit(Checkpoint::Phase(LifecyclePhase::Deleting)).await?;

        if server.started {
            info!("Server '{}' is running and will be powered off", server_id);
            self.client
                .power_off_server(&server_id)
                .await
                .for_server(&server_id)?;
            let handle = OperationHandle::server(&server_id, "Power off server");
            self.waiter
                .wait(&handle, self.config.shutdown_timeout())
                .await?;
        }

        info!("Server '{}' is being deleted...", server_id);
        self.client
            .delete_server(&server_id)
            .await
            .for_server(&server_id)?;
        let handle = OperationHandle::server(&server_id, "Delete server");
        self.waiter
            .wait_for_delete(&handle, self.config.delete_timeout())
            .await?;

        progress.commit(Checkpoint::Phase(LifecyclePhase::Absent)).await?;
        clear(store, Some(&server_id)).await
    }

    async fn resolve_image(&self, desired: &ServerSpec, datacenter_id: &str) -> Result<CatalogImage> {
        match &desired.os_image {
            OsImage::Id(_) => Err(ReconcileError::UnsupportedFeature {
                server_id: None,
                feature: "selecting an OS image by id".to_string(),
            }),
            OsImage::Name(name) => {
                info!("Looking up OS image '{}' by name...", name);
                let image = self
                    .client
                    .find_os_image(name, datacenter_id)
                    .await
                    .unassigned()?;
                match image {
                    Some(image) => {
                        info!("Server will be deployed from OS image '{}'", image.id);
                        Ok(image)
                    }
                    None => {
                        warn!(
                            "No OS image named '{}' in data centre '{}'",
                            name, datacenter_id
                        );
                        Err(ReconcileError::ImageNotFound {
                            name: name.clone(),
                            datacenter_id: datacenter_id.to_string(),
                            network_domain_id: desired.network_domain_id.clone(),
                        })
                    }
                }
            }
        }
    }
}

/// Only a record that has been deployed can be updated or planned against.
fn existing_id(record: &ServerRecord) -> Result<&str> {
    record
        .id
        .as_deref()
        .ok_or(ReconcileError::InvalidTransition {
            server_id: None,
            from: record.phase,
            to: LifecyclePhase::Updating,
        })
}

async fn clear(store: &dyn StateStore, server_id: Option<&str>) -> Result<()> {
    store
        .clear()
        .await
        .map_err(|source| ReconcileError::Checkpoint {
            server_id: server_id.map(str::to_string),
            source,
        })
}

/// Baseline from the image, overlaid with declared CPU / memory.
fn deployment_config(desired: &ServerSpec, image: &CatalogImage) -> DeploymentConfig {
    let mut config = DeploymentConfig {
        name: desired.name.clone(),
        description: desired.description.clone(),
        admin_password: desired.admin_password.clone(),
        start: desired.auto_start,
        image_id: String::new(),
        memory_gb: 0,
        cpu_count: 0,
        disks: Vec::new(),
        network_domain_id: desired.network_domain_id.clone(),
        primary_vlan_id: desired.primary_adapter_vlan.clone(),
        primary_ipv4: desired.primary_adapter_ipv4.clone(),
        dns_primary: desired.dns_primary.clone(),
        dns_secondary: desired.dns_secondary.clone(),
    };
    config.apply_image(image);

    if let Some(memory_gb) = desired.memory_gb {
        config.memory_gb = memory_gb;
    }
    if let Some(cpu_count) = desired.cpu_count {
        config.cpu_count = cpu_count;
    }
    config
}

/// Decide every update branch against one snapshot. Validation failures
/// (immutable fields, shrinking, unknown disks) surface here, before any
/// mutation.
fn plan_update(desired: &ServerSpec, observed: &ServerObservedState) -> Result<UpdatePlan> {
    let server = &observed.server;

    if desired.name != server.name {
        return Err(immutable(server, "name", &server.name, &desired.name));
    }
    if desired.description != server.description {
        return Err(immutable(
            server,
            "description",
            &server.description,
            &desired.description,
        ));
    }

    let by_unit = observed.disks_by_unit();
    let tags = tags_differ(&desired.tags, &observed.tags)
        .then(|| diff_tags(&desired.tags, &observed.tags));

    Ok(UpdatePlan {
        compute: ComputeChange::between(desired, server),
        image_disks: plan_disks(&server.id, DiskGroup::Image, &desired.image_disks, &by_unit)?,
        additional_disks: plan_disks(
            &server.id,
            DiskGroup::Additional,
            &desired.additional_disks,
            &by_unit,
        )?,
        address: AddressChange::between(desired, &server.primary_adapter),
        tags,
    })
}

fn immutable(server: &Server, field: &'static str, current: &str, desired: &str) -> ReconcileError {
    ReconcileError::ImmutableField {
        server_id: server.id.clone(),
        field,
        current: current.to_string(),
        desired: desired.to_string(),
    }
}

/// Rebuild the record from what the control plane reports. Observed disks
/// declared as image disks stay image disks; everything else is, by
/// elimination, an additional disk.
fn refresh(record: ServerRecord, observed: &ServerObservedState) -> ServerRecord {
    let server = &observed.server;
    let mut remaining = disks_by_unit(&server.disks);

    let image_disks: Vec<Disk> = record
        .spec
        .image_disks
        .iter()
        .filter_map(|d| remaining.remove(&d.scsi_unit_id))
        .collect();
    let additional_disks: Vec<Disk> = remaining.into_values().collect();

    let mut spec = record.spec;
    spec.name = server.name.clone();
    spec.description = server.description.clone();
    spec.network_domain_id = server.network_domain_id.clone();
    spec.memory_gb = Some(server.memory_gb);
    spec.cpu_count = Some(server.cpu_count);
    spec.primary_adapter_vlan = Some(server.primary_adapter.vlan_id.clone());
    spec.primary_adapter_ipv4 = Some(server.primary_adapter.private_ipv4.clone());
    spec.primary_adapter_ipv6 = server.primary_adapter.private_ipv6.clone();
    spec.image_disks = image_disks;
    spec.additional_disks = additional_disks;
    spec.tags = observed.tags.clone();

    ServerRecord {
        id: Some(server.id.clone()),
        phase: record.phase,
        spec,
        os_image_id: Some(server.source_image_id.clone()),
        datacenter_id: Some(server.datacenter_id.clone()),
        updated_at: chrono::Utc::now().to_rfc3339(),
    }
}
