//! In-memory control plane.
//!
//! Behaves like the real service from the reconciler's point of view:
//! mutations are accepted immediately and complete after a number of
//! polls through `get_resource`. Faults can be injected per call kind, and
//! every mutation request is recorded so tests can assert on exactly what
//! was sent.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    ApiResponse, AssetType, ClientError, ComputeClient, DeploymentConfig, NetworkAdapter,
    NetworkDomain, OsImage, ResizeDiskResponse, Resource, ResourceState, ResourceType, Server,
    TagPage, RESULT_SUCCESS,
};
use crate::model::{Disk, Tag};
use crate::store::StoreError;

/// Request kinds that faults can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    GetServer,
    DeployServer,
    ReconfigureServer,
    AddDisk,
    ResizeDisk,
    NotifyIpChange,
    PowerOffServer,
    DeleteServer,
    GetAssetTags,
    ApplyTags,
    RemoveTags,
}

/// Injected misbehaviour, consumed by the next matching call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The request never reaches the service.
    Transport(String),
    /// Accepted, then reported as failed with this reason.
    FailOperation(String),
    /// Accepted and never converges.
    Stall,
    /// Synchronous response with a non-success code (tags, disk resize).
    Response { code: String, message: String },
    /// Tag listing claims this many pages.
    TagPages(u32),
}

/// A mutation request as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    DeployServer {
        name: String,
    },
    ReconfigureServer {
        server_id: String,
        memory_gb: Option<u32>,
        cpu_count: Option<u32>,
    },
    AddDisk {
        server_id: String,
        scsi_unit_id: u32,
        size_gb: u32,
        speed: String,
    },
    ResizeDisk {
        server_id: String,
        disk_id: String,
        size_gb: u32,
    },
    NotifyIpChange {
        adapter_id: String,
        ipv4: Option<String>,
        ipv6: Option<String>,
    },
    PowerOffServer {
        server_id: String,
    },
    DeleteServer {
        server_id: String,
    },
    ApplyTags {
        server_id: String,
        tags: Vec<Tag>,
    },
    RemoveTags {
        server_id: String,
        names: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Effect {
    Deploy,
    Reconfigure {
        memory_gb: Option<u32>,
        cpu_count: Option<u32>,
    },
    AddDisk(Disk),
    ResizeDisk {
        disk_id: String,
        size_gb: u32,
    },
    ChangeAddress {
        ipv4: Option<String>,
        ipv6: Option<String>,
    },
    PowerOff,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingOperation {
    resource_type: ResourceType,
    resource_id: String,
    server_id: String,
    effect: Effect,
    polls_remaining: u32,
    #[serde(default)]
    failure: Option<String>,
    #[serde(default)]
    stalled: bool,
}

#[derive(Debug, Clone)]
struct ArmedFault {
    kind: CallKind,
    /// Matching calls to let through first.
    skip: u32,
    fault: Fault,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CloudState {
    network_domains: BTreeMap<String, NetworkDomain>,
    images: Vec<OsImage>,
    servers: BTreeMap<String, Server>,
    tags: BTreeMap<String, BTreeMap<String, String>>,
    pending: Vec<PendingOperation>,
    convergence_polls: u32,
    next_address: u32,
    #[serde(skip)]
    faults: Vec<ArmedFault>,
    #[serde(skip)]
    calls: Vec<Call>,
}

impl CloudState {
    fn take_fault(&mut self, kind: CallKind) -> Option<Fault> {
        let index = self.faults.iter().position(|f| f.kind == kind)?;
        if self.faults[index].skip > 0 {
            self.faults[index].skip -= 1;
            return None;
        }
        Some(self.faults.remove(index).fault)
    }

    fn server_mut(&mut self, id: &str) -> Result<&mut Server, ClientError> {
        self.servers.get_mut(id).ok_or_else(|| not_found("server", id))
    }

    fn idle_server_mut(&mut self, id: &str) -> Result<&mut Server, ClientError> {
        let server = self.server_mut(id)?;
        if server.state.is_pending() || server.primary_adapter.state.is_pending() {
            return Err(ClientError::Api {
                code: "RESOURCE_BUSY".to_string(),
                message: format!("server '{}' has an operation in progress", id),
            });
        }
        Ok(server)
    }

    /// Accept an operation: mark the resource pending and queue the effect.
    fn begin(
        &mut self,
        resource_type: ResourceType,
        resource_id: String,
        server_id: &str,
        effect: Effect,
        fault: Option<Fault>,
    ) -> Result<(), ClientError> {
        let pending_state = match effect {
            Effect::Deploy => ResourceState::PendingAdd,
            Effect::Delete => ResourceState::PendingDelete,
            _ => ResourceState::PendingChange,
        };
        let server = self.server_mut(server_id)?;
        match resource_type {
            ResourceType::Server => {
                server.state = pending_state;
                server.failure_reason = None;
            }
            ResourceType::NetworkAdapter => {
                server.primary_adapter.state = pending_state;
                server.primary_adapter.failure_reason = None;
            }
        }

        let (failure, stalled) = match fault {
            Some(Fault::FailOperation(reason)) => (Some(reason), false),
            Some(Fault::Stall) => (None, true),
            _ => (None, false),
        };
        self.pending.push(PendingOperation {
            resource_type,
            resource_id,
            server_id: server_id.to_string(),
            effect,
            polls_remaining: self.convergence_polls.max(1),
            failure,
            stalled,
        });
        Ok(())
    }

    /// Advance the pending operation on a resource by one poll.
    fn poll(&mut self, resource_type: ResourceType, resource_id: &str) {
        let Some(index) = self
            .pending
            .iter()
            .position(|op| op.resource_type == resource_type && op.resource_id == resource_id)
        else {
            return;
        };

        let op = &mut self.pending[index];
        if op.stalled {
            return;
        }
        op.polls_remaining = op.polls_remaining.saturating_sub(1);
        if op.polls_remaining > 0 {
            return;
        }

        let op = self.pending.remove(index);
        self.complete(op);
    }

    fn complete(&mut self, op: PendingOperation) {
        debug!(resource_id = %op.resource_id, effect = ?op.effect, "Simulated operation completed");

        if let Some(reason) = op.failure {
            let failed = match op.effect {
                Effect::Deploy => ResourceState::FailedAdd,
                Effect::Delete => ResourceState::FailedDelete,
                _ => ResourceState::FailedChange,
            };
            if let Some(server) = self.servers.get_mut(&op.server_id) {
                match op.resource_type {
                    ResourceType::Server => {
                        server.state = failed;
                        server.failure_reason = Some(reason);
                    }
                    ResourceType::NetworkAdapter => {
                        server.primary_adapter.state = failed;
                        server.primary_adapter.failure_reason = Some(reason);
                    }
                }
            }
            return;
        }

        if let Effect::Delete = op.effect {
            self.servers.remove(&op.server_id);
            self.tags.remove(&op.server_id);
            return;
        }

        let Some(server) = self.servers.get_mut(&op.server_id) else {
            return;
        };
        match op.effect {
            Effect::Deploy | Effect::Delete => {}
            Effect::Reconfigure {
                memory_gb,
                cpu_count,
            } => {
                if let Some(memory_gb) = memory_gb {
                    server.memory_gb = memory_gb;
                }
                if let Some(cpu_count) = cpu_count {
                    server.cpu_count = cpu_count;
                }
            }
            Effect::AddDisk(disk) => server.disks.push(disk),
            Effect::ResizeDisk { disk_id, size_gb } => {
                if let Some(disk) = server
                    .disks
                    .iter_mut()
                    .find(|d| d.id.as_deref() == Some(disk_id.as_str()))
                {
                    disk.size_gb = size_gb;
                }
            }
            Effect::ChangeAddress { ipv4, ipv6 } => {
                if let Some(ipv4) = ipv4 {
                    server.primary_adapter.private_ipv4 = ipv4;
                }
                if ipv6.is_some() {
                    server.primary_adapter.private_ipv6 = ipv6;
                }
            }
            Effect::PowerOff => server.started = false,
        }
        match op.resource_type {
            ResourceType::Server => server.state = ResourceState::Normal,
            ResourceType::NetworkAdapter => server.primary_adapter.state = ResourceState::Normal,
        }
    }
}

fn not_found(kind: &str, id: &str) -> ClientError {
    ClientError::Api {
        code: "RESOURCE_NOT_FOUND".to_string(),
        message: format!("{} '{}' not found", kind, id),
    }
}

fn fail_transport(fault: &Option<Fault>) -> Result<(), ClientError> {
    match fault {
        Some(Fault::Transport(msg)) => Err(ClientError::Transport(msg.clone())),
        _ => Ok(()),
    }
}

/// Simulated control plane.
pub struct SimulatedCloud {
    state: Mutex<CloudState>,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCloud {
    /// Empty cloud where operations converge on the second poll.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CloudState {
                convergence_polls: 2,
                ..CloudState::default()
            }),
        }
    }

    /// A cloud with one network domain and two images, for local runs.
    pub fn sandbox() -> Self {
        Self::new()
            .with_network_domain(NetworkDomain {
                id: "nd-sandbox".to_string(),
                name: "sandbox".to_string(),
                datacenter_id: "NA9".to_string(),
            })
            .with_image(OsImage {
                id: "img-ubuntu-1404".to_string(),
                name: "Ubuntu 14.04 2 CPU".to_string(),
                datacenter_id: "NA9".to_string(),
                cpu_count: 2,
                memory_gb: 4,
                disks: vec![Disk::new(0, 10)],
            })
            .with_image(OsImage {
                id: "img-centos-7".to_string(),
                name: "CentOS 7 64-bit 2 CPU".to_string(),
                datacenter_id: "NA9".to_string(),
                cpu_count: 2,
                memory_gb: 4,
                disks: vec![Disk::new(0, 10)],
            })
    }

    pub fn with_network_domain(mut self, domain: NetworkDomain) -> Self {
        self.state
            .get_mut()
            .network_domains
            .insert(domain.id.clone(), domain);
        self
    }

    pub fn with_image(mut self, image: OsImage) -> Self {
        self.state.get_mut().images.push(image);
        self
    }

    pub fn with_convergence_polls(mut self, polls: u32) -> Self {
        self.state.get_mut().convergence_polls = polls.max(1);
        self
    }

    /// Load a previously saved world from JSON.
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = tokio::fs::read(path).await?;
        let state: CloudState = serde_json::from_slice(&bytes)?;
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(&*self.state.lock().await)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Seed an existing server.
    pub async fn insert_server(&self, server: Server) {
        self.state
            .lock()
            .await
            .servers
            .insert(server.id.clone(), server);
    }

    pub async fn set_tags(&self, server_id: &str, tags: &[Tag]) {
        let tags = tags
            .iter()
            .map(|t| (t.name.clone(), t.value.clone()))
            .collect();
        self.state
            .lock()
            .await
            .tags
            .insert(server_id.to_string(), tags);
    }

    /// Make the next `kind` call misbehave.
    pub async fn inject(&self, kind: CallKind, fault: Fault) {
        self.inject_after(kind, 0, fault).await;
    }

    /// Let `skip` matching calls succeed, then misbehave on the next one.
    pub async fn inject_after(&self, kind: CallKind, skip: u32, fault: Fault) {
        self.state
            .lock()
            .await
            .faults
            .push(ArmedFault { kind, skip, fault });
    }

    pub async fn server(&self, id: &str) -> Option<Server> {
        self.state.lock().await.servers.get(id).cloned()
    }

    pub async fn tags(&self, server_id: &str) -> Vec<Tag> {
        self.state
            .lock()
            .await
            .tags
            .get(server_id)
            .map(|tags| tags.iter().map(|(n, v)| Tag::new(n, v)).collect())
            .unwrap_or_default()
    }

    /// Mutation requests received so far.
    pub async fn calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }
}

#[async_trait]
impl ComputeClient for SimulatedCloud {
    async fn get_network_domain(&self, id: &str) -> Result<Option<NetworkDomain>, ClientError> {
        Ok(self.state.lock().await.network_domains.get(id).cloned())
    }

    async fn find_os_image(
        &self,
        name: &str,
        datacenter_id: &str,
    ) -> Result<Option<OsImage>, ClientError> {
        let state = self.state.lock().await;
        Ok(state
            .images
            .iter()
            .find(|i| i.name == name && i.datacenter_id == datacenter_id)
            .cloned())
    }

    async fn deploy_server(&self, config: &DeploymentConfig) -> Result<String, ClientError> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::DeployServer {
            name: config.name.clone(),
        });
        let fault = state.take_fault(CallKind::DeployServer);
        fail_transport(&fault)?;

        let domain = state
            .network_domains
            .get(&config.network_domain_id)
            .cloned()
            .ok_or_else(|| not_found("network domain", &config.network_domain_id))?;
        if !state.images.iter().any(|i| i.id == config.image_id) {
            return Err(not_found("OS image", &config.image_id));
        }

        state.next_address += 1;
        let host = 10 + state.next_address;
        let id = uuid::Uuid::new_v4().to_string();
        let disks = config
            .disks
            .iter()
            .map(|d| Disk {
                id: Some(uuid::Uuid::new_v4().to_string()),
                ..d.clone()
            })
            .collect();

        let server = Server {
            id: id.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            network_domain_id: domain.id.clone(),
            datacenter_id: domain.datacenter_id.clone(),
            source_image_id: config.image_id.clone(),
            memory_gb: config.memory_gb,
            cpu_count: config.cpu_count,
            disks,
            primary_adapter: NetworkAdapter {
                id: uuid::Uuid::new_v4().to_string(),
                vlan_id: config
                    .primary_vlan_id
                    .clone()
                    .unwrap_or_else(|| format!("vlan-{}", domain.id)),
                private_ipv4: config
                    .primary_ipv4
                    .clone()
                    .unwrap_or_else(|| format!("10.0.0.{}", host)),
                private_ipv6: Some(format!("fd00::{:x}", host)),
                state: ResourceState::Normal,
                failure_reason: None,
            },
            started: config.start,
            state: ResourceState::PendingAdd,
            failure_reason: None,
        };
        state.servers.insert(id.clone(), server);
        state.begin(ResourceType::Server, id.clone(), &id, Effect::Deploy, fault)?;
        Ok(id)
    }

    async fn get_server(&self, id: &str) -> Result<Option<Server>, ClientError> {
        let mut state = self.state.lock().await;
        let fault = state.take_fault(CallKind::GetServer);
        fail_transport(&fault)?;
        Ok(state.servers.get(id).cloned())
    }

    async fn reconfigure_server(
        &self,
        id: &str,
        memory_gb: Option<u32>,
        cpu_count: Option<u32>,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::ReconfigureServer {
            server_id: id.to_string(),
            memory_gb,
            cpu_count,
        });
        let fault = state.take_fault(CallKind::ReconfigureServer);
        fail_transport(&fault)?;
        state.idle_server_mut(id)?;
        state.begin(
            ResourceType::Server,
            id.to_string(),
            id,
            Effect::Reconfigure {
                memory_gb,
                cpu_count,
            },
            fault,
        )
    }

    async fn add_disk(
        &self,
        server_id: &str,
        scsi_unit_id: u32,
        size_gb: u32,
        speed: &str,
    ) -> Result<String, ClientError> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::AddDisk {
            server_id: server_id.to_string(),
            scsi_unit_id,
            size_gb,
            speed: speed.to_string(),
        });
        let fault = state.take_fault(CallKind::AddDisk);
        fail_transport(&fault)?;

        let server = state.idle_server_mut(server_id)?;
        if server.disks.iter().any(|d| d.scsi_unit_id == scsi_unit_id) {
            return Err(ClientError::Api {
                code: "INVALID_INPUT_DATA".to_string(),
                message: format!("SCSI unit {} is already in use", scsi_unit_id),
            });
        }

        let disk_id = uuid::Uuid::new_v4().to_string();
        let disk = Disk {
            id: Some(disk_id.clone()),
            scsi_unit_id,
            size_gb,
            speed: speed.to_string(),
        };
        state.begin(
            ResourceType::Server,
            server_id.to_string(),
            server_id,
            Effect::AddDisk(disk),
            fault,
        )?;
        Ok(disk_id)
    }

    async fn resize_disk(
        &self,
        server_id: &str,
        disk_id: &str,
        size_gb: u32,
    ) -> Result<ResizeDiskResponse, ClientError> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::ResizeDisk {
            server_id: server_id.to_string(),
            disk_id: disk_id.to_string(),
            size_gb,
        });
        let fault = state.take_fault(CallKind::ResizeDisk);
        fail_transport(&fault)?;
        if let Some(Fault::Response { code, message }) = fault {
            return Ok(ResizeDiskResponse {
                result: code,
                message,
            });
        }

        let server = state.idle_server_mut(server_id)?;
        let current = server
            .disks
            .iter()
            .find(|d| d.id.as_deref() == Some(disk_id))
            .map(|d| d.size_gb)
            .ok_or_else(|| not_found("disk", disk_id))?;
        if size_gb <= current {
            return Ok(ResizeDiskResponse {
                result: "ERROR".to_string(),
                message: "disks can only be expanded".to_string(),
            });
        }

        state.begin(
            ResourceType::Server,
            server_id.to_string(),
            server_id,
            Effect::ResizeDisk {
                disk_id: disk_id.to_string(),
                size_gb,
            },
            fault,
        )?;
        Ok(ResizeDiskResponse {
            result: RESULT_SUCCESS.to_string(),
            message: format!("disk '{}' is being resized", disk_id),
        })
    }

    async fn notify_ip_change(
        &self,
        adapter_id: &str,
        ipv4: Option<&str>,
        ipv6: Option<&str>,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::NotifyIpChange {
            adapter_id: adapter_id.to_string(),
            ipv4: ipv4.map(str::to_string),
            ipv6: ipv6.map(str::to_string),
        });
        let fault = state.take_fault(CallKind::NotifyIpChange);
        fail_transport(&fault)?;

        let server_id = state
            .servers
            .values()
            .find(|s| s.primary_adapter.id == adapter_id)
            .map(|s| s.id.clone())
            .ok_or_else(|| not_found("network adapter", adapter_id))?;
        state.idle_server_mut(&server_id)?;
        state.begin(
            ResourceType::NetworkAdapter,
            format!("{}/{}", server_id, adapter_id),
            &server_id,
            Effect::ChangeAddress {
                ipv4: ipv4.map(str::to_string),
                ipv6: ipv6.map(str::to_string),
            },
            fault,
        )
    }

    async fn power_off_server(&self, id: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::PowerOffServer {
            server_id: id.to_string(),
        });
        let fault = state.take_fault(CallKind::PowerOffServer);
        fail_transport(&fault)?;

        let server = state.idle_server_mut(id)?;
        if !server.started {
            return Err(ClientError::Api {
                code: "SERVER_STOPPED".to_string(),
                message: format!("server '{}' is already stopped", id),
            });
        }
        state.begin(
            ResourceType::Server,
            id.to_string(),
            id,
            Effect::PowerOff,
            fault,
        )
    }

    async fn delete_server(&self, id: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::DeleteServer {
            server_id: id.to_string(),
        });
        let fault = state.take_fault(CallKind::DeleteServer);
        fail_transport(&fault)?;

        let server = state.idle_server_mut(id)?;
        if server.started {
            return Err(ClientError::Api {
                code: "SERVER_STARTED".to_string(),
                message: format!("server '{}' must be stopped before it is deleted", id),
            });
        }
        state.begin(
            ResourceType::Server,
            id.to_string(),
            id,
            Effect::Delete,
            fault,
        )
    }

    async fn get_asset_tags(
        &self,
        asset_id: &str,
        _asset_type: AssetType,
        page: u32,
    ) -> Result<TagPage, ClientError> {
        let mut state = self.state.lock().await;
        let fault = state.take_fault(CallKind::GetAssetTags);
        fail_transport(&fault)?;
        let page_count = match fault {
            Some(Fault::TagPages(pages)) => pages,
            _ => 1,
        };

        let items = if page == 1 {
            state
                .tags
                .get(asset_id)
                .map(|tags| tags.iter().map(|(n, v)| Tag::new(n, v)).collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok(TagPage {
            items,
            page_count,
        })
    }

    async fn apply_asset_tags(
        &self,
        asset_id: &str,
        _asset_type: AssetType,
        tags: &[Tag],
    ) -> Result<ApiResponse, ClientError> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::ApplyTags {
            server_id: asset_id.to_string(),
            tags: tags.to_vec(),
        });
        let fault = state.take_fault(CallKind::ApplyTags);
        fail_transport(&fault)?;
        if let Some(Fault::Response { code, message }) = fault {
            return Ok(ApiResponse { code, message });
        }

        state.server_mut(asset_id)?;
        let entry = state.tags.entry(asset_id.to_string()).or_default();
        for tag in tags {
            entry.insert(tag.name.clone(), tag.value.clone());
        }
        Ok(ApiResponse::ok())
    }

    async fn remove_asset_tags(
        &self,
        asset_id: &str,
        _asset_type: AssetType,
        names: &[String],
    ) -> Result<ApiResponse, ClientError> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::RemoveTags {
            server_id: asset_id.to_string(),
            names: names.to_vec(),
        });
        let fault = state.take_fault(CallKind::RemoveTags);
        fail_transport(&fault)?;
        if let Some(Fault::Response { code, message }) = fault {
            return Ok(ApiResponse { code, message });
        }

        state.server_mut(asset_id)?;
        if let Some(entry) = state.tags.get_mut(asset_id) {
            for name in names {
                entry.remove(name);
            }
        }
        Ok(ApiResponse::ok())
    }

    async fn get_resource(
        &self,
        resource_type: ResourceType,
        id: &str,
    ) -> Result<Option<Resource>, ClientError> {
        let mut state = self.state.lock().await;
        state.poll(resource_type, id);

        match resource_type {
            ResourceType::Server => Ok(state.servers.get(id).cloned().map(Resource::Server)),
            ResourceType::NetworkAdapter => {
                let Some((server_id, adapter_id)) = id.split_once('/') else {
                    return Ok(None);
                };
                Ok(state
                    .servers
                    .get(server_id)
                    .map(|s| &s.primary_adapter)
                    .filter(|a| a.id == adapter_id)
                    .cloned()
                    .map(Resource::NetworkAdapter))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> DeploymentConfig {
        DeploymentConfig {
            name: name.to_string(),
            description: String::new(),
            admin_password: "pw".to_string(),
            start: true,
            image_id: "img-ubuntu-1404".to_string(),
            memory_gb: 4,
            cpu_count: 2,
            disks: vec![Disk::new(0, 10)],
            network_domain_id: "nd-sandbox".to_string(),
            primary_vlan_id: None,
            primary_ipv4: None,
            dns_primary: String::new(),
            dns_secondary: String::new(),
        }
    }

    #[tokio::test]
    async fn test_deploy_converges_after_polls() {
        let cloud = SimulatedCloud::sandbox().with_convergence_polls(3);
        let id = cloud.deploy_server(&config("sim-1")).await.unwrap();

        for _ in 0..2 {
            let r = cloud
                .get_resource(ResourceType::Server, &id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(r.state(), ResourceState::PendingAdd);
        }
        let r = cloud
            .get_resource(ResourceType::Server, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.state(), ResourceState::Normal);
        let server = r.into_server().unwrap();
        assert!(server.disks[0].id.is_some());
    }

    #[tokio::test]
    async fn test_busy_server_rejects_second_mutation() {
        let cloud = SimulatedCloud::sandbox();
        let id = cloud.deploy_server(&config("sim-2")).await.unwrap();
        let err = cloud.reconfigure_server(&id, Some(8), None).await.unwrap_err();
        assert!(matches!(err, ClientError::Api { ref code, .. } if code == "RESOURCE_BUSY"));
    }

    #[tokio::test]
    async fn test_failed_operation_reports_reason() {
        let cloud = SimulatedCloud::sandbox().with_convergence_polls(1);
        cloud
            .inject(CallKind::DeployServer, Fault::FailOperation("no capacity".to_string()))
            .await;
        let id = cloud.deploy_server(&config("sim-3")).await.unwrap();
        let r = cloud
            .get_resource(ResourceType::Server, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.state(), ResourceState::FailedAdd);
        assert_eq!(r.failure_reason(), Some("no capacity"));
    }

    #[tokio::test]
    async fn test_save_and_load_world() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.json");
        let cloud = SimulatedCloud::sandbox().with_convergence_polls(1);
        let id = cloud.deploy_server(&config("sim-4")).await.unwrap();
        cloud.save(&path).await.unwrap();

        let loaded = SimulatedCloud::load(&path).await.unwrap();
        let r = loaded
            .get_resource(ResourceType::Server, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.state(), ResourceState::Normal);
        assert!(loaded.calls().await.is_empty());
    }
}
