//! Client interface for the cloud control plane.
//!
//! The control plane runs every mutation asynchronously: a call returns as
//! soon as the request is accepted, and the affected resource reports a
//! pending state until the operation completes. Callers poll
//! [`ComputeClient::get_resource`] to observe convergence.

pub mod sim;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Disk, Tag};

pub use sim::SimulatedCloud;

/// Result code reported by a successful disk resize request.
pub const RESULT_SUCCESS: &str = "SUCCESS";
/// Response code reported by a successful tag request.
pub const RESPONSE_CODE_OK: &str = "OK";

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("API error {code}: {message}")]
    Api { code: String, message: String },
}

/// Kinds of resource whose state can be polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Server,
    NetworkAdapter,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Server => "server",
            ResourceType::NetworkAdapter => "network adapter",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asset kinds that carry tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetType {
    Server,
}

/// Provisioning state reported on every resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    Normal,
    PendingAdd,
    PendingChange,
    PendingDelete,
    FailedAdd,
    FailedChange,
    FailedDelete,
    RequiresSupport,
}

impl ResourceState {
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ResourceState::PendingAdd | ResourceState::PendingChange | ResourceState::PendingDelete
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            ResourceState::FailedAdd
                | ResourceState::FailedChange
                | ResourceState::FailedDelete
                | ResourceState::RequiresSupport
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Normal => "NORMAL",
            ResourceState::PendingAdd => "PENDING_ADD",
            ResourceState::PendingChange => "PENDING_CHANGE",
            ResourceState::PendingDelete => "PENDING_DELETE",
            ResourceState::FailedAdd => "FAILED_ADD",
            ResourceState::FailedChange => "FAILED_CHANGE",
            ResourceState::FailedDelete => "FAILED_DELETE",
            ResourceState::RequiresSupport => "REQUIRES_SUPPORT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDomain {
    pub id: String,
    pub name: String,
    pub datacenter_id: String,
}

/// OS image catalog entry. The image defines the initial CPU, memory and
/// disk layout of servers deployed from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsImage {
    pub id: String,
    pub name: String,
    pub datacenter_id: String,
    pub cpu_count: u32,
    pub memory_gb: u32,
    pub disks: Vec<Disk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAdapter {
    pub id: String,
    pub vlan_id: String,
    pub private_ipv4: String,
    #[serde(default)]
    pub private_ipv6: Option<String>,
    pub state: ResourceState,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Server as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub description: String,
    pub network_domain_id: String,
    pub datacenter_id: String,
    pub source_image_id: String,
    pub memory_gb: u32,
    pub cpu_count: u32,
    pub disks: Vec<Disk>,
    pub primary_adapter: NetworkAdapter,
    pub started: bool,
    pub state: ResourceState,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Resource returned by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Server(Server),
    NetworkAdapter(NetworkAdapter),
}

impl Resource {
    pub fn state(&self) -> ResourceState {
        match self {
            Resource::Server(s) => s.state,
            Resource::NetworkAdapter(a) => a.state,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Resource::Server(s) => s.failure_reason.as_deref(),
            Resource::NetworkAdapter(a) => a.failure_reason.as_deref(),
        }
    }

    pub fn into_server(self) -> Option<Server> {
        match self {
            Resource::Server(s) => Some(s),
            Resource::NetworkAdapter(_) => None,
        }
    }
}

/// Request to deploy a new server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub name: String,
    pub description: String,
    pub admin_password: String,
    pub start: bool,
    pub image_id: String,
    pub memory_gb: u32,
    pub cpu_count: u32,
    pub disks: Vec<Disk>,
    pub network_domain_id: String,
    pub primary_vlan_id: Option<String>,
    pub primary_ipv4: Option<String>,
    pub dns_primary: String,
    pub dns_secondary: String,
}

impl DeploymentConfig {
    /// Take CPU, memory and disk layout from the image.
    pub fn apply_image(&mut self, image: &OsImage) {
        self.image_id = image.id.clone();
        self.cpu_count = image.cpu_count;
        self.memory_gb = image.memory_gb;
        self.disks = image.disks.clone();
    }
}

/// One page of an asset's tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPage {
    pub items: Vec<Tag>,
    pub page_count: u32,
}

/// Response to a synchronous API request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub code: String,
    pub message: String,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            code: RESPONSE_CODE_OK.to_string(),
            message: "OK".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == RESPONSE_CODE_OK
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeDiskResponse {
    pub result: String,
    pub message: String,
}

impl ResizeDiskResponse {
    pub fn is_success(&self) -> bool {
        self.result == RESULT_SUCCESS
    }
}

/// Typed operations offered by the control plane. Implementations must be
/// safe to share between independent reconciliation runs.
#[async_trait]
pub trait ComputeClient: Send + Sync {
    async fn get_network_domain(&self, id: &str) -> Result<Option<NetworkDomain>, ClientError>;

    /// Exact-name lookup scoped to one data centre.
    async fn find_os_image(
        &self,
        name: &str,
        datacenter_id: &str,
    ) -> Result<Option<OsImage>, ClientError>;

    /// Returns the id of the new server.
    async fn deploy_server(&self, config: &DeploymentConfig) -> Result<String, ClientError>;

    async fn get_server(&self, id: &str) -> Result<Option<Server>, ClientError>;

    async fn reconfigure_server(
        &self,
        id: &str,
        memory_gb: Option<u32>,
        cpu_count: Option<u32>,
    ) -> Result<(), ClientError>;

    /// Returns the id of the new disk.
    async fn add_disk(
        &self,
        server_id: &str,
        scsi_unit_id: u32,
        size_gb: u32,
        speed: &str,
    ) -> Result<String, ClientError>;

    async fn resize_disk(
        &self,
        server_id: &str,
        disk_id: &str,
        size_gb: u32,
    ) -> Result<ResizeDiskResponse, ClientError>;

    async fn notify_ip_change(
        &self,
        adapter_id: &str,
        ipv4: Option<&str>,
        ipv6: Option<&str>,
    ) -> Result<(), ClientError>;

    async fn power_off_server(&self, id: &str) -> Result<(), ClientError>;

    async fn delete_server(&self, id: &str) -> Result<(), ClientError>;

    /// Pages are numbered from 1.
    async fn get_asset_tags(
        &self,
        asset_id: &str,
        asset_type: AssetType,
        page: u32,
    ) -> Result<TagPage, ClientError>;

    async fn apply_asset_tags(
        &self,
        asset_id: &str,
        asset_type: AssetType,
        tags: &[Tag],
    ) -> Result<ApiResponse, ClientError>;

    async fn remove_asset_tags(
        &self,
        asset_id: &str,
        asset_type: AssetType,
        names: &[String],
    ) -> Result<ApiResponse, ClientError>;

    /// Current representation of a pollable resource. Network adapters are
    /// addressed as `<server id>/<adapter id>`.
    async fn get_resource(
        &self,
        resource_type: ResourceType,
        id: &str,
    ) -> Result<Option<Resource>, ClientError>;
}
