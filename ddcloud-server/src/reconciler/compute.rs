//! Compute/network reconciler - CPU, memory and primary adapter addresses.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use super::waiter::{OperationHandle, OperationWaiter};
use crate::clients::{ComputeClient, NetworkAdapter, Resource, Server};
use crate::error::{ClientResultExt, ReconcileError, Result};
use crate::model::ServerSpec;

/// New CPU / memory values; `None` leaves a dimension alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ComputeChange {
    pub memory_gb: Option<u32>,
    pub cpu_count: Option<u32>,
}

impl ComputeChange {
    /// Only declared values that differ from the server count as changes.
    pub fn between(desired: &ServerSpec, observed: &Server) -> Self {
        Self {
            memory_gb: desired.memory_gb.filter(|m| *m != observed.memory_gb),
            cpu_count: desired.cpu_count.filter(|c| *c != observed.cpu_count),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.memory_gb.is_none() && self.cpu_count.is_none()
    }

    fn describe(&self) -> (String, String) {
        let memory = match self.memory_gb {
            Some(m) => format!("will change to {}GB", m),
            None => "no change".to_string(),
        };
        let cpu = match self.cpu_count {
            Some(c) => format!("will change to {}", c),
            None => "no change".to_string(),
        };
        (memory, cpu)
    }
}

/// New primary adapter addresses; `None` leaves a family alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressChange {
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

impl AddressChange {
    pub fn between(desired: &ServerSpec, observed: &NetworkAdapter) -> Self {
        Self {
            ipv4: desired
                .primary_adapter_ipv4
                .clone()
                .filter(|ip| *ip != observed.private_ipv4),
            ipv6: desired
                .primary_adapter_ipv6
                .clone()
                .filter(|ip| observed.private_ipv6.as_ref() != Some(ip)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }
}

pub struct ComputeReconciler {
    client: Arc<dyn ComputeClient>,
    waiter: OperationWaiter,
    update_timeout: Duration,
    adapter_timeout: Duration,
}

impl ComputeReconciler {
    pub fn new(
        client: Arc<dyn ComputeClient>,
        waiter: OperationWaiter,
        update_timeout: Duration,
        adapter_timeout: Duration,
    ) -> Self {
        Self {
            client,
            waiter,
            update_timeout,
            adapter_timeout,
        }
    }

    /// Change CPU and/or memory and wait for the server to converge.
    /// Returns the refreshed server.
    pub async fn reconfigure(&self, server_id: &str, change: ComputeChange) -> Result<Server> {
        if change.is_empty() {
            return Err(ReconcileError::InvalidSpec {
                field: "compute".to_string(),
                reason: "reconfigure needs a memory or CPU change".to_string(),
            });
        }

        let (memory, cpu) = change.describe();
        info!(
            "Update configuration for server '{}' (memory: {}, CPU: {})...",
            server_id, memory, cpu
        );
        self.client
            .reconfigure_server(server_id, change.memory_gb, change.cpu_count)
            .await
            .for_server(server_id)?;

        let handle = OperationHandle::server(server_id, "Reconfigure server");
        match self.waiter.wait(&handle, self.update_timeout).await? {
            Resource::Server(server) => Ok(server),
            Resource::NetworkAdapter(_) => Err(ReconcileError::NotFound {
                kind: "server",
                id: server_id.to_string(),
            }),
        }
    }

    /// Tell the control plane the primary adapter's addresses changed. The
    /// operation converges on the adapter, not the server.
    pub async fn readdress(&self, server: &Server, change: &AddressChange) -> Result<NetworkAdapter> {
        if change.is_empty() {
            return Err(ReconcileError::InvalidSpec {
                field: "primary_adapter".to_string(),
                reason: "readdress needs an IPv4 or IPv6 change".to_string(),
            });
        }

        let adapter_id = &server.primary_adapter.id;
        info!(
            server_id = %server.id,
            adapter_id = %adapter_id,
            ipv4 = change.ipv4.as_deref().unwrap_or("-"),
            ipv6 = change.ipv6.as_deref().unwrap_or("-"),
            "Updating primary adapter addresses"
        );
        self.client
            .notify_ip_change(adapter_id, change.ipv4.as_deref(), change.ipv6.as_deref())
            .await
            .for_server(&server.id)?;

        let handle =
            OperationHandle::network_adapter(&server.id, adapter_id, "Update adapter IP address");
        match self.waiter.wait(&handle, self.adapter_timeout).await? {
            Resource::NetworkAdapter(adapter) => Ok(adapter),
            Resource::Server(_) => Err(ReconcileError::NotFound {
                kind: "network adapter",
                id: handle.resource_id,
            }),
        }
    }
}
