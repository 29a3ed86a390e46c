//! Waits for accepted operations to converge.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clients::{ComputeClient, Resource, ResourceType};
use crate::error::{ClientResultExt, ReconcileError, Result};

/// Ceilings beyond this are clamped, so any configured timeout yields a
/// representable deadline.
const MAX_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// An operation the control plane has accepted but not yet completed.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    pub resource_type: ResourceType,
    pub resource_id: String,
    /// Human-readable label used in logs and timeout errors.
    pub action: String,
    started: Instant,
}

impl OperationHandle {
    pub fn new(
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.into(),
            action: action.into(),
            started: Instant::now(),
        }
    }

    pub fn server(server_id: &str, action: impl Into<String>) -> Self {
        Self::new(ResourceType::Server, server_id, action)
    }

    /// Adapter operations converge on the adapter, addressed through its
    /// server.
    pub fn network_adapter(server_id: &str, adapter_id: &str, action: impl Into<String>) -> Self {
        Self::new(
            ResourceType::NetworkAdapter,
            format!("{}/{}", server_id, adapter_id),
            action,
        )
    }

    pub fn server_id(&self) -> &str {
        match self.resource_type {
            ResourceType::Server => &self.resource_id,
            ResourceType::NetworkAdapter => self
                .resource_id
                .split_once('/')
                .map(|(server, _)| server)
                .unwrap_or(&self.resource_id),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn deadline(&self, timeout: Duration) -> Instant {
        self.started
            .checked_add(timeout.min(MAX_WAIT))
            .unwrap_or(self.started)
    }
}

/// Polls the control plane until an operation reaches a terminal state.
#[derive(Clone)]
pub struct OperationWaiter {
    client: Arc<dyn ComputeClient>,
    poll_interval: Duration,
}

impl OperationWaiter {
    pub fn new(client: Arc<dyn ComputeClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Wait for the resource to leave its pending state, returning the
    /// refreshed resource on success.
    pub async fn wait(&self, handle: &OperationHandle, timeout: Duration) -> Result<Resource> {
        let deadline = handle.deadline(timeout);
        debug!(
            resource_id = %handle.resource_id,
            action = %handle.action,
            timeout_secs = timeout.as_secs(),
            "Waiting for operation"
        );

        loop {
            let resource = self
                .client
                .get_resource(handle.resource_type, &handle.resource_id)
                .await
                .for_server(handle.server_id())?
                .ok_or_else(|| ReconcileError::NotFound {
                    kind: handle.resource_type.as_str(),
                    id: handle.resource_id.clone(),
                })?;

            let state = resource.state();
            if state.is_failed() {
                let reason = resource
                    .failure_reason()
                    .map(str::to_string)
                    .unwrap_or_else(|| state.to_string());
                warn!(
                    resource_id = %handle.resource_id,
                    action = %handle.action,
                    reason = %reason,
                    "Operation failed"
                );
                return Err(self.failed(handle, reason));
            }
            if !state.is_pending() {
                info!(
                    resource_id = %handle.resource_id,
                    action = %handle.action,
                    elapsed_ms = handle.elapsed().as_millis() as u64,
                    "Operation converged"
                );
                return Ok(resource);
            }

            debug!(resource_id = %handle.resource_id, state = %state, "Operation still pending");
            self.pause(handle, deadline).await?;
        }
    }

    /// Wait for the resource to disappear.
    pub async fn wait_for_delete(&self, handle: &OperationHandle, timeout: Duration) -> Result<()> {
        let deadline = handle.deadline(timeout);

        loop {
            let resource = self
                .client
                .get_resource(handle.resource_type, &handle.resource_id)
                .await
                .for_server(handle.server_id())?;

            let Some(resource) = resource else {
                info!(
                    resource_id = %handle.resource_id,
                    elapsed_ms = handle.elapsed().as_millis() as u64,
                    "Resource deleted"
                );
                return Ok(());
            };

            let state = resource.state();
            if state.is_failed() {
                let reason = resource
                    .failure_reason()
                    .map(str::to_string)
                    .unwrap_or_else(|| state.to_string());
                return Err(self.failed(handle, reason));
            }

            debug!(resource_id = %handle.resource_id, state = %state, "Delete still pending");
            self.pause(handle, deadline).await?;
        }
    }

    async fn pause(&self, handle: &OperationHandle, deadline: Instant) -> Result<()> {
        let now = Instant::now();
        if now >= deadline {
            warn!(
                resource_id = %handle.resource_id,
                action = %handle.action,
                "Timeout waiting for operation"
            );
            return Err(ReconcileError::OperationTimeout {
                resource_type: handle.resource_type,
                resource_id: handle.resource_id.clone(),
                action: handle.action.clone(),
                elapsed: handle.elapsed(),
            });
        }
        tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        Ok(())
    }

    fn failed(&self, handle: &OperationHandle, reason: String) -> ReconcileError {
        ReconcileError::RemoteOperationFailed {
            resource_type: handle.resource_type,
            resource_id: handle.resource_id.clone(),
            action: handle.action.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{NetworkAdapter, ResourceState, Server, SimulatedCloud};

    fn server(id: &str, state: ResourceState, reason: Option<&str>) -> Server {
        Server {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            network_domain_id: "nd-1".to_string(),
            datacenter_id: "NA9".to_string(),
            source_image_id: "img-1".to_string(),
            memory_gb: 4,
            cpu_count: 2,
            disks: vec![],
            primary_adapter: NetworkAdapter {
                id: "nic-1".to_string(),
                vlan_id: "vlan-1".to_string(),
                private_ipv4: "10.0.0.5".to_string(),
                private_ipv6: None,
                state: ResourceState::Normal,
                failure_reason: None,
            },
            started: true,
            state,
            failure_reason: reason.map(str::to_string),
        }
    }

    fn waiter(cloud: Arc<SimulatedCloud>) -> OperationWaiter {
        OperationWaiter::new(cloud, Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_on_stuck_resource() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud
            .insert_server(server("srv-1", ResourceState::PendingChange, None))
            .await;

        let handle = OperationHandle::server("srv-1", "Resize disk");
        let timeout = Duration::from_secs(60);
        let err = waiter(cloud).wait(&handle, timeout).await.unwrap_err();

        match err {
            ReconcileError::OperationTimeout {
                action, elapsed, ..
            } => {
                assert_eq!(action, "Resize disk");
                assert!(elapsed >= timeout);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_reports_remote_failure_reason() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud
            .insert_server(server(
                "srv-2",
                ResourceState::FailedChange,
                Some("insufficient capacity"),
            ))
            .await;

        let handle = OperationHandle::server("srv-2", "Reconfigure server");
        let err = waiter(cloud)
            .wait(&handle, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::RemoteOperationFailed { ref reason, .. } if reason == "insufficient capacity"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_refreshed_resource() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud
            .insert_server(server("srv-3", ResourceState::Normal, None))
            .await;

        let handle = OperationHandle::server("srv-3", "Deploy server");
        let resource = waiter(cloud)
            .wait(&handle, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(resource.into_server().unwrap().id, "srv-3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_delete_of_missing_resource() {
        let cloud = Arc::new(SimulatedCloud::new());
        let handle = OperationHandle::server("gone", "Delete server");
        waiter(cloud)
            .wait_for_delete(&handle, Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_accepts_unbounded_timeout() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud
            .insert_server(server("srv-5", ResourceState::Normal, None))
            .await;

        let handle = OperationHandle::server("srv-5", "Deploy server");
        let waiter = waiter(cloud);
        waiter.wait(&handle, Duration::MAX).await.unwrap();

        let gone = OperationHandle::server("gone", "Delete server");
        waiter.wait_for_delete(&gone, Duration::MAX).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_clamped() {
        let handle = OperationHandle::server("srv-6", "Deploy server");
        assert_eq!(handle.deadline(Duration::MAX), handle.started + MAX_WAIT);
        assert_eq!(
            handle.deadline(Duration::from_secs(60)),
            handle.started + Duration::from_secs(60)
        );
    }

    #[test]
    fn test_adapter_handle_server_id() {
        let handle = OperationHandle::network_adapter("srv-4", "nic-9", "Update adapter IP address");
        assert_eq!(handle.resource_id, "srv-4/nic-9");
        assert_eq!(handle.server_id(), "srv-4");
    }
}
