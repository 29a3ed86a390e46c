//! Reads the current remote state of a server.

use std::sync::Arc;

use tracing::debug;

use crate::clients::{AssetType, ComputeClient};
use crate::error::{ClientResultExt, ReconcileError, Result};
use crate::model::{ServerObservedState, Tag};

pub struct SnapshotReader {
    client: Arc<dyn ComputeClient>,
}

impl SnapshotReader {
    pub fn new(client: Arc<dyn ComputeClient>) -> Self {
        Self { client }
    }

    /// Fetch server configuration, disks, adapter and tags. An unknown id
    /// is reported as `NotFound`; transport failures are never retried here.
    pub async fn read(&self, server_id: &str) -> Result<ServerObservedState> {
        debug!("Reading server {}", server_id);
        let server = self
            .client
            .get_server(server_id)
            .await
            .for_server(server_id)?
            .ok_or_else(|| ReconcileError::NotFound {
                kind: "server",
                id: server_id.to_string(),
            })?;

        let tags = read_tags(self.client.as_ref(), server_id).await?;
        Ok(ServerObservedState { server, tags })
    }
}

/// Read a server's tags. Only single-page listings are supported; a listing
/// that reports more pages fails instead of silently dropping tags.
pub async fn read_tags(client: &dyn ComputeClient, server_id: &str) -> Result<Vec<Tag>> {
    let page = client
        .get_asset_tags(server_id, AssetType::Server, 1)
        .await
        .for_server(server_id)?;

    if page.page_count > 1 {
        return Err(ReconcileError::UnsupportedFeature {
            server_id: Some(server_id.to_string()),
            feature: format!("tag listings spanning {} pages", page.page_count),
        });
    }

    debug!("Read {} tags for server {}", page.items.len(), server_id);
    Ok(page.items)
}
