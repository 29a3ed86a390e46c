//! Tag reconciler - upserts declared tags and removes stale ones.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::snapshot::read_tags;
use crate::clients::{AssetType, ComputeClient};
use crate::error::{ClientResultExt, ReconcileError, Result};
use crate::model::{tags_by_name, Tag};

/// Tags are keyed by name. A changed value is corrected by the upsert and
/// never appears in `remove`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagDiff {
    pub upsert: Vec<Tag>,
    pub remove: Vec<String>,
}

pub fn diff_tags(desired: &[Tag], observed: &[Tag]) -> TagDiff {
    let keep: BTreeSet<&str> = desired.iter().map(|t| t.name.as_str()).collect();
    let remove = observed
        .iter()
        .map(|t| t.name.as_str())
        .filter(|name| !keep.contains(name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect();

    TagDiff {
        upsert: desired.to_vec(),
        remove,
    }
}

/// Whether the two sets differ by name or value.
pub fn tags_differ(desired: &[Tag], observed: &[Tag]) -> bool {
    tags_by_name(desired) != tags_by_name(observed)
}

pub struct TagReconciler {
    client: Arc<dyn ComputeClient>,
}

impl TagReconciler {
    pub fn new(client: Arc<dyn ComputeClient>) -> Self {
        Self { client }
    }

    /// One batched upsert of every declared tag, then one batched removal
    /// if anything is left over. A non-OK response code fails the step even
    /// though the request itself went through.
    pub async fn reconcile(&self, server_id: &str, desired: &[Tag]) -> Result<()> {
        info!("Configuring tags for server '{}'...", server_id);

        let observed = read_tags(self.client.as_ref(), server_id).await?;
        let diff = diff_tags(desired, &observed);

        if !diff.upsert.is_empty() {
            info!("Applying {} tags to server '{}'...", diff.upsert.len(), server_id);
            let response = self
                .client
                .apply_asset_tags(server_id, AssetType::Server, &diff.upsert)
                .await
                .for_server(server_id)?;
            if !response.is_ok() {
                return Err(ReconcileError::TagApply {
                    server_id: server_id.to_string(),
                    names: diff.upsert.iter().map(|t| t.name.clone()).collect(),
                    code: response.code,
                    message: response.message,
                });
            }
        }

        if !diff.remove.is_empty() {
            info!(
                "Removing {} unused tags from server '{}'...",
                diff.remove.len(),
                server_id
            );
            let response = self
                .client
                .remove_asset_tags(server_id, AssetType::Server, &diff.remove)
                .await
                .for_server(server_id)?;
            if !response.is_ok() {
                return Err(ReconcileError::TagRemove {
                    server_id: server_id.to_string(),
                    names: diff.remove.clone(),
                    code: response.code,
                    message: response.message,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_upserts_changed_value_and_removes_stale() {
        let desired = vec![Tag::new("a", "1"), Tag::new("b", "2")];
        let observed = vec![Tag::new("b", "9"), Tag::new("c", "3")];

        let diff = diff_tags(&desired, &observed);
        assert_eq!(diff.upsert, desired);
        assert_eq!(diff.remove, vec!["c".to_string()]);
    }

    #[test]
    fn test_diff_with_no_desired_tags_removes_everything() {
        let observed = vec![Tag::new("owner", "ops"), Tag::new("env", "prod")];
        let diff = diff_tags(&[], &observed);
        assert!(diff.upsert.is_empty());
        assert_eq!(diff.remove, vec!["env".to_string(), "owner".to_string()]);
    }

    #[test]
    fn test_tags_differ_by_value_only() {
        let a = vec![Tag::new("env", "prod")];
        let b = vec![Tag::new("env", "staging")];
        assert!(tags_differ(&a, &b));
        assert!(!tags_differ(&a, &a.clone()));
    }
}
