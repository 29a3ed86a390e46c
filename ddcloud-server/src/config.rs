//! Timeout ceilings and polling cadence.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconciler configuration. Every ceiling is per operation kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Server deployment.
    pub create_timeout_secs: u64,
    /// Reconfigure, add disk, resize disk.
    pub update_timeout_secs: u64,
    /// Network adapter IP change.
    pub adapter_update_timeout_secs: u64,
    pub delete_timeout_secs: u64,
    /// Power off before delete.
    pub shutdown_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            create_timeout_secs: 30 * 60,
            update_timeout_secs: 10 * 60,
            adapter_update_timeout_secs: 5 * 60,
            delete_timeout_secs: 15 * 60,
            shutdown_timeout_secs: 5 * 60,
            poll_interval_ms: 5_000,
        }
    }
}

impl ReconcilerConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }

    pub fn adapter_update_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_update_timeout_secs)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Never zero, so the waiter cannot busy-loop.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.create_timeout(), Duration::from_secs(1800));
        assert_eq!(config.delete_timeout(), Duration::from_secs(900));
        assert!(config.adapter_update_timeout() < Duration::from_secs(600));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ReconcilerConfig =
            serde_json::from_str(r#"{"poll_interval_ms": 0, "delete_timeout_secs": 60}"#).unwrap();
        assert_eq!(config.delete_timeout(), Duration::from_secs(60));
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
        assert_eq!(config.update_timeout_secs, 600);
    }
}
