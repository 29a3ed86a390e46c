//! The caller's persisted record of a server and the checkpoints that
//! advance it.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::model::{Disk, ServerSpec, Tag};

/// Lifecycle phase of a server record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecyclePhase {
    Absent,
    Creating,
    Present,
    Updating,
    Deleting,
}

impl LifecyclePhase {
    /// Whether `self -> to` is a legal edge. Re-entry edges allow an
    /// interrupted update or delete to be run again.
    pub fn can_transition_to(self, to: LifecyclePhase) -> bool {
        use LifecyclePhase::*;
        matches!(
            (self, to),
            (Absent, Creating)
                | (Creating, Present)
                | (Present, Updating)
                | (Updating, Present)
                | (Updating, Updating)
                | (Present, Deleting)
                | (Creating, Deleting)
                | (Updating, Deleting)
                | (Deleting, Deleting)
                | (Deleting, Absent)
        )
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecyclePhase::Absent => "absent",
            LifecyclePhase::Creating => "creating",
            LifecyclePhase::Present => "present",
            LifecyclePhase::Updating => "updating",
            LifecyclePhase::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

/// A sub-step that has converged and must be recorded before the next
/// one starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkpoint {
    Phase(LifecyclePhase),
    ImageResolved {
        image_id: String,
        datacenter_id: String,
    },
    ServerDeployed {
        server_id: String,
    },
    PrimaryAddress {
        ipv4: Option<String>,
        ipv6: Option<String>,
    },
    Compute {
        memory_gb: Option<u32>,
        cpu_count: Option<u32>,
    },
    ImageDisks(Vec<Disk>),
    AdditionalDisks(Vec<Disk>),
    Tags(Vec<Tag>),
}

impl Checkpoint {
    pub fn label(&self) -> &'static str {
        match self {
            Checkpoint::Phase(_) => "phase",
            Checkpoint::ImageResolved { .. } => "os_image_id",
            Checkpoint::ServerDeployed { .. } => "id",
            Checkpoint::PrimaryAddress { .. } => "primary_adapter",
            Checkpoint::Compute { .. } => "compute",
            Checkpoint::ImageDisks(_) => "image_disks",
            Checkpoint::AdditionalDisks(_) => "additional_disks",
            Checkpoint::Tags(_) => "tags",
        }
    }
}

/// Persisted record of a server: the declared state as far as it is known
/// to have converged, plus attributes computed by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub phase: LifecyclePhase,
    pub spec: ServerSpec,
    #[serde(default)]
    pub os_image_id: Option<String>,
    #[serde(default)]
    pub datacenter_id: Option<String>,
    #[serde(default)]
    pub updated_at: String,
}

impl ServerRecord {
    /// A record for a server that does not exist yet.
    pub fn new(spec: ServerSpec) -> Self {
        Self {
            id: None,
            phase: LifecyclePhase::Absent,
            spec,
            os_image_id: None,
            datacenter_id: None,
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    /// Apply a checkpoint, returning the updated record.
    pub fn apply(mut self, checkpoint: Checkpoint) -> Result<Self> {
        match checkpoint {
            Checkpoint::Phase(to) => {
                if !self.phase.can_transition_to(to) {
                    return Err(ReconcileError::InvalidTransition {
                        server_id: self.id.clone(),
                        from: self.phase,
                        to,
                    });
                }
                self.phase = to;
                if to == LifecyclePhase::Absent {
                    self.id = None;
                }
            }
            Checkpoint::ImageResolved {
                image_id,
                datacenter_id,
            } => {
                self.os_image_id = Some(image_id);
                self.datacenter_id = Some(datacenter_id);
            }
            Checkpoint::ServerDeployed { server_id } => self.id = Some(server_id),
            Checkpoint::PrimaryAddress { ipv4, ipv6 } => {
                if ipv4.is_some() {
                    self.spec.primary_adapter_ipv4 = ipv4;
                }
                if ipv6.is_some() {
                    self.spec.primary_adapter_ipv6 = ipv6;
                }
            }
            Checkpoint::Compute {
                memory_gb,
                cpu_count,
            } => {
                if memory_gb.is_some() {
                    self.spec.memory_gb = memory_gb;
                }
                if cpu_count.is_some() {
                    self.spec.cpu_count = cpu_count;
                }
            }
            Checkpoint::ImageDisks(disks) => self.spec.image_disks = disks,
            Checkpoint::AdditionalDisks(disks) => self.spec.additional_disks = disks,
            Checkpoint::Tags(tags) => self.spec.tags = tags,
        }
        self.updated_at = Utc::now().to_rfc3339();
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OsImage;

    fn record() -> ServerRecord {
        ServerRecord::new(ServerSpec {
            name: "db-01".to_string(),
            description: "database".to_string(),
            admin_password: "pw".to_string(),
            network_domain_id: "nd-1".to_string(),
            memory_gb: None,
            cpu_count: Some(4),
            os_image: OsImage::Name("CentOS 7".to_string()),
            primary_adapter_vlan: None,
            primary_adapter_ipv4: None,
            primary_adapter_ipv6: None,
            dns_primary: String::new(),
            dns_secondary: String::new(),
            auto_start: false,
            image_disks: vec![],
            additional_disks: vec![],
            tags: vec![],
        })
    }

    #[test]
    fn test_phase_edges() {
        use LifecyclePhase::*;
        assert!(Absent.can_transition_to(Creating));
        assert!(Updating.can_transition_to(Present));
        assert!(!Absent.can_transition_to(Present));
        assert!(!Present.can_transition_to(Creating));
        assert!(!Deleting.can_transition_to(Present));
    }

    #[test]
    fn test_skipping_a_phase_is_rejected() {
        let err = record()
            .apply(Checkpoint::Phase(LifecyclePhase::Present))
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::InvalidTransition {
                from: LifecyclePhase::Absent,
                to: LifecyclePhase::Present,
                ..
            }
        ));
    }

    #[test]
    fn test_compute_checkpoint_keeps_undeclared_dimension() {
        let r = record()
            .apply(Checkpoint::Compute {
                memory_gb: Some(8),
                cpu_count: None,
            })
            .unwrap();
        assert_eq!(r.spec.memory_gb, Some(8));
        assert_eq!(r.spec.cpu_count, Some(4));
    }

    #[test]
    fn test_absent_clears_id() {
        let r = record()
            .apply(Checkpoint::Phase(LifecyclePhase::Creating))
            .and_then(|r| {
                r.apply(Checkpoint::ServerDeployed {
                    server_id: "srv-9".to_string(),
                })
            })
            .and_then(|r| r.apply(Checkpoint::Phase(LifecyclePhase::Deleting)))
            .and_then(|r| r.apply(Checkpoint::Phase(LifecyclePhase::Absent)))
            .unwrap();
        assert_eq!(r.id, None);
        assert_eq!(r.phase, LifecyclePhase::Absent);
    }

    #[test]
    fn test_record_round_trips_through_json() {
        let r = record();
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"ABSENT\""));
        let back: ServerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
