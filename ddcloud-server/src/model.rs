//! Desired and observed server state.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::clients::Server;
use crate::error::{ReconcileError, Result};

/// Speed class used when a disk does not declare one.
pub const DEFAULT_DISK_SPEED: &str = "STANDARD";

fn default_disk_speed() -> String {
    DEFAULT_DISK_SPEED.to_string()
}

/// A server disk. The SCSI unit id is the join key between desired and
/// observed disks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Assigned by the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub scsi_unit_id: u32,
    pub size_gb: u32,
    #[serde(default = "default_disk_speed")]
    pub speed: String,
}

impl Disk {
    pub fn new(scsi_unit_id: u32, size_gb: u32) -> Self {
        Self {
            id: None,
            scsi_unit_id,
            size_gb,
            speed: default_disk_speed(),
        }
    }

    pub fn with_speed(mut self, speed: impl Into<String>) -> Self {
        self.speed = speed.into();
        self
    }
}

/// Index disks by SCSI unit id.
pub fn disks_by_unit(disks: &[Disk]) -> BTreeMap<u32, Disk> {
    disks
        .iter()
        .map(|d| (d.scsi_unit_id, d.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Index tags by name.
pub fn tags_by_name(tags: &[Tag]) -> BTreeMap<String, String> {
    tags.iter()
        .map(|t| (t.name.clone(), t.value.clone()))
        .collect()
}

/// OS image reference. Exactly one of id or name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsImage {
    Id(String),
    Name(String),
}

/// Declared configuration of a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub admin_password: String,
    pub network_domain_id: String,
    /// Taken from the image when not declared.
    #[serde(default)]
    pub memory_gb: Option<u32>,
    #[serde(default)]
    pub cpu_count: Option<u32>,
    pub os_image: OsImage,
    #[serde(default)]
    pub primary_adapter_vlan: Option<String>,
    /// Assigned by the control plane when absent.
    #[serde(default)]
    pub primary_adapter_ipv4: Option<String>,
    #[serde(default)]
    pub primary_adapter_ipv6: Option<String>,
    #[serde(default)]
    pub dns_primary: String,
    #[serde(default)]
    pub dns_secondary: String,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub image_disks: Vec<Disk>,
    #[serde(default)]
    pub additional_disks: Vec<Disk>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl ServerSpec {
    /// Check the declared configuration once, before any remote call.
    pub fn validate(&self) -> Result<()> {
        require_non_empty("name", &self.name)?;
        require_non_empty("admin_password", &self.admin_password)?;
        require_non_empty("network_domain_id", &self.network_domain_id)?;

        match &self.os_image {
            OsImage::Id(id) => require_non_empty("os_image.id", id)?,
            OsImage::Name(name) => require_non_empty("os_image.name", name)?,
        }

        if self.memory_gb == Some(0) {
            return Err(invalid("memory_gb", "must be greater than zero"));
        }
        if self.cpu_count == Some(0) {
            return Err(invalid("cpu_count", "must be greater than zero"));
        }

        let mut units = HashSet::new();
        let disks = self
            .image_disks
            .iter()
            .map(|d| ("image_disks", d))
            .chain(self.additional_disks.iter().map(|d| ("additional_disks", d)));
        for (group, disk) in disks {
            if !units.insert(disk.scsi_unit_id) {
                return Err(invalid(
                    group,
                    format!("duplicate SCSI unit {}", disk.scsi_unit_id),
                ));
            }
            if disk.size_gb == 0 {
                return Err(invalid(
                    group,
                    format!("disk at SCSI unit {} has zero size", disk.scsi_unit_id),
                ));
            }
        }

        let mut names = HashSet::new();
        for tag in &self.tags {
            if tag.name.is_empty() {
                return Err(invalid("tags", "tag name must not be empty"));
            }
            if !names.insert(tag.name.as_str()) {
                return Err(invalid("tags", format!("duplicate tag '{}'", tag.name)));
            }
        }

        Ok(())
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(())
}

fn invalid(field: &str, reason: impl Into<String>) -> ReconcileError {
    ReconcileError::InvalidSpec {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// What the control plane currently reports for a server, tags included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerObservedState {
    pub server: Server,
    pub tags: Vec<Tag>,
}

impl ServerObservedState {
    pub fn disks_by_unit(&self) -> BTreeMap<u32, Disk> {
        disks_by_unit(&self.server.disks)
    }
}
