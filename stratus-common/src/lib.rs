use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mount point of the boot volume. Never bound to a caller-supplied volume.
pub const ROOT_MOUNT_POINT: &str = "/";

/// Correlation tag written on every provisioned instance (value = instance id).
pub const INSTANCE_ID_TAG: &str = "STRATUS_INSTANCE_ID";

/// Display-name tag understood by the provider console.
pub const NAME_TAG: &str = "Name";

/// Mount point -> volume id, as supplied by the caller.
pub type MountSpec = BTreeMap<String, String>;

/// Environment handed to the instance through user-data.
/// Ordered so the serialized payload is stable byte-for-byte.
pub type EnvMap = BTreeMap<String, String>;

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,    // Launch accepted, not yet confirmed running
    Running,
    Stopped,
    Terminated,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Infrastructure {
    Aws,
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeviceMapping {
    pub mount_point: String,
    #[serde(default)]
    pub device_name: String,
}

impl DeviceMapping {
    pub fn new(mount_point: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
            device_name: device_name.into(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.mount_point == ROOT_MOUNT_POINT
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub device_mappings: Vec<DeviceMapping>,
}

impl Image {
    /// Mount points the caller has to bind a volume to (everything but the boot volume).
    pub fn required_mount_points(&self) -> impl Iterator<Item = &str> {
        self.device_mappings
            .iter()
            .filter(|m| !m.is_root())
            .map(|m| m.mount_point.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub state: InstanceState,
    pub infrastructure: Infrastructure,
    pub image_id: String,
    pub created: DateTime<Utc>,
}
