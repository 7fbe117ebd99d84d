use std::fmt;
use std::time::Duration;
use stratus_providers::ProviderError;

use crate::state_store::StoreError;

/// Workflow step a provisioning failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    ResolveImage,
    ValidateMounts,
    EncodeEnv,
    Launch,
    AttachVolumes,
    Tag,
    Register,
}

impl ProvisionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStep::ResolveImage => "resolve-image",
            ProvisionStep::ValidateMounts => "validate-mounts",
            ProvisionStep::EncodeEnv => "encode-env",
            ProvisionStep::Launch => "launch",
            ProvisionStep::AttachVolumes => "attach-volumes",
            ProvisionStep::Tag => "tag",
            ProvisionStep::Register => "register",
        }
    }

    /// Steps from launch onwards may leave a remote resource behind.
    pub fn mutates_control_plane(&self) -> bool {
        !matches!(
            self,
            ProvisionStep::ResolveImage | ProvisionStep::ValidateMounts | ProvisionStep::EncodeEnv
        )
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VolumeAttachError {
    #[error("stopping instance for volume attach: {0}")]
    Stop(ProviderError),
    #[error("attaching volume {volume_id} at {mount_point}: {error}")]
    Attach {
        volume_id: String,
        mount_point: String,
        error: ProviderError,
    },
    #[error("starting instance after volume attach: {0}")]
    Start(ProviderError),
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("resolving image {image_id}: {error}")]
    ResourceLookup {
        image_id: String,
        error: ProviderError,
    },
    #[error("required mount point missing from input: {mount_point}")]
    Validation { mount_point: String },
    #[error("encoding instance env as user-data: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("launching instance: {0}")]
    Launch(ProviderError),
    #[error("expected 1 instance to be created, control plane reported {}", .instance_ids.len())]
    LaunchCountMismatch { instance_ids: Vec<String> },
    #[error("control plane reported an instance with an empty id")]
    EmptyInstanceId,
    #[error("attaching volumes to instance {instance_id}: {error}")]
    VolumeAttach {
        instance_id: String,
        error: VolumeAttachError,
    },
    #[error("tagging instance {instance_id}: {error}")]
    Tagging {
        instance_id: String,
        error: ProviderError,
    },
    #[error("registering instance: {0}")]
    Register(#[from] StoreError),
    #[error("provisioning did not finish within {after:?} (still in step {step})")]
    DeadlineExceeded { after: Duration, step: ProvisionStep },
}

impl ProvisionError {
    pub fn step(&self) -> ProvisionStep {
        match self {
            ProvisionError::ResourceLookup { .. } => ProvisionStep::ResolveImage,
            ProvisionError::Validation { .. } => ProvisionStep::ValidateMounts,
            ProvisionError::Encoding(_) => ProvisionStep::EncodeEnv,
            ProvisionError::Launch(_)
            | ProvisionError::LaunchCountMismatch { .. }
            | ProvisionError::EmptyInstanceId => ProvisionStep::Launch,
            ProvisionError::VolumeAttach { .. } => ProvisionStep::AttachVolumes,
            ProvisionError::Tagging { .. } => ProvisionStep::Tag,
            ProvisionError::Register(_) => ProvisionStep::Register,
            ProvisionError::DeadlineExceeded { step, .. } => *step,
        }
    }

    /// False when the failure happened before any mutating control-plane
    /// call, so the whole operation is safe to retry as-is. True means a
    /// remote resource may exist and cleanup was attempted.
    pub fn touched_control_plane(&self) -> bool {
        self.step().mutates_control_plane()
    }
}

/// A compensating terminate that failed. Logged, never returned.
#[derive(Debug)]
pub struct CompensationWarning {
    pub instance_id: String,
    pub error: ProviderError,
}

impl fmt::Display for CompensationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cleanup of instance {} failed, it may still be running: {}",
            self.instance_id, self.error
        )
    }
}
