use async_trait::async_trait;
use std::collections::BTreeMap;
use stratus_common::Image;

pub mod retry;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// Failure reported by the control plane (or the transport in front of it).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("control plane returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("request throttled: {0}")]
    Throttled(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Retryable according to the error kind alone (status codes are judged by the retry policy).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transport(_))
    }

    /// Explicit throttle signal from the collaborator.
    pub fn is_throttle(&self) -> bool {
        matches!(self, ProviderError::Throttled(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// Resource-lifecycle operations of the remote control plane.
///
/// Implementations do not retry on their own; wrap them in
/// [`retry::RetryingControlPlane`] to get backoff on transient failures.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn lookup_image(&self, image_id: &str) -> Result<Image, ProviderError>;

    /// Launches `count` instances from `image_id` and returns the ids the
    /// control plane reports. `user_data` is an opaque, already-encoded blob.
    async fn create_instances(
        &self,
        image_id: &str,
        count: u32,
        user_data: &str,
    ) -> Result<Vec<String>, ProviderError>;

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), ProviderError>;
    async fn stop_instance(&self, instance_id: &str) -> Result<(), ProviderError>;
    async fn start_instance(&self, instance_id: &str) -> Result<(), ProviderError>;

    // Only valid while the instance is stopped on this provider.
    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        mount_point: &str,
    ) -> Result<(), ProviderError>;

    async fn create_tags(
        &self,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError>;
}
