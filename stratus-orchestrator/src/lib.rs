pub mod api;
mod compensation;
pub mod error;
pub mod provider_manager;
pub mod provisioner;
pub mod settings;
pub mod state_store;
pub mod volume_attacher;

pub use error::{CompensationWarning, ProvisionError, ProvisionStep, VolumeAttachError};
pub use provisioner::Provisioner;
pub use state_store::{InstanceStateStore, StoreError};
pub use volume_attacher::VolumeAttacher;
