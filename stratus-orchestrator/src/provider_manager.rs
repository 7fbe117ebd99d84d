use std::sync::Arc;
use stratus_providers::ControlPlane;

pub struct ProviderManager;

impl ProviderManager {
    /// Builds the control plane named `provider_name`. `Ok(None)` means the
    /// provider is unknown or was not compiled in.
    pub fn get_provider(provider_name: &str) -> anyhow::Result<Option<Arc<dyn ControlPlane>>> {
        match provider_name.to_lowercase().as_str() {
            #[cfg(feature = "provider-mock")]
            "mock" => Ok(Some(mock::build()?)),
            // Add other providers here.
            _ => Ok(None),
        }
    }
}

#[cfg(feature = "provider-mock")]
mod mock {
    use anyhow::Context;
    use std::sync::Arc;
    use stratus_common::{DeviceMapping, Image};
    use stratus_providers::mock::MockControlPlane;
    use stratus_providers::ControlPlane;

    /// Seeds the mock from MOCK_IMAGES (JSON array of images), falling back
    /// to a single root-only image.
    pub(super) fn build() -> anyhow::Result<Arc<dyn ControlPlane>> {
        let images = match std::env::var("MOCK_IMAGES") {
            Ok(raw) if !raw.trim().is_empty() => parse_images(&raw)?,
            _ => vec![default_image()],
        };
        let provider = MockControlPlane::new();
        for image in images {
            tracing::info!(image_id = %image.id, "seeding mock image");
            provider.insert_image(image);
        }
        Ok(Arc::new(provider))
    }

    pub(super) fn parse_images(raw: &str) -> anyhow::Result<Vec<Image>> {
        serde_json::from_str(raw).context("MOCK_IMAGES must be a JSON array of images")
    }

    fn default_image() -> Image {
        Image {
            id: "ami-mock".to_string(),
            name: "mock-base".to_string(),
            device_mappings: vec![DeviceMapping::new("/", "/dev/sda1")],
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_none() {
        assert!(ProviderManager::get_provider("scaleway").unwrap().is_none());
    }
}
