#![allow(dead_code)]

use std::sync::Arc;
use stratus_common::{DeviceMapping, Image, MountSpec};
use stratus_orchestrator::{InstanceStateStore, Provisioner};
use stratus_providers::mock::MockControlPlane;
use stratus_providers::retry::{FixedJitter, RetryPolicy};

pub const IMAGE_ID: &str = "ami-data";

/// Boot volume plus one data volume at /data.
pub fn data_image() -> Image {
    Image {
        id: IMAGE_ID.to_string(),
        name: "data-image".to_string(),
        device_mappings: vec![
            DeviceMapping::new("/", "/dev/sda1"),
            DeviceMapping::new("/data", "/dev/sdb"),
        ],
    }
}

pub fn mounts(pairs: &[(&str, &str)]) -> MountSpec {
    pairs
        .iter()
        .map(|(m, v)| (m.to_string(), v.to_string()))
        .collect()
}

pub struct Harness {
    pub mock: Arc<MockControlPlane>,
    pub store: Arc<InstanceStateStore>,
    pub provisioner: Provisioner,
}

pub fn harness(max_retries: u32) -> Harness {
    let mock = Arc::new(MockControlPlane::new().with_image(data_image()));
    let store = Arc::new(InstanceStateStore::new());
    let policy = Arc::new(RetryPolicy::new(max_retries, Arc::new(FixedJitter(0))));
    let provisioner = Provisioner::new(mock.clone(), policy, store.clone());
    Harness {
        mock,
        store,
        provisioner,
    }
}
