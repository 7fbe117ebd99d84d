use std::sync::Arc;
use stratus_common::MountSpec;
use stratus_providers::ControlPlane;

use crate::error::VolumeAttachError;

/// Binds volumes to an instance. The provider cannot attach to a running
/// instance, so the sequence is stop -> attach each volume -> start.
///
/// A failure aborts immediately. Volumes attached earlier stay attached; the
/// caller cleans up by terminating the whole instance.
#[derive(Clone)]
pub struct VolumeAttacher {
    control_plane: Arc<dyn ControlPlane>,
}

impl VolumeAttacher {
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self { control_plane }
    }

    pub async fn attach(
        &self,
        instance_id: &str,
        mounts: &MountSpec,
    ) -> Result<(), VolumeAttachError> {
        tracing::debug!(instance_id, "stopping instance for volume attach");
        self.control_plane
            .stop_instance(instance_id)
            .await
            .map_err(VolumeAttachError::Stop)?;

        for (mount_point, volume_id) in mounts {
            tracing::debug!(
                instance_id,
                volume_id = %volume_id,
                mount_point = %mount_point,
                "attaching volume"
            );
            self.control_plane
                .attach_volume(volume_id, instance_id, mount_point)
                .await
                .map_err(|error| VolumeAttachError::Attach {
                    volume_id: volume_id.clone(),
                    mount_point: mount_point.clone(),
                    error,
                })?;
        }

        tracing::debug!(instance_id, "starting instance after volume attach");
        self.control_plane
            .start_instance(instance_id)
            .await
            .map_err(VolumeAttachError::Start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::{DeviceMapping, Image, InstanceState};
    use stratus_providers::mock::{Call, MockControlPlane, Operation};
    use stratus_providers::ProviderError;

    async fn launched() -> Arc<MockControlPlane> {
        let mock = Arc::new(MockControlPlane::new().with_image(Image {
            id: "ami-1".into(),
            name: "base".into(),
            device_mappings: vec![DeviceMapping::new("/", "/dev/sda1")],
        }));
        mock.script_launch(vec!["i-1".into()]);
        mock.create_instances("ami-1", 1, "").await.unwrap();
        mock
    }

    fn mounts(pairs: &[(&str, &str)]) -> MountSpec {
        pairs
            .iter()
            .map(|(m, v)| (m.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn stops_attaches_then_starts() {
        let mock = launched().await;
        let attacher = VolumeAttacher::new(mock.clone());
        attacher
            .attach("i-1", &mounts(&[("/data", "vol-1"), ("/logs", "vol-2")]))
            .await
            .unwrap();

        let ops: Vec<Operation> = mock
            .mutating_calls()
            .iter()
            .skip(1) // launch
            .map(Call::operation)
            .collect();
        assert_eq!(
            ops,
            vec![
                Operation::StopInstance,
                Operation::AttachVolume,
                Operation::AttachVolume,
                Operation::StartInstance,
            ]
        );
        assert_eq!(mock.attached_volumes("i-1").len(), 2);
        assert_eq!(mock.instance_state("i-1"), Some(InstanceState::Running));
    }

    #[tokio::test]
    async fn attach_failure_aborts_without_starting() {
        let mock = launched().await;
        mock.fail_next(Operation::AttachVolume, ProviderError::Rejected("busy".into()));
        let attacher = VolumeAttacher::new(mock.clone());

        let err = attacher
            .attach("i-1", &mounts(&[("/data", "vol-1"), ("/logs", "vol-2")]))
            .await
            .unwrap_err();
        match err {
            VolumeAttachError::Attach {
                volume_id,
                mount_point,
                ..
            } => {
                assert_eq!(volume_id, "vol-1");
                assert_eq!(mount_point, "/data");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mock.call_count(Operation::AttachVolume), 1);
        assert_eq!(mock.call_count(Operation::StartInstance), 0);
        assert_eq!(mock.instance_state("i-1"), Some(InstanceState::Stopped));
    }

    #[tokio::test]
    async fn stop_failure_is_reported_as_stop() {
        let mock = launched().await;
        mock.fail_next(Operation::StopInstance, ProviderError::Rejected("locked".into()));
        let attacher = VolumeAttacher::new(mock.clone());
        let err = attacher
            .attach("i-1", &mounts(&[("/data", "vol-1")]))
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeAttachError::Stop(_)));
        assert_eq!(mock.call_count(Operation::AttachVolume), 0);
    }
}
