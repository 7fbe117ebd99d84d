use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use stratus_common::{
    EnvMap, Image, Infrastructure, Instance, InstanceState, MountSpec, INSTANCE_ID_TAG, NAME_TAG,
};
use stratus_providers::retry::{RetryPolicy, RetryingControlPlane};
use stratus_providers::ControlPlane;

use crate::compensation::ProvisionalInstances;
use crate::error::{ProvisionError, ProvisionStep};
use crate::state_store::InstanceStateStore;
use crate::volume_attacher::VolumeAttacher;

/// Launches instances and brings them to a registered state, or leaves
/// nothing billable behind.
///
/// Workflow: resolve image -> validate mounts -> encode env -> launch ->
/// (stop/attach/start) -> tag -> register. Any failure after launch
/// terminates what was launched.
pub struct Provisioner {
    control_plane: Arc<dyn ControlPlane>,
    attacher: VolumeAttacher,
    store: Arc<InstanceStateStore>,
    deadline: Option<Duration>,
}

impl Provisioner {
    /// Every call to `control_plane` goes through `policy`.
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        policy: Arc<RetryPolicy>,
        store: Arc<InstanceStateStore>,
    ) -> Self {
        let control_plane: Arc<dyn ControlPlane> =
            Arc::new(RetryingControlPlane::new(control_plane, policy));
        Self {
            attacher: VolumeAttacher::new(control_plane.clone()),
            control_plane,
            store,
            deadline: None,
        }
    }

    /// Caps the whole workflow. On expiry the in-flight call or backoff
    /// sleep is abandoned and launched instances are still cleaned up.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn store(&self) -> &Arc<InstanceStateStore> {
        &self.store
    }

    pub async fn provision(
        &self,
        name: &str,
        image_id: &str,
        mounts: &MountSpec,
        env: &EnvMap,
    ) -> Result<Instance, ProvisionError> {
        let steps = StepTracker::default();
        let workflow = self.run(&steps, name, image_id, mounts, env);
        match self.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, workflow).await {
                Ok(result) => result,
                Err(_) => {
                    let step = steps.current();
                    tracing::error!(
                        instance_name = name,
                        image_id,
                        ?deadline,
                        %step,
                        "provisioning deadline exceeded"
                    );
                    Err(ProvisionError::DeadlineExceeded {
                        after: deadline,
                        step,
                    })
                }
            },
            None => workflow.await,
        }
    }

    #[tracing::instrument(name = "provision", skip_all, fields(instance_name = %name, image_id = %image_id))]
    async fn run(
        &self,
        steps: &StepTracker,
        name: &str,
        image_id: &str,
        mounts: &MountSpec,
        env: &EnvMap,
    ) -> Result<Instance, ProvisionError> {
        tracing::info!(
            mounts = ?mounts,
            env_keys = ?env.keys().collect::<Vec<_>>(),
            "running instance"
        );

        steps.enter(ProvisionStep::ResolveImage);
        let image = self
            .control_plane
            .lookup_image(image_id)
            .await
            .map_err(|error| {
                tracing::error!(error = %error, "getting image failed");
                ProvisionError::ResourceLookup {
                    image_id: image_id.to_string(),
                    error,
                }
            })?;
        steps.enter(ProvisionStep::ValidateMounts);
        validate_mounts(&image, mounts)?;
        steps.enter(ProvisionStep::EncodeEnv);
        let user_data = encode_user_data(env)?;

        steps.enter(ProvisionStep::Launch);
        let instance_ids = self
            .control_plane
            .create_instances(&image.id, 1, &user_data)
            .await
            .map_err(|error| {
                tracing::error!(error = %error, "failed to run instance");
                ProvisionError::Launch(error)
            })?;

        // From here on anything launched is terminated unless registration succeeds.
        let provisional = ProvisionalInstances::new(self.control_plane.clone(), &instance_ids);

        let instance_id = match instance_ids.as_slice() {
            [id] if !id.is_empty() => id.clone(),
            [_] => {
                let err = ProvisionError::EmptyInstanceId;
                provisional.compensate(&err).await;
                return Err(err);
            }
            _ => {
                tracing::error!(
                    count = instance_ids.len(),
                    instance_ids = ?instance_ids,
                    "run instance produced an unexpected number of instances, expected 1"
                );
                let err = ProvisionError::LaunchCountMismatch { instance_ids };
                provisional.compensate(&err).await;
                return Err(err);
            }
        };

        let instance = match self.prepare(steps, &instance_id, name, &image, mounts).await {
            Ok(instance) => instance,
            Err(err) => {
                provisional.compensate(&err).await;
                return Err(err);
            }
        };
        steps.enter(ProvisionStep::Register);
        if let Err(err) = self.store.register(instance.clone()) {
            let err = ProvisionError::from(err);
            provisional.compensate(&err).await;
            return Err(err);
        }
        provisional.commit();

        tracing::info!(instance_id = %instance.id, "instance created successfully");
        Ok(instance)
    }

    /// Post-launch steps that need compensation on failure.
    async fn prepare(
        &self,
        steps: &StepTracker,
        instance_id: &str,
        name: &str,
        image: &Image,
        mounts: &MountSpec,
    ) -> Result<Instance, ProvisionError> {
        if !mounts.is_empty() {
            steps.enter(ProvisionStep::AttachVolumes);
            self.attacher
                .attach(instance_id, mounts)
                .await
                .map_err(|error| ProvisionError::VolumeAttach {
                    instance_id: instance_id.to_string(),
                    error,
                })?;
        }

        let tags = BTreeMap::from([
            (INSTANCE_ID_TAG.to_string(), instance_id.to_string()),
            (NAME_TAG.to_string(), name.to_string()),
        ]);
        steps.enter(ProvisionStep::Tag);
        self.control_plane
            .create_tags(instance_id, &tags)
            .await
            .map_err(|error| ProvisionError::Tagging {
                instance_id: instance_id.to_string(),
                error,
            })?;

        Ok(Instance {
            id: instance_id.to_string(),
            name: name.to_string(),
            state: InstanceState::Pending,
            infrastructure: Infrastructure::Aws,
            image_id: image.id.clone(),
            created: Utc::now(),
        })
    }
}

/// Last workflow step entered, readable after the workflow future is dropped.
struct StepTracker(Mutex<ProvisionStep>);

impl Default for StepTracker {
    fn default() -> Self {
        Self(Mutex::new(ProvisionStep::ResolveImage))
    }
}

impl StepTracker {
    fn enter(&self, step: ProvisionStep) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = step;
    }

    fn current(&self) -> ProvisionStep {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Every non-root device mapping of `image` needs a volume in `mounts`.
pub fn validate_mounts(image: &Image, mounts: &MountSpec) -> Result<(), ProvisionError> {
    for mount_point in image.required_mount_points() {
        if !mounts.contains_key(mount_point) {
            tracing::error!(
                required_device_mappings = ?image.device_mappings,
                mount_point,
                "required mount point missing"
            );
            return Err(ProvisionError::Validation {
                mount_point: mount_point.to_string(),
            });
        }
    }
    Ok(())
}

/// User-data payload read inside the instance: the env as a JSON object,
/// base64 (standard alphabet, padded).
pub fn encode_user_data(env: &EnvMap) -> Result<String, ProvisionError> {
    let json = serde_json::to_vec(env)?;
    Ok(STANDARD.encode(json))
}
