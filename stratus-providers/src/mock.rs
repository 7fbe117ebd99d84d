use crate::{ControlPlane, ProviderError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use stratus_common::{Image, InstanceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    LookupImage,
    CreateInstances,
    TerminateInstance,
    StopInstance,
    StartInstance,
    AttachVolume,
    CreateTags,
}

/// One request as received by the mock, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    LookupImage {
        image_id: String,
    },
    CreateInstances {
        image_id: String,
        count: u32,
        user_data: String,
    },
    TerminateInstance {
        instance_id: String,
    },
    StopInstance {
        instance_id: String,
    },
    StartInstance {
        instance_id: String,
    },
    AttachVolume {
        volume_id: String,
        instance_id: String,
        mount_point: String,
    },
    CreateTags {
        resource_id: String,
        tags: BTreeMap<String, String>,
    },
}

impl Call {
    pub fn operation(&self) -> Operation {
        match self {
            Call::LookupImage { .. } => Operation::LookupImage,
            Call::CreateInstances { .. } => Operation::CreateInstances,
            Call::TerminateInstance { .. } => Operation::TerminateInstance,
            Call::StopInstance { .. } => Operation::StopInstance,
            Call::StartInstance { .. } => Operation::StartInstance,
            Call::AttachVolume { .. } => Operation::AttachVolume,
            Call::CreateTags { .. } => Operation::CreateTags,
        }
    }

    /// Everything except image lookups changes remote state.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Call::LookupImage { .. })
    }
}

#[derive(Default)]
struct MockState {
    images: HashMap<String, Image>,
    instances: HashMap<String, InstanceState>,
    attachments: HashMap<String, BTreeMap<String, String>>,
    tags: HashMap<String, BTreeMap<String, String>>,
    calls: Vec<Call>,
    failures: HashMap<Operation, VecDeque<ProviderError>>,
    launch_results: VecDeque<Vec<String>>,
    latency: HashMap<Operation, Duration>,
}

/// In-memory control plane for tests and local runs.
///
/// Instances launch straight into `running`. Volumes can only be attached to a
/// stopped instance, like the real provider.
#[derive(Default)]
pub struct MockControlPlane {
    state: Mutex<MockState>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(self, image: Image) -> Self {
        self.insert_image(image);
        self
    }

    pub fn insert_image(&self, image: Image) {
        self.lock().images.insert(image.id.clone(), image);
    }

    /// Queue an error for the next call of `operation`. Errors are consumed in FIFO order.
    pub fn fail_next(&self, operation: Operation, err: ProviderError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(err);
    }

    /// Ids the next launch reports, instead of one generated id.
    /// Scripted ids are tracked as running instances.
    pub fn script_launch(&self, instance_ids: Vec<String>) {
        self.lock().launch_results.push_back(instance_ids);
    }

    pub fn set_latency(&self, operation: Operation, latency: Duration) {
        self.lock().latency.insert(operation, latency);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.is_mutating())
            .cloned()
            .collect()
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation() == operation)
            .count()
    }

    pub fn terminated_ids(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::TerminateInstance { instance_id } => Some(instance_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn instance_state(&self, instance_id: &str) -> Option<InstanceState> {
        self.lock().instances.get(instance_id).copied()
    }

    pub fn attached_volumes(&self, instance_id: &str) -> BTreeMap<String, String> {
        self.lock()
            .attachments
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tags(&self, resource_id: &str) -> BTreeMap<String, String> {
        self.lock().tags.get(resource_id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the call, waits out any configured latency, then pops an injected failure.
    async fn begin(&self, call: Call) -> Result<(), ProviderError> {
        let operation = call.operation();
        let latency = {
            let mut state = self.lock();
            state.calls.push(call);
            state.latency.get(&operation).copied()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let injected = self
            .lock()
            .failures
            .get_mut(&operation)
            .and_then(|q| q.pop_front());
        match injected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn transition(
        &self,
        instance_id: &str,
        allowed_from: &[InstanceState],
        to: InstanceState,
    ) -> Result<(), ProviderError> {
        let mut state = self.lock();
        let current = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {}", instance_id)))?;
        if !allowed_from.contains(current) {
            return Err(ProviderError::Rejected(format!(
                "instance {} is {}, cannot move to {}",
                instance_id,
                current.as_str(),
                to.as_str()
            )));
        }
        *current = to;
        Ok(())
    }
}

fn generated_instance_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("i-{}", &hex[..17])
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn lookup_image(&self, image_id: &str) -> Result<Image, ProviderError> {
        self.begin(Call::LookupImage {
            image_id: image_id.to_string(),
        })
        .await?;
        self.lock()
            .images
            .get(image_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("image {}", image_id)))
    }

    async fn create_instances(
        &self,
        image_id: &str,
        count: u32,
        user_data: &str,
    ) -> Result<Vec<String>, ProviderError> {
        self.begin(Call::CreateInstances {
            image_id: image_id.to_string(),
            count,
            user_data: user_data.to_string(),
        })
        .await?;
        let mut state = self.lock();
        if !state.images.contains_key(image_id) {
            return Err(ProviderError::NotFound(format!("image {}", image_id)));
        }
        let ids = match state.launch_results.pop_front() {
            Some(ids) => ids,
            None => (0..count).map(|_| generated_instance_id()).collect(),
        };
        for id in ids.iter().filter(|id| !id.is_empty()) {
            state.instances.insert(id.clone(), InstanceState::Running);
        }
        Ok(ids)
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        self.begin(Call::TerminateInstance {
            instance_id: instance_id.to_string(),
        })
        .await?;
        // Terminating twice is a no-op, as on the real control plane.
        self.transition(
            instance_id,
            &[
                InstanceState::Pending,
                InstanceState::Running,
                InstanceState::Stopped,
                InstanceState::Terminated,
            ],
            InstanceState::Terminated,
        )
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        self.begin(Call::StopInstance {
            instance_id: instance_id.to_string(),
        })
        .await?;
        self.transition(
            instance_id,
            &[InstanceState::Running, InstanceState::Stopped],
            InstanceState::Stopped,
        )
    }

    async fn start_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        self.begin(Call::StartInstance {
            instance_id: instance_id.to_string(),
        })
        .await?;
        self.transition(
            instance_id,
            &[InstanceState::Stopped, InstanceState::Running],
            InstanceState::Running,
        )
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        mount_point: &str,
    ) -> Result<(), ProviderError> {
        self.begin(Call::AttachVolume {
            volume_id: volume_id.to_string(),
            instance_id: instance_id.to_string(),
            mount_point: mount_point.to_string(),
        })
        .await?;
        let mut state = self.lock();
        match state.instances.get(instance_id) {
            None => {
                return Err(ProviderError::NotFound(format!("instance {}", instance_id)));
            }
            Some(InstanceState::Stopped) => {}
            Some(other) => {
                return Err(ProviderError::Rejected(format!(
                    "volumes can only be attached to a stopped instance ({} is {})",
                    instance_id,
                    other.as_str()
                )));
            }
        }
        state
            .attachments
            .entry(instance_id.to_string())
            .or_default()
            .insert(mount_point.to_string(), volume_id.to_string());
        Ok(())
    }

    async fn create_tags(
        &self,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        self.begin(Call::CreateTags {
            resource_id: resource_id.to_string(),
            tags: tags.clone(),
        })
        .await?;
        let mut state = self.lock();
        if !state.instances.contains_key(resource_id) {
            return Err(ProviderError::NotFound(format!("resource {}", resource_id)));
        }
        state
            .tags
            .entry(resource_id.to_string())
            .or_default()
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}
