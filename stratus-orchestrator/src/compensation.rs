use std::sync::Arc;
use stratus_providers::ControlPlane;

use crate::error::{CompensationWarning, ProvisionError};

/// Instances that exist remotely but are not registered yet.
///
/// Releasing the guard terminates them. `commit` disarms it after a successful
/// registration; `compensate` terminates on an explicit failure path. If the
/// guard is dropped while still armed (the provisioning future was cancelled
/// or hit its deadline) the terminate calls are spawned onto the runtime.
pub(crate) struct ProvisionalInstances {
    control_plane: Arc<dyn ControlPlane>,
    instance_ids: Vec<String>,
}

impl ProvisionalInstances {
    pub(crate) fn new(control_plane: Arc<dyn ControlPlane>, instance_ids: &[String]) -> Self {
        Self {
            control_plane,
            instance_ids: instance_ids
                .iter()
                .filter(|id| !id.is_empty())
                .cloned()
                .collect(),
        }
    }

    pub(crate) fn commit(mut self) {
        self.instance_ids.clear();
    }

    /// Best-effort terminate of every held instance. Failures are logged as
    /// warnings and never replace `cause`.
    pub(crate) async fn compensate(mut self, cause: &ProvisionError) {
        tracing::error!(error = %cause, step = %cause.step(), "provisioning failed");
        // An id leaves the list only once its terminate returned, so a
        // cancellation mid-cleanup still hands it to Drop.
        while let Some(instance_id) = self.instance_ids.first().cloned() {
            terminate(self.control_plane.as_ref(), &instance_id).await;
            self.instance_ids.remove(0);
        }
    }
}

impl Drop for ProvisionalInstances {
    fn drop(&mut self) {
        if self.instance_ids.is_empty() {
            return;
        }
        let instance_ids = std::mem::take(&mut self.instance_ids);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    instance_ids = ?instance_ids,
                    "provisioning aborted, scheduling cleanup"
                );
                let control_plane = self.control_plane.clone();
                handle.spawn(async move {
                    for instance_id in instance_ids {
                        terminate(control_plane.as_ref(), &instance_id).await;
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    instance_ids = ?instance_ids,
                    "provisioning aborted outside a runtime, instances were not cleaned up"
                );
            }
        }
    }
}

async fn terminate(control_plane: &dyn ControlPlane, instance_id: &str) {
    tracing::warn!(instance_id, "cleaning up instance");
    match control_plane.terminate_instance(instance_id).await {
        Ok(()) => tracing::info!(instance_id, "cleanup terminate issued"),
        Err(error) => {
            let warning = CompensationWarning {
                instance_id: instance_id.to_string(),
                error,
            };
            tracing::warn!(instance_id, "{}", warning);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_providers::mock::{MockControlPlane, Operation};
    use stratus_providers::ProviderError;

    #[tokio::test]
    async fn empty_ids_are_never_terminated() {
        let mock = Arc::new(MockControlPlane::new());
        let guard = ProvisionalInstances::new(mock.clone(), &["".to_string(), "i-2".to_string()]);
        guard.compensate(&ProvisionError::EmptyInstanceId).await;
        assert_eq!(mock.terminated_ids(), vec!["i-2".to_string()]);
    }

    #[tokio::test]
    async fn commit_disarms() {
        let mock = Arc::new(MockControlPlane::new());
        let guard = ProvisionalInstances::new(mock.clone(), &["i-1".to_string()]);
        guard.commit();
        tokio::task::yield_now().await;
        assert!(mock.terminated_ids().is_empty());
    }

    #[tokio::test]
    async fn failed_terminate_does_not_stop_the_rest() {
        let mock = Arc::new(MockControlPlane::new());
        mock.fail_next(
            Operation::TerminateInstance,
            ProviderError::Rejected("denied".into()),
        );
        let guard = ProvisionalInstances::new(mock.clone(), &["i-1".to_string(), "i-2".to_string()]);
        guard.compensate(&ProvisionError::EmptyInstanceId).await;
        assert_eq!(
            mock.terminated_ids(),
            vec!["i-1".to_string(), "i-2".to_string()]
        );
    }

    #[tokio::test]
    async fn drop_while_armed_spawns_terminate() {
        let mock = Arc::new(MockControlPlane::new());
        drop(ProvisionalInstances::new(mock.clone(), &["i-9".to_string()]));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(mock.terminated_ids(), vec!["i-9".to_string()]);
    }
}
