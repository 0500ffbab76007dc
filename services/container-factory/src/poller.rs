//! Stability polling against the resource manager.
//!
//! Every mutation the orchestrator issues is acknowledged before the cluster
//! has acted on it. The poller re-reads the service until the expected state
//! is visible, so that callers only see converged results. Transient read
//! failures (transport errors, 5xx) are retried until the deadline.

use std::sync::Arc;

use yarnpool_id::ComponentName;
use yarnpool_reconcile::{await_condition, ConvergenceStatus, PollPolicy};

use crate::client::{ResourceManager, ServiceState, ServiceStatus};
use crate::error::{FactoryError, RemoteError};

/// Polls one service until a condition on its status holds.
#[derive(Clone)]
pub struct StabilityPoller {
    rm: Arc<dyn ResourceManager>,
    service: String,
    service_policy: PollPolicy,
    container_policy: PollPolicy,
}

impl StabilityPoller {
    pub fn new(
        rm: Arc<dyn ResourceManager>,
        service: impl Into<String>,
        service_policy: PollPolicy,
        container_policy: PollPolicy,
    ) -> Self {
        Self {
            rm,
            service: service.into(),
            service_policy,
            container_policy,
        }
    }

    /// Wait for the service to report STABLE.
    ///
    /// A freshly created service may briefly be invisible, so a missing
    /// service counts as still converging.
    pub async fn await_service_stable(&self) -> Result<ServiceStatus, FactoryError> {
        let resource = format!("service {}", self.service);
        let status = await_condition(
            &self.service_policy,
            &resource,
            || self.rm.get_service(&self.service),
            RemoteError::is_transient,
            |status: &Option<ServiceStatus>| match status {
                None => ConvergenceStatus::Converging,
                Some(s) if s.state.is_terminal() => ConvergenceStatus::Diverged,
                Some(s) if s.state == ServiceState::Unknown => ConvergenceStatus::Unknown,
                Some(s) => ConvergenceStatus::from_predicate(s.is_stable()),
            },
        )
        .await?;

        status.ok_or_else(|| FactoryError::Diverged { resource })
    }

    /// Wait for `component` to have exactly `expected` desired and READY
    /// containers.
    pub async fn await_component_count(
        &self,
        component: &ComponentName,
        expected: u32,
    ) -> Result<ServiceStatus, FactoryError> {
        let resource = format!("{}/{}", self.service, component);
        let status = await_condition(
            &self.container_policy,
            &resource,
            || self.rm.get_service(&self.service),
            RemoteError::is_transient,
            |status: &Option<ServiceStatus>| {
                let Some(status) = status else {
                    return ConvergenceStatus::Diverged;
                };
                if status.state.is_terminal() {
                    return ConvergenceStatus::Diverged;
                }
                match status.component(component.as_str()) {
                    Some(c) => ConvergenceStatus::from_predicate(
                        c.number_of_containers == expected && c.running_count() == expected,
                    ),
                    None => ConvergenceStatus::from_predicate(expected == 0),
                }
            },
        )
        .await?;

        status.ok_or_else(|| FactoryError::Diverged { resource })
    }

    /// Wait for the service to disappear after a delete.
    pub async fn await_service_absent(&self) -> Result<(), FactoryError> {
        let resource = format!("service {}", self.service);
        await_condition(
            &self.service_policy,
            &resource,
            || self.rm.get_service(&self.service),
            RemoteError::is_transient,
            |status: &Option<ServiceStatus>| ConvergenceStatus::from_predicate(status.is_none()),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::client::{ComponentSpec, ResourceManagerClient};
    use crate::config::FactoryConfig;
    use yarnpool_testing::{MockConfig, MockResourceManager};

    fn fast_policy(timeout: Duration) -> PollPolicy {
        PollPolicy::fixed(Duration::from_millis(5), timeout)
    }

    async fn setup(delay: Duration) -> (MockResourceManager, StabilityPoller) {
        let mock = MockResourceManager::spawn(MockConfig {
            convergence_delay: delay,
            ..Default::default()
        })
        .await
        .unwrap();
        let config = FactoryConfig {
            resource_manager_url: mock.base_url(),
            ..Default::default()
        };
        let rm = Arc::new(ResourceManagerClient::new(&config).unwrap());
        let poller = StabilityPoller::new(
            rm,
            "svc",
            fast_policy(Duration::from_secs(2)),
            fast_policy(Duration::from_secs(2)),
        );
        (mock, poller)
    }

    #[tokio::test]
    async fn test_component_count_waits_for_ready() {
        let (mock, poller) = setup(Duration::from_millis(60)).await;
        mock.seed_service("svc", &[("web", "img:1", 1)]);

        let config = FactoryConfig {
            resource_manager_url: mock.base_url(),
            ..Default::default()
        };
        let client = ResourceManagerClient::new(&config).unwrap();
        client
            .flex_component("svc", &ComponentSpec::flex("web", 2))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let web = ComponentName::new("web").unwrap();
        let status = poller.await_component_count(&web, 2).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(status.component("web").unwrap().running_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_service_diverges() {
        let (mock, poller) = setup(Duration::ZERO).await;
        mock.seed_service("svc", &[]);
        mock.mark_failed("svc");

        let err = poller.await_service_stable().await.unwrap_err();
        assert!(matches!(err, FactoryError::Diverged { .. }));
    }

    #[tokio::test]
    async fn test_missing_service_times_out_when_waiting_for_stable() {
        let (_mock, poller) = setup(Duration::ZERO).await;
        let poller = StabilityPoller {
            service_policy: fast_policy(Duration::from_millis(40)),
            ..poller
        };

        let err = poller.await_service_stable().await.unwrap_err();
        assert!(matches!(err, FactoryError::ConvergenceTimeout { .. }));
        assert!(err.is_indeterminate());
    }

    #[tokio::test]
    async fn test_absent_component_satisfies_zero() {
        let (mock, poller) = setup(Duration::ZERO).await;
        mock.seed_service("svc", &[]);

        let ghost = ComponentName::new("ghost").unwrap();
        poller.await_component_count(&ghost, 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_service_absent_after_delete() {
        let (mock, poller) = setup(Duration::ZERO).await;
        mock.seed_service("svc", &[("web", "img:1", 2)]);

        let config = FactoryConfig {
            resource_manager_url: mock.base_url(),
            ..Default::default()
        };
        ResourceManagerClient::new(&config)
            .unwrap()
            .delete_service("svc")
            .await
            .unwrap();

        poller.await_service_absent().await.unwrap();
    }
}
