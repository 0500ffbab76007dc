//! Caller-facing handle for one running container.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;
use yarnpool_id::{ComponentName, ContainerId, TransactionId};

use crate::actors::{DestroyRequest, Placement};
use crate::error::FactoryError;
use crate::orchestrator::Orchestrator;
use crate::registry::InstanceRef;

/// A container produced by the factory.
///
/// The handle records the instance it was bound to when the container came
/// up. Scale-down always removes the highest-ordinal instance of a component,
/// so after other handles of the same component are destroyed the recorded
/// instance is informational; the component and its count are what destroy
/// acts on.
pub struct ContainerHandle {
    id: ContainerId,
    component: ComponentName,
    instance: InstanceRef,
    generation: u64,
    name_hint: String,
    created_at: DateTime<Utc>,
    log_url: Option<String>,
    orchestrator: Orchestrator,
    /// Set by the orchestrator as soon as a scale-down for this handle is
    /// accepted, even if the caller has stopped waiting by then.
    spent: Arc<AtomicBool>,
}

impl ContainerHandle {
    pub(crate) fn new(
        orchestrator: Orchestrator,
        placement: Placement,
        name_hint: impl Into<String>,
        surface_log_links: bool,
    ) -> Self {
        let log_url = if surface_log_links {
            placement.instance.log_url.clone()
        } else {
            None
        };

        Self {
            id: ContainerId::new(),
            component: placement.component,
            instance: placement.instance,
            generation: placement.generation,
            name_hint: name_hint.into(),
            created_at: Utc::now(),
            log_url,
            orchestrator,
            spent: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn component(&self) -> &ComponentName {
        &self.component
    }

    /// `{component}-{ordinal}` at creation time.
    pub fn instance_name(&self) -> &str {
        &self.instance.instance_name
    }

    pub fn ordinal(&self) -> u32 {
        self.instance.ordinal
    }

    /// Container id assigned by the resource manager.
    pub fn remote_container_id(&self) -> &str {
        &self.instance.container_id
    }

    pub fn name_hint(&self) -> &str {
        &self.name_hint
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Log link reported by the resource manager, when surfacing is enabled.
    pub fn log_url(&self) -> Option<&str> {
        self.log_url.as_deref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.spent.load(Ordering::Acquire)
    }

    /// Remove this container by scaling its component down by one.
    ///
    /// A handle is spent once the scale-down has been accepted, even if
    /// waiting for it to converge then fails or the caller drops this future;
    /// retrying would remove another container. Further calls fail with
    /// [`FactoryError::InvariantViolation`] without contacting the resource
    /// manager.
    #[instrument(skip_all, fields(container_id = %self.id, component = %self.component, tx_id = %tx_id))]
    pub async fn destroy(&mut self, tx_id: &TransactionId) -> Result<(), FactoryError> {
        if self.is_destroyed() {
            return Err(FactoryError::InvariantViolation(format!(
                "container {} was already destroyed",
                self.id
            )));
        }

        self.orchestrator
            .destroy(DestroyRequest {
                tx_id: *tx_id,
                component: self.component.clone(),
                container_id: self.instance.container_id.clone(),
                generation: self.generation,
                spent: Arc::clone(&self.spent),
            })
            .await
    }
}

impl fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("id", &self.id)
            .field("component", &self.component)
            .field("instance", &self.instance.instance_name)
            .field("generation", &self.generation)
            .field("name_hint", &self.name_hint)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
