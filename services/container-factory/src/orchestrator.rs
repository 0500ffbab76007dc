//! Orchestrator - cloneable front door to the service actor.
//!
//! Mutations are sent to the actor's mailbox and applied strictly in arrival
//! order. Reads of the remote status go straight to the resource manager and
//! may run concurrently with a pending mutation. Local state is observed
//! through snapshots the actor publishes on `watch` channels.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::actors::{
    spawn_actor, ActorHandle, ActorRef, CreateRequest, DestroyRequest, Placement, ServiceActor,
    ServiceMessage, ServiceSettings,
};
use crate::client::{ResourceManager, ServiceStatus};
use crate::error::FactoryError;
use crate::poller::StabilityPoller;
use crate::registry::RegistrySnapshot;

const MAILBOX_SIZE: usize = 256;

/// Local view of the service's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLifecycle {
    Absent,
    Creating,
    Stable,
    Destroying,
}

impl fmt::Display for ServiceLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceLifecycle::Absent => "absent",
            ServiceLifecycle::Creating => "creating",
            ServiceLifecycle::Stable => "stable",
            ServiceLifecycle::Destroying => "destroying",
        })
    }
}

/// Handle to the service actor. Clones share the same actor.
///
/// The actor stops once [`Orchestrator::shutdown`] is called or the last
/// clone is dropped.
#[derive(Clone)]
pub struct Orchestrator {
    mailbox: ActorHandle<ServiceMessage>,
    actor: Arc<ActorRef>,
    rm: Arc<dyn ResourceManager>,
    service_name: Arc<str>,
    lifecycle_rx: watch::Receiver<ServiceLifecycle>,
    snapshot_rx: watch::Receiver<RegistrySnapshot>,
}

impl Orchestrator {
    /// Spawn the service actor on the current runtime.
    pub fn spawn(
        rm: Arc<dyn ResourceManager>,
        poller: StabilityPoller,
        settings: ServiceSettings,
    ) -> Self {
        let (lifecycle_tx, lifecycle_rx) = watch::channel(ServiceLifecycle::Absent);
        let (snapshot_tx, snapshot_rx) = watch::channel(RegistrySnapshot::default());
        let service_name: Arc<str> = Arc::from(settings.name.as_str());

        let actor = ServiceActor::new(rm.clone(), poller, settings, lifecycle_tx, snapshot_tx);
        let (mailbox, actor_ref) = spawn_actor(actor, MAILBOX_SIZE);

        Self {
            mailbox,
            actor: Arc::new(actor_ref),
            rm,
            service_name,
            lifecycle_rx,
            snapshot_rx,
        }
    }

    pub async fn init(&self) -> Result<ServiceStatus, FactoryError> {
        self.mailbox
            .request(|reply_to| ServiceMessage::Init { reply_to })
            .await?
    }

    pub async fn create_container(&self, request: CreateRequest) -> Result<Placement, FactoryError> {
        self.mailbox
            .request(|reply_to| ServiceMessage::CreateContainer { request, reply_to })
            .await?
    }

    pub async fn destroy(&self, request: DestroyRequest) -> Result<(), FactoryError> {
        self.mailbox
            .request(|reply_to| ServiceMessage::Destroy { request, reply_to })
            .await?
    }

    pub async fn resync(&self) -> Result<RegistrySnapshot, FactoryError> {
        self.mailbox
            .request(|reply_to| ServiceMessage::Resync { reply_to })
            .await?
    }

    pub async fn recover(&self) -> Result<Vec<Placement>, FactoryError> {
        self.mailbox
            .request(|reply_to| ServiceMessage::Recover { reply_to })
            .await?
    }

    pub async fn cleanup(&self) -> Result<(), FactoryError> {
        self.mailbox
            .request(|reply_to| ServiceMessage::Cleanup { reply_to })
            .await?
    }

    /// Current remote status, read outside the mutation path.
    pub async fn service_status(&self) -> Result<Option<ServiceStatus>, FactoryError> {
        Ok(self.rm.get_service(&self.service_name).await?)
    }

    pub fn lifecycle(&self) -> ServiceLifecycle {
        *self.lifecycle_rx.borrow()
    }

    /// Latest registry snapshot published by the actor.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Stop the actor after its current message. Requests still queued fail
    /// with [`FactoryError::OrchestratorStopped`].
    pub async fn shutdown(&self) {
        self.actor.stop();
        self.mailbox.closed().await;
    }

    pub fn is_running(&self) -> bool {
        self.actor.is_running() && !self.mailbox.is_closed()
    }
}
