//! Service actor - the single writer for the factory's remote service.
//!
//! Every structural mutation (create service, flex component, delete service)
//! is a message in this actor's mailbox. The actor handles one message at a
//! time and polls each mutation to convergence before taking the next, so the
//! resource manager never sees overlapping changes to the service.
//!
//! Lifecycle: `Absent -> Creating -> Stable -> Destroying -> Absent`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, instrument, warn};
use yarnpool_id::{ComponentName, TransactionId};

use super::framework::{Actor, ActorContext, ActorError};
use crate::client::{
    Artifact, ComponentSpec, CreateOutcome, DeleteOutcome, ResourceManager, ResourceSpec,
    ServiceSpec, ServiceStatus,
};
use crate::config::FactoryConfig;
use crate::error::FactoryError;
use crate::image::ImageName;
use crate::orchestrator::ServiceLifecycle;
use crate::poller::StabilityPoller;
use crate::registry::{ComponentRegistry, InstanceRef, RegistrySnapshot};

// =============================================================================
// Messages
// =============================================================================

/// Messages handled by ServiceActor.
#[derive(Debug)]
pub enum ServiceMessage {
    /// Create the service (or adopt an existing one) and wait for STABLE.
    Init {
        reply_to: oneshot::Sender<Result<ServiceStatus, FactoryError>>,
    },

    /// Add one container to a component, creating the component if needed.
    CreateContainer {
        request: CreateRequest,
        reply_to: oneshot::Sender<Result<Placement, FactoryError>>,
    },

    /// Remove one container from a component.
    Destroy {
        request: DestroyRequest,
        reply_to: oneshot::Sender<Result<(), FactoryError>>,
    },

    /// Rebuild the registry from a fresh status read.
    Resync {
        reply_to: oneshot::Sender<Result<RegistrySnapshot, FactoryError>>,
    },

    /// Bind every READY instance that no live handle owns.
    Recover {
        reply_to: oneshot::Sender<Result<Vec<Placement>, FactoryError>>,
    },

    /// Delete the service and forget all local state.
    Cleanup {
        reply_to: oneshot::Sender<Result<(), FactoryError>>,
    },
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub tx_id: TransactionId,
    pub component: ComponentName,
    /// Resolved artifact id.
    pub image: String,
    pub resources: ResourceSpec,
}

#[derive(Debug, Clone)]
pub struct DestroyRequest {
    pub tx_id: TransactionId,
    pub component: ComponentName,
    /// Remote id of the instance the handle was bound to.
    pub container_id: String,
    /// Service incarnation the handle was created in.
    pub generation: u64,
    /// Shared with the handle; set once a scale-down for it is accepted.
    pub spent: Arc<AtomicBool>,
}

/// An instance bound to a new handle.
#[derive(Debug, Clone)]
pub struct Placement {
    pub component: ComponentName,
    pub instance: InstanceRef,
    pub generation: u64,
}

// =============================================================================
// Settings
// =============================================================================

/// Static description of the service the actor manages.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub name: String,
    pub version: String,
    pub queue: String,
    /// Zero-count components sent with the create request.
    pub predeclared: Vec<ComponentSpec>,
    /// Resources assumed for remote components that do not report any.
    pub default_resources: ResourceSpec,
    /// Whether destroy callers wait for the scale-down to converge.
    pub wait_on_destroy: bool,
}

impl ServiceSettings {
    pub fn from_config(config: &FactoryConfig) -> Result<Self, FactoryError> {
        let default_resources = ResourceSpec::new(config.default_cpus, config.default_memory_mb);
        let registry = config.runtimes_registry.as_deref();

        let predeclared = config
            .predeclared_images
            .iter()
            .map(|raw| {
                let image = ImageName::parse(raw)?;
                Ok(ComponentSpec {
                    name: image.component_name(registry, false)?.to_string(),
                    number_of_containers: 0,
                    artifact: Some(Artifact::docker(image.resolve(registry, false))),
                    resource: Some(default_resources.clone()),
                    launch_command: None,
                })
            })
            .collect::<Result<Vec<_>, FactoryError>>()?;

        Ok(Self {
            name: config.service_name.clone(),
            version: config.service_version.clone(),
            queue: config.queue.clone(),
            predeclared,
            default_resources,
            wait_on_destroy: config.wait_on_destroy,
        })
    }
}

// =============================================================================
// Service Actor
// =============================================================================

pub struct ServiceActor {
    rm: Arc<dyn ResourceManager>,
    poller: StabilityPoller,
    settings: ServiceSettings,
    registry: ComponentRegistry,
    lifecycle: ServiceLifecycle,
    /// Incremented whenever local state is discarded; handles from an older
    /// generation are stale.
    generation: u64,
    lifecycle_tx: watch::Sender<ServiceLifecycle>,
    snapshot_tx: watch::Sender<RegistrySnapshot>,
}

impl ServiceActor {
    pub fn new(
        rm: Arc<dyn ResourceManager>,
        poller: StabilityPoller,
        settings: ServiceSettings,
        lifecycle_tx: watch::Sender<ServiceLifecycle>,
        snapshot_tx: watch::Sender<RegistrySnapshot>,
    ) -> Self {
        Self {
            rm,
            poller,
            settings,
            registry: ComponentRegistry::new(),
            lifecycle: ServiceLifecycle::Absent,
            generation: 1,
            lifecycle_tx,
            snapshot_tx,
        }
    }

    fn publish(&self) {
        self.lifecycle_tx.send_replace(self.lifecycle);
        self.snapshot_tx.send_replace(self.registry.snapshot());
    }

    fn set_lifecycle(&mut self, lifecycle: ServiceLifecycle) {
        if self.lifecycle != lifecycle {
            debug!(service = %self.settings.name, from = %self.lifecycle, to = %lifecycle, "Lifecycle transition");
        }
        self.lifecycle = lifecycle;
        self.publish();
    }

    fn require_stable(&self, operation: &'static str) -> Result<(), FactoryError> {
        match self.lifecycle {
            ServiceLifecycle::Stable => Ok(()),
            state => Err(FactoryError::InvalidState { operation, state }),
        }
    }

    fn reconcile(&mut self, status: &ServiceStatus) {
        self.registry
            .reconcile(status, &self.settings.default_resources);
    }

    /// Discards local state and invalidates every outstanding handle.
    fn forget(&mut self) {
        self.registry.clear();
        self.generation += 1;
    }

    #[instrument(skip_all, fields(service = %self.settings.name))]
    async fn init(&mut self) -> Result<ServiceStatus, FactoryError> {
        match self.lifecycle {
            ServiceLifecycle::Stable => {
                if self.rm.get_service(&self.settings.name).await?.is_some() {
                    let status = self.poller.await_service_stable().await?;
                    self.reconcile(&status);
                    self.publish();
                    debug!("Service already initialized");
                    return Ok(status);
                }
                warn!("Service disappeared remotely, creating it again");
                self.forget();
            }
            ServiceLifecycle::Destroying => {
                return Err(FactoryError::InvalidState {
                    operation: "init",
                    state: self.lifecycle,
                });
            }
            ServiceLifecycle::Absent | ServiceLifecycle::Creating => {}
        }

        self.set_lifecycle(ServiceLifecycle::Creating);

        let spec = ServiceSpec {
            name: self.settings.name.clone(),
            version: self.settings.version.clone(),
            queue: Some(self.settings.queue.clone()),
            components: self.settings.predeclared.clone(),
        };

        match self.rm.create_service(&spec).await? {
            CreateOutcome::Created => info!(
                predeclared = spec.components.len(),
                "Service submitted, waiting for it to become stable"
            ),
            CreateOutcome::AlreadyExists => {
                info!("Service already exists, adopting it")
            }
        }

        let status = self.poller.await_service_stable().await?;
        self.reconcile(&status);
        self.set_lifecycle(ServiceLifecycle::Stable);

        info!(components = self.registry.len(), "Service stable");
        Ok(status)
    }

    #[instrument(
        skip_all,
        fields(
            service = %self.settings.name,
            component = %request.component,
            tx_id = %request.tx_id,
        )
    )]
    async fn create_container(&mut self, request: &CreateRequest) -> Result<Placement, FactoryError> {
        self.require_stable("create container")?;

        let entry = self.registry.resolve_or_create(
            &request.component,
            &request.image,
            request.resources.clone(),
        )?;
        let target = entry.desired + 1;

        // A component the resource manager has never seen is created by the
        // same flex call, so it must carry the artifact and resources.
        let body = if entry.materialized {
            ComponentSpec::flex(request.component.as_str(), target)
        } else {
            ComponentSpec {
                name: request.component.to_string(),
                number_of_containers: target,
                artifact: Some(Artifact::docker(entry.image.clone())),
                resource: Some(entry.resources.clone()),
                launch_command: None,
            }
        };
        let is_new = !entry.materialized;

        self.rm
            .flex_component(&self.settings.name, &body)
            .await?;
        self.registry.bump_desired(&request.component, 1)?;
        self.registry.mark_materialized(&request.component);
        self.publish();

        debug!(desired = target, is_new, "Flex accepted, waiting for container");

        let status = self
            .poller
            .await_component_count(&request.component, target)
            .await?;
        self.reconcile(&status);

        let instance = self
            .registry
            .claim_newest_instance(&request.component)
            .ok_or_else(|| {
                FactoryError::InvariantViolation(format!(
                    "component {} converged to {target} but has no unbound instance",
                    request.component
                ))
            })?;
        self.publish();

        info!(
            desired = target,
            instance = %instance.instance_name,
            container = %instance.container_id,
            "Container running"
        );

        Ok(Placement {
            component: request.component.clone(),
            instance,
            generation: self.generation,
        })
    }

    /// Validates the request and issues the scale-down. Returns the new
    /// desired count.
    async fn begin_destroy(&mut self, request: &DestroyRequest) -> Result<u32, FactoryError> {
        if request.generation != self.generation {
            return Err(FactoryError::InvariantViolation(format!(
                "container {} belongs to a previous incarnation of service {}",
                request.container_id, self.settings.name
            )));
        }
        if request.spent.load(Ordering::Acquire) {
            return Err(FactoryError::InvariantViolation(format!(
                "container {} was already destroyed",
                request.container_id
            )));
        }
        self.require_stable("destroy container")?;

        let current = self
            .registry
            .current_desired(&request.component)
            .ok_or_else(|| {
                FactoryError::InvariantViolation(format!(
                    "unknown component {}",
                    request.component
                ))
            })?;
        if current == 0 {
            return Err(FactoryError::InvariantViolation(format!(
                "component {} has no containers left to destroy",
                request.component
            )));
        }
        let target = current - 1;

        self.rm
            .flex_component(
                &self.settings.name,
                &ComponentSpec::flex(request.component.as_str(), target),
            )
            .await?;
        request.spent.store(true, Ordering::Release);
        self.registry.bump_desired(&request.component, -1)?;
        self.registry.release(&request.component, &request.container_id);
        self.publish();

        Ok(target)
    }

    #[instrument(
        skip_all,
        fields(
            service = %self.settings.name,
            component = %request.component,
            tx_id = %request.tx_id,
        )
    )]
    async fn destroy(
        &mut self,
        request: DestroyRequest,
        reply_to: oneshot::Sender<Result<(), FactoryError>>,
    ) {
        let target = match self.begin_destroy(&request).await {
            Ok(target) => target,
            Err(e) => {
                let _ = reply_to.send(Err(e));
                return;
            }
        };

        // The caller may be released early, but the next mutation still waits
        // for this one to converge.
        let reply_to = if self.settings.wait_on_destroy {
            Some(reply_to)
        } else {
            let _ = reply_to.send(Ok(()));
            None
        };

        let outcome = match self
            .poller
            .await_component_count(&request.component, target)
            .await
        {
            Ok(status) => {
                self.reconcile(&status);
                self.publish();
                debug!(desired = target, "Scale-down converged");
                Ok(())
            }
            Err(e) => Err(e),
        };

        match (reply_to, outcome) {
            (Some(reply_to), outcome) => {
                let _ = reply_to.send(outcome);
            }
            (None, Err(e)) => {
                warn!(error = %e, desired = target, "Scale-down did not converge");
            }
            (None, Ok(())) => {}
        }
    }

    #[instrument(skip_all, fields(service = %self.settings.name))]
    async fn resync(&mut self) -> Result<RegistrySnapshot, FactoryError> {
        match self.rm.get_service(&self.settings.name).await? {
            Some(status) => {
                self.reconcile(&status);
                debug!(components = self.registry.len(), "Registry resynced");
            }
            None => {
                if self.lifecycle != ServiceLifecycle::Absent {
                    warn!(lifecycle = %self.lifecycle, "Service no longer exists remotely");
                    self.forget();
                    self.lifecycle = ServiceLifecycle::Absent;
                } else {
                    self.registry.clear();
                }
            }
        }
        self.publish();
        Ok(self.registry.snapshot())
    }

    async fn recover(&mut self) -> Result<Vec<Placement>, FactoryError> {
        self.require_stable("recover containers")?;
        self.resync().await?;

        let placements: Vec<Placement> = self
            .registry
            .claim_unbound()
            .into_iter()
            .map(|(component, instance)| Placement {
                component,
                instance,
                generation: self.generation,
            })
            .collect();
        self.publish();

        info!(
            service = %self.settings.name,
            recovered = placements.len(),
            "Recovered running containers"
        );
        Ok(placements)
    }

    #[instrument(skip_all, fields(service = %self.settings.name))]
    async fn cleanup(&mut self) -> Result<(), FactoryError> {
        self.set_lifecycle(ServiceLifecycle::Destroying);

        let result = match self.rm.delete_service(&self.settings.name).await {
            Ok(DeleteOutcome::Deleted) => self.poller.await_service_absent().await,
            Ok(DeleteOutcome::NotFound) => {
                debug!("Service was already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        };

        // Local tracking is dropped whatever the remote outcome.
        self.forget();
        self.set_lifecycle(ServiceLifecycle::Absent);

        match &result {
            Ok(()) => info!("Service removed"),
            Err(e) => warn!(error = %e, "Service removal failed; local state discarded"),
        }
        result
    }

    /// Undo the binding of placements whose caller stopped waiting.
    fn unbind(&mut self, placements: &[Placement]) {
        for placement in placements {
            self.registry
                .release(&placement.component, &placement.instance.container_id);
            warn!(
                component = %placement.component,
                instance = %placement.instance.instance_name,
                "Caller went away; container left running unbound"
            );
        }
        self.publish();
    }
}

#[async_trait]
impl Actor for ServiceActor {
    type Message = ServiceMessage;

    fn name(&self) -> &str {
        "service"
    }

    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        self.publish();
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: ServiceMessage,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        match msg {
            ServiceMessage::Init { reply_to } => {
                let result = self.init().await;
                let _ = reply_to.send(result);
            }

            ServiceMessage::CreateContainer { request, reply_to } => {
                let result = self.create_container(&request).await;
                if let Err(Ok(placement)) = reply_to.send(result) {
                    self.unbind(&[placement]);
                }
            }

            ServiceMessage::Destroy { request, reply_to } => {
                self.destroy(request, reply_to).await;
            }

            ServiceMessage::Resync { reply_to } => {
                let result = self.resync().await;
                let _ = reply_to.send(result);
            }

            ServiceMessage::Recover { reply_to } => {
                let result = self.recover().await;
                if let Err(Ok(placements)) = reply_to.send(result) {
                    self.unbind(&placements);
                }
            }

            ServiceMessage::Cleanup { reply_to } => {
                let result = self.cleanup().await;
                let _ = reply_to.send(result);
            }
        }

        Ok(true)
    }

    async fn on_stop(&mut self, ctx: &mut ActorContext) {
        info!(
            actor_id = %ctx.actor_id,
            messages = ctx.messages_processed,
            service = %self.settings.name,
            lifecycle = %self.lifecycle,
            components = self.registry.len(),
            "Service actor stopping"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_predeclare_zero_count_components() {
        let config = FactoryConfig {
            runtimes_registry: Some("registry.local".to_string()),
            predeclared_images: vec![
                "openwhisk/nodejs:20".to_string(),
                "openwhisk/python3:3.11".to_string(),
            ],
            default_cpus: 2,
            default_memory_mb: 512,
            ..Default::default()
        };

        let settings = ServiceSettings::from_config(&config).unwrap();
        assert_eq!(settings.predeclared.len(), 2);

        let nodejs = &settings.predeclared[0];
        assert_eq!(nodejs.name, "registry-local-openwhisk-nodejs-20-d2b0a8f5");
        assert_eq!(nodejs.number_of_containers, 0);
        assert_eq!(
            nodejs.artifact.as_ref().unwrap().id,
            "registry.local/openwhisk/nodejs:20"
        );
        assert_eq!(nodejs.resource, Some(ResourceSpec::new(2, 512)));
    }

    #[test]
    fn test_settings_reject_bad_image() {
        let config = FactoryConfig {
            predeclared_images: vec!["openwhisk/:latest".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            ServiceSettings::from_config(&config),
            Err(FactoryError::InvalidImage(_))
        ));
    }
}
