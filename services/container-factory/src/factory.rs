//! Container factory façade.
//!
//! Translates container-pool requests (byte-sized memory, image descriptors)
//! into orchestrator operations and wraps the results in
//! [`ContainerHandle`]s. Holds no state of its own beyond the orchestrator.

use std::sync::Arc;

use tracing::{info, instrument};
use yarnpool_id::TransactionId;

use crate::actors::{CreateRequest, ServiceSettings};
use crate::client::{ResourceManager, ResourceManagerClient, ResourceSpec, ServiceStatus};
use crate::config::FactoryConfig;
use crate::error::FactoryError;
use crate::handle::ContainerHandle;
use crate::image::ImageName;
use crate::orchestrator::{Orchestrator, ServiceLifecycle};
use crate::poller::StabilityPoller;
use crate::registry::RegistrySnapshot;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Produces containers hosted as components of one resource-manager service.
pub struct ContainerFactory {
    config: Arc<FactoryConfig>,
    orchestrator: Orchestrator,
}

impl ContainerFactory {
    /// Create a factory talking to the configured resource manager.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: FactoryConfig) -> Result<Self, FactoryError> {
        let rm = Arc::new(ResourceManagerClient::new(&config)?);
        Self::with_resource_manager(config, rm)
    }

    /// Create a factory on top of any [`ResourceManager`] implementation.
    pub fn with_resource_manager(
        config: FactoryConfig,
        rm: Arc<dyn ResourceManager>,
    ) -> Result<Self, FactoryError> {
        let settings = ServiceSettings::from_config(&config)?;
        let poller = StabilityPoller::new(
            rm.clone(),
            config.service_name.clone(),
            config.service_poll_policy(),
            config.container_poll_policy(),
        );
        let orchestrator = Orchestrator::spawn(rm, poller, settings);

        info!(
            service = %config.service_name,
            rm_url = %config.resource_manager_url,
            auth = config.auth.kind(),
            "Container factory created"
        );

        Ok(Self {
            config: Arc::new(config),
            orchestrator,
        })
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Create the service, or adopt it if it already exists, and wait until
    /// it is stable.
    pub async fn init(&self) -> Result<(), FactoryError> {
        self.orchestrator.init().await.map(|_| ())
    }

    /// Start one container of `image` and wait until it is running.
    ///
    /// `memory_bytes` is rounded up to whole megabytes; zero memory or CPUs
    /// fall back to the configured defaults. Runtime images
    /// (`use_provided_image == false`) are pulled from the configured runtimes
    /// registry.
    #[instrument(skip_all, fields(tx_id = %tx_id, name_hint = %name_hint, image = %image))]
    pub async fn create_container(
        &self,
        tx_id: &TransactionId,
        name_hint: &str,
        image: &ImageName,
        use_provided_image: bool,
        memory_bytes: u64,
        cpus: u32,
    ) -> Result<ContainerHandle, FactoryError> {
        let registry = self.config.runtimes_registry.as_deref();
        let request = CreateRequest {
            tx_id: *tx_id,
            component: image.component_name(registry, use_provided_image)?,
            image: image.resolve(registry, use_provided_image),
            resources: self.resource_spec(memory_bytes, cpus),
        };

        let placement = self.orchestrator.create_container(request).await?;
        let handle = ContainerHandle::new(
            self.orchestrator.clone(),
            placement,
            name_hint,
            self.config.surface_log_links,
        );

        if let Some(log_url) = handle.log_url() {
            info!(container_id = %handle.id(), log_url, "Container logs available");
        }
        Ok(handle)
    }

    /// Delete the service and every container in it. Local state is
    /// discarded even if the delete fails.
    pub async fn cleanup(&self) -> Result<(), FactoryError> {
        self.orchestrator.cleanup().await
    }

    /// Handles for running containers that no live handle owns, e.g. those
    /// created before a restart.
    pub async fn recover_containers(&self) -> Result<Vec<ContainerHandle>, FactoryError> {
        let placements = self.orchestrator.recover().await?;
        Ok(placements
            .into_iter()
            .map(|placement| {
                let name_hint = placement.instance.instance_name.clone();
                ContainerHandle::new(
                    self.orchestrator.clone(),
                    placement,
                    name_hint,
                    self.config.surface_log_links,
                )
            })
            .collect())
    }

    /// Rebuild local bookkeeping from the remote service description.
    pub async fn resync(&self) -> Result<RegistrySnapshot, FactoryError> {
        self.orchestrator.resync().await
    }

    /// Remote status, read without waiting for pending mutations.
    pub async fn service_status(&self) -> Result<Option<ServiceStatus>, FactoryError> {
        self.orchestrator.service_status().await
    }

    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        self.orchestrator.snapshot()
    }

    pub fn lifecycle(&self) -> ServiceLifecycle {
        self.orchestrator.lifecycle()
    }

    /// Stop the orchestrator. The remote service is left as it is.
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }

    fn resource_spec(&self, memory_bytes: u64, cpus: u32) -> ResourceSpec {
        let memory_mb = match memory_bytes {
            0 => self.config.default_memory_mb,
            bytes => bytes.div_ceil(BYTES_PER_MB),
        };
        let cpus = match cpus {
            0 => self.config.default_cpus,
            n => n,
        };
        ResourceSpec::new(cpus, memory_mb)
    }
}
