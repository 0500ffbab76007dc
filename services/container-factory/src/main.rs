//! yarnpool Container Factory daemon
//!
//! Creates (or adopts) the configured service, optionally pre-warms
//! containers for every pre-declared image, and removes the whole service on
//! Ctrl-C.

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use yarnpool_factory::{ContainerFactory, FactoryConfig, ImageName, TransactionId};

#[tokio::main]
async fn main() -> Result<()> {
    let config = FactoryConfig::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        service = %config.service_name,
        rm_url = %config.resource_manager_url,
        auth = config.auth.kind(),
        queue = %config.queue,
        "Configuration loaded"
    );

    let factory = ContainerFactory::new(config.clone()).context("failed to create factory")?;
    factory.init().await.context("failed to initialize service")?;

    let recovered = factory.recover_containers().await?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "Adopted containers from a previous run");
    }

    let mut warm = Vec::new();
    for raw in &config.predeclared_images {
        let image = ImageName::parse(raw)?;
        for n in 0..config.prewarm_count {
            let tx_id = TransactionId::new();
            let name_hint = format!("prewarm-{}-{n}", image.name);
            match factory
                .create_container(&tx_id, &name_hint, &image, false, 0, 0)
                .await
            {
                Ok(handle) => {
                    info!(
                        container_id = %handle.id(),
                        instance = handle.instance_name(),
                        "Pre-warmed container"
                    );
                    warm.push(handle);
                }
                Err(e) => {
                    warn!(image = %image, error = %e, "Pre-warm failed");
                    break;
                }
            }
        }
    }

    let snapshot = factory.registry_snapshot();
    info!(
        lifecycle = %factory.lifecycle(),
        components = snapshot.components.len(),
        containers = warm.len() + recovered.len(),
        "Container factory ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    if let Err(e) = factory.cleanup().await {
        error!(error = %e, indeterminate = e.is_indeterminate(), "Cleanup failed");
    }
    factory.shutdown().await;

    info!("Container factory shutdown complete");
    Ok(())
}
