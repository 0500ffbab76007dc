//! Mock resource manager for integration tests.
//!
//! Serves the subset of the YARN services REST API the container factory
//! consumes, under `/app/v1`:
//!
//! - `POST   /services`: create (409 if it already exists)
//! - `GET    /services/{name}`: status with per-component containers
//! - `PUT    /services/{name}/components/{component}`: flex
//! - `DELETE /services/{name}`: remove
//!
//! Mutations converge after a configurable delay so tests can observe the
//! asynchronous contract. The mock also records every request, can inject
//! failures, and counts mutations that arrive while an earlier one is still
//! converging.

mod routes;
mod state;

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use routes::Shared;
use state::MockState;

pub use state::{
    ComponentDoc, ComponentView, ContainerDoc, InjectedResponse, MockOperation, RecordedRequest,
    ServiceDoc,
};

/// Authentication the mock enforces.
#[derive(Debug, Clone, Default)]
pub enum MockAuth {
    /// Accept everything.
    #[default]
    None,
    /// Require `?user.name={user}`.
    Simple { user: String },
    /// Require `Authorization: Negotiate {token}`.
    Negotiate { token: String },
}

/// Mock configuration.
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Time between accepting a mutation and it becoming visible.
    pub convergence_delay: Duration,
    pub auth: MockAuth,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            convergence_delay: Duration::from_millis(50),
            auth: MockAuth::None,
        }
    }
}

/// A running mock resource manager bound to a loopback port.
pub struct MockResourceManager {
    addr: SocketAddr,
    shared: Shared,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockResourceManager {
    /// Starts a mock with default settings.
    pub async fn start() -> io::Result<Self> {
        Self::spawn(MockConfig::default()).await
    }

    /// Starts a mock on `127.0.0.1:0`.
    pub async fn spawn(config: MockConfig) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let shared = Shared {
            state: Arc::new(Mutex::new(MockState::new(
                addr.to_string(),
                config.convergence_delay,
            ))),
            auth: config.auth,
        };
        let app = routes::router(shared.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            shared,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Base URL to configure the client with (includes `/app/v1`).
    pub fn base_url(&self) -> String {
        format!("http://{}/app/v1", self.addr)
    }

    pub fn set_convergence_delay(&self, delay: Duration) {
        self.shared.lock().convergence_delay = delay;
    }

    /// Makes the next request for `op` fail with `status`.
    pub fn fail_next(&self, op: MockOperation, status: u16) {
        self.shared
            .lock()
            .injected
            .push_back((op, InjectedResponse::Status(status)));
    }

    /// Makes the next request for `op` return a non-JSON 200 body.
    pub fn garble_next(&self, op: MockOperation) {
        self.shared
            .lock()
            .injected
            .push_back((op, InjectedResponse::Garbage));
    }

    /// Creates an already-converged service with `(component, image, count)`
    /// entries.
    pub fn seed_service(&self, name: &str, components: &[(&str, &str, u32)]) {
        self.shared.lock().seed_service(name, components);
    }

    /// Puts a service into the FAILED state.
    pub fn mark_failed(&self, name: &str) {
        if let Some(service) = self.shared.lock().services.get_mut(name) {
            service.failed = true;
        }
    }

    pub fn service_exists(&self, name: &str) -> bool {
        self.shared.lock().services.contains_key(name)
    }

    /// Current status document, after applying due convergence.
    pub fn service(&self, name: &str) -> Option<ServiceDoc> {
        let mut state = self.shared.lock();
        state.settle();
        state.render_service(name)
    }

    pub fn component_names(&self, service: &str) -> Vec<String> {
        let state = self.shared.lock();
        state
            .services
            .get(service)
            .map(|s| s.components.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn component(&self, service: &str, component: &str) -> Option<ComponentView> {
        let mut state = self.shared.lock();
        state.settle();
        state.component_view(service, component)
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.shared.lock().requests.clone()
    }

    /// Mutations received while an earlier change was still converging.
    pub fn overlapping_mutations(&self) -> u32 {
        self.shared.lock().overlapping_mutations
    }
}

impl Drop for MockResourceManager {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
