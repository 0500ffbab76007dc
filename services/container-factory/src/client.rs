//! Resource manager REST client.
//!
//! Wraps the services API of a YARN-style resource manager:
//! - Creating and deleting the factory's service
//! - Reading service status (components, containers)
//! - Flexing a component to a target container count
//!
//! The client never retries. Every call either returns the decoded response or
//! a [`RemoteError`] carrying the HTTP status and body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::{AuthMode, FactoryConfig};
use crate::error::RemoteError;

/// Resource manager operations used by the orchestrator.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Submit a service definition. Creating an existing service is not an
    /// error.
    async fn create_service(&self, spec: &ServiceSpec) -> Result<CreateOutcome, RemoteError>;

    /// Read the current status, or `None` if the service does not exist.
    async fn get_service(&self, name: &str) -> Result<Option<ServiceStatus>, RemoteError>;

    /// Set a component's desired container count. A component that does not
    /// exist yet is created when the spec carries an artifact and resource.
    async fn flex_component(&self, service: &str, component: &ComponentSpec)
        -> Result<(), RemoteError>;

    /// Remove the service and every container in it.
    async fn delete_service(&self, name: &str) -> Result<DeleteOutcome, RemoteError>;
}

/// Result of [`ResourceManager::create_service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Result of [`ResourceManager::delete_service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// HTTP implementation of [`ResourceManager`].
#[derive(Debug, Clone)]
pub struct ResourceManagerClient {
    client: reqwest::Client,
    base_url: String,
    user: Option<String>,
}

impl ResourceManagerClient {
    /// Create a client from config.
    pub fn new(config: &FactoryConfig) -> Result<Self, RemoteError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let user = match &config.auth {
            AuthMode::Simple { user } => Some(user.clone()),
            AuthMode::Kerberos { token } => {
                let mut value = HeaderValue::from_str(&format!("Negotiate {token}"))
                    .map_err(|_| RemoteError::InvalidRequest("invalid kerberos token".into()))?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
                None
            }
        };

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|source| RemoteError::Transport {
                operation: "build_client",
                source,
            })?;

        Ok(Self {
            client,
            base_url: config.resource_manager_url.trim_end_matches('/').to_string(),
            user,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Attach simple-auth identity and send.
    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, RemoteError> {
        let request = match &self.user {
            Some(user) => request.query(&[("user.name", user.as_str())]),
            None => request,
        };

        request
            .send()
            .await
            .map_err(|source| RemoteError::Transport { operation, source })
    }

    async fn rejected(operation: &'static str, response: Response) -> RemoteError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(operation, status = %status, body = %body, "Resource manager rejected request");
        RemoteError::Rejected {
            operation,
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl ResourceManager for ResourceManagerClient {
    async fn create_service(&self, spec: &ServiceSpec) -> Result<CreateOutcome, RemoteError> {
        const OP: &str = "create_service";
        debug!(
            service = %spec.name,
            components = spec.components.len(),
            "Creating service"
        );

        let response = self
            .send(OP, self.client.post(self.url("/services")).json(spec))
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(CreateOutcome::Created);
        }
        if status == StatusCode::CONFLICT {
            return Ok(CreateOutcome::AlreadyExists);
        }

        // Some resource manager versions answer 400 with a diagnostic instead of 409.
        let err = Self::rejected(OP, response).await;
        if let RemoteError::Rejected { status: 400, body, .. } = &err {
            if body.to_ascii_lowercase().contains("already exists") {
                return Ok(CreateOutcome::AlreadyExists);
            }
        }
        Err(err)
    }

    async fn get_service(&self, name: &str) -> Result<Option<ServiceStatus>, RemoteError> {
        const OP: &str = "get_service";
        let url = self.url(&format!("/services/{name}"));
        debug!(url = %url, "Fetching service status");

        let response = self.send(OP, self.client.get(&url)).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::rejected(OP, response).await);
        }

        let body = response
            .text()
            .await
            .map_err(|source| RemoteError::Transport { operation: OP, source })?;
        let status: ServiceStatus =
            serde_json::from_str(&body).map_err(|e| RemoteError::Malformed {
                operation: OP,
                message: e.to_string(),
            })?;

        Ok(Some(status))
    }

    async fn flex_component(
        &self,
        service: &str,
        component: &ComponentSpec,
    ) -> Result<(), RemoteError> {
        const OP: &str = "flex_component";
        debug!(
            service,
            component = %component.name,
            number_of_containers = component.number_of_containers,
            "Flexing component"
        );

        let url = self.url(&format!("/services/{service}/components/{}", component.name));
        let response = self.send(OP, self.client.put(url).json(component)).await?;

        if !response.status().is_success() {
            return Err(Self::rejected(OP, response).await);
        }
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<DeleteOutcome, RemoteError> {
        const OP: &str = "delete_service";
        debug!(service = name, "Deleting service");

        let url = self.url(&format!("/services/{name}"));
        let response = self.send(OP, self.client.delete(url)).await?;

        match response.status() {
            s if s.is_success() => Ok(DeleteOutcome::Deleted),
            StatusCode::NOT_FOUND => Ok(DeleteOutcome::NotFound),
            _ => Err(Self::rejected(OP, response).await),
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// Service definition submitted on creation.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSpec {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    pub components: Vec<ComponentSpec>,
}

/// Component definition; also the body of a flex request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentSpec {
    pub name: String,
    pub number_of_containers: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_command: Option<String>,
}

impl ComponentSpec {
    /// A bare count change for a component the resource manager already knows.
    pub fn flex(name: impl Into<String>, number_of_containers: u32) -> Self {
        Self {
            name: name.into(),
            number_of_containers,
            artifact: None,
            resource: None,
            launch_command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: ArtifactKind,
}

impl Artifact {
    pub fn docker(image: impl Into<String>) -> Self {
        Self {
            id: image.into(),
            kind: ArtifactKind::Docker,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    #[default]
    Docker,
    Tarball,
    Service,
}

/// Per-container resources. The resource manager takes memory in MB as a
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpus: u32,
    pub memory: String,
}

impl ResourceSpec {
    pub fn new(cpus: u32, memory_mb: u64) -> Self {
        Self {
            cpus,
            memory: memory_mb.to_string(),
        }
    }

    pub fn memory_mb(&self) -> Option<u64> {
        self.memory.trim().parse().ok()
    }
}

/// Service lifecycle state as reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Accepted,
    Started,
    Stable,
    Flex,
    Upgrading,
    Stopped,
    Failed,
    #[serde(other)]
    Unknown,
}

impl ServiceState {
    /// States from which the service will not converge on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    Init,
    Started,
    RunningButUnready,
    Ready,
    Stopped,
    NeedsUpgrade,
    Upgrading,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Service status returned by `GET /services/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    #[serde(default)]
    pub components: Vec<ComponentStatus>,
}

impl ServiceStatus {
    pub fn component(&self, name: &str) -> Option<&ComponentStatus> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn is_stable(&self) -> bool {
        self.state == ServiceState::Stable
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub name: String,
    #[serde(default)]
    pub number_of_containers: u32,
    #[serde(default)]
    pub artifact: Option<Artifact>,
    #[serde(default)]
    pub resource: Option<ResourceSpec>,
    #[serde(default)]
    pub containers: Vec<ContainerStatus>,
}

impl ComponentStatus {
    /// Containers that are up and serving and whose instance name carries an
    /// ordinal. Instances without one cannot be bound to a handle, so they are
    /// not counted as running.
    pub fn ready_containers(&self) -> impl Iterator<Item = &ContainerStatus> {
        self.containers
            .iter()
            .filter(|c| c.state == ContainerState::Ready && c.ordinal().is_some())
    }

    pub fn running_count(&self) -> u32 {
        self.ready_containers().count() as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub id: String,
    pub component_instance_name: String,
    pub state: ContainerState,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub log_url: Option<String>,
}

impl ContainerStatus {
    /// Position within the component, parsed from `{component}-{ordinal}`.
    pub fn ordinal(&self) -> Option<u32> {
        self.component_instance_name
            .rsplit_once('-')
            .and_then(|(_, n)| n.parse().ok())
    }
}
