//! yarnpool Container Factory
//!
//! Runs action containers as components of one long-running service on a
//! YARN-style resource manager instead of launching them on a local engine.
//! Each distinct image maps to one component; creating or destroying a
//! container flexes that component's container count by one.
//!
//! ## Architecture
//!
//! ```text
//! ContainerFactory            (init / create_container / cleanup)
//! └── Orchestrator            (cloneable mailbox handle, status reads)
//!     └── ServiceActor        (single writer, one mutation at a time)
//!         ├── ComponentRegistry
//!         ├── StabilityPoller
//!         └── ResourceManager (REST client)
//! ```
//!
//! Every mutation is polled to convergence before the next one is sent: the
//! resource manager's behavior under overlapping structural changes is
//! undefined. Local bookkeeping is a cache of the remote service description
//! and is rebuilt from it on init, resync and recovery.
//!
//! ## Modules
//!
//! - `client`: resource manager REST client and wire types
//! - `poller`: stability polling
//! - `registry`: in-memory component bookkeeping
//! - `actors`: actor framework and the service actor
//! - `orchestrator`: front door to the service actor
//! - `handle`: caller-facing container handles
//! - `factory`: the container factory façade

pub mod actors;
pub mod client;
pub mod config;
pub mod error;
pub mod factory;
pub mod handle;
pub mod image;
pub mod orchestrator;
pub mod poller;
pub mod registry;

// Re-export commonly used types
pub use client::{ResourceManager, ResourceManagerClient, ServiceState, ServiceStatus};
pub use config::{AuthMode, FactoryConfig};
pub use error::{FactoryError, RemoteError};
pub use factory::ContainerFactory;
pub use handle::ContainerHandle;
pub use image::ImageName;
pub use orchestrator::ServiceLifecycle;
pub use registry::RegistrySnapshot;
pub use yarnpool_id::{ComponentName, ContainerId, TransactionId};
