//! Actor-based serialization of service mutations.
//!
//! - **ServiceActor**: sole writer of the factory's service and component
//!   registry; one mutation in flight at a time.

pub mod framework;
pub mod service;

pub use framework::{spawn_actor, Actor, ActorContext, ActorError, ActorHandle, ActorRef};
pub use service::{
    CreateRequest, DestroyRequest, Placement, ServiceActor, ServiceMessage, ServiceSettings,
};
