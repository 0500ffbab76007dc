//! # yarnpool-id
//!
//! Identifier types shared by the container factory.
//!
//! Two kinds of identity live here:
//!
//! - **Local IDs** (`ContainerId`, `TransactionId`): ULID-backed, prefixed
//!   (`ctr_01HV…`, `tx_01HV…`), generated by this process and never sent to the
//!   resource manager as keys.
//! - **Component names** (`ComponentName`): DNS-label-safe names derived
//!   deterministically from a container image reference. The same image always
//!   yields the same component, so a restarted process maps images back onto
//!   the components it created before.

mod component;
mod error;
mod macros;
mod types;

pub use component::ComponentName;
pub use error::IdError;
pub use types::*;

/// Re-export ulid for the `define_id!` macro expansion.
pub use ulid::Ulid;
