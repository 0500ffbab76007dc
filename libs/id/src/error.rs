//! Error types for ID parsing and component name validation.

use thiserror::Error;

/// Errors that can occur when parsing IDs or validating component names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ID has an unexpected prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A component name is not a valid DNS label.
    #[error("invalid component name '{name}': {reason}")]
    InvalidComponentName { name: String, reason: &'static str },
}
