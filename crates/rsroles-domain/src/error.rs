//! Domain error types for catalog operations.

use thiserror::Error;

/// Domain-specific errors for catalog operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    /// Permission name could not be mapped to a `(resource, action)` key.
    #[error("cannot resolve capability for permission: {permission}")]
    UnresolvablePermission { permission: String },

    /// Unknown capability action token.
    #[error("invalid capability action: {value}")]
    InvalidAction { value: String },

    /// Unknown HTTP method.
    #[error("invalid http method: {value}")]
    InvalidHttpMethod { value: String },

    /// Unknown policy type in an external representation.
    #[error("invalid policy type: {value}")]
    InvalidPolicyType { value: String },

    /// External representation is missing a required config entry.
    #[error("policy '{policy}' is missing config entry '{key}'")]
    MissingPolicyConfig { policy: String, key: String },

    /// Module event is structurally invalid.
    #[error("invalid module event: {message}")]
    InvalidModuleEvent { message: String },

    /// Generic validation failure.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
