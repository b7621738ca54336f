//! Service-layer error types.
//!
//! `ServiceError` is what callers of the synchronization services see. Store
//! and domain failures convert into it, and so do authorization-server
//! failures (see [`crate::authz::AuthzError`]).

use rsroles_domain::DomainError;
use rsroles_storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Referenced role, policy, capability or user is absent.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Duplicate name or an already-assigned edge.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// The authorization server failed or was unreachable.
    #[error("authorization server error: {message}")]
    RemoteService { message: String, retryable: bool },

    /// A compensating action failed; the two stores may now disagree.
    #[error("stores are inconsistent after failed compensation: {source}")]
    Inconsistency {
        source: Box<ServiceError>,
        compensation_failures: Vec<ServiceError>,
    },

    /// Several concurrent sub-operations failed.
    #[error("{primary} ({} more failures suppressed)", .suppressed.len())]
    Aggregate {
        primary: Box<ServiceError>,
        suppressed: Vec<ServiceError>,
    },

    /// Permissions of a loadable role still reference missing capabilities.
    #[error("role {role_id} has unresolved permissions: {}", .permissions.join(", "))]
    UnresolvedPermissions {
        role_id: Uuid,
        permissions: Vec<String>,
    },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl ServiceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ServiceError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ServiceError::Conflict {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation {
            message: message.into(),
        }
    }

    /// Wraps `source` with the compensation failures that followed it.
    pub fn inconsistency(source: ServiceError, compensation_failures: Vec<ServiceError>) -> Self {
        ServiceError::Inconsistency {
            source: Box::new(source),
            compensation_failures,
        }
    }

    /// Attaches `suppressed` to this error. Returns `self` unchanged when empty.
    pub fn with_suppressed(self, suppressed: Vec<ServiceError>) -> Self {
        if suppressed.is_empty() {
            return self;
        }
        match self {
            ServiceError::Aggregate {
                primary,
                suppressed: mut existing,
            } => {
                existing.extend(suppressed);
                ServiceError::Aggregate {
                    primary,
                    suppressed: existing,
                }
            }
            other => ServiceError::Aggregate {
                primary: Box::new(other),
                suppressed,
            },
        }
    }

    /// Whether a retry of the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::RemoteService { retryable, .. } => *retryable,
            ServiceError::UnresolvedPermissions { .. } => true,
            ServiceError::Aggregate { primary, .. } => primary.is_retryable(),
            _ => false,
        }
    }

    /// The error that caused this one to be raised.
    pub fn primary(&self) -> &ServiceError {
        match self {
            ServiceError::Aggregate { primary, .. } => primary.primary(),
            ServiceError::Inconsistency { source, .. } => source.primary(),
            other => other,
        }
    }

    /// Errors attached to this one as suppressed.
    pub fn suppressed(&self) -> &[ServiceError] {
        match self {
            ServiceError::Aggregate { suppressed, .. } => suppressed,
            ServiceError::Inconsistency {
                compensation_failures,
                ..
            } => compensation_failures,
            _ => &[],
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.primary(), ServiceError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.primary(), ServiceError::Conflict { .. })
    }

    pub fn is_inconsistency(&self) -> bool {
        matches!(self, ServiceError::Inconsistency { .. })
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { entity, id } => ServiceError::NotFound { entity, id },
            err if err.is_conflict() => ServiceError::Conflict {
                message: err.to_string(),
            },
            err => ServiceError::Storage(err),
        }
    }
}

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;
