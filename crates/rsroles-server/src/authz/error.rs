//! Authorization-server error types.

use thiserror::Error;

use crate::error::ServiceError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthzError {
    #[error("{kind} already exists on authorization server: {name}")]
    Conflict { kind: &'static str, name: String },

    #[error("{kind} not found on authorization server: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("authorization server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("authorization server unreachable: {message}")]
    Unavailable { message: String },

    #[error("authorization server rejected credentials: {message}")]
    Authentication { message: String },

    #[error("unexpected authorization server response: {message}")]
    Decode { message: String },
}

impl AuthzError {
    /// Maps a non-success HTTP status to an error.
    pub fn from_status(status: u16, kind: &'static str, name: &str, body: String) -> Self {
        match status {
            409 => AuthzError::Conflict {
                kind,
                name: name.to_string(),
            },
            404 => AuthzError::NotFound {
                kind,
                name: name.to_string(),
            },
            401 | 403 => AuthzError::Authentication { message: body },
            _ => AuthzError::Status {
                status,
                message: body,
            },
        }
    }

    /// 5xx and transport failures may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            AuthzError::Status { status, .. } => *status >= 500,
            AuthzError::Unavailable { .. } => true,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AuthzError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AuthzError::NotFound { .. })
    }
}

impl From<AuthzError> for ServiceError {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::NotFound { kind, name } => ServiceError::NotFound { entity: kind, id: name },
            AuthzError::Conflict { .. } => ServiceError::Conflict {
                message: err.to_string(),
            },
            other => ServiceError::RemoteService {
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }
}

/// Result type for authorization-server calls.
pub type AuthzResult<T> = Result<T, AuthzError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(AuthzError::from_status(409, "policy", "p", String::new()).is_conflict());
        assert!(AuthzError::from_status(404, "policy", "p", String::new()).is_not_found());
        assert!(matches!(
            AuthzError::from_status(401, "policy", "p", "expired".to_string()),
            AuthzError::Authentication { .. }
        ));
        assert!(AuthzError::from_status(503, "policy", "p", String::new()).is_retryable());
        assert!(!AuthzError::from_status(400, "policy", "p", String::new()).is_retryable());
    }

    #[test]
    fn test_conversion_keeps_retryability() {
        let err: ServiceError = AuthzError::Unavailable {
            message: "connection refused".to_string(),
        }
        .into();
        assert!(err.is_retryable());

        let err: ServiceError = AuthzError::from_status(400, "role", "r", "bad".to_string()).into();
        assert!(matches!(err, ServiceError::RemoteService { retryable: false, .. }));
    }
}
