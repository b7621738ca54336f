//! Storage error types.

use rsroles_domain::model::EdgeTable;
use thiserror::Error;
use uuid::Uuid;

/// Storage-specific errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Entity not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Unique constraint violated.
    #[error("{entity} already exists: {key}")]
    AlreadyExists { entity: &'static str, key: String },

    /// Edge already present in the table.
    #[error("duplicate {table} edge: {subject_id} -> {object_id}")]
    DuplicateEdge {
        table: EdgeTable,
        subject_id: Uuid,
        object_id: Uuid,
    },

    /// Edge absent from the table.
    #[error("{table} edge not found: {subject_id} -> {object_id}")]
    EdgeNotFound {
        table: EdgeTable,
        subject_id: Uuid,
        object_id: Uuid,
    },

    /// Another migration job is still running.
    #[error("migration job already in progress: {job_id}")]
    MigrationInProgress { job_id: Uuid },

    /// Database connection error.
    #[error("database connection error: {message}")]
    ConnectionError { message: String },

    /// Database query error.
    #[error("database query error: {message}")]
    QueryError { message: String },

    /// Invalid input error.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Internal error.
    #[error("internal storage error: {message}")]
    InternalError { message: String },
}

impl StorageError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StorageError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn already_exists(entity: &'static str, key: impl ToString) -> Self {
        StorageError::AlreadyExists {
            entity,
            key: key.to_string(),
        }
    }

    /// Unique-constraint style conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::AlreadyExists { .. }
                | StorageError::DuplicateEdge { .. }
                | StorageError::MigrationInProgress { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::NotFound { .. } | StorageError::EdgeNotFound { .. }
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
