//! Migration job bookkeeping.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    InProgress,
    Finished,
    Failed,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationStatus::InProgress => "IN_PROGRESS",
            MigrationStatus::Finished => "FINISHED",
            MigrationStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: Uuid,
    pub status: MigrationStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_records: u64,
}

impl MigrationJob {
    pub fn start() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: MigrationStatus::InProgress,
            started_at: Utc::now(),
            finished_at: None,
            total_records: 0,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == MigrationStatus::InProgress
    }
}

/// Kind of record a migration error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationErrorType {
    Role,
    Capability,
    CapabilitySet,
    Assignment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationError {
    pub id: Uuid,
    pub job_id: Uuid,
    pub error_type: MigrationErrorType,
    pub message: String,
    /// Name or id of the entity that failed.
    pub entity_ref: String,
    pub occurred_at: DateTime<Utc>,
}

impl MigrationError {
    pub fn new(
        job_id: Uuid,
        error_type: MigrationErrorType,
        entity_ref: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            error_type,
            message: message.into(),
            entity_ref: entity_ref.into(),
            occurred_at: Utc::now(),
        }
    }
}
