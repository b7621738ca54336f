//! Assignment edges between subjects (roles, users) and catalog objects.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The side of an assignment that receives access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Subject {
    Role(Uuid),
    User(Uuid),
}

impl Subject {
    pub fn id(&self) -> Uuid {
        match self {
            Subject::Role(id) | Subject::User(id) => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Subject::Role(_) => "role",
            Subject::User(_) => "user",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind(), self.id())
    }
}

/// The catalog object side of an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Grant {
    Capability(Uuid),
    CapabilitySet(Uuid),
}

impl Grant {
    pub fn id(&self) -> Uuid {
        match self {
            Grant::Capability(id) | Grant::CapabilitySet(id) => *id,
        }
    }
}

/// Edge tables of the assignment graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeTable {
    RoleCapability,
    RoleCapabilitySet,
    UserCapability,
    UserCapabilitySet,
    UserRole,
    /// Capability-set membership: (set id, capability id).
    CapabilitySetMember,
}

impl EdgeTable {
    /// Table for a `(subject, grant)` assignment.
    pub fn for_assignment(subject: &Subject, grant: &Grant) -> Self {
        match (subject, grant) {
            (Subject::Role(_), Grant::Capability(_)) => EdgeTable::RoleCapability,
            (Subject::Role(_), Grant::CapabilitySet(_)) => EdgeTable::RoleCapabilitySet,
            (Subject::User(_), Grant::Capability(_)) => EdgeTable::UserCapability,
            (Subject::User(_), Grant::CapabilitySet(_)) => EdgeTable::UserCapabilitySet,
        }
    }

    /// Tables whose object side references a capability id.
    pub const CAPABILITY_TABLES: [EdgeTable; 3] = [
        EdgeTable::RoleCapability,
        EdgeTable::UserCapability,
        EdgeTable::CapabilitySetMember,
    ];

    /// Tables whose object side references a capability-set id.
    pub const CAPABILITY_SET_TABLES: [EdgeTable; 2] =
        [EdgeTable::RoleCapabilitySet, EdgeTable::UserCapabilitySet];
}

impl fmt::Display for EdgeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EdgeTable::RoleCapability => "role_capability",
            EdgeTable::RoleCapabilitySet => "role_capability_set",
            EdgeTable::UserCapability => "user_capability",
            EdgeTable::UserCapabilitySet => "user_capability_set",
            EdgeTable::UserRole => "user_role",
            EdgeTable::CapabilitySetMember => "capability_set_capability",
        };
        f.write_str(name)
    }
}

/// A `(subject-id, object-id)` row in one of the edge tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub table: EdgeTable,
    pub subject_id: Uuid,
    pub object_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn new(table: EdgeTable, subject_id: Uuid, object_id: Uuid) -> Self {
        Self {
            table,
            subject_id,
            object_id,
            created_at: Utc::now(),
        }
    }

    pub fn assignment(subject: Subject, grant: Grant) -> Self {
        Self::new(
            EdgeTable::for_assignment(&subject, &grant),
            subject.id(),
            grant.id(),
        )
    }
}
