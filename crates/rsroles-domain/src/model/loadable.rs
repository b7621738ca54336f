//! Loadable roles: roles declared by legacy permission names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::role::RoleType;

/// A permission of a loadable role, resolved lazily to a capability or set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadablePermission {
    pub role_id: Uuid,
    pub permission_name: String,
    pub capability_id: Option<Uuid>,
    pub capability_set_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoadablePermission {
    pub fn new(role_id: Uuid, permission_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            role_id,
            permission_name: permission_name.into(),
            capability_id: None,
            capability_set_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Linked to at least one catalog object.
    pub fn is_resolved(&self) -> bool {
        self.capability_id.is_some() || self.capability_set_id.is_some()
    }
}

/// A role whose permissions are declared by permission name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadableRole {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub role_type: RoleType,
    pub permissions: Vec<LoadablePermission>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoadableRole {
    pub fn new<I, S>(name: impl Into<String>, permission_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut permissions: Vec<LoadablePermission> = Vec::new();
        for name in permission_names {
            let name = name.into();
            if !permissions.iter().any(|p| p.permission_name == name) {
                permissions.push(LoadablePermission::new(id, name));
            }
        }
        Self {
            id,
            name: name.into(),
            description: None,
            role_type: RoleType::Default,
            permissions,
            created_at: now,
            updated_at: now,
        }
    }

    /// Permission names that are not yet linked to the catalog.
    pub fn unresolved(&self) -> Vec<&str> {
        self.permissions
            .iter()
            .filter(|p| !p.is_resolved())
            .map(|p| p.permission_name.as_str())
            .collect()
    }
}
