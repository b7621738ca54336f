//! Objects exchanged with the authorization server.

use serde::{Deserialize, Serialize};

use rsroles_domain::model::{DecisionStrategy, Role};

/// Realm role as stored by the authorization server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRole {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<&Role> for RemoteRole {
    fn from(role: &Role) -> Self {
        Self {
            id: None,
            name: role.name.clone(),
            description: role.description.clone(),
        }
    }
}

/// A named scope, one per HTTP method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteScope {
    pub id: String,
    pub name: String,
}

/// A protected resource, one per static endpoint path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteResource {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub uris: Vec<String>,
}

/// A scope permission: policies that grant scopes on resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopePermission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub decision_strategy: DecisionStrategy,
    /// Policy ids
    pub policies: Vec<String>,
    /// Resource ids
    pub resources: Vec<String>,
    /// Scope ids
    pub scopes: Vec<String>,
}
