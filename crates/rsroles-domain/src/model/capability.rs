//! Capabilities, capability sets and their endpoints.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Canonical action of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityAction {
    View,
    Create,
    Edit,
    Delete,
    Manage,
    Execute,
}

impl CapabilityAction {
    /// Lowercase token used in capability names (`foo_item.edit`).
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityAction::View => "view",
            CapabilityAction::Create => "create",
            CapabilityAction::Edit => "edit",
            CapabilityAction::Delete => "delete",
            CapabilityAction::Manage => "manage",
            CapabilityAction::Execute => "execute",
        }
    }

    /// Action implied by an HTTP method when the permission name has no verb token.
    pub fn from_http_method(method: HttpMethod) -> Option<Self> {
        match method {
            HttpMethod::Get | HttpMethod::Head | HttpMethod::Options => Some(Self::View),
            HttpMethod::Post => Some(Self::Create),
            HttpMethod::Put | HttpMethod::Patch => Some(Self::Edit),
            HttpMethod::Delete => Some(Self::Delete),
        }
    }
}

impl fmt::Display for CapabilityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "view" => Ok(Self::View),
            "create" => Ok(Self::Create),
            "edit" => Ok(Self::Edit),
            "delete" => Ok(Self::Delete),
            "manage" => Ok(Self::Manage),
            "execute" => Ok(Self::Execute),
            _ => Err(DomainError::InvalidAction {
                value: s.to_string(),
            }),
        }
    }
}

/// Capability category shown to administrators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityType {
    Data,
    Settings,
    Procedural,
}

/// HTTP method of an endpoint. Doubles as the authorization-server scope name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 7] = [
        HttpMethod::Get,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Patch,
        HttpMethod::Delete,
        HttpMethod::Head,
        HttpMethod::Options,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            _ => Err(DomainError::InvalidHttpMethod {
                value: s.to_string(),
            }),
        }
    }
}

/// A protected HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub path: String,
    pub method: HttpMethod,
}

impl Endpoint {
    pub fn new(path: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            path: path.into(),
            method,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Appends `extra` to `target`, skipping `(path, method)` pairs already present.
///
/// First-seen order is preserved. Returns `true` if anything was added.
pub fn union_endpoints<I>(target: &mut Vec<Endpoint>, extra: I) -> bool
where
    I: IntoIterator<Item = Endpoint>,
{
    let mut seen: HashSet<Endpoint> = target.iter().cloned().collect();
    let before = target.len();
    for endpoint in extra {
        if seen.insert(endpoint.clone()) {
            target.push(endpoint);
        }
    }
    target.len() != before
}

/// The `(resource, action)` pair that identifies a capability in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CapabilityKey {
    pub resource: String,
    pub action: CapabilityAction,
}

impl CapabilityKey {
    pub fn new(resource: impl Into<String>, action: CapabilityAction) -> Self {
        Self {
            resource: resource.into(),
            action,
        }
    }

    /// Catalog name derived from the key: `Foo Item` + EDIT -> `foo_item.edit`.
    pub fn capability_name(&self) -> String {
        let resource = self
            .resource
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect::<Vec<_>>()
            .join("_");
        format!("{}.{}", resource, self.action.as_str())
    }
}

impl fmt::Display for CapabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.resource, self.action)
    }
}

/// Atomic authorization unit: one resource, one action, one permission name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub resource: String,
    pub action: CapabilityAction,
    pub capability_type: CapabilityType,
    pub permission: String,
    pub application_id: String,
    pub module_id: Option<String>,
    pub endpoints: Vec<Endpoint>,
    /// Placeholder created to satisfy a capability-set reference.
    pub dummy: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Capability {
    /// Creates a real capability for `key`.
    pub fn new(
        key: &CapabilityKey,
        permission: impl Into<String>,
        capability_type: CapabilityType,
        application_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: key.capability_name(),
            description: None,
            resource: key.resource.clone(),
            action: key.action,
            capability_type,
            permission: permission.into(),
            application_id: application_id.into(),
            module_id: None,
            endpoints: Vec::new(),
            dummy: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a placeholder referenced by a capability set before the real one exists.
    pub fn placeholder(
        key: &CapabilityKey,
        permission: impl Into<String>,
        application_id: impl Into<String>,
    ) -> Self {
        let mut capability = Self::new(key, permission, CapabilityType::Data, application_id);
        capability.dummy = true;
        capability
    }

    pub fn key(&self) -> CapabilityKey {
        CapabilityKey::new(self.resource.clone(), self.action)
    }
}

/// Named bundle of capabilities assignable as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub resource: String,
    pub action: CapabilityAction,
    pub capability_type: CapabilityType,
    pub permission: String,
    pub application_id: String,
    pub module_id: Option<String>,
    /// Member capability ids, in insertion order without duplicates.
    pub capabilities: Vec<Uuid>,
    pub visible: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CapabilitySet {
    pub fn new(
        key: &CapabilityKey,
        permission: impl Into<String>,
        capability_type: CapabilityType,
        application_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: key.capability_name(),
            description: None,
            resource: key.resource.clone(),
            action: key.action,
            capability_type,
            permission: permission.into(),
            application_id: application_id.into(),
            module_id: None,
            capabilities: Vec::new(),
            visible: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> CapabilityKey {
        CapabilityKey::new(self.resource.clone(), self.action)
    }

    /// Adds member ids, keeping order and skipping duplicates. Returns `true` on change.
    pub fn add_members<I>(&mut self, ids: I) -> bool
    where
        I: IntoIterator<Item = Uuid>,
    {
        let mut changed = false;
        for id in ids {
            if !self.capabilities.contains(&id) {
                self.capabilities.push(id);
                changed = true;
            }
        }
        changed
    }
}
