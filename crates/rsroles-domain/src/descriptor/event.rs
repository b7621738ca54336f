//! Module registration events as delivered by the module event source.

use serde::{Deserialize, Serialize};

/// Kind of module the descriptors come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleType {
    #[default]
    Backend,
    Ui,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModuleEventType {
    Create,
    Update,
    Delete,
}

/// Endpoint as declared by a module. The method is kept raw and validated on merge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub path: String,
    pub method: String,
}

impl EndpointDescriptor {
    pub fn new(path: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDescriptor {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sub_permissions: Vec<String>,
    #[serde(default)]
    pub visible: Option<bool>,
}

impl PermissionDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_sub_permissions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub_permissions = names.into_iter().map(Into::into).collect();
        self
    }
}

/// One `(permission, endpoints)` pair of a module descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub permission: PermissionDescriptor,
    #[serde(default)]
    pub endpoints: Vec<EndpointDescriptor>,
}

impl ResourceDescriptor {
    pub fn new(permission: PermissionDescriptor, endpoints: Vec<EndpointDescriptor>) -> Self {
        Self {
            permission,
            endpoints,
        }
    }

    /// A permission with endpoints: `ResourceDescriptor::endpoint("foo.item.get", "GET", "/foo/{id}")`.
    pub fn endpoint(permission: &str, method: &str, path: &str) -> Self {
        Self::new(
            PermissionDescriptor::new(permission),
            vec![EndpointDescriptor::new(path, method)],
        )
    }

    /// A permission set without endpoints of its own.
    pub fn set<I, S>(permission: &str, sub_permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            PermissionDescriptor::new(permission).with_sub_permissions(sub_permissions),
            Vec::new(),
        )
    }
}

/// Module registration event keyed by `(module_id, application_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleEvent {
    #[serde(rename = "type")]
    pub event_type: ModuleEventType,
    pub module_id: String,
    #[serde(default)]
    pub module_type: ModuleType,
    pub application_id: String,
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    /// Resources declared before an update; absent for create/delete.
    #[serde(default)]
    pub previous_resources: Option<Vec<ResourceDescriptor>>,
}

impl ModuleEvent {
    pub fn create(
        module_id: impl Into<String>,
        application_id: impl Into<String>,
        resources: Vec<ResourceDescriptor>,
    ) -> Self {
        Self {
            event_type: ModuleEventType::Create,
            module_id: module_id.into(),
            module_type: ModuleType::Backend,
            application_id: application_id.into(),
            resources,
            previous_resources: None,
        }
    }

    pub fn update(
        module_id: impl Into<String>,
        application_id: impl Into<String>,
        previous: Vec<ResourceDescriptor>,
        resources: Vec<ResourceDescriptor>,
    ) -> Self {
        Self {
            event_type: ModuleEventType::Update,
            previous_resources: Some(previous),
            ..Self::create(module_id, application_id, resources)
        }
    }

    pub fn delete(
        module_id: impl Into<String>,
        application_id: impl Into<String>,
        resources: Vec<ResourceDescriptor>,
    ) -> Self {
        Self {
            event_type: ModuleEventType::Delete,
            ..Self::create(module_id, application_id, resources)
        }
    }

    pub fn with_module_type(mut self, module_type: ModuleType) -> Self {
        self.module_type = module_type;
        self
    }
}
