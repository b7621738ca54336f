//! Descriptor merger: module resources -> capabilities and capability-set descriptors.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use super::action::{parse_permission, resource_name, ParsedPermission};
use super::event::{ModuleEvent, ModuleType, ResourceDescriptor};
use crate::model::{
    union_endpoints, Capability, CapabilityAction, CapabilityKey, CapabilityType, Endpoint,
};

/// A capability-set member, named by key and by the permission that referenced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetMember {
    pub key: CapabilityKey,
    pub permission: String,
}

/// A capability set as declared by a module, before member ids are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySetDescriptor {
    pub key: CapabilityKey,
    pub permission: String,
    pub description: Option<String>,
    pub capability_type: CapabilityType,
    pub application_id: String,
    pub module_id: String,
    pub visible: bool,
    pub members: Vec<SetMember>,
}

impl CapabilitySetDescriptor {
    pub fn name(&self) -> String {
        self.key.capability_name()
    }
}

/// Output of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeResult {
    pub capabilities: Vec<Capability>,
    pub capability_sets: Vec<CapabilitySetDescriptor>,
}

impl MergeResult {
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty() && self.capability_sets.is_empty()
    }
}

/// Folds contributions that share a key, tracking the canonical contributor.
struct Fold<T> {
    key: CapabilityKey,
    rank: usize,
    permission: String,
    description: Option<String>,
    capability_type: CapabilityType,
    payload: T,
}

struct Folds<T> {
    entries: Vec<Fold<T>>,
    index: HashMap<CapabilityKey, usize>,
}

impl<T> Folds<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Inserts or folds a contribution; returns the entry it landed in.
    fn fold(
        &mut self,
        parsed: &ParsedPermission,
        permission: &str,
        description: Option<String>,
        payload: impl FnOnce() -> T,
    ) -> &mut Fold<T> {
        let rank = parsed.verb_rank();
        let idx = match self.index.get(&parsed.key) {
            Some(&idx) => {
                let entry = &mut self.entries[idx];
                // Strictly lower rank replaces; ties keep the first-seen contributor.
                if rank < entry.rank {
                    entry.rank = rank;
                    entry.permission = permission.to_string();
                    entry.capability_type = parsed.capability_type;
                    if description.is_some() {
                        entry.description = description;
                    }
                }
                idx
            }
            None => {
                self.entries.push(Fold {
                    key: parsed.key.clone(),
                    rank,
                    permission: permission.to_string(),
                    description,
                    capability_type: parsed.capability_type,
                    payload: payload(),
                });
                let idx = self.entries.len() - 1;
                self.index.insert(parsed.key.clone(), idx);
                idx
            }
        };
        &mut self.entries[idx]
    }

    fn get(&self, key: &CapabilityKey) -> Option<&Fold<T>> {
        self.index.get(key).map(|&idx| &self.entries[idx])
    }
}

/// Turns declared module resources into catalog records.
///
/// Permissions mapping to the same `(resource, action)` key are folded into one
/// capability: endpoints are unioned in first-seen order, and the canonical
/// permission name is the contributor with the highest verb precedence
/// (`put` before `patch`), ties going to the first one seen. The result does
/// not depend on the order of contributors inside one event.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorMerger;

impl DescriptorMerger {
    pub fn new() -> Self {
        Self
    }

    /// Merges the resources of a module event.
    pub fn merge(&self, event: &ModuleEvent) -> MergeResult {
        self.merge_resources(
            &event.application_id,
            &event.module_id,
            event.module_type,
            &event.resources,
        )
    }

    pub fn merge_resources(
        &self,
        application_id: &str,
        module_id: &str,
        module_type: ModuleType,
        resources: &[ResourceDescriptor],
    ) -> MergeResult {
        let mut capabilities: Folds<Vec<Endpoint>> = Folds::new();
        let mut declared: HashMap<&str, CapabilityKey> = HashMap::new();
        let mut sets: HashMap<&str, &ResourceDescriptor> = HashMap::new();
        let mut set_order: Vec<&str> = Vec::new();

        for resource in resources {
            let name = resource.permission.name.as_str();
            let endpoints = parse_endpoints(resource);
            let is_set = !resource.permission.sub_permissions.is_empty();

            if is_set && !sets.contains_key(name) {
                sets.insert(name, resource);
                set_order.push(name);
            }
            if is_set && endpoints.is_empty() {
                continue;
            }

            let Some(parsed) = parse_permission(name, &endpoints) else {
                warn!(permission = %name, module_id = %module_id, "Cannot resolve capability for permission, skipping");
                continue;
            };

            let description = describe(resource);
            let entry = capabilities.fold(&parsed, name, description, Vec::new);
            union_endpoints(&mut entry.payload, endpoints);
            declared.insert(name, parsed.key);
        }

        let mut set_folds: Folds<Vec<SetMember>> = Folds::new();
        for name in set_order {
            let resource = sets[name];
            let endpoints = parse_endpoints(resource);

            let mut members = Vec::new();
            let mut visited = HashSet::new();
            collect_members(name, &sets, &declared, &capabilities, &mut visited, &mut members);
            if let Some(own) = declared.get(name) {
                push_member(&mut members, own.clone(), name.to_string());
            }

            if members.is_empty() {
                warn!(permission = %name, module_id = %module_id, "Capability set has no resolvable members, dropping");
                continue;
            }

            let parsed = parse_permission(name, &endpoints).unwrap_or_else(|| {
                let tokens: Vec<&str> = name.split('.').collect();
                debug!(permission = %name, "No action token on permission set, defaulting to manage");
                ParsedPermission {
                    key: CapabilityKey::new(resource_name(&tokens), CapabilityAction::Manage),
                    capability_type: CapabilityType::Data,
                    verb: None,
                }
            });

            let entry = set_folds.fold(&parsed, name, describe(resource), Vec::new);
            for member in members {
                push_member(&mut entry.payload, member.key, member.permission);
            }
        }

        let visible_by_default = module_type == ModuleType::Ui;
        let capability_sets = set_folds
            .entries
            .into_iter()
            .map(|fold| {
                let visible = sets
                    .get(fold.permission.as_str())
                    .and_then(|r| r.permission.visible)
                    .unwrap_or(visible_by_default);
                CapabilitySetDescriptor {
                    key: fold.key,
                    permission: fold.permission,
                    description: fold.description,
                    capability_type: fold.capability_type,
                    application_id: application_id.to_string(),
                    module_id: module_id.to_string(),
                    visible,
                    members: fold.payload,
                }
            })
            .collect();

        let capabilities = capabilities
            .entries
            .into_iter()
            .map(|fold| {
                let mut capability = Capability::new(
                    &fold.key,
                    fold.permission,
                    fold.capability_type,
                    application_id,
                );
                capability.description = fold.description;
                capability.module_id = Some(module_id.to_string());
                capability.endpoints = fold.payload;
                capability
            })
            .collect();

        MergeResult {
            capabilities,
            capability_sets,
        }
    }
}

fn describe(resource: &ResourceDescriptor) -> Option<String> {
    resource
        .permission
        .description
        .clone()
        .or_else(|| resource.permission.display_name.clone())
}

fn parse_endpoints(resource: &ResourceDescriptor) -> Vec<Endpoint> {
    let mut endpoints = Vec::with_capacity(resource.endpoints.len());
    let parsed = resource.endpoints.iter().filter_map(|e| match e.method.parse() {
        Ok(method) => Some(Endpoint::new(e.path.clone(), method)),
        Err(err) => {
            warn!(permission = %resource.permission.name, path = %e.path, error = %err, "Skipping endpoint with invalid method");
            None
        }
    });
    union_endpoints(&mut endpoints, parsed);
    endpoints
}

fn push_member(members: &mut Vec<SetMember>, key: CapabilityKey, permission: String) {
    if !members.iter().any(|m| m.key == key) {
        members.push(SetMember { key, permission });
    }
}

/// Resolves the sub-permissions of set `name`, flattening nested sets.
fn collect_members<'a>(
    name: &'a str,
    sets: &HashMap<&'a str, &'a ResourceDescriptor>,
    declared: &HashMap<&str, CapabilityKey>,
    capabilities: &Folds<Vec<Endpoint>>,
    visited: &mut HashSet<&'a str>,
    members: &mut Vec<SetMember>,
) {
    if !visited.insert(name) {
        return;
    }
    let Some(resource) = sets.get(name) else {
        return;
    };

    for sub in &resource.permission.sub_permissions {
        let sub = sub.as_str();
        if let Some(key) = declared.get(sub) {
            // Use the canonical permission of the folded capability.
            let permission = capabilities
                .get(key)
                .map(|f| f.permission.clone())
                .unwrap_or_else(|| sub.to_string());
            push_member(members, key.clone(), permission);
        }
        if let Some((nested, _)) = sets.get_key_value(sub) {
            collect_members(*nested, sets, declared, capabilities, visited, members);
            continue;
        }
        if declared.contains_key(sub) {
            continue;
        }
        match parse_permission(sub, &[]) {
            Some(parsed) => push_member(members, parsed.key, sub.to_string()),
            None => debug!(set = %name, permission = %sub, "Unresolvable sub-permission ignored"),
        }
    }
}
