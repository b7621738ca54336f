//! In-process authorization server for tests and local runs.

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use uuid::Uuid;

use rsroles_domain::model::{ExternalPolicy, HttpMethod, Role};

use super::error::{AuthzError, AuthzResult};
use super::types::{RemoteResource, RemoteRole, RemoteScope, ScopePermission};
use super::AuthorizationServer;
use crate::context::ExecutionContext;

/// In-memory [`AuthorizationServer`] with call recording and failure injection.
///
/// Objects are not partitioned by tenant. Every call is recorded as
/// `"<operation> <target>"`, including calls that fail.
///
/// One scope per HTTP method exists from the start; tests remove scopes with
/// [`InMemoryAuthorizationServer::remove_scope`].
#[derive(Debug)]
pub struct InMemoryAuthorizationServer {
    roles: DashMap<String, RemoteRole>,
    role_users: DashSet<(String, Uuid)>,
    resources: DashMap<String, RemoteResource>,
    scopes: DashMap<String, RemoteScope>,
    policies: DashMap<Uuid, ExternalPolicy>,
    permissions: DashMap<String, ScopePermission>,
    calls: Mutex<Vec<String>>,
    failures: DashMap<&'static str, u32>,
}

impl Default for InMemoryAuthorizationServer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAuthorizationServer {
    pub fn new() -> Self {
        let scopes = DashMap::new();
        for method in HttpMethod::ALL {
            scopes.insert(
                method.as_str().to_string(),
                RemoteScope {
                    id: Uuid::new_v4().to_string(),
                    name: method.as_str().to_string(),
                },
            );
        }

        Self {
            roles: DashMap::new(),
            role_users: DashSet::new(),
            resources: DashMap::new(),
            scopes,
            policies: DashMap::new(),
            permissions: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            failures: DashMap::new(),
        }
    }

    /// Makes the next `times` calls of `operation` fail with a 503.
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        self.failures.insert(operation, times);
    }

    pub fn remove_scope(&self, name: &str) {
        self.scopes.remove(name);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Calls whose operation is `operation`.
    pub fn calls_of(&self, operation: &str) -> Vec<String> {
        let prefix = format!("{operation} ");
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(&prefix))
            .collect()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.roles.contains_key(name)
    }

    pub fn user_has_role(&self, user_id: Uuid, role_name: &str) -> bool {
        self.role_users.contains(&(role_name.to_string(), user_id))
    }

    pub fn has_policy(&self, id: Uuid) -> bool {
        self.policies.contains_key(&id)
    }

    pub fn has_permission(&self, name: &str) -> bool {
        self.permissions.contains_key(name)
    }

    /// Sorted names of all scope permissions.
    pub fn permission_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.permissions.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    fn record(&self, operation: &'static str, target: &str) -> AuthzResult<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(format!("{operation} {target}"));
        }

        if let Some(mut remaining) = self.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AuthzError::Status {
                    status: 503,
                    message: format!("injected failure in {operation} for {target}"),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AuthorizationServer for InMemoryAuthorizationServer {
    async fn create_role(&self, _ctx: &ExecutionContext, role: &Role) -> AuthzResult<()> {
        self.record("create_role", &role.name)?;
        if self.roles.contains_key(&role.name) {
            return Err(AuthzError::Conflict {
                kind: "role",
                name: role.name.clone(),
            });
        }
        let mut remote = RemoteRole::from(role);
        remote.id = Some(Uuid::new_v4().to_string());
        self.roles.insert(role.name.clone(), remote);
        Ok(())
    }

    async fn update_role(
        &self,
        _ctx: &ExecutionContext,
        previous_name: &str,
        role: &Role,
    ) -> AuthzResult<()> {
        self.record("update_role", previous_name)?;
        let (_, existing) = self
            .roles
            .remove(previous_name)
            .ok_or_else(|| AuthzError::NotFound {
                kind: "role",
                name: previous_name.to_string(),
            })?;
        let mut remote = RemoteRole::from(role);
        remote.id = existing.id;
        self.roles.insert(role.name.clone(), remote);
        Ok(())
    }

    async fn delete_role(&self, _ctx: &ExecutionContext, name: &str) -> AuthzResult<()> {
        self.record("delete_role", name)?;
        self.roles.remove(name).ok_or_else(|| AuthzError::NotFound {
            kind: "role",
            name: name.to_string(),
        })?;
        self.role_users.retain(|(role, _)| role != name);
        Ok(())
    }

    async fn find_role(
        &self,
        _ctx: &ExecutionContext,
        name: &str,
    ) -> AuthzResult<Option<RemoteRole>> {
        self.record("find_role", name)?;
        Ok(self.roles.get(name).map(|r| r.value().clone()))
    }

    async fn assign_role(
        &self,
        _ctx: &ExecutionContext,
        user_id: Uuid,
        role_name: &str,
    ) -> AuthzResult<()> {
        self.record("assign_role", role_name)?;
        if !self.roles.contains_key(role_name) {
            return Err(AuthzError::NotFound {
                kind: "role",
                name: role_name.to_string(),
            });
        }
        self.role_users.insert((role_name.to_string(), user_id));
        Ok(())
    }

    async fn unassign_role(
        &self,
        _ctx: &ExecutionContext,
        user_id: Uuid,
        role_name: &str,
    ) -> AuthzResult<()> {
        self.record("unassign_role", role_name)?;
        self.role_users.remove(&(role_name.to_string(), user_id));
        Ok(())
    }

    async fn find_resource(
        &self,
        _ctx: &ExecutionContext,
        path: &str,
    ) -> AuthzResult<Option<RemoteResource>> {
        self.record("find_resource", path)?;
        Ok(self.resources.get(path).map(|r| r.value().clone()))
    }

    async fn create_resource(
        &self,
        _ctx: &ExecutionContext,
        path: &str,
        _scopes: &[RemoteScope],
    ) -> AuthzResult<RemoteResource> {
        self.record("create_resource", path)?;
        let resource = RemoteResource {
            id: Uuid::new_v4().to_string(),
            name: path.to_string(),
            uris: vec![path.to_string()],
        };
        match self.resources.entry(path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(AuthzError::Conflict {
                kind: "resource",
                name: path.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(resource.clone());
                Ok(resource)
            }
        }
    }

    async fn delete_resource(&self, _ctx: &ExecutionContext, id: &str) -> AuthzResult<()> {
        self.record("delete_resource", id)?;
        let before = self.resources.len();
        self.resources.retain(|_, r| r.id != id);
        if self.resources.len() == before {
            return Err(AuthzError::NotFound {
                kind: "resource",
                name: id.to_string(),
            });
        }
        Ok(())
    }

    async fn find_scope(
        &self,
        _ctx: &ExecutionContext,
        name: &str,
    ) -> AuthzResult<Option<RemoteScope>> {
        self.record("find_scope", name)?;
        Ok(self.scopes.get(name).map(|s| s.value().clone()))
    }

    async fn create_policy(
        &self,
        _ctx: &ExecutionContext,
        policy: &ExternalPolicy,
    ) -> AuthzResult<()> {
        self.record("create_policy", &policy.name)?;
        let clash = self.policies.contains_key(&policy.id)
            || self.policies.iter().any(|p| p.name == policy.name);
        if clash {
            return Err(AuthzError::Conflict {
                kind: "policy",
                name: policy.name.clone(),
            });
        }
        self.policies.insert(policy.id, policy.clone());
        Ok(())
    }

    async fn update_policy(
        &self,
        _ctx: &ExecutionContext,
        policy: &ExternalPolicy,
    ) -> AuthzResult<()> {
        self.record("update_policy", &policy.name)?;
        let mut existing = self
            .policies
            .get_mut(&policy.id)
            .ok_or_else(|| AuthzError::NotFound {
                kind: "policy",
                name: policy.name.clone(),
            })?;
        *existing = policy.clone();
        Ok(())
    }

    async fn delete_policy(&self, _ctx: &ExecutionContext, id: Uuid) -> AuthzResult<()> {
        self.record("delete_policy", &id.to_string())?;
        self.policies.remove(&id).ok_or_else(|| AuthzError::NotFound {
            kind: "policy",
            name: id.to_string(),
        })?;
        // Permissions left without policies are removed with them.
        let policy_id = id.to_string();
        self.permissions
            .retain(|_, p| !(p.policies.len() == 1 && p.policies[0] == policy_id));
        Ok(())
    }

    async fn find_policy(
        &self,
        _ctx: &ExecutionContext,
        name: &str,
    ) -> AuthzResult<Option<ExternalPolicy>> {
        self.record("find_policy", name)?;
        Ok(self
            .policies
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value().clone()))
    }

    async fn create_permission(
        &self,
        _ctx: &ExecutionContext,
        permission: &ScopePermission,
    ) -> AuthzResult<()> {
        self.record("create_permission", &permission.name)?;
        match self.permissions.entry(permission.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(AuthzError::Conflict {
                kind: "permission",
                name: permission.name.clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let mut stored = permission.clone();
                stored.id = Some(Uuid::new_v4().to_string());
                entry.insert(stored);
                Ok(())
            }
        }
    }

    async fn find_permission(
        &self,
        _ctx: &ExecutionContext,
        name: &str,
    ) -> AuthzResult<Option<ScopePermission>> {
        self.record("find_permission", name)?;
        Ok(self.permissions.get(name).map(|p| p.value().clone()))
    }

    async fn delete_permission(&self, _ctx: &ExecutionContext, name: &str) -> AuthzResult<()> {
        self.record("delete_permission", name)?;
        self.permissions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AuthzError::NotFound {
                kind: "permission",
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_role_lifecycle_and_call_recording() {
        let server = InMemoryAuthorizationServer::new();
        let ctx = ExecutionContext::new("diku");
        let role = Role::new("librarian");

        server.create_role(&ctx, &role).await.unwrap();
        let duplicate = server.create_role(&ctx, &role).await;
        server.delete_role(&ctx, "librarian").await.unwrap();

        assert!(duplicate.unwrap_err().is_conflict());
        assert!(!server.has_role("librarian"));
        assert_eq!(
            server.calls(),
            vec![
                "create_role librarian",
                "create_role librarian",
                "delete_role librarian"
            ]
        );
    }

    #[tokio::test]
    async fn test_injected_failures_carry_target() {
        let server = InMemoryAuthorizationServer::new();
        let ctx = ExecutionContext::new("diku");
        server.fail_next("find_scope", 1);

        let err = server.find_scope(&ctx, "GET").await.unwrap_err();

        assert!(err.is_retryable());
        assert!(err.to_string().contains("find_scope for GET"));
        assert!(server.find_scope(&ctx, "GET").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_removed_scope_is_absent() {
        let server = InMemoryAuthorizationServer::new();
        let ctx = ExecutionContext::new("diku");
        server.remove_scope("PATCH");

        assert!(server.find_scope(&ctx, "PATCH").await.unwrap().is_none());
        assert!(server.find_scope(&ctx, "PUT").await.unwrap().is_some());
    }
}
