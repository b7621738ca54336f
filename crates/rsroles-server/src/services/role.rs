//! Role service: dual-written role CRUD.

use std::sync::Arc;

use tracing::{error, info, instrument};
use uuid::Uuid;

use rsroles_domain::model::{EdgeTable, Role, Subject};
use rsroles_storage::CatalogStore;

use super::ignore_not_found;
use crate::authz::AuthorizationServer;
use crate::context::ExecutionContext;
use crate::error::{ServiceError, ServiceResult};
use crate::events::{CatalogChange, CatalogEventBus};
use crate::sync::{aggregate, subject_endpoints, DualWriteCoordinator, EndpointPermissionSync};

pub struct RoleService<S, A> {
    store: Arc<S>,
    authz: Arc<A>,
    coordinator: DualWriteCoordinator,
    permissions: EndpointPermissionSync<A>,
    events: CatalogEventBus,
}

impl<S, A> Clone for RoleService<S, A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            authz: Arc::clone(&self.authz),
            coordinator: self.coordinator,
            permissions: self.permissions.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S: CatalogStore, A: AuthorizationServer> RoleService<S, A> {
    pub fn new(
        store: Arc<S>,
        authz: Arc<A>,
        coordinator: DualWriteCoordinator,
        permissions: EndpointPermissionSync<A>,
        events: CatalogEventBus,
    ) -> Self {
        Self {
            store,
            authz,
            coordinator,
            permissions,
            events,
        }
    }

    /// Creates the role remotely, then locally; the remote role is deleted
    /// again if the local insert fails.
    #[instrument(skip(self, ctx, role), fields(role = %role.name))]
    pub async fn create(&self, ctx: &ExecutionContext, role: Role) -> ServiceResult<Role> {
        if self.store.find_role_by_name(&role.name).await?.is_some() {
            return Err(ServiceError::conflict(format!(
                "role name is already taken: {}",
                role.name
            )));
        }

        let authz = Arc::clone(&self.authz);
        let detached = ctx.detached();
        let name = role.name.clone();

        self.coordinator
            .execute_with_compensation(
                ctx,
                "create role",
                || async { Ok(self.authz.create_role(ctx, &role).await?) },
                |()| async { Ok(self.store.create_role(&role).await?) },
                move || async move { Ok(authz.delete_role(&detached, &name).await?) },
            )
            .await
    }

    /// Updates name, description or type. The remote role is reverted if
    /// the local update fails.
    #[instrument(skip(self, ctx, role), fields(role_id = %role.id))]
    pub async fn update(&self, ctx: &ExecutionContext, role: Role) -> ServiceResult<Role> {
        let existing = self.get(role.id).await?;
        if let Some(other) = self.store.find_role_by_name(&role.name).await? {
            if other.id != role.id {
                return Err(ServiceError::conflict(format!(
                    "role name is already taken: {}",
                    role.name
                )));
            }
        }

        let authz = Arc::clone(&self.authz);
        let detached = ctx.detached();
        let new_name = role.name.clone();
        let previous = existing.clone();

        self.coordinator
            .execute_with_compensation(
                ctx,
                "update role",
                || async { Ok(self.authz.update_role(ctx, &existing.name, &role).await?) },
                |()| async { Ok(self.store.update_role(&role).await?) },
                move || async move { Ok(authz.update_role(&detached, &new_name, &previous).await?) },
            )
            .await
    }

    /// Deletes a role, its assignments and its policy.
    ///
    /// The local delete happens first and cannot be undone: once the row is
    /// gone there is nothing to restore from. A remote failure afterwards is
    /// logged as an error and returned as an `Inconsistency`.
    #[instrument(skip(self, ctx))]
    pub async fn delete(&self, ctx: &ExecutionContext, id: Uuid) -> ServiceResult<()> {
        let role = self.get(id).await?;
        let subject = Subject::Role(id);
        let endpoints = subject_endpoints(self.store.as_ref(), &subject).await?;

        for table in [EdgeTable::RoleCapability, EdgeTable::RoleCapabilitySet] {
            let objects: Vec<Uuid> = self
                .store
                .list_edges_by_subject(table, id)
                .await?
                .into_iter()
                .map(|edge| edge.object_id)
                .collect();
            self.store.delete_edges(table, id, &objects).await?;
        }
        self.store
            .delete_edges_by_object(EdgeTable::UserRole, id)
            .await?;
        if self.store.find_loadable_role(id).await?.is_some() {
            self.store.delete_loadable_role(id).await?;
        }
        if self.store.find_policy(id).await?.is_some() {
            self.store.delete_policy(id).await?;
        }
        self.store.delete_role(id).await?;
        self.events
            .publish(ctx, CatalogChange::RolePermissionsChanged { role_id: id });

        // Permissions go before the policy they reference.
        let results = vec![
            self.permissions.delete(ctx, &subject, &endpoints).await,
            ignore_not_found(self.authz.delete_policy(ctx, id).await),
            ignore_not_found(self.authz.delete_role(ctx, &role.name).await),
        ];
        if let Err(err) = aggregate(results) {
            error!(
                role_id = %id,
                role = %role.name,
                error = %err,
                "Role deleted locally but not on authorization server"
            );
            return Err(ServiceError::inconsistency(err, Vec::new()));
        }

        info!(role_id = %id, role = %role.name, "Role deleted");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> ServiceResult<Role> {
        self.store
            .find_role(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("role", id))
    }

    pub async fn find_by_name(&self, name: &str) -> ServiceResult<Option<Role>> {
        Ok(self.store.find_role_by_name(name).await?)
    }

    pub async fn list(&self) -> ServiceResult<Vec<Role>> {
        Ok(self.store.list_roles().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::SyncServices;
    use crate::authz::InMemoryAuthorizationServer;
    use crate::config::ServiceConfig;
    use rsroles_domain::model::{
        Capability, CapabilityAction, CapabilityKey, CapabilityType, Endpoint, Grant, HttpMethod,
    };
    use rsroles_storage::MemoryCatalogStore;

    type Services = SyncServices<MemoryCatalogStore, InMemoryAuthorizationServer>;

    fn services() -> Services {
        SyncServices::new(
            &ServiceConfig::default(),
            MemoryCatalogStore::new_shared(),
            Arc::new(InMemoryAuthorizationServer::new()),
        )
    }

    // ===== Section 1: Create and update =====

    #[tokio::test]
    async fn test_create_mirrors_role() {
        let services = services();
        let ctx = ExecutionContext::new("diku");

        let role = services
            .roles
            .create(&ctx, Role::new("librarian"))
            .await
            .unwrap();

        assert!(services.authz.has_role("librarian"));
        assert_eq!(services.roles.get(role.id).await.unwrap().name, "librarian");
    }

    #[tokio::test]
    async fn test_local_failure_removes_remote_role_and_allows_retry() {
        // Arrange
        let services = services();
        let ctx = ExecutionContext::new("diku");
        services.store.fail_next("create_role", 1);

        // Act
        let first = services.roles.create(&ctx, Role::new("librarian")).await;
        let second = services.roles.create(&ctx, Role::new("librarian")).await;

        // Assert
        assert!(first.is_err());
        assert!(second.is_ok());
        assert_eq!(services.authz.calls_of("delete_role").len(), 1);
        assert!(services.authz.has_role("librarian"));
    }

    #[tokio::test]
    async fn test_remote_failure_leaves_no_local_row() {
        let services = services();
        let ctx = ExecutionContext::new("diku");
        services.authz.fail_next("create_role", 1);

        let err = services
            .roles
            .create(&ctx, Role::new("librarian"))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(services.roles.find_by_name("librarian").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_reverts_remote_rename_on_local_failure() {
        let services = services();
        let ctx = ExecutionContext::new("diku");
        let role = services
            .roles
            .create(&ctx, Role::new("librarian"))
            .await
            .unwrap();
        let mut renamed = role.clone();
        renamed.name = "archivist".to_string();
        services.store.fail_next("update_role", 1);

        assert!(services.roles.update(&ctx, renamed).await.is_err());

        assert!(services.authz.has_role("librarian"));
        assert!(!services.authz.has_role("archivist"));
    }

    #[tokio::test]
    async fn test_rename_to_taken_name_is_conflict() {
        let services = services();
        let ctx = ExecutionContext::new("diku");
        services.roles.create(&ctx, Role::new("a")).await.unwrap();
        let mut b = services.roles.create(&ctx, Role::new("b")).await.unwrap();
        b.name = "a".to_string();

        let err = services.roles.update(&ctx, b).await.unwrap_err();

        assert!(err.is_conflict());
    }

    // ===== Section 2: Delete =====

    #[tokio::test]
    async fn test_delete_removes_assignments_and_remote_objects() {
        // Arrange
        let services = services();
        let ctx = ExecutionContext::new("diku");
        let mut rx = services.events.subscribe();
        let role = services
            .roles
            .create(&ctx, Role::new("librarian"))
            .await
            .unwrap();
        let mut capability = Capability::new(
            &CapabilityKey::new("Foo", CapabilityAction::View),
            "foo.get",
            CapabilityType::Data,
            "app-1.0",
        );
        capability.endpoints = vec![Endpoint::new("/foo", HttpMethod::Get)];
        services.store.create_capability(&capability).await.unwrap();
        services
            .assignments
            .assign(&ctx, Subject::Role(role.id), &[Grant::Capability(capability.id)])
            .await
            .unwrap();

        // Act
        services.roles.delete(&ctx, role.id).await.unwrap();

        // Assert
        assert!(services.roles.find_by_name("librarian").await.unwrap().is_none());
        assert!(!services.authz.has_role("librarian"));
        assert!(!services.authz.has_policy(role.id));
        assert!(services.authz.permission_names().is_empty());
        assert_eq!(services.store.edge_count(EdgeTable::RoleCapability), 0);
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.change,
            CatalogChange::RolePermissionsChanged { role_id: role.id }
        );
    }

    #[tokio::test]
    async fn test_remote_delete_failure_is_inconsistency() {
        let services = services();
        let ctx = ExecutionContext::new("diku");
        let role = services
            .roles
            .create(&ctx, Role::new("librarian"))
            .await
            .unwrap();
        services.authz.fail_next("delete_role", 1);

        let err = services.roles.delete(&ctx, role.id).await.unwrap_err();

        assert!(err.is_inconsistency());
        assert!(services.roles.find_by_name("librarian").await.unwrap().is_none());
        assert!(services.authz.has_role("librarian"));
    }

    #[tokio::test]
    async fn test_delete_unknown_role_is_not_found() {
        let services = services();

        let err = services
            .roles
            .delete(&ExecutionContext::new("diku"), Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(err.is_not_found());
    }
}
