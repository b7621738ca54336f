//! Loadable roles: predefined roles whose permissions are given by name.
//!
//! A permission name resolves to the capability, or failing that the
//! capability set, carrying that permission. A name the merger folded into
//! a capability published under another verb (`foo.item.patch` into
//! `foo.item.put`) resolves through the key both parse to. Resolution of one
//! role is serialized, whether it runs at creation, in the retrier or on a
//! catalog event. Names that do not resolve at
//! creation time stay on the loadable role with no link. They are retried
//! in the background by the [`ReconciliationRetrier`] and, after that gives
//! up, whenever a matching capability or set shows up in the catalog
//! (see [`ReconciliationTrigger`]).

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use rsroles_domain::descriptor::{parse_permission, permission_aliases};
use rsroles_domain::model::{
    Capability, CapabilitySet, EdgeTable, Grant, LoadablePermission, LoadableRole, Role, Subject,
};
use rsroles_storage::CatalogStore;

use super::assignment::AssignmentService;
use super::role::RoleService;
use crate::authz::AuthorizationServer;
use crate::context::ExecutionContext;
use crate::error::{ServiceError, ServiceResult};
use crate::events::{CatalogChange, CatalogEventBus};
use crate::sync::{KeyedLocks, ReconciliationRetrier};

/// Result of [`LoadableRoleService::create`].
#[derive(Debug)]
pub struct LoadableRoleCreation {
    pub role: LoadableRole,
    /// Permission names that did not resolve synchronously.
    pub unresolved: Vec<String>,
    /// Background reconciliation, when anything was left unresolved.
    pub reconciliation: Option<JoinHandle<()>>,
}

pub struct LoadableRoleService<S, A> {
    store: Arc<S>,
    roles: RoleService<S, A>,
    assignments: AssignmentService<S, A>,
    retrier: ReconciliationRetrier,
    locks: KeyedLocks<Uuid>,
}

impl<S, A> Clone for LoadableRoleService<S, A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            roles: self.roles.clone(),
            assignments: self.assignments.clone(),
            retrier: self.retrier.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<S: CatalogStore, A: AuthorizationServer> LoadableRoleService<S, A> {
    pub fn new(
        store: Arc<S>,
        roles: RoleService<S, A>,
        assignments: AssignmentService<S, A>,
        retrier: ReconciliationRetrier,
    ) -> Self {
        Self {
            store,
            roles,
            assignments,
            retrier,
            locks: KeyedLocks::new(),
        }
    }

    /// Creates the role, resolves what it can, and schedules the rest.
    ///
    /// Unresolved permissions are not an error: the call succeeds and the
    /// remaining names are reconciled in the background.
    #[instrument(skip(self, ctx, loadable), fields(role = %loadable.name))]
    pub async fn create(
        &self,
        ctx: &ExecutionContext,
        loadable: LoadableRole,
    ) -> ServiceResult<LoadableRoleCreation> {
        let mut role = Role::new(loadable.name.clone()).with_type(loadable.role_type);
        role.id = loadable.id;
        role.description = loadable.description.clone();
        self.roles.create(ctx, role).await?;

        if let Err(err) = self.store.save_loadable_role(&loadable).await {
            let err = ServiceError::from(err);
            return match self.roles.delete(ctx, loadable.id).await {
                Ok(()) => Err(err),
                Err(cleanup) => Err(ServiceError::inconsistency(err, vec![cleanup])),
            };
        }

        let unresolved = self.resolve_pending(ctx, loadable.id).await?;
        let reconciliation = if unresolved.is_empty() {
            None
        } else {
            info!(
                role_id = %loadable.id,
                unresolved = unresolved.len(),
                "Scheduling reconciliation of unresolved permissions"
            );
            Some(self.schedule_resolution(ctx, loadable.id))
        };

        let role = self.get(loadable.id).await?;
        Ok(LoadableRoleCreation {
            role,
            unresolved,
            reconciliation,
        })
    }

    /// One resolution attempt for `role_id`.
    ///
    /// Fails with the retryable `UnresolvedPermissions` while any name has
    /// no capability or capability set in the catalog.
    pub async fn resolve_role(&self, ctx: &ExecutionContext, role_id: Uuid) -> ServiceResult<()> {
        let unresolved = self.resolve_pending(ctx, role_id).await?;
        if unresolved.is_empty() {
            return Ok(());
        }
        Err(ServiceError::UnresolvedPermissions {
            role_id,
            permissions: unresolved,
        })
    }

    /// Runs [`resolve_role`](Self::resolve_role) under the retrier in the background.
    pub fn schedule_resolution(&self, ctx: &ExecutionContext, role_id: Uuid) -> JoinHandle<()> {
        let service = self.clone();
        let ctx = ctx.detached();
        self.retrier.spawn(
            format!("resolve loadable role {role_id}"),
            move |_attempt| {
                let service = service.clone();
                let ctx = ctx.clone();
                async move { service.resolve_role(&ctx, role_id).await }
            },
        )
    }

    /// Links every loadable permission named after `capability` and assigns it.
    pub async fn resolve_for_capability(
        &self,
        ctx: &ExecutionContext,
        capability: &Capability,
    ) -> ServiceResult<usize> {
        if capability.dummy {
            return Ok(0);
        }
        self.resolve_for_grant(
            ctx,
            &capability.permission,
            &capability.name,
            Grant::Capability(capability.id),
        )
        .await
    }

    pub async fn resolve_for_capability_set(
        &self,
        ctx: &ExecutionContext,
        set: &CapabilitySet,
    ) -> ServiceResult<usize> {
        self.resolve_for_grant(
            ctx,
            &set.permission,
            &set.name,
            Grant::CapabilitySet(set.id),
        )
        .await
    }

    pub async fn get(&self, id: Uuid) -> ServiceResult<LoadableRole> {
        self.store
            .find_loadable_role(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("loadable role", id))
    }

    /// Deletes the role; the loadable row goes with it.
    pub async fn delete(&self, ctx: &ExecutionContext, id: Uuid) -> ServiceResult<()> {
        self.get(id).await?;
        self.roles.delete(ctx, id).await
    }

    /// Resolves what currently can be; returns the names still unresolved.
    async fn resolve_pending(
        &self,
        ctx: &ExecutionContext,
        role_id: Uuid,
    ) -> ServiceResult<Vec<String>> {
        let _guard = self.locks.lock(role_id).await;
        let loadable = self.get(role_id).await?;
        let pending: Vec<String> = loadable
            .unresolved()
            .into_iter()
            .map(str::to_string)
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let capabilities: BTreeMap<String, Uuid> = self
            .store
            .find_capabilities_by_permissions(&pending)
            .await?
            .into_iter()
            .filter(|c| !c.dummy)
            .map(|c| (c.permission, c.id))
            .collect();
        let sets: BTreeMap<String, Uuid> = self
            .store
            .find_capability_sets_by_permissions(&pending)
            .await?
            .into_iter()
            .map(|s| (s.permission, s.id))
            .collect();

        let mut grants = Vec::new();
        let mut links = Vec::new();
        let mut unresolved = Vec::new();
        for permission in loadable.permissions.into_iter().filter(|p| !p.is_resolved()) {
            let name = &permission.permission_name;
            let grant = match (capabilities.get(name), sets.get(name)) {
                (Some(id), _) => Grant::Capability(*id),
                (None, Some(id)) => Grant::CapabilitySet(*id),
                (None, None) => match self.find_by_key(name).await? {
                    Some(grant) => grant,
                    None => {
                        unresolved.push(permission.permission_name);
                        continue;
                    }
                },
            };
            grants.push(grant);
            links.push(link(permission, grant));
        }

        self.assign_missing(ctx, role_id, &grants).await?;
        self.persist_links(links).await?;
        debug!(
            role_id = %role_id,
            resolved = grants.len(),
            unresolved = unresolved.len(),
            "Loadable permissions resolved"
        );
        Ok(unresolved)
    }

    /// Catalog entry for a name published under another verb of the same key.
    async fn find_by_key(&self, permission: &str) -> ServiceResult<Option<Grant>> {
        let Some(parsed) = parse_permission(permission, &[]) else {
            return Ok(None);
        };
        let name = parsed.key.capability_name();
        if let Some(capability) = self.store.find_capability_by_name(&name).await? {
            if !capability.dummy {
                return Ok(Some(Grant::Capability(capability.id)));
            }
        }
        Ok(self
            .store
            .find_capability_set_by_name(&name)
            .await?
            .map(|set| Grant::CapabilitySet(set.id)))
    }

    /// Links and assigns pending rows named `permission` or one of its aliases.
    ///
    /// `name` is the catalog name of the grant; an alias only matches when it
    /// parses to that name.
    async fn resolve_for_grant(
        &self,
        ctx: &ExecutionContext,
        permission: &str,
        name: &str,
        grant: Grant,
    ) -> ServiceResult<usize> {
        let rows: Vec<LoadablePermission> = self
            .store
            .find_loadable_permissions_by_names(&permission_aliases(permission))
            .await?
            .into_iter()
            .filter(|p| !p.is_resolved())
            .filter(|p| {
                p.permission_name == permission
                    || parse_permission(&p.permission_name, &[])
                        .is_some_and(|parsed| parsed.key.capability_name() == name)
            })
            .collect();

        let mut resolved = 0;
        for row in rows {
            let _guard = self.locks.lock(row.role_id).await;
            // A concurrent pass may have resolved it while we waited.
            let Some(current) = self.pending_row(&row).await? else {
                continue;
            };
            self.assign_missing(ctx, current.role_id, &[grant]).await?;
            self.store
                .update_loadable_permission(&link(current, grant))
                .await?;
            resolved += 1;
        }
        if resolved > 0 {
            info!(permission, resolved, "Resolved loadable permissions from catalog change");
        }
        Ok(resolved)
    }

    async fn pending_row(&self, row: &LoadablePermission) -> ServiceResult<Option<LoadablePermission>> {
        Ok(self
            .store
            .find_loadable_role(row.role_id)
            .await?
            .and_then(|role| {
                role.permissions
                    .into_iter()
                    .find(|p| p.permission_name == row.permission_name)
            })
            .filter(|p| !p.is_resolved()))
    }

    /// Assigns the grants the role does not already hold.
    async fn assign_missing(
        &self,
        ctx: &ExecutionContext,
        role_id: Uuid,
        grants: &[Grant],
    ) -> ServiceResult<()> {
        let subject = Subject::Role(role_id);
        let missing = self.unassigned(&subject, grants).await?;
        if missing.is_empty() {
            return Ok(());
        }
        match self.assignments.assign(ctx, subject, &missing).await {
            // Some grant was assigned outside reconciliation in the meantime.
            Err(err) if err.is_conflict() => {
                debug!(role_id = %role_id, error = %err, "Grants assigned concurrently, re-checking");
                let missing = self.unassigned(&subject, &missing).await?;
                if missing.is_empty() {
                    return Ok(());
                }
                self.assignments.assign(ctx, subject, &missing).await
            }
            result => result,
        }
    }

    async fn unassigned(&self, subject: &Subject, grants: &[Grant]) -> ServiceResult<Vec<Grant>> {
        let mut missing = Vec::with_capacity(grants.len());
        for grant in grants {
            let table = EdgeTable::for_assignment(subject, grant);
            if !missing.contains(grant) && !self.store.edge_exists(table, subject.id(), grant.id()).await? {
                missing.push(*grant);
            }
        }
        Ok(missing)
    }

    async fn persist_links(&self, links: Vec<LoadablePermission>) -> ServiceResult<()> {
        for link in links {
            self.store.update_loadable_permission(&link).await?;
        }
        Ok(())
    }
}

fn link(mut permission: LoadablePermission, grant: Grant) -> LoadablePermission {
    match grant {
        Grant::Capability(id) => permission.capability_id = Some(id),
        Grant::CapabilitySet(id) => permission.capability_set_id = Some(id),
    }
    permission
}

/// Listens for catalog changes and resolves loadable permissions they satisfy.
pub struct ReconciliationTrigger<S, A> {
    loadable_roles: LoadableRoleService<S, A>,
}

impl<S: CatalogStore, A: AuthorizationServer> ReconciliationTrigger<S, A> {
    pub fn new(loadable_roles: LoadableRoleService<S, A>) -> Self {
        Self { loadable_roles }
    }

    /// Subscribes to `events` and handles them until the bus is dropped.
    pub fn spawn(self, events: &CatalogEventBus) -> JoinHandle<()> {
        let mut receiver = events.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let name = event.change.name();
                        if let Err(err) = self.handle(&event.context, &event.change).await {
                            warn!(event = name, error = %err, "Reconciliation on catalog change failed");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Reconciliation trigger lagged behind catalog events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Reconciliation trigger stopped");
        })
    }

    async fn handle(&self, ctx: &ExecutionContext, change: &CatalogChange) -> ServiceResult<()> {
        match change {
            CatalogChange::CapabilityCreated { new }
            | CatalogChange::CapabilityUpdated { new, .. } => {
                self.loadable_roles.resolve_for_capability(ctx, new).await?;
            }
            CatalogChange::CapabilitySetCreated { new }
            | CatalogChange::CapabilitySetUpdated { new, .. } => {
                self.loadable_roles
                    .resolve_for_capability_set(ctx, new)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::SyncServices;
    use crate::authz::InMemoryAuthorizationServer;
    use crate::config::ServiceConfig;
    use crate::sync::RetryPolicy;
    use rsroles_domain::descriptor::{ModuleEvent, ResourceDescriptor};
    use rsroles_domain::model::{CapabilityAction, CapabilityKey};
    use rsroles_storage::MemoryCatalogStore;
    use std::time::Duration;

    type Services = SyncServices<MemoryCatalogStore, InMemoryAuthorizationServer>;

    fn services() -> Services {
        let mut config = ServiceConfig::default();
        config.retry.max_attempts = 3;
        config.retry.initial_backoff_ms = 10;
        config.retry.max_backoff_ms = 20;
        SyncServices::new(
            &config,
            MemoryCatalogStore::new_shared(),
            Arc::new(InMemoryAuthorizationServer::new()),
        )
    }

    fn foo_module() -> ModuleEvent {
        ModuleEvent::create(
            "mod-foo-1.0.0",
            "app-foo-1.0.0",
            vec![
                ResourceDescriptor::endpoint("foo.item.get", "GET", "/foo/{id}"),
                ResourceDescriptor::endpoint("foo.item.post", "POST", "/foo"),
            ],
        )
    }

    // ===== Section 1: Synchronous resolution =====

    #[tokio::test]
    async fn test_create_resolves_known_permissions_and_assigns_them() {
        // Arrange
        let services = services();
        let ctx = ExecutionContext::new("diku");
        services.catalog.apply(&ctx, &foo_module()).await.unwrap();

        // Act
        let created = services
            .loadable_roles
            .create(&ctx, LoadableRole::new("Librarian", ["foo.item.get", "foo.item.post"]))
            .await
            .unwrap();

        // Assert
        assert!(created.unresolved.is_empty());
        assert!(created.reconciliation.is_none());
        assert!(created.role.unresolved().is_empty());
        let grants = services
            .assignments
            .grants(&Subject::Role(created.role.id))
            .await
            .unwrap();
        assert_eq!(grants.len(), 2);
    }

    #[tokio::test]
    async fn test_permission_name_resolves_to_capability_set() {
        // Arrange
        let services = services();
        let ctx = ExecutionContext::new("diku");
        let mut event = foo_module();
        event.resources.push(ResourceDescriptor::set(
            "foo.all",
            ["foo.item.get", "foo.item.post"],
        ));
        services.catalog.apply(&ctx, &event).await.unwrap();

        // Act
        let created = services
            .loadable_roles
            .create(&ctx, LoadableRole::new("Foo Admin", ["foo.all"]))
            .await
            .unwrap();

        // Assert
        let permission = &created.role.permissions[0];
        assert!(permission.capability_id.is_none());
        assert!(permission.capability_set_id.is_some());
    }

    // ===== Section 2: Deferred resolution =====

    #[tokio::test(start_paused = true)]
    async fn test_retrier_exhaustion_leaves_permission_unresolved() {
        // Arrange
        let services = services();
        let ctx = ExecutionContext::new("diku");

        // Act
        let created = services
            .loadable_roles
            .create(&ctx, LoadableRole::new("Cataloger", ["bar.item.get"]))
            .await
            .unwrap();
        created
            .reconciliation
            .expect("reconciliation scheduled")
            .await
            .unwrap();

        // Assert
        assert_eq!(created.unresolved, vec!["bar.item.get".to_string()]);
        let stored = services.loadable_roles.get(created.role.id).await.unwrap();
        assert_eq!(stored.unresolved(), vec!["bar.item.get"]);
        assert!(stored.permissions[0].capability_id.is_none());
        assert!(stored.permissions[0].capability_set_id.is_none());
    }

    #[tokio::test]
    async fn test_resolve_role_reports_retryable_unresolved_error() {
        // Arrange
        let services = services();
        let ctx = ExecutionContext::new("diku");
        let created = services
            .loadable_roles
            .create(&ctx, LoadableRole::new("Cataloger", ["bar.item.get"]))
            .await
            .unwrap();
        if let Some(handle) = created.reconciliation {
            handle.abort();
        }

        // Act
        let err = services
            .loadable_roles
            .resolve_role(&ctx, created.role.id)
            .await
            .unwrap_err();

        // Assert
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            ServiceError::UnresolvedPermissions { ref permissions, .. } if permissions == &["bar.item.get".to_string()]
        ));
    }

    #[tokio::test]
    async fn test_capability_created_event_resolves_pending_permission() {
        // Arrange
        let services = services();
        let ctx = ExecutionContext::new("diku");
        let trigger = services.start_reconciliation_trigger();
        let created = services
            .loadable_roles
            .create(&ctx, LoadableRole::new("Librarian", ["foo.item.get"]))
            .await
            .unwrap();
        if let Some(handle) = created.reconciliation {
            handle.abort();
        }

        // Act
        services.catalog.apply(&ctx, &foo_module()).await.unwrap();

        // Assert
        let mut resolved = false;
        for _ in 0..50 {
            let stored = services.loadable_roles.get(created.role.id).await.unwrap();
            if stored.unresolved().is_empty() {
                resolved = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(resolved);
        let grants = services
            .assignments
            .grants(&Subject::Role(created.role.id))
            .await
            .unwrap();
        assert_eq!(grants.len(), 1);
        trigger.abort();
    }

    #[tokio::test]
    async fn test_resolve_for_placeholder_capability_is_noop() {
        // Arrange
        let services = services();
        let ctx = ExecutionContext::new("diku");
        let placeholder = Capability::placeholder(
            &CapabilityKey::new("Foo Item", CapabilityAction::View),
            "foo.item.get",
            "app-foo-1.0.0",
        );

        // Act
        let resolved = services
            .loadable_roles
            .resolve_for_capability(&ctx, &placeholder)
            .await
            .unwrap();

        // Assert
        assert_eq!(resolved, 0);
    }

    // ===== Section 3: Folded names and concurrent passes =====

    fn put_and_patch_module() -> ModuleEvent {
        ModuleEvent::create(
            "mod-foo-1.0.0",
            "app-foo-1.0.0",
            vec![
                ResourceDescriptor::endpoint("foo.item.put", "PUT", "/foo/{id}"),
                ResourceDescriptor::endpoint("foo.item.patch", "PATCH", "/foo/{id}"),
            ],
        )
    }

    #[tokio::test]
    async fn test_folded_permission_name_resolves_to_edit_capability() {
        // Arrange
        let services = services();
        let ctx = ExecutionContext::new("diku");
        services.catalog.apply(&ctx, &put_and_patch_module()).await.unwrap();
        let edit = services
            .catalog
            .find_capability_by_name("foo_item.edit")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(edit.permission, "foo.item.put");

        // Act
        let created = services
            .loadable_roles
            .create(&ctx, LoadableRole::new("Editor", ["foo.item.patch"]))
            .await
            .unwrap();

        // Assert
        assert!(created.unresolved.is_empty());
        assert!(created.reconciliation.is_none());
        assert_eq!(created.role.permissions[0].capability_id, Some(edit.id));
    }

    #[tokio::test]
    async fn test_capability_event_resolves_folded_permission_name() {
        // Arrange
        let services = services();
        let ctx = ExecutionContext::new("diku");
        let created = services
            .loadable_roles
            .create(&ctx, LoadableRole::new("Editor", ["foo.item.patch"]))
            .await
            .unwrap();
        if let Some(handle) = created.reconciliation {
            handle.abort();
        }
        services.catalog.apply(&ctx, &put_and_patch_module()).await.unwrap();
        let edit = services
            .catalog
            .find_capability_by_name("foo_item.edit")
            .await
            .unwrap()
            .unwrap();

        // Act
        let resolved = services
            .loadable_roles
            .resolve_for_capability(&ctx, &edit)
            .await
            .unwrap();

        // Assert
        assert_eq!(resolved, 1);
        let stored = services.loadable_roles.get(created.role.id).await.unwrap();
        assert!(stored.unresolved().is_empty());
        assert_eq!(stored.permissions[0].capability_id, Some(edit.id));
    }

    #[tokio::test]
    async fn test_concurrent_resolution_passes_both_succeed() {
        // Arrange
        let services = services();
        let ctx = ExecutionContext::new("diku");
        let created = services
            .loadable_roles
            .create(&ctx, LoadableRole::new("Librarian", ["foo.item.get"]))
            .await
            .unwrap();
        if let Some(handle) = created.reconciliation {
            handle.abort();
        }
        services.catalog.apply(&ctx, &foo_module()).await.unwrap();
        let capability = services
            .catalog
            .find_capability_by_name("foo_item.view")
            .await
            .unwrap()
            .unwrap();

        // Act
        let (by_retrier, by_event) = tokio::join!(
            services.loadable_roles.resolve_role(&ctx, created.role.id),
            services.loadable_roles.resolve_for_capability(&ctx, &capability),
        );

        // Assert
        by_retrier.unwrap();
        assert!(by_event.unwrap() <= 1);
        let stored = services.loadable_roles.get(created.role.id).await.unwrap();
        assert!(stored.unresolved().is_empty());
        let grants = services
            .assignments
            .grants(&Subject::Role(created.role.id))
            .await
            .unwrap();
        assert_eq!(grants, vec![Grant::Capability(capability.id)]);
    }

    #[tokio::test]
    async fn test_resolution_tolerates_grant_assigned_elsewhere() {
        // Arrange
        let services = services();
        let ctx = ExecutionContext::new("diku");
        let created = services
            .loadable_roles
            .create(&ctx, LoadableRole::new("Librarian", ["foo.item.get"]))
            .await
            .unwrap();
        if let Some(handle) = created.reconciliation {
            handle.abort();
        }
        services.catalog.apply(&ctx, &foo_module()).await.unwrap();
        let capability = services
            .catalog
            .find_capability_by_name("foo_item.view")
            .await
            .unwrap()
            .unwrap();
        services
            .assignments
            .assign(&ctx, Subject::Role(created.role.id), &[Grant::Capability(capability.id)])
            .await
            .unwrap();

        // Act
        services
            .loadable_roles
            .resolve_role(&ctx, created.role.id)
            .await
            .unwrap();

        // Assert
        let stored = services.loadable_roles.get(created.role.id).await.unwrap();
        assert_eq!(stored.permissions[0].capability_id, Some(capability.id));
    }

    #[test]
    fn test_retry_policy_follows_config() {
        let services = services();
        let policy: &RetryPolicy = services.loadable_roles.retrier.policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(10));
    }
}
