//! Scope permissions for the endpoints a subject can reach.
//!
//! Each `(subject, method, path)` triple is mirrored to the authorization
//! server as one scope permission named by
//! [`naming::permission_name`](rsroles_domain::naming::permission_name). The
//! permission references the subject's policy (whose id is the subject id),
//! the resource registered for the path and the scope of the method.
//!
//! Creation fans out one task per path, deletion one task per endpoint, both
//! through the [`BatchExecutor`].

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use rsroles_domain::model::{
    union_endpoints, DecisionStrategy, Endpoint, EdgeTable, HttpMethod, Subject,
};
use rsroles_domain::naming;
use rsroles_storage::CatalogStore;

use super::batch::BatchExecutor;
use crate::authz::{AuthorizationServer, RemoteResource, RemoteScope, ScopePermission};
use crate::context::ExecutionContext;
use crate::error::{ServiceError, ServiceResult};

/// Mirrors endpoint access of subjects into scope permissions.
pub struct EndpointPermissionSync<A> {
    authz: Arc<A>,
    batch: BatchExecutor,
}

impl<A> Clone for EndpointPermissionSync<A> {
    fn clone(&self) -> Self {
        Self {
            authz: Arc::clone(&self.authz),
            batch: self.batch,
        }
    }
}

impl<A: AuthorizationServer> EndpointPermissionSync<A> {
    pub fn new(authz: Arc<A>, batch: BatchExecutor) -> Self {
        Self { authz, batch }
    }

    /// Creates scope permissions granting `subject` each endpoint.
    ///
    /// Permissions that already exist count as created. Endpoints whose
    /// method has no scope on the server are skipped with a warning.
    #[instrument(skip(self, ctx, endpoints), fields(subject = %subject, endpoints = endpoints.len()))]
    pub async fn create(
        &self,
        ctx: &ExecutionContext,
        subject: &Subject,
        endpoints: &[Endpoint],
    ) -> ServiceResult<()> {
        if endpoints.is_empty() {
            return Ok(());
        }

        let groups = group_by_path(endpoints);
        self.batch
            .run(groups, |(path, methods)| {
                self.create_for_path(ctx, subject, path, methods)
            })
            .await?;
        Ok(())
    }

    /// Deletes the scope permissions granting `subject` each endpoint.
    ///
    /// Permissions already absent count as deleted.
    #[instrument(skip(self, ctx, endpoints), fields(subject = %subject, endpoints = endpoints.len()))]
    pub async fn delete(
        &self,
        ctx: &ExecutionContext,
        subject: &Subject,
        endpoints: &[Endpoint],
    ) -> ServiceResult<()> {
        if endpoints.is_empty() {
            return Ok(());
        }

        self.batch
            .run(endpoints.to_vec(), |endpoint: Endpoint| async move {
                let name = naming::permission_name(endpoint.method, subject, &endpoint.path);
                match self.authz.delete_permission(ctx, &name).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_not_found() => {
                        debug!(permission = %name, "Permission already absent");
                        Ok(())
                    }
                    Err(err) => Err(ServiceError::from(err)),
                }
            })
            .await?;
        Ok(())
    }

    /// Brings the permissions of `subject` from `before` to `after`.
    ///
    /// Creation and deletion both run to completion; their failures are
    /// aggregated.
    pub async fn sync(
        &self,
        ctx: &ExecutionContext,
        subject: &Subject,
        before: &[Endpoint],
        after: &[Endpoint],
    ) -> ServiceResult<()> {
        let (added, removed) = endpoint_diff(before, after);
        let created = self.create(ctx, subject, &added).await;
        let deleted = self.delete(ctx, subject, &removed).await;
        super::batch::aggregate(vec![created, deleted])?;
        Ok(())
    }

    async fn create_for_path(
        &self,
        ctx: &ExecutionContext,
        subject: &Subject,
        path: String,
        methods: Vec<HttpMethod>,
    ) -> ServiceResult<()> {
        let mut scopes: Vec<(HttpMethod, RemoteScope)> = Vec::with_capacity(methods.len());
        for method in methods {
            match self.authz.find_scope(ctx, method.as_str()).await? {
                Some(scope) => scopes.push((method, scope)),
                None => warn!(
                    path = %path,
                    method = %method,
                    "Scope not found on authorization server, skipping endpoint"
                ),
            }
        }
        if scopes.is_empty() {
            return Ok(());
        }

        let all_scopes: Vec<RemoteScope> = scopes.iter().map(|(_, s)| s.clone()).collect();
        let resource = self.find_or_create_resource(ctx, &path, &all_scopes).await?;

        for (method, scope) in scopes {
            let permission = ScopePermission {
                id: None,
                name: naming::permission_name(method, subject, &path),
                description: None,
                decision_strategy: DecisionStrategy::Unanimous,
                policies: vec![subject.id().to_string()],
                resources: vec![resource.id.clone()],
                scopes: vec![scope.id],
            };
            match self.authz.create_permission(ctx, &permission).await {
                Ok(()) => {}
                Err(err) if err.is_conflict() => {
                    debug!(permission = %permission.name, "Permission already exists");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn find_or_create_resource(
        &self,
        ctx: &ExecutionContext,
        path: &str,
        scopes: &[RemoteScope],
    ) -> ServiceResult<RemoteResource> {
        if let Some(resource) = self.authz.find_resource(ctx, path).await? {
            return Ok(resource);
        }

        match self.authz.create_resource(ctx, path, scopes).await {
            Ok(resource) => Ok(resource),
            // Created concurrently by another task.
            Err(err) if err.is_conflict() => self
                .authz
                .find_resource(ctx, path)
                .await?
                .ok_or_else(|| ServiceError::not_found("resource", path)),
            Err(err) => Err(err.into()),
        }
    }
}

/// Endpoints grouped by path, paths and methods in first-seen order.
fn group_by_path(endpoints: &[Endpoint]) -> Vec<(String, Vec<HttpMethod>)> {
    let mut groups: Vec<(String, Vec<HttpMethod>)> = Vec::new();
    for endpoint in endpoints {
        match groups.iter_mut().find(|(path, _)| *path == endpoint.path) {
            Some((_, methods)) => {
                if !methods.contains(&endpoint.method) {
                    methods.push(endpoint.method);
                }
            }
            None => groups.push((endpoint.path.clone(), vec![endpoint.method])),
        }
    }
    groups
}

/// `(added, removed)` going from `before` to `after`.
pub fn endpoint_diff(before: &[Endpoint], after: &[Endpoint]) -> (Vec<Endpoint>, Vec<Endpoint>) {
    let before_set: HashSet<&Endpoint> = before.iter().collect();
    let after_set: HashSet<&Endpoint> = after.iter().collect();
    let added = after
        .iter()
        .filter(|e| !before_set.contains(e))
        .cloned()
        .collect();
    let removed = before
        .iter()
        .filter(|e| !after_set.contains(e))
        .cloned()
        .collect();
    (added, removed)
}

/// Endpoints `subject` reaches through its direct capabilities and the
/// members of its capability sets.
pub async fn subject_endpoints<S>(store: &S, subject: &Subject) -> ServiceResult<Vec<Endpoint>>
where
    S: CatalogStore + ?Sized,
{
    let (capability_table, set_table) = match subject {
        Subject::Role(_) => (EdgeTable::RoleCapability, EdgeTable::RoleCapabilitySet),
        Subject::User(_) => (EdgeTable::UserCapability, EdgeTable::UserCapabilitySet),
    };

    let mut capability_ids: Vec<Uuid> = store
        .list_edges_by_subject(capability_table, subject.id())
        .await?
        .into_iter()
        .map(|edge| edge.object_id)
        .collect();
    let set_ids: Vec<Uuid> = store
        .list_edges_by_subject(set_table, subject.id())
        .await?
        .into_iter()
        .map(|edge| edge.object_id)
        .collect();

    for set in store.find_capability_sets(&set_ids).await? {
        for id in set.capabilities {
            if !capability_ids.contains(&id) {
                capability_ids.push(id);
            }
        }
    }

    let mut endpoints = Vec::new();
    for capability in store.find_capabilities(&capability_ids).await? {
        union_endpoints(&mut endpoints, capability.endpoints);
    }
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::InMemoryAuthorizationServer;
    use rsroles_domain::model::{
        Capability, CapabilityAction, CapabilityKey, CapabilitySet, CapabilityType, Edge, Grant,
    };
    use rsroles_storage::MemoryCatalogStore;

    fn sync_with(server: &Arc<InMemoryAuthorizationServer>) -> EndpointPermissionSync<InMemoryAuthorizationServer> {
        EndpointPermissionSync::new(Arc::clone(server), BatchExecutor::new(4))
    }

    fn role() -> Subject {
        Subject::Role(Uuid::new_v4())
    }

    // ===== Section 1: Creation =====

    #[tokio::test]
    async fn test_create_registers_one_resource_per_path() {
        // Arrange
        let server = Arc::new(InMemoryAuthorizationServer::new());
        let sync = sync_with(&server);
        let ctx = ExecutionContext::new("diku");
        let subject = role();
        let endpoints = vec![
            Endpoint::new("/foo/{id}", HttpMethod::Put),
            Endpoint::new("/foo/{id}", HttpMethod::Patch),
            Endpoint::new("/foo", HttpMethod::Get),
        ];

        // Act
        sync.create(&ctx, &subject, &endpoints).await.unwrap();

        // Assert
        assert_eq!(server.calls_of("create_resource").len(), 2);
        assert_eq!(server.permission_names().len(), 3);
        assert!(server.has_permission(&naming::permission_name(
            HttpMethod::Patch,
            &subject,
            "/foo/{id}"
        )));
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let server = Arc::new(InMemoryAuthorizationServer::new());
        let sync = sync_with(&server);
        let ctx = ExecutionContext::new("diku");
        let subject = role();
        let endpoints = vec![Endpoint::new("/foo", HttpMethod::Get)];

        sync.create(&ctx, &subject, &endpoints).await.unwrap();
        sync.create(&ctx, &subject, &endpoints).await.unwrap();

        assert_eq!(server.permission_names().len(), 1);
        assert_eq!(server.calls_of("create_resource").len(), 1);
    }

    #[tokio::test]
    async fn test_missing_scope_skips_endpoint() {
        let server = Arc::new(InMemoryAuthorizationServer::new());
        server.remove_scope("PATCH");
        let sync = sync_with(&server);
        let ctx = ExecutionContext::new("diku");
        let subject = role();

        sync.create(
            &ctx,
            &subject,
            &[
                Endpoint::new("/foo/{id}", HttpMethod::Patch),
                Endpoint::new("/foo/{id}", HttpMethod::Put),
            ],
        )
        .await
        .unwrap();

        assert_eq!(
            server.permission_names(),
            vec![naming::permission_name(HttpMethod::Put, &subject, "/foo/{id}")]
        );
    }

    #[tokio::test]
    async fn test_failures_across_paths_are_aggregated() {
        // Arrange
        let server = Arc::new(InMemoryAuthorizationServer::new());
        server.fail_next("create_permission", 2);
        let sync = sync_with(&server);
        let ctx = ExecutionContext::new("diku");
        let endpoints = vec![
            Endpoint::new("/a", HttpMethod::Get),
            Endpoint::new("/b", HttpMethod::Get),
            Endpoint::new("/c", HttpMethod::Get),
        ];

        // Act
        let err = sync.create(&ctx, &role(), &endpoints).await.unwrap_err();

        // Assert
        assert!(err.is_retryable());
        assert_eq!(err.suppressed().len(), 1);
        assert_eq!(server.permission_names().len(), 1);
    }

    // ===== Section 2: Deletion and diff =====

    #[tokio::test]
    async fn test_delete_ignores_absent_permissions() {
        let server = Arc::new(InMemoryAuthorizationServer::new());
        let sync = sync_with(&server);
        let ctx = ExecutionContext::new("diku");
        let subject = role();
        let kept = Endpoint::new("/foo", HttpMethod::Get);
        let dropped = Endpoint::new("/foo", HttpMethod::Post);
        sync.create(&ctx, &subject, &[kept.clone()]).await.unwrap();

        sync.delete(&ctx, &subject, &[kept, dropped]).await.unwrap();

        assert!(server.permission_names().is_empty());
    }

    #[tokio::test]
    async fn test_sync_applies_diff() {
        let server = Arc::new(InMemoryAuthorizationServer::new());
        let sync = sync_with(&server);
        let ctx = ExecutionContext::new("diku");
        let subject = role();
        let get = Endpoint::new("/foo", HttpMethod::Get);
        let post = Endpoint::new("/foo", HttpMethod::Post);
        sync.create(&ctx, &subject, &[get.clone()]).await.unwrap();

        sync.sync(&ctx, &subject, &[get], &[post]).await.unwrap();

        assert_eq!(
            server.permission_names(),
            vec![naming::permission_name(HttpMethod::Post, &subject, "/foo")]
        );
    }

    #[test]
    fn test_endpoint_diff() {
        let a = Endpoint::new("/a", HttpMethod::Get);
        let b = Endpoint::new("/b", HttpMethod::Get);
        let c = Endpoint::new("/c", HttpMethod::Get);

        let (added, removed) = endpoint_diff(&[a.clone(), b.clone()], &[b, c.clone()]);

        assert_eq!(added, vec![c]);
        assert_eq!(removed, vec![a]);
    }

    // ===== Section 3: Subject endpoints =====

    #[tokio::test]
    async fn test_subject_endpoints_include_set_members() {
        // Arrange
        let store = MemoryCatalogStore::new();
        let mut direct = Capability::new(
            &CapabilityKey::new("Foo", CapabilityAction::View),
            "foo.get",
            CapabilityType::Data,
            "app-1.0",
        );
        direct.endpoints = vec![Endpoint::new("/foo", HttpMethod::Get)];
        let mut member = Capability::new(
            &CapabilityKey::new("Bar", CapabilityAction::View),
            "bar.get",
            CapabilityType::Data,
            "app-1.0",
        );
        member.endpoints = vec![
            Endpoint::new("/bar", HttpMethod::Get),
            Endpoint::new("/foo", HttpMethod::Get),
        ];
        let mut set = CapabilitySet::new(
            &CapabilityKey::new("Bar", CapabilityAction::Manage),
            "bar.all",
            CapabilityType::Data,
            "app-1.0",
        );
        set.add_members([member.id]);
        store.create_capability(&direct).await.unwrap();
        store.create_capability(&member).await.unwrap();
        store.create_capability_set(&set).await.unwrap();
        let subject = role();
        store
            .insert_edges(&[
                Edge::assignment(subject, Grant::Capability(direct.id)),
                Edge::assignment(subject, Grant::CapabilitySet(set.id)),
            ])
            .await
            .unwrap();

        // Act
        let endpoints = subject_endpoints(&store, &subject).await.unwrap();

        // Assert
        assert_eq!(
            endpoints,
            vec![
                Endpoint::new("/foo", HttpMethod::Get),
                Endpoint::new("/bar", HttpMethod::Get),
            ]
        );
    }
}
