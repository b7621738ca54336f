use super::*;
use crate::authz::InMemoryAuthorizationServer;
use crate::sync::BatchExecutor;
use rsroles_domain::model::{
    CapabilityAction, CapabilityKey, CapabilitySet, CapabilityType, Grant, HttpMethod,
    LoadableRole,
};
use rsroles_domain::naming;
use rsroles_storage::MemoryCatalogStore;

struct Fixture {
    store: Arc<MemoryCatalogStore>,
    server: Arc<InMemoryAuthorizationServer>,
    events: CatalogEventBus,
    rewriter: DuplicateRewriter<MemoryCatalogStore, InMemoryAuthorizationServer>,
    ctx: ExecutionContext,
}

fn fixture() -> Fixture {
    let store = MemoryCatalogStore::new_shared();
    let server = Arc::new(InMemoryAuthorizationServer::new());
    let events = CatalogEventBus::new(16);
    let permissions = EndpointPermissionSync::new(Arc::clone(&server), BatchExecutor::new(4));
    let rewriter = DuplicateRewriter::new(Arc::clone(&store), permissions, events.clone());
    Fixture {
        store,
        server,
        events,
        rewriter,
        ctx: ExecutionContext::new("diku"),
    }
}

async fn capability(
    store: &MemoryCatalogStore,
    resource: &str,
    permission: &str,
    endpoint: Endpoint,
) -> Capability {
    let mut capability = Capability::new(
        &CapabilityKey::new(resource, CapabilityAction::Edit),
        permission,
        CapabilityType::Data,
        "app-1.0",
    );
    capability.endpoints = vec![endpoint];
    store.create_capability(&capability).await.unwrap()
}

async fn capability_set(store: &MemoryCatalogStore, resource: &str, members: &[Uuid]) -> CapabilitySet {
    let key = CapabilityKey::new(resource, CapabilityAction::Manage);
    let mut set = CapabilitySet::new(
        &key,
        format!("{}.all", resource.to_lowercase()),
        CapabilityType::Data,
        "app-1.0",
    );
    set.add_members(members.iter().copied());
    let set = store.create_capability_set(&set).await.unwrap();
    let edges: Vec<Edge> = members
        .iter()
        .map(|id| Edge::new(EdgeTable::CapabilitySetMember, set.id, *id))
        .collect();
    store.insert_edges(&edges).await.unwrap();
    set
}

async fn assign(store: &MemoryCatalogStore, subject: Subject, grant: Grant) {
    store
        .insert_edges(&[Edge::assignment(subject, grant)])
        .await
        .unwrap();
}

async fn objects(store: &MemoryCatalogStore, table: EdgeTable, subject: Uuid) -> Vec<Uuid> {
    store
        .list_edges_by_subject(table, subject)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.object_id)
        .collect()
}

// ===== Section 1: Edge rewriting =====

#[tokio::test]
async fn test_subject_holding_both_keeps_single_edge_to_new() {
    // Arrange
    let f = fixture();
    let old = capability(&f.store, "Foo Item", "foo.item.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let new = capability(&f.store, "Foo Items", "foo.items.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let role = Subject::Role(Uuid::new_v4());
    assign(&f.store, role, Grant::Capability(old.id)).await;
    assign(&f.store, role, Grant::Capability(new.id)).await;

    // Act
    let outcome = f
        .rewriter
        .rewrite(&f.ctx, ArtifactKind::Capability, &old.name, &new.name)
        .await
        .unwrap();

    // Assert
    assert_eq!(
        outcome,
        RewriteOutcome::Completed {
            rewritten: 0,
            duplicates_removed: 1
        }
    );
    assert_eq!(objects(&f.store, EdgeTable::RoleCapability, role.id()).await, vec![new.id]);
    assert!(f.store.find_capability(old.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_subject_holding_only_old_is_moved_to_new() {
    let f = fixture();
    let old = capability(&f.store, "Foo Item", "foo.item.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let new = capability(&f.store, "Foo Items", "foo.items.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let user = Subject::User(Uuid::new_v4());
    assign(&f.store, user, Grant::Capability(old.id)).await;

    let outcome = f
        .rewriter
        .rewrite(&f.ctx, ArtifactKind::Capability, &old.name, &new.name)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RewriteOutcome::Completed {
            rewritten: 1,
            duplicates_removed: 0
        }
    );
    assert_eq!(objects(&f.store, EdgeTable::UserCapability, user.id()).await, vec![new.id]);
}

#[tokio::test]
async fn test_rerun_is_noop() {
    let f = fixture();
    let old = capability(&f.store, "Foo Item", "foo.item.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let new = capability(&f.store, "Foo Items", "foo.items.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let role = Subject::Role(Uuid::new_v4());
    assign(&f.store, role, Grant::Capability(old.id)).await;
    f.rewriter
        .rewrite(&f.ctx, ArtifactKind::Capability, &old.name, &new.name)
        .await
        .unwrap();
    f.server.clear_calls();

    let outcome = f
        .rewriter
        .rewrite(&f.ctx, ArtifactKind::Capability, &old.name, &new.name)
        .await
        .unwrap();

    assert_eq!(outcome, RewriteOutcome::AlreadyMigrated);
    assert_eq!(objects(&f.store, EdgeTable::RoleCapability, role.id()).await, vec![new.id]);
    assert!(f.server.calls().is_empty());
}

#[tokio::test]
async fn test_set_membership_follows_rewrite() {
    let f = fixture();
    let old = capability(&f.store, "Foo Item", "foo.item.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let new = capability(&f.store, "Foo Items", "foo.items.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let other = capability(&f.store, "Bar", "bar.put", Endpoint::new("/bar", HttpMethod::Put)).await;
    let set = capability_set(&f.store, "Foo", &[old.id, other.id]).await;

    f.rewriter
        .rewrite(&f.ctx, ArtifactKind::Capability, &old.name, &new.name)
        .await
        .unwrap();

    let set = f.store.find_capability_set(set.id).await.unwrap().unwrap();
    assert_eq!(set.capabilities, vec![new.id, other.id]);
    assert_eq!(
        objects(&f.store, EdgeTable::CapabilitySetMember, set.id).await.len(),
        2
    );
}

#[tokio::test]
async fn test_loadable_permission_links_are_moved() {
    let f = fixture();
    let old = capability(&f.store, "Foo Item", "foo.item.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let new = capability(&f.store, "Foo Items", "foo.items.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let mut loadable = LoadableRole::new("reader", ["foo.item.put"]);
    loadable.permissions[0].capability_id = Some(old.id);
    f.store.save_loadable_role(&loadable).await.unwrap();

    f.rewriter
        .rewrite(&f.ctx, ArtifactKind::Capability, &old.name, &new.name)
        .await
        .unwrap();

    let linked = f
        .store
        .find_loadable_permissions_by_capability(new.id)
        .await
        .unwrap();
    assert_eq!(linked.len(), 1);
    assert!(f
        .store
        .find_loadable_permissions_by_capability(old.id)
        .await
        .unwrap()
        .is_empty());
}

// ===== Section 2: Skip safety =====

#[tokio::test]
async fn test_missing_old_returns_without_remote_calls() {
    let f = fixture();

    let outcome = f
        .rewriter
        .rewrite(&f.ctx, ArtifactKind::Capability, "gone.edit", "foo_items.edit")
        .await
        .unwrap();

    assert_eq!(outcome, RewriteOutcome::AlreadyMigrated);
    assert!(f.server.calls().is_empty());
}

#[tokio::test]
async fn test_missing_new_leaves_old_untouched() {
    let f = fixture();
    let old = capability(&f.store, "Foo Item", "foo.item.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let role = Subject::Role(Uuid::new_v4());
    assign(&f.store, role, Grant::Capability(old.id)).await;

    let outcome = f
        .rewriter
        .rewrite(&f.ctx, ArtifactKind::Capability, &old.name, "missing.edit")
        .await
        .unwrap();

    assert_eq!(outcome, RewriteOutcome::SkippedMissingTarget);
    assert!(f.store.find_capability(old.id).await.unwrap().is_some());
    assert_eq!(objects(&f.store, EdgeTable::RoleCapability, role.id()).await, vec![old.id]);
}

#[tokio::test]
async fn test_rewrite_onto_itself_is_rejected() {
    let f = fixture();

    let err = f
        .rewriter
        .rewrite(&f.ctx, ArtifactKind::Capability, "foo.edit", "foo.edit")
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Validation { .. }));
}

// ===== Section 3: Events and remote sync =====

#[tokio::test]
async fn test_deleted_event_carries_old_record() {
    let f = fixture();
    let mut receiver = f.events.subscribe();
    let old = capability(&f.store, "Foo Item", "foo.item.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let new = capability(&f.store, "Foo Items", "foo.items.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;

    f.rewriter
        .rewrite(&f.ctx, ArtifactKind::Capability, &old.name, &new.name)
        .await
        .unwrap();

    let event = receiver.recv().await.unwrap();
    assert_eq!(event.change, CatalogChange::CapabilityDeleted { old });
}

#[tokio::test]
async fn test_remote_permissions_follow_new_endpoints() {
    // Arrange
    let f = fixture();
    let old = capability(&f.store, "Foo Item", "foo.item.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let new = capability(&f.store, "Foo Items", "foo.items.put", Endpoint::new("/foo/items/{id}", HttpMethod::Put)).await;
    let role = Subject::Role(Uuid::new_v4());
    assign(&f.store, role, Grant::Capability(old.id)).await;
    let permissions = EndpointPermissionSync::new(Arc::clone(&f.server), BatchExecutor::new(2));
    permissions
        .create(&f.ctx, &role, &old.endpoints)
        .await
        .unwrap();

    // Act
    f.rewriter
        .rewrite(&f.ctx, ArtifactKind::Capability, &old.name, &new.name)
        .await
        .unwrap();

    // Assert
    assert_eq!(
        f.server.permission_names(),
        vec![naming::permission_name(HttpMethod::Put, &role, "/foo/items/{id}")]
    );
}

#[tokio::test]
async fn test_capability_set_rewrite() {
    let f = fixture();
    let member = capability(&f.store, "Foo Item", "foo.item.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let old = capability_set(&f.store, "Foo", &[member.id]).await;
    let new = capability_set(&f.store, "Foos", &[member.id]).await;
    let role = Subject::Role(Uuid::new_v4());
    let user = Subject::User(Uuid::new_v4());
    assign(&f.store, role, Grant::CapabilitySet(old.id)).await;
    assign(&f.store, role, Grant::CapabilitySet(new.id)).await;
    assign(&f.store, user, Grant::CapabilitySet(old.id)).await;

    let outcome = f
        .rewriter
        .rewrite(&f.ctx, ArtifactKind::CapabilitySet, &old.name, &new.name)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RewriteOutcome::Completed {
            rewritten: 1,
            duplicates_removed: 1
        }
    );
    assert_eq!(objects(&f.store, EdgeTable::RoleCapabilitySet, role.id()).await, vec![new.id]);
    assert_eq!(objects(&f.store, EdgeTable::UserCapabilitySet, user.id()).await, vec![new.id]);
    assert!(f.store.find_capability_set(old.id).await.unwrap().is_none());
    assert!(objects(&f.store, EdgeTable::CapabilitySetMember, old.id).await.is_empty());
}

// ===== Section 4: Partial failure =====

#[tokio::test]
async fn test_failed_local_rewrite_restores_edges_and_old_record() {
    // Arrange
    let f = fixture();
    let old = capability(&f.store, "Foo Item", "foo.item.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let new = capability(&f.store, "Foo Items", "foo.items.put", Endpoint::new("/foo/{id}", HttpMethod::Put)).await;
    let role = Subject::Role(Uuid::new_v4());
    let user = Subject::User(Uuid::new_v4());
    assign(&f.store, role, Grant::Capability(old.id)).await;
    assign(&f.store, role, Grant::Capability(new.id)).await;
    assign(&f.store, user, Grant::Capability(old.id)).await;
    f.store.fail_next("delete_capability", 1);

    // Act
    let result = f
        .rewriter
        .rewrite(&f.ctx, ArtifactKind::Capability, &old.name, &new.name)
        .await;

    // Assert
    assert!(result.is_err());
    assert!(f.store.find_capability(old.id).await.unwrap().is_some());
    let mut role_objects = objects(&f.store, EdgeTable::RoleCapability, role.id()).await;
    role_objects.sort();
    let mut expected = vec![old.id, new.id];
    expected.sort();
    assert_eq!(role_objects, expected);
    assert_eq!(objects(&f.store, EdgeTable::UserCapability, user.id()).await, vec![old.id]);

    // The rerun applies the whole rewrite.
    let outcome = f
        .rewriter
        .rewrite(&f.ctx, ArtifactKind::Capability, &old.name, &new.name)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RewriteOutcome::Completed {
            rewritten: 1,
            duplicates_removed: 1
        }
    );
}
