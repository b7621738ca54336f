//! Catalog store contract tests.
//!
//! Written against the `CatalogStore` trait so every backend can be run
//! through the same checks; the in-memory store is the one wired here.

use rsroles_domain::model::{
    Capability, CapabilityAction, CapabilityKey, CapabilityType, Edge, EdgeTable, LoadableRole,
    Role,
};
use rsroles_storage::{CatalogStore, MemoryCatalogStore, StorageError};
use uuid::Uuid;

fn capability(resource: &str, permission: &str) -> Capability {
    Capability::new(
        &CapabilityKey::new(resource, CapabilityAction::View),
        permission,
        CapabilityType::Data,
        "app-foo-1.0.0",
    )
}

/// Name, permission and role-name uniqueness.
async fn run_uniqueness_checks<S: CatalogStore>(store: &S) {
    let foo = store
        .create_capability(&capability("Foo", "foo.get"))
        .await
        .unwrap();

    let same_name = store.create_capability(&capability("Foo", "foo.view")).await;
    assert!(matches!(same_name, Err(ref err) if err.is_conflict()));

    let same_permission = store.create_capability(&capability("Bar", "foo.get")).await;
    assert!(matches!(same_permission, Err(ref err) if err.is_conflict()));

    // Name lookups are exact.
    assert!(store.find_capability_by_name("FOO.view").await.unwrap().is_none());
    assert_eq!(
        store.find_capability_by_name("foo.view").await.unwrap().map(|c| c.id),
        Some(foo.id)
    );

    store.create_role(&Role::new("Librarian")).await.unwrap();
    let duplicate = store.create_role(&Role::new("Librarian")).await;
    assert!(matches!(duplicate, Err(StorageError::AlreadyExists { .. })));
}

/// Edge insertion is all-or-nothing and rewrite refuses duplicates.
async fn run_edge_checks<S: CatalogStore>(store: &S) {
    let role = Uuid::new_v4();
    let old = Uuid::new_v4();
    let new = Uuid::new_v4();
    let other = Uuid::new_v4();

    store
        .insert_edges(&[Edge::new(EdgeTable::RoleCapability, role, old)])
        .await
        .unwrap();

    let batch = store
        .insert_edges(&[
            Edge::new(EdgeTable::RoleCapability, role, other),
            Edge::new(EdgeTable::RoleCapability, role, old),
        ])
        .await;
    assert!(matches!(batch, Err(StorageError::DuplicateEdge { .. })));
    assert!(!store
        .edge_exists(EdgeTable::RoleCapability, role, other)
        .await
        .unwrap());

    store
        .rewrite_edge(EdgeTable::RoleCapability, role, old, new)
        .await
        .unwrap();
    assert!(store.edge_exists(EdgeTable::RoleCapability, role, new).await.unwrap());
    assert!(!store.edge_exists(EdgeTable::RoleCapability, role, old).await.unwrap());

    let missing = store
        .rewrite_edge(EdgeTable::RoleCapability, role, old, new)
        .await;
    assert!(matches!(missing, Err(StorageError::EdgeNotFound { .. })));
}

/// Loadable permissions survive a save and are found by name.
async fn run_loadable_checks<S: CatalogStore>(store: &S) {
    let role = LoadableRole::new("Cataloger", ["foo.get", "bar.get"]);
    store.save_loadable_role(&role).await.unwrap();

    let rows = store
        .find_loadable_permissions_by_names(&["bar.get".to_string()])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].role_id, role.id);
    assert!(!rows[0].is_resolved());

    store.delete_loadable_role(role.id).await.unwrap();
    assert!(store.find_loadable_role(role.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_memory_store_uniqueness() {
    run_uniqueness_checks(&MemoryCatalogStore::new()).await;
}

#[tokio::test]
async fn test_memory_store_edges() {
    run_edge_checks(&MemoryCatalogStore::new()).await;
}

#[tokio::test]
async fn test_memory_store_loadable_roles() {
    run_loadable_checks(&MemoryCatalogStore::new()).await;
}
