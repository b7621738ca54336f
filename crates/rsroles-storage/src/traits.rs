//! CatalogStore trait definition.

use async_trait::async_trait;
use uuid::Uuid;

use rsroles_domain::model::{
    Capability, CapabilitySet, Edge, EdgeTable, LoadablePermission, LoadableRole, MigrationError,
    MigrationJob, MigrationStatus, Policy, Role,
};

use crate::error::StorageResult;

/// Abstract interface of the relational system-of-record.
///
/// Implementations must be thread-safe (Send + Sync) and enforce the
/// uniqueness constraints documented on each method; callers rely on them
/// as the last line of defense against concurrent duplicate writes.
///
/// Lookups by name or permission are case-sensitive exact matches. Lookups
/// by key return `Ok(None)` when the row is absent.
#[async_trait]
pub trait CatalogStore: Send + Sync + 'static {
    // Capability operations

    /// Inserts a capability. Name and permission are unique.
    async fn create_capability(&self, capability: &Capability) -> StorageResult<Capability>;

    /// Replaces a capability by id.
    async fn update_capability(&self, capability: &Capability) -> StorageResult<Capability>;

    /// Deletes a capability by id.
    async fn delete_capability(&self, id: Uuid) -> StorageResult<()>;

    async fn find_capability(&self, id: Uuid) -> StorageResult<Option<Capability>>;

    async fn find_capability_by_name(&self, name: &str) -> StorageResult<Option<Capability>>;

    async fn find_capability_by_permission(
        &self,
        permission: &str,
    ) -> StorageResult<Option<Capability>>;

    /// Capabilities with any of the given permission names.
    async fn find_capabilities_by_permissions(
        &self,
        permissions: &[String],
    ) -> StorageResult<Vec<Capability>>;

    /// Capabilities with the given ids; missing ids are skipped.
    async fn find_capabilities(&self, ids: &[Uuid]) -> StorageResult<Vec<Capability>>;

    /// Capabilities registered by a module of an application.
    async fn list_capabilities_by_module(
        &self,
        application_id: &str,
        module_id: &str,
    ) -> StorageResult<Vec<Capability>>;

    // Capability-set operations

    /// Inserts a capability set. Name and permission are unique.
    async fn create_capability_set(&self, set: &CapabilitySet) -> StorageResult<CapabilitySet>;

    async fn update_capability_set(&self, set: &CapabilitySet) -> StorageResult<CapabilitySet>;

    async fn delete_capability_set(&self, id: Uuid) -> StorageResult<()>;

    async fn find_capability_set(&self, id: Uuid) -> StorageResult<Option<CapabilitySet>>;

    async fn find_capability_set_by_name(&self, name: &str)
        -> StorageResult<Option<CapabilitySet>>;

    async fn find_capability_set_by_permission(
        &self,
        permission: &str,
    ) -> StorageResult<Option<CapabilitySet>>;

    async fn find_capability_sets_by_permissions(
        &self,
        permissions: &[String],
    ) -> StorageResult<Vec<CapabilitySet>>;

    async fn find_capability_sets(&self, ids: &[Uuid]) -> StorageResult<Vec<CapabilitySet>>;

    async fn list_capability_sets_by_module(
        &self,
        application_id: &str,
        module_id: &str,
    ) -> StorageResult<Vec<CapabilitySet>>;

    // Role operations

    /// Inserts a role. Name is unique.
    async fn create_role(&self, role: &Role) -> StorageResult<Role>;

    async fn update_role(&self, role: &Role) -> StorageResult<Role>;

    async fn delete_role(&self, id: Uuid) -> StorageResult<()>;

    async fn find_role(&self, id: Uuid) -> StorageResult<Option<Role>>;

    async fn find_role_by_name(&self, name: &str) -> StorageResult<Option<Role>>;

    async fn list_roles(&self) -> StorageResult<Vec<Role>>;

    // Policy operations

    /// Inserts a policy. Name is unique.
    async fn create_policy(&self, policy: &Policy) -> StorageResult<Policy>;

    async fn update_policy(&self, policy: &Policy) -> StorageResult<Policy>;

    async fn delete_policy(&self, id: Uuid) -> StorageResult<()>;

    async fn find_policy(&self, id: Uuid) -> StorageResult<Option<Policy>>;

    async fn find_policy_by_name(&self, name: &str) -> StorageResult<Option<Policy>>;

    // Assignment-edge operations

    /// Inserts edges atomically: if any edge already exists, nothing is written.
    async fn insert_edges(&self, edges: &[Edge]) -> StorageResult<()>;

    /// Deletes `(subject, object)` edges for each object id. Returns the number removed.
    async fn delete_edges(
        &self,
        table: EdgeTable,
        subject_id: Uuid,
        object_ids: &[Uuid],
    ) -> StorageResult<usize>;

    /// Deletes every edge of `table` whose object side is `object_id`.
    async fn delete_edges_by_object(&self, table: EdgeTable, object_id: Uuid)
        -> StorageResult<usize>;

    async fn list_edges_by_subject(
        &self,
        table: EdgeTable,
        subject_id: Uuid,
    ) -> StorageResult<Vec<Edge>>;

    async fn list_edges_by_object(&self, table: EdgeTable, object_id: Uuid)
        -> StorageResult<Vec<Edge>>;

    async fn edge_exists(
        &self,
        table: EdgeTable,
        subject_id: Uuid,
        object_id: Uuid,
    ) -> StorageResult<bool>;

    /// Points an existing `(subject, old)` edge at `new`.
    ///
    /// Fails with `EdgeNotFound` if the source edge is absent and with
    /// `DuplicateEdge` if `(subject, new)` already exists.
    async fn rewrite_edge(
        &self,
        table: EdgeTable,
        subject_id: Uuid,
        old_object_id: Uuid,
        new_object_id: Uuid,
    ) -> StorageResult<()>;

    // Loadable-role operations

    /// Inserts or replaces a loadable role with its permissions.
    async fn save_loadable_role(&self, role: &LoadableRole) -> StorageResult<LoadableRole>;

    async fn find_loadable_role(&self, id: Uuid) -> StorageResult<Option<LoadableRole>>;

    async fn delete_loadable_role(&self, id: Uuid) -> StorageResult<()>;

    /// Replaces one permission row, matched by `(role_id, permission_name)`.
    async fn update_loadable_permission(
        &self,
        permission: &LoadablePermission,
    ) -> StorageResult<LoadablePermission>;

    /// Permission rows, across all loadable roles, with any of the given names.
    async fn find_loadable_permissions_by_names(
        &self,
        names: &[String],
    ) -> StorageResult<Vec<LoadablePermission>>;

    async fn find_loadable_permissions_by_capability(
        &self,
        capability_id: Uuid,
    ) -> StorageResult<Vec<LoadablePermission>>;

    async fn find_loadable_permissions_by_capability_set(
        &self,
        capability_set_id: Uuid,
    ) -> StorageResult<Vec<LoadablePermission>>;

    // Migration-job operations

    /// Inserts a job; fails with `MigrationInProgress` while another job is running.
    async fn create_migration_job(&self, job: &MigrationJob) -> StorageResult<MigrationJob>;

    async fn update_migration_job(&self, job: &MigrationJob) -> StorageResult<MigrationJob>;

    async fn find_migration_job(&self, id: Uuid) -> StorageResult<Option<MigrationJob>>;

    /// Jobs, newest first, optionally filtered by status.
    async fn list_migration_jobs(
        &self,
        status: Option<MigrationStatus>,
    ) -> StorageResult<Vec<MigrationJob>>;

    async fn add_migration_error(&self, error: &MigrationError) -> StorageResult<()>;

    async fn list_migration_errors(&self, job_id: Uuid) -> StorageResult<Vec<MigrationError>>;
}
