//! In-memory catalog store for testing and embedded use.
//!
//! Rows live in `DashMap`s keyed by id. Writes that must check a uniqueness
//! constraint across rows take a per-table write guard so that the
//! check-then-insert is atomic; reads never take the guard.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::instrument;
use uuid::Uuid;

use rsroles_domain::model::{
    Capability, CapabilitySet, Edge, EdgeTable, LoadablePermission, LoadableRole, MigrationError,
    MigrationJob, MigrationStatus, Policy, Role,
};

use crate::error::{StorageError, StorageResult};
use crate::traits::CatalogStore;

type EdgeKey = (EdgeTable, Uuid, Uuid);

/// In-memory implementation of [`CatalogStore`].
///
/// # Performance Characteristics
///
/// - **Lookup by id**: O(1) (DashMap)
/// - **Lookup by name/permission**: O(N) linear scan
/// - **Edge insert/delete/exists**: O(1) per edge
/// - **Edge listing**: O(E) scan of all edges
///
/// # Failure injection
///
/// [`MemoryCatalogStore::fail_next`] makes the next calls of a named
/// operation fail with a `QueryError`, which lets tests exercise the
/// compensation paths of the services built on top of the store.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    capabilities: DashMap<Uuid, Capability>,
    capability_sets: DashMap<Uuid, CapabilitySet>,
    roles: DashMap<Uuid, Role>,
    policies: DashMap<Uuid, Policy>,
    edges: DashMap<EdgeKey, Edge>,
    loadable_roles: DashMap<Uuid, LoadableRole>,
    migration_jobs: DashMap<Uuid, MigrationJob>,
    migration_errors: DashMap<Uuid, Vec<MigrationError>>,
    capability_guard: Mutex<()>,
    capability_set_guard: Mutex<()>,
    role_guard: Mutex<()>,
    policy_guard: Mutex<()>,
    edge_guard: Mutex<()>,
    migration_guard: Mutex<()>,
    failures: DashMap<&'static str, u32>,
}

impl MemoryCatalogStore {
    /// Creates a new in-memory catalog store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory catalog store wrapped in Arc.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Makes the next `times` calls of `operation` fail.
    ///
    /// `operation` is the trait method name, e.g. `"create_role"`.
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        self.failures.insert(operation, times);
    }

    /// Number of edges currently stored in `table`.
    pub fn edge_count(&self, table: EdgeTable) -> usize {
        self.edges.iter().filter(|e| e.key().0 == table).count()
    }

    fn maybe_fail(&self, operation: &'static str) -> StorageResult<()> {
        if let Some(mut remaining) = self.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::QueryError {
                    message: format!("injected failure in {operation}"),
                });
            }
        }
        Ok(())
    }
}

fn lock(guard: &Mutex<()>) -> StorageResult<MutexGuard<'_, ()>> {
    guard.lock().map_err(|_| StorageError::InternalError {
        message: "store write guard poisoned".to_string(),
    })
}

fn matches_any(value: &str, candidates: &[String]) -> bool {
    candidates.iter().any(|c| c == value)
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    #[instrument(skip(self, capability), fields(name = %capability.name))]
    async fn create_capability(&self, capability: &Capability) -> StorageResult<Capability> {
        self.maybe_fail("create_capability")?;
        let _guard = lock(&self.capability_guard)?;

        if self.capabilities.contains_key(&capability.id) {
            return Err(StorageError::already_exists("capability", capability.id));
        }
        for existing in self.capabilities.iter() {
            if existing.name == capability.name {
                return Err(StorageError::already_exists("capability", &capability.name));
            }
            if existing.permission == capability.permission {
                return Err(StorageError::already_exists(
                    "capability",
                    &capability.permission,
                ));
            }
        }

        self.capabilities.insert(capability.id, capability.clone());
        Ok(capability.clone())
    }

    async fn update_capability(&self, capability: &Capability) -> StorageResult<Capability> {
        self.maybe_fail("update_capability")?;
        let _guard = lock(&self.capability_guard)?;

        if !self.capabilities.contains_key(&capability.id) {
            return Err(StorageError::not_found("capability", capability.id));
        }
        let clash = self.capabilities.iter().any(|c| {
            c.id != capability.id
                && (c.name == capability.name || c.permission == capability.permission)
        });
        if clash {
            return Err(StorageError::already_exists("capability", &capability.name));
        }

        let mut updated = capability.clone();
        updated.updated_at = chrono::Utc::now();
        self.capabilities.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn delete_capability(&self, id: Uuid) -> StorageResult<()> {
        self.maybe_fail("delete_capability")?;
        self.capabilities
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found("capability", id))
    }

    async fn find_capability(&self, id: Uuid) -> StorageResult<Option<Capability>> {
        Ok(self.capabilities.get(&id).map(|c| c.value().clone()))
    }

    async fn find_capability_by_name(&self, name: &str) -> StorageResult<Option<Capability>> {
        Ok(self
            .capabilities
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value().clone()))
    }

    async fn find_capability_by_permission(
        &self,
        permission: &str,
    ) -> StorageResult<Option<Capability>> {
        Ok(self
            .capabilities
            .iter()
            .find(|c| c.permission == permission)
            .map(|c| c.value().clone()))
    }

    async fn find_capabilities_by_permissions(
        &self,
        permissions: &[String],
    ) -> StorageResult<Vec<Capability>> {
        Ok(self
            .capabilities
            .iter()
            .filter(|c| matches_any(&c.permission, permissions))
            .map(|c| c.value().clone())
            .collect())
    }

    async fn find_capabilities(&self, ids: &[Uuid]) -> StorageResult<Vec<Capability>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.capabilities.get(id).map(|c| c.value().clone()))
            .collect())
    }

    async fn list_capabilities_by_module(
        &self,
        application_id: &str,
        module_id: &str,
    ) -> StorageResult<Vec<Capability>> {
        Ok(self
            .capabilities
            .iter()
            .filter(|c| {
                c.application_id == application_id && c.module_id.as_deref() == Some(module_id)
            })
            .map(|c| c.value().clone())
            .collect())
    }

    #[instrument(skip(self, set), fields(name = %set.name))]
    async fn create_capability_set(&self, set: &CapabilitySet) -> StorageResult<CapabilitySet> {
        self.maybe_fail("create_capability_set")?;
        let _guard = lock(&self.capability_set_guard)?;

        let clash = self.capability_sets.iter().any(|s| {
            s.id == set.id || s.name == set.name || s.permission == set.permission
        });
        if clash {
            return Err(StorageError::already_exists("capability set", &set.name));
        }

        self.capability_sets.insert(set.id, set.clone());
        Ok(set.clone())
    }

    async fn update_capability_set(&self, set: &CapabilitySet) -> StorageResult<CapabilitySet> {
        self.maybe_fail("update_capability_set")?;
        let _guard = lock(&self.capability_set_guard)?;

        if !self.capability_sets.contains_key(&set.id) {
            return Err(StorageError::not_found("capability set", set.id));
        }
        let clash = self
            .capability_sets
            .iter()
            .any(|s| s.id != set.id && (s.name == set.name || s.permission == set.permission));
        if clash {
            return Err(StorageError::already_exists("capability set", &set.name));
        }

        let mut updated = set.clone();
        updated.updated_at = chrono::Utc::now();
        self.capability_sets.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn delete_capability_set(&self, id: Uuid) -> StorageResult<()> {
        self.maybe_fail("delete_capability_set")?;
        self.capability_sets
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found("capability set", id))
    }

    async fn find_capability_set(&self, id: Uuid) -> StorageResult<Option<CapabilitySet>> {
        Ok(self.capability_sets.get(&id).map(|s| s.value().clone()))
    }

    async fn find_capability_set_by_name(
        &self,
        name: &str,
    ) -> StorageResult<Option<CapabilitySet>> {
        Ok(self
            .capability_sets
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.value().clone()))
    }

    async fn find_capability_set_by_permission(
        &self,
        permission: &str,
    ) -> StorageResult<Option<CapabilitySet>> {
        Ok(self
            .capability_sets
            .iter()
            .find(|s| s.permission == permission)
            .map(|s| s.value().clone()))
    }

    async fn find_capability_sets_by_permissions(
        &self,
        permissions: &[String],
    ) -> StorageResult<Vec<CapabilitySet>> {
        Ok(self
            .capability_sets
            .iter()
            .filter(|s| matches_any(&s.permission, permissions))
            .map(|s| s.value().clone())
            .collect())
    }

    async fn find_capability_sets(&self, ids: &[Uuid]) -> StorageResult<Vec<CapabilitySet>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.capability_sets.get(id).map(|s| s.value().clone()))
            .collect())
    }

    async fn list_capability_sets_by_module(
        &self,
        application_id: &str,
        module_id: &str,
    ) -> StorageResult<Vec<CapabilitySet>> {
        Ok(self
            .capability_sets
            .iter()
            .filter(|s| {
                s.application_id == application_id && s.module_id.as_deref() == Some(module_id)
            })
            .map(|s| s.value().clone())
            .collect())
    }

    #[instrument(skip(self, role), fields(role_id = %role.id))]
    async fn create_role(&self, role: &Role) -> StorageResult<Role> {
        self.maybe_fail("create_role")?;
        let _guard = lock(&self.role_guard)?;

        if self.roles.contains_key(&role.id) {
            return Err(StorageError::already_exists("role", role.id));
        }
        if self.roles.iter().any(|r| r.name == role.name) {
            return Err(StorageError::already_exists("role", &role.name));
        }

        self.roles.insert(role.id, role.clone());
        Ok(role.clone())
    }

    async fn update_role(&self, role: &Role) -> StorageResult<Role> {
        self.maybe_fail("update_role")?;
        let _guard = lock(&self.role_guard)?;

        if !self.roles.contains_key(&role.id) {
            return Err(StorageError::not_found("role", role.id));
        }
        if self.roles.iter().any(|r| r.id != role.id && r.name == role.name) {
            return Err(StorageError::already_exists("role", &role.name));
        }

        let mut updated = role.clone();
        updated.updated_at = chrono::Utc::now();
        self.roles.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn delete_role(&self, id: Uuid) -> StorageResult<()> {
        self.maybe_fail("delete_role")?;
        self.roles
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found("role", id))
    }

    async fn find_role(&self, id: Uuid) -> StorageResult<Option<Role>> {
        Ok(self.roles.get(&id).map(|r| r.value().clone()))
    }

    async fn find_role_by_name(&self, name: &str) -> StorageResult<Option<Role>> {
        Ok(self
            .roles
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.value().clone()))
    }

    async fn list_roles(&self) -> StorageResult<Vec<Role>> {
        let mut roles: Vec<Role> = self.roles.iter().map(|r| r.value().clone()).collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    #[instrument(skip(self, policy), fields(policy_id = %policy.id))]
    async fn create_policy(&self, policy: &Policy) -> StorageResult<Policy> {
        self.maybe_fail("create_policy")?;
        let _guard = lock(&self.policy_guard)?;

        if self
            .policies
            .iter()
            .any(|p| p.id == policy.id || p.name == policy.name)
        {
            return Err(StorageError::already_exists("policy", &policy.name));
        }

        self.policies.insert(policy.id, policy.clone());
        Ok(policy.clone())
    }

    async fn update_policy(&self, policy: &Policy) -> StorageResult<Policy> {
        self.maybe_fail("update_policy")?;
        let _guard = lock(&self.policy_guard)?;

        if !self.policies.contains_key(&policy.id) {
            return Err(StorageError::not_found("policy", policy.id));
        }
        if self
            .policies
            .iter()
            .any(|p| p.id != policy.id && p.name == policy.name)
        {
            return Err(StorageError::already_exists("policy", &policy.name));
        }

        let mut updated = policy.clone();
        updated.updated_at = chrono::Utc::now();
        self.policies.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn delete_policy(&self, id: Uuid) -> StorageResult<()> {
        self.maybe_fail("delete_policy")?;
        self.policies
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found("policy", id))
    }

    async fn find_policy(&self, id: Uuid) -> StorageResult<Option<Policy>> {
        Ok(self.policies.get(&id).map(|p| p.value().clone()))
    }

    async fn find_policy_by_name(&self, name: &str) -> StorageResult<Option<Policy>> {
        Ok(self
            .policies
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value().clone()))
    }

    async fn insert_edges(&self, edges: &[Edge]) -> StorageResult<()> {
        self.maybe_fail("insert_edges")?;
        let _guard = lock(&self.edge_guard)?;

        let mut batch: HashSet<EdgeKey> = HashSet::with_capacity(edges.len());
        for edge in edges {
            let key = (edge.table, edge.subject_id, edge.object_id);
            if self.edges.contains_key(&key) || !batch.insert(key) {
                return Err(StorageError::DuplicateEdge {
                    table: edge.table,
                    subject_id: edge.subject_id,
                    object_id: edge.object_id,
                });
            }
        }

        for edge in edges {
            self.edges
                .insert((edge.table, edge.subject_id, edge.object_id), edge.clone());
        }
        Ok(())
    }

    async fn delete_edges(
        &self,
        table: EdgeTable,
        subject_id: Uuid,
        object_ids: &[Uuid],
    ) -> StorageResult<usize> {
        self.maybe_fail("delete_edges")?;
        let _guard = lock(&self.edge_guard)?;

        Ok(object_ids
            .iter()
            .filter(|object_id| self.edges.remove(&(table, subject_id, **object_id)).is_some())
            .count())
    }

    async fn delete_edges_by_object(
        &self,
        table: EdgeTable,
        object_id: Uuid,
    ) -> StorageResult<usize> {
        self.maybe_fail("delete_edges_by_object")?;
        let _guard = lock(&self.edge_guard)?;

        let before = self.edges.len();
        self.edges
            .retain(|(t, _, object), _| !(*t == table && *object == object_id));
        Ok(before - self.edges.len())
    }

    async fn list_edges_by_subject(
        &self,
        table: EdgeTable,
        subject_id: Uuid,
    ) -> StorageResult<Vec<Edge>> {
        let mut edges: Vec<Edge> = self
            .edges
            .iter()
            .filter(|e| e.key().0 == table && e.key().1 == subject_id)
            .map(|e| e.value().clone())
            .collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(edges)
    }

    async fn list_edges_by_object(
        &self,
        table: EdgeTable,
        object_id: Uuid,
    ) -> StorageResult<Vec<Edge>> {
        let mut edges: Vec<Edge> = self
            .edges
            .iter()
            .filter(|e| e.key().0 == table && e.key().2 == object_id)
            .map(|e| e.value().clone())
            .collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(edges)
    }

    async fn edge_exists(
        &self,
        table: EdgeTable,
        subject_id: Uuid,
        object_id: Uuid,
    ) -> StorageResult<bool> {
        Ok(self.edges.contains_key(&(table, subject_id, object_id)))
    }

    async fn rewrite_edge(
        &self,
        table: EdgeTable,
        subject_id: Uuid,
        old_object_id: Uuid,
        new_object_id: Uuid,
    ) -> StorageResult<()> {
        self.maybe_fail("rewrite_edge")?;
        let _guard = lock(&self.edge_guard)?;

        if self.edges.contains_key(&(table, subject_id, new_object_id)) {
            return Err(StorageError::DuplicateEdge {
                table,
                subject_id,
                object_id: new_object_id,
            });
        }
        let (_, mut edge) = self
            .edges
            .remove(&(table, subject_id, old_object_id))
            .ok_or(StorageError::EdgeNotFound {
                table,
                subject_id,
                object_id: old_object_id,
            })?;

        edge.object_id = new_object_id;
        self.edges.insert((table, subject_id, new_object_id), edge);
        Ok(())
    }

    async fn save_loadable_role(&self, role: &LoadableRole) -> StorageResult<LoadableRole> {
        self.maybe_fail("save_loadable_role")?;
        self.loadable_roles.insert(role.id, role.clone());
        Ok(role.clone())
    }

    async fn find_loadable_role(&self, id: Uuid) -> StorageResult<Option<LoadableRole>> {
        Ok(self.loadable_roles.get(&id).map(|r| r.value().clone()))
    }

    async fn delete_loadable_role(&self, id: Uuid) -> StorageResult<()> {
        self.maybe_fail("delete_loadable_role")?;
        self.loadable_roles
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found("loadable role", id))
    }

    async fn update_loadable_permission(
        &self,
        permission: &LoadablePermission,
    ) -> StorageResult<LoadablePermission> {
        self.maybe_fail("update_loadable_permission")?;
        let mut role = self
            .loadable_roles
            .get_mut(&permission.role_id)
            .ok_or_else(|| StorageError::not_found("loadable role", permission.role_id))?;

        let row = role
            .permissions
            .iter_mut()
            .find(|p| p.permission_name == permission.permission_name)
            .ok_or_else(|| {
                StorageError::not_found("loadable permission", &permission.permission_name)
            })?;

        *row = permission.clone();
        row.updated_at = chrono::Utc::now();
        Ok(row.clone())
    }

    async fn find_loadable_permissions_by_names(
        &self,
        names: &[String],
    ) -> StorageResult<Vec<LoadablePermission>> {
        Ok(self
            .loadable_roles
            .iter()
            .flat_map(|r| {
                r.permissions
                    .iter()
                    .filter(|p| matches_any(&p.permission_name, names))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    async fn find_loadable_permissions_by_capability(
        &self,
        capability_id: Uuid,
    ) -> StorageResult<Vec<LoadablePermission>> {
        Ok(self
            .loadable_roles
            .iter()
            .flat_map(|r| {
                r.permissions
                    .iter()
                    .filter(|p| p.capability_id == Some(capability_id))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    async fn find_loadable_permissions_by_capability_set(
        &self,
        capability_set_id: Uuid,
    ) -> StorageResult<Vec<LoadablePermission>> {
        Ok(self
            .loadable_roles
            .iter()
            .flat_map(|r| {
                r.permissions
                    .iter()
                    .filter(|p| p.capability_set_id == Some(capability_set_id))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    async fn create_migration_job(&self, job: &MigrationJob) -> StorageResult<MigrationJob> {
        self.maybe_fail("create_migration_job")?;
        let _guard = lock(&self.migration_guard)?;

        if job.is_in_progress() {
            if let Some(running) = self.migration_jobs.iter().find(|j| j.is_in_progress()) {
                return Err(StorageError::MigrationInProgress { job_id: running.id });
            }
        }

        self.migration_jobs.insert(job.id, job.clone());
        Ok(job.clone())
    }

    async fn update_migration_job(&self, job: &MigrationJob) -> StorageResult<MigrationJob> {
        self.maybe_fail("update_migration_job")?;
        let _guard = lock(&self.migration_guard)?;

        let mut entry = self
            .migration_jobs
            .get_mut(&job.id)
            .ok_or_else(|| StorageError::not_found("migration job", job.id))?;
        *entry = job.clone();
        Ok(job.clone())
    }

    async fn find_migration_job(&self, id: Uuid) -> StorageResult<Option<MigrationJob>> {
        Ok(self.migration_jobs.get(&id).map(|j| j.value().clone()))
    }

    async fn list_migration_jobs(
        &self,
        status: Option<MigrationStatus>,
    ) -> StorageResult<Vec<MigrationJob>> {
        let mut jobs: Vec<MigrationJob> = self
            .migration_jobs
            .iter()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .map(|j| j.value().clone())
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(jobs)
    }

    async fn add_migration_error(&self, error: &MigrationError) -> StorageResult<()> {
        self.maybe_fail("add_migration_error")?;
        if !self.migration_jobs.contains_key(&error.job_id) {
            return Err(StorageError::not_found("migration job", error.job_id));
        }
        self.migration_errors
            .entry(error.job_id)
            .or_default()
            .push(error.clone());
        Ok(())
    }

    async fn list_migration_errors(&self, job_id: Uuid) -> StorageResult<Vec<MigrationError>> {
        Ok(self
            .migration_errors
            .get(&job_id)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }
}
