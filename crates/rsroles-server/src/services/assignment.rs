//! Assignment service: the subject side of the assignment graph.
//!
//! Granting capabilities or capability sets to a role or user creates scope
//! permissions for every endpoint the subject newly reaches, then records
//! the edges. Revoking removes the edges, then deletes the permissions for
//! endpoints the subject no longer reaches through any other grant.

use std::sync::Arc;

use tracing::{debug, error, instrument};
use uuid::Uuid;

use rsroles_domain::model::{union_endpoints, Edge, EdgeTable, Endpoint, Grant, Role, Subject};
use rsroles_storage::CatalogStore;

use super::policy::PolicyService;
use super::ignore_not_found;
use crate::authz::AuthorizationServer;
use crate::context::ExecutionContext;
use crate::error::{ServiceError, ServiceResult};
use crate::sync::{
    aggregate, endpoint_diff, subject_endpoints, DualWriteCoordinator, EndpointPermissionSync,
};

pub struct AssignmentService<S, A> {
    store: Arc<S>,
    authz: Arc<A>,
    coordinator: DualWriteCoordinator,
    policies: PolicyService<S, A>,
    permissions: EndpointPermissionSync<A>,
}

impl<S, A> Clone for AssignmentService<S, A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            authz: Arc::clone(&self.authz),
            coordinator: self.coordinator,
            policies: self.policies.clone(),
            permissions: self.permissions.clone(),
        }
    }
}

impl<S: CatalogStore, A: AuthorizationServer> AssignmentService<S, A> {
    pub fn new(
        store: Arc<S>,
        authz: Arc<A>,
        coordinator: DualWriteCoordinator,
        policies: PolicyService<S, A>,
        permissions: EndpointPermissionSync<A>,
    ) -> Self {
        Self {
            store,
            authz,
            coordinator,
            policies,
            permissions,
        }
    }

    /// Grants capabilities or capability sets to `subject`.
    ///
    /// Fails with `NotFound` if the subject or a grant is absent and with
    /// `Conflict` if any grant is already assigned; nothing is written then.
    /// If only some permissions could be created, the created ones are
    /// deleted again before the failure is returned.
    #[instrument(skip(self, ctx, grants), fields(subject = %subject, grants = grants.len()))]
    pub async fn assign(
        &self,
        ctx: &ExecutionContext,
        subject: Subject,
        grants: &[Grant],
    ) -> ServiceResult<()> {
        let grants = dedup(grants);
        if grants.is_empty() {
            return Err(ServiceError::validation("no capabilities to assign"));
        }
        self.require_subject(&subject).await?;

        let mut already_assigned = Vec::new();
        for grant in &grants {
            self.require_grant(grant).await?;
            let table = EdgeTable::for_assignment(&subject, grant);
            if self.store.edge_exists(table, subject.id(), grant.id()).await? {
                already_assigned.push(grant.id().to_string());
            }
        }
        if !already_assigned.is_empty() {
            return Err(ServiceError::conflict(format!(
                "already assigned to {subject}: {}",
                already_assigned.join(", ")
            )));
        }

        self.policies.ensure_subject_policy(ctx, &subject).await?;

        let before = subject_endpoints(self.store.as_ref(), &subject).await?;
        let mut after = before.clone();
        union_endpoints(&mut after, self.grant_endpoints(&grants).await?);
        let (added, _) = endpoint_diff(&before, &after);

        let edges: Vec<Edge> = grants
            .iter()
            .map(|grant| Edge::assignment(subject, *grant))
            .collect();
        let permissions = self.permissions.clone();
        let detached = ctx.detached();
        let compensate = added.clone();

        self.coordinator
            .execute_with_compensation(
                ctx,
                "assign capabilities",
                || async {
                    match self.permissions.create(ctx, &subject, &added).await {
                        Ok(()) => Ok(()),
                        Err(err) => Err(self.discard_partial(ctx, &subject, &added, err).await),
                    }
                },
                |()| async { Ok(self.store.insert_edges(&edges).await?) },
                move || async move { permissions.delete(&detached, &subject, &compensate).await },
            )
            .await
    }

    /// Revokes grants from `subject`.
    ///
    /// Permissions are deleted only for endpoints the subject no longer
    /// reaches. If that fails, the removed edges are restored.
    #[instrument(skip(self, ctx, grants), fields(subject = %subject, grants = grants.len()))]
    pub async fn revoke(
        &self,
        ctx: &ExecutionContext,
        subject: Subject,
        grants: &[Grant],
    ) -> ServiceResult<()> {
        let grants = dedup(grants);
        for grant in &grants {
            let table = EdgeTable::for_assignment(&subject, grant);
            if !self.store.edge_exists(table, subject.id(), grant.id()).await? {
                return Err(ServiceError::not_found(
                    "assignment",
                    format!("{subject} -> {}", grant.id()),
                ));
            }
        }

        let before = subject_endpoints(self.store.as_ref(), &subject).await?;
        let edges: Vec<Edge> = grants
            .iter()
            .map(|grant| Edge::assignment(subject, *grant))
            .collect();
        let store = Arc::clone(&self.store);
        let snapshot = edges.clone();

        self.coordinator
            .execute_delete_with_restore(
                ctx,
                "revoke capabilities",
                || async {
                    for edge in &edges {
                        self.store
                            .delete_edges(edge.table, edge.subject_id, &[edge.object_id])
                            .await?;
                    }
                    Ok(())
                },
                || async {
                    let after = subject_endpoints(self.store.as_ref(), &subject).await?;
                    let (_, removed) = endpoint_diff(&before, &after);
                    self.permissions.delete(ctx, &subject, &removed).await
                },
                move || async move {
                    store.insert_edges(&snapshot).await?;
                    Ok(())
                },
            )
            .await
    }

    /// Assigns a role to a user on both sides.
    #[instrument(skip(self, ctx))]
    pub async fn assign_user_role(
        &self,
        ctx: &ExecutionContext,
        user_id: Uuid,
        role_id: Uuid,
    ) -> ServiceResult<()> {
        let role = self.role(role_id).await?;
        if self
            .store
            .edge_exists(EdgeTable::UserRole, user_id, role_id)
            .await?
        {
            return Err(ServiceError::conflict(format!(
                "user {user_id} already has role '{}'",
                role.name
            )));
        }

        let authz = Arc::clone(&self.authz);
        let detached = ctx.detached();
        let role_name = role.name.clone();

        self.coordinator
            .execute_with_compensation(
                ctx,
                "assign user role",
                || async { Ok(self.authz.assign_role(ctx, user_id, &role.name).await?) },
                |()| async {
                    let edge = Edge::new(EdgeTable::UserRole, user_id, role_id);
                    Ok(self.store.insert_edges(&[edge]).await?)
                },
                move || async move { Ok(authz.unassign_role(&detached, user_id, &role_name).await?) },
            )
            .await
    }

    #[instrument(skip(self, ctx))]
    pub async fn revoke_user_role(
        &self,
        ctx: &ExecutionContext,
        user_id: Uuid,
        role_id: Uuid,
    ) -> ServiceResult<()> {
        let role = self.role(role_id).await?;
        if !self
            .store
            .edge_exists(EdgeTable::UserRole, user_id, role_id)
            .await?
        {
            return Err(ServiceError::not_found(
                "user role",
                format!("{user_id} -> {role_id}"),
            ));
        }

        let store = Arc::clone(&self.store);

        self.coordinator
            .execute_delete_with_restore(
                ctx,
                "revoke user role",
                || async {
                    self.store
                        .delete_edges(EdgeTable::UserRole, user_id, &[role_id])
                        .await?;
                    Ok(())
                },
                || async { ignore_not_found(self.authz.unassign_role(ctx, user_id, &role.name).await) },
                move || async move {
                    let edge = Edge::new(EdgeTable::UserRole, user_id, role_id);
                    store.insert_edges(&[edge]).await?;
                    Ok(())
                },
            )
            .await
    }

    /// Roles assigned to a user.
    pub async fn user_roles(&self, user_id: Uuid) -> ServiceResult<Vec<Role>> {
        let mut roles = Vec::new();
        for edge in self
            .store
            .list_edges_by_subject(EdgeTable::UserRole, user_id)
            .await?
        {
            if let Some(role) = self.store.find_role(edge.object_id).await? {
                roles.push(role);
            }
        }
        Ok(roles)
    }

    /// Capabilities and capability sets assigned directly to `subject`.
    pub async fn grants(&self, subject: &Subject) -> ServiceResult<Vec<Grant>> {
        let (capability_table, set_table) = match subject {
            Subject::Role(_) => (EdgeTable::RoleCapability, EdgeTable::RoleCapabilitySet),
            Subject::User(_) => (EdgeTable::UserCapability, EdgeTable::UserCapabilitySet),
        };
        let mut grants: Vec<Grant> = self
            .store
            .list_edges_by_subject(capability_table, subject.id())
            .await?
            .into_iter()
            .map(|edge| Grant::Capability(edge.object_id))
            .collect();
        grants.extend(
            self.store
                .list_edges_by_subject(set_table, subject.id())
                .await?
                .into_iter()
                .map(|edge| Grant::CapabilitySet(edge.object_id)),
        );
        Ok(grants)
    }

    pub async fn subject_endpoints(&self, subject: &Subject) -> ServiceResult<Vec<Endpoint>> {
        subject_endpoints(self.store.as_ref(), subject).await
    }

    /// Subjects reaching `grant`, directly or, for a capability, through a set.
    pub async fn subjects_of(&self, grant: &Grant) -> ServiceResult<Vec<Subject>> {
        let mut subjects = Vec::new();
        match grant {
            Grant::Capability(id) => {
                self.collect_subjects(
                    EdgeTable::RoleCapability,
                    EdgeTable::UserCapability,
                    *id,
                    &mut subjects,
                )
                .await?;
                for membership in self
                    .store
                    .list_edges_by_object(EdgeTable::CapabilitySetMember, *id)
                    .await?
                {
                    self.collect_subjects(
                        EdgeTable::RoleCapabilitySet,
                        EdgeTable::UserCapabilitySet,
                        membership.subject_id,
                        &mut subjects,
                    )
                    .await?;
                }
            }
            Grant::CapabilitySet(id) => {
                self.collect_subjects(
                    EdgeTable::RoleCapabilitySet,
                    EdgeTable::UserCapabilitySet,
                    *id,
                    &mut subjects,
                )
                .await?;
            }
        }
        Ok(subjects)
    }

    /// Current endpoints of each subject, to diff against after a catalog change.
    pub async fn endpoint_snapshot(
        &self,
        subjects: Vec<Subject>,
    ) -> ServiceResult<Vec<(Subject, Vec<Endpoint>)>> {
        let mut snapshot = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let endpoints = subject_endpoints(self.store.as_ref(), &subject).await?;
            snapshot.push((subject, endpoints));
        }
        Ok(snapshot)
    }

    /// Syncs the permissions of every subject in `snapshot` to its current endpoints.
    ///
    /// Every subject is attempted; failures are aggregated. Inside a unit of
    /// work, a rollback syncs each subject back to its snapshot.
    pub async fn sync_snapshot(
        &self,
        ctx: &ExecutionContext,
        snapshot: &[(Subject, Vec<Endpoint>)],
    ) -> ServiceResult<()> {
        let mut results = Vec::with_capacity(snapshot.len());
        for (subject, before) in snapshot {
            let result = match subject_endpoints(self.store.as_ref(), subject).await {
                Ok(after) => {
                    self.restore_on_rollback(ctx, *subject, &after, before);
                    self.permissions.sync(ctx, subject, before, &after).await
                }
                Err(err) => Err(err),
            };
            results.push(result);
        }
        aggregate(results)?;
        debug!(subjects = snapshot.len(), "Subject permissions synced");
        Ok(())
    }

    fn restore_on_rollback(
        &self,
        ctx: &ExecutionContext,
        subject: Subject,
        after: &[Endpoint],
        before: &[Endpoint],
    ) {
        let Some(uow) = ctx.active_unit_of_work() else {
            return;
        };
        if after == before {
            return;
        }
        let permissions = self.permissions.clone();
        let detached = ctx.detached();
        let (after, before) = (after.to_vec(), before.to_vec());
        uow.on_rollback(format!("restore permissions of {subject}"), move || async move {
            permissions.sync(&detached, &subject, &after, &before).await
        });
    }

    /// Deletes whatever a failed create left behind; `cause` stays the primary error.
    async fn discard_partial(
        &self,
        ctx: &ExecutionContext,
        subject: &Subject,
        endpoints: &[Endpoint],
        cause: ServiceError,
    ) -> ServiceError {
        match self.permissions.delete(&ctx.detached(), subject, endpoints).await {
            Ok(()) => cause,
            Err(cleanup) => {
                error!(
                    subject = %subject,
                    error = %cause,
                    cleanup_error = %cleanup,
                    "Partially created permissions could not be deleted"
                );
                ServiceError::inconsistency(cause, vec![cleanup])
            }
        }
    }

    async fn collect_subjects(
        &self,
        role_table: EdgeTable,
        user_table: EdgeTable,
        object_id: Uuid,
        subjects: &mut Vec<Subject>,
    ) -> ServiceResult<()> {
        let roles = self.store.list_edges_by_object(role_table, object_id).await?;
        let users = self.store.list_edges_by_object(user_table, object_id).await?;
        let found = roles
            .into_iter()
            .map(|edge| Subject::Role(edge.subject_id))
            .chain(users.into_iter().map(|edge| Subject::User(edge.subject_id)));
        for subject in found {
            if !subjects.contains(&subject) {
                subjects.push(subject);
            }
        }
        Ok(())
    }

    async fn grant_endpoints(&self, grants: &[Grant]) -> ServiceResult<Vec<Endpoint>> {
        let mut capability_ids = Vec::new();
        let mut set_ids = Vec::new();
        for grant in grants {
            match grant {
                Grant::Capability(id) => capability_ids.push(*id),
                Grant::CapabilitySet(id) => set_ids.push(*id),
            }
        }
        for set in self.store.find_capability_sets(&set_ids).await? {
            for id in set.capabilities {
                if !capability_ids.contains(&id) {
                    capability_ids.push(id);
                }
            }
        }

        let mut endpoints = Vec::new();
        for capability in self.store.find_capabilities(&capability_ids).await? {
            union_endpoints(&mut endpoints, capability.endpoints);
        }
        Ok(endpoints)
    }

    async fn require_subject(&self, subject: &Subject) -> ServiceResult<()> {
        // Users live in an external directory; only roles are checked.
        if let Subject::Role(id) = subject {
            self.role(*id).await?;
        }
        Ok(())
    }

    async fn require_grant(&self, grant: &Grant) -> ServiceResult<()> {
        match grant {
            Grant::Capability(id) => {
                if self.store.find_capability(*id).await?.is_none() {
                    return Err(ServiceError::not_found("capability", id));
                }
            }
            Grant::CapabilitySet(id) => {
                if self.store.find_capability_set(*id).await?.is_none() {
                    return Err(ServiceError::not_found("capability set", id));
                }
            }
        }
        Ok(())
    }

    async fn role(&self, id: Uuid) -> ServiceResult<Role> {
        self.store
            .find_role(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("role", id))
    }
}

fn dedup(grants: &[Grant]) -> Vec<Grant> {
    let mut unique = Vec::with_capacity(grants.len());
    for grant in grants {
        if !unique.contains(grant) {
            unique.push(*grant);
        }
    }
    unique
}
