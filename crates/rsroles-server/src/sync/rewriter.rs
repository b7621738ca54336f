//! Duplicate rewriter.
//!
//! Collapses two catalog records that describe the same artifact. Every edge
//! pointing at the old record is moved to the new one (or dropped when the
//! subject already holds the new one), loadable-permission links follow, and
//! the old record is deleted. A re-run finds nothing left to move.
//!
//! The local rewrite runs under a lock keyed by `(kind, old, new)` and in its
//! own unit of work: every store write registers its undo, so a failure
//! partway restores the records and edges as they were. Remote permission
//! sync for the affected subjects happens after the lock is released.

use std::fmt;
use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use rsroles_domain::model::{Capability, Edge, EdgeTable, Endpoint, LoadablePermission, Subject};
use rsroles_storage::{CatalogStore, StorageError};

use super::batch::aggregate;
use super::lock::KeyedLocks;
use super::permissions::{subject_endpoints, EndpointPermissionSync};
use crate::authz::AuthorizationServer;
use crate::context::ExecutionContext;
use crate::error::{ServiceError, ServiceResult};
use crate::events::{CatalogChange, CatalogEventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Capability,
    CapabilitySet,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Capability => f.write_str("capability"),
            ArtifactKind::CapabilitySet => f.write_str("capability set"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteOutcome {
    /// Edges moved to the new record and the old record deleted.
    Completed {
        rewritten: usize,
        duplicates_removed: usize,
    },
    /// The old record no longer exists.
    AlreadyMigrated,
    /// The new record does not exist; nothing was touched.
    SkippedMissingTarget,
}

#[derive(Debug, Default, Clone, Copy)]
struct EdgeCounts {
    rewritten: usize,
    duplicates_removed: usize,
}

/// Local part of a completed rewrite, handed to the remote phase.
struct LocalRewrite {
    counts: EdgeCounts,
    /// Affected subjects with their endpoints before the rewrite.
    subjects: Vec<(Subject, Vec<Endpoint>)>,
    deleted: CatalogChange,
}

enum LocalOutcome {
    Rewritten(LocalRewrite),
    Skipped(RewriteOutcome),
}

pub struct DuplicateRewriter<S, A> {
    store: Arc<S>,
    permissions: EndpointPermissionSync<A>,
    events: CatalogEventBus,
    locks: KeyedLocks<(ArtifactKind, String, String)>,
}

impl<S, A> Clone for DuplicateRewriter<S, A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            permissions: self.permissions.clone(),
            events: self.events.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<S: CatalogStore, A: AuthorizationServer> DuplicateRewriter<S, A> {
    pub fn new(
        store: Arc<S>,
        permissions: EndpointPermissionSync<A>,
        events: CatalogEventBus,
    ) -> Self {
        Self {
            store,
            permissions,
            events,
            locks: KeyedLocks::new(),
        }
    }

    /// Moves every reference from `old_name` to `new_name` and deletes the old record.
    ///
    /// Names are matched exactly. Publishes a deleted event carrying the old
    /// record once the local rewrite is done, even if the remote sync of the
    /// affected subjects then fails.
    #[instrument(skip(self, ctx, kind), fields(kind = %kind))]
    pub async fn rewrite(
        &self,
        ctx: &ExecutionContext,
        kind: ArtifactKind,
        old_name: &str,
        new_name: &str,
    ) -> ServiceResult<RewriteOutcome> {
        if old_name == new_name {
            return Err(ServiceError::validation(format!(
                "cannot rewrite {kind} '{old_name}' onto itself"
            )));
        }

        let local = {
            let _guard = self
                .locks
                .lock((kind, old_name.to_string(), new_name.to_string()))
                .await;
            ctx.transaction(|tx| async move {
                match kind {
                    ArtifactKind::Capability => {
                        self.rewrite_capability(&tx, old_name, new_name).await
                    }
                    ArtifactKind::CapabilitySet => {
                        self.rewrite_capability_set(&tx, old_name, new_name).await
                    }
                }
            })
            .await?
        };

        let rewrite = match local {
            LocalOutcome::Rewritten(rewrite) => rewrite,
            LocalOutcome::Skipped(outcome) => return Ok(outcome),
        };

        let synced = self.sync_subjects(ctx, &rewrite.subjects).await;
        self.events.publish(ctx, rewrite.deleted);
        synced?;

        info!(
            old = old_name,
            new = new_name,
            rewritten = rewrite.counts.rewritten,
            duplicates_removed = rewrite.counts.duplicates_removed,
            "Duplicate {kind} collapsed"
        );
        Ok(RewriteOutcome::Completed {
            rewritten: rewrite.counts.rewritten,
            duplicates_removed: rewrite.counts.duplicates_removed,
        })
    }

    async fn rewrite_capability(
        &self,
        ctx: &ExecutionContext,
        old_name: &str,
        new_name: &str,
    ) -> ServiceResult<LocalOutcome> {
        let Some(old) = self.store.find_capability_by_name(old_name).await? else {
            return Ok(LocalOutcome::Skipped(RewriteOutcome::AlreadyMigrated));
        };
        let Some(new) = self.store.find_capability_by_name(new_name).await? else {
            warn!(old = old_name, new = new_name, "Target capability missing, skipping rewrite");
            return Ok(LocalOutcome::Skipped(RewriteOutcome::SkippedMissingTarget));
        };

        let subjects = self.capability_subjects(&old).await?;
        let subjects = self.snapshot_endpoints(subjects).await?;

        let mut counts = EdgeCounts::default();
        for table in [EdgeTable::RoleCapability, EdgeTable::UserCapability] {
            self.move_edges(ctx, table, old.id, new.id, &mut counts).await?;
        }
        self.move_set_memberships(ctx, old.id, new.id, &mut counts)
            .await?;

        for permission in self
            .store
            .find_loadable_permissions_by_capability(old.id)
            .await?
        {
            let mut relinked = permission.clone();
            relinked.capability_id = Some(new.id);
            self.relink(ctx, &relinked, permission).await?;
        }

        self.store.delete_capability(old.id).await?;
        let restore = old.clone();
        ctx.undo_local(&self.store, "delete capability", move |store| async move {
            store.create_capability(&restore).await.map(|_| ())
        });
        Ok(LocalOutcome::Rewritten(LocalRewrite {
            counts,
            subjects,
            deleted: CatalogChange::CapabilityDeleted { old },
        }))
    }

    async fn rewrite_capability_set(
        &self,
        ctx: &ExecutionContext,
        old_name: &str,
        new_name: &str,
    ) -> ServiceResult<LocalOutcome> {
        let Some(old) = self.store.find_capability_set_by_name(old_name).await? else {
            return Ok(LocalOutcome::Skipped(RewriteOutcome::AlreadyMigrated));
        };
        let Some(new) = self.store.find_capability_set_by_name(new_name).await? else {
            warn!(old = old_name, new = new_name, "Target capability set missing, skipping rewrite");
            return Ok(LocalOutcome::Skipped(RewriteOutcome::SkippedMissingTarget));
        };

        let subjects = self.set_subjects(old.id).await?;
        let subjects = self.snapshot_endpoints(subjects).await?;

        let mut counts = EdgeCounts::default();
        for table in EdgeTable::CAPABILITY_SET_TABLES {
            self.move_edges(ctx, table, old.id, new.id, &mut counts).await?;
        }

        for permission in self
            .store
            .find_loadable_permissions_by_capability_set(old.id)
            .await?
        {
            let mut relinked = permission.clone();
            relinked.capability_set_id = Some(new.id);
            self.relink(ctx, &relinked, permission).await?;
        }

        let members = self
            .store
            .list_edges_by_subject(EdgeTable::CapabilitySetMember, old.id)
            .await?;
        self.store
            .delete_edges(EdgeTable::CapabilitySetMember, old.id, &old.capabilities)
            .await?;
        ctx.undo_local(&self.store, "delete set members", move |store| async move {
            store.insert_edges(&members).await
        });
        self.store.delete_capability_set(old.id).await?;
        let restore = old.clone();
        ctx.undo_local(&self.store, "delete capability set", move |store| async move {
            store.create_capability_set(&restore).await.map(|_| ())
        });
        Ok(LocalOutcome::Rewritten(LocalRewrite {
            counts,
            subjects,
            deleted: CatalogChange::CapabilitySetDeleted { old },
        }))
    }

    /// Points every `(subject, old)` edge of `table` at `new`, or drops it
    /// when `(subject, new)` already exists.
    async fn move_edges(
        &self,
        ctx: &ExecutionContext,
        table: EdgeTable,
        old_id: Uuid,
        new_id: Uuid,
        counts: &mut EdgeCounts,
    ) -> ServiceResult<()> {
        for edge in self.store.list_edges_by_object(table, old_id).await? {
            if self.store.edge_exists(table, edge.subject_id, new_id).await? {
                self.drop_edge(ctx, edge).await?;
                counts.duplicates_removed += 1;
                continue;
            }

            let subject_id = edge.subject_id;
            match self
                .store
                .rewrite_edge(table, subject_id, old_id, new_id)
                .await
            {
                Ok(()) => {
                    ctx.undo_local(&self.store, "rewrite edge", move |store| async move {
                        store.rewrite_edge(table, subject_id, new_id, old_id).await
                    });
                    counts.rewritten += 1;
                }
                Err(StorageError::DuplicateEdge { .. }) => {
                    self.drop_edge(ctx, edge).await?;
                    counts.duplicates_removed += 1;
                }
                Err(StorageError::EdgeNotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn drop_edge(&self, ctx: &ExecutionContext, edge: Edge) -> ServiceResult<()> {
        self.store
            .delete_edges(edge.table, edge.subject_id, &[edge.object_id])
            .await?;
        ctx.undo_local(&self.store, "drop duplicate edge", move |store| async move {
            store.insert_edges(&[edge]).await
        });
        Ok(())
    }

    async fn relink(
        &self,
        ctx: &ExecutionContext,
        relinked: &LoadablePermission,
        previous: LoadablePermission,
    ) -> ServiceResult<()> {
        self.store.update_loadable_permission(relinked).await?;
        ctx.undo_local(&self.store, "relink loadable permission", move |store| async move {
            store.update_loadable_permission(&previous).await.map(|_| ())
        });
        Ok(())
    }

    /// Replaces `old_id` by `new_id` in the member lists of sets containing it.
    async fn move_set_memberships(
        &self,
        ctx: &ExecutionContext,
        old_id: Uuid,
        new_id: Uuid,
        counts: &mut EdgeCounts,
    ) -> ServiceResult<()> {
        let set_ids: Vec<Uuid> = self
            .store
            .list_edges_by_object(EdgeTable::CapabilitySetMember, old_id)
            .await?
            .into_iter()
            .map(|edge| edge.subject_id)
            .collect();

        self.move_edges(ctx, EdgeTable::CapabilitySetMember, old_id, new_id, counts)
            .await?;

        for previous in self.store.find_capability_sets(&set_ids).await? {
            let mut set = previous.clone();
            let members = std::mem::take(&mut set.capabilities);
            let replaced = members
                .into_iter()
                .map(|id| if id == old_id { new_id } else { id });
            set.add_members(replaced);
            self.store.update_capability_set(&set).await?;
            ctx.undo_local(&self.store, "update capability set", move |store| async move {
                store.update_capability_set(&previous).await.map(|_| ())
            });
        }
        Ok(())
    }

    /// Subjects holding `old` directly or through one of its sets.
    async fn capability_subjects(&self, old: &Capability) -> ServiceResult<Vec<Subject>> {
        let mut subjects = Vec::new();
        for edge in self
            .store
            .list_edges_by_object(EdgeTable::RoleCapability, old.id)
            .await?
        {
            push_unique(&mut subjects, Subject::Role(edge.subject_id));
        }
        for edge in self
            .store
            .list_edges_by_object(EdgeTable::UserCapability, old.id)
            .await?
        {
            push_unique(&mut subjects, Subject::User(edge.subject_id));
        }
        for membership in self
            .store
            .list_edges_by_object(EdgeTable::CapabilitySetMember, old.id)
            .await?
        {
            for subject in self.set_subjects(membership.subject_id).await? {
                push_unique(&mut subjects, subject);
            }
        }
        Ok(subjects)
    }

    async fn set_subjects(&self, set_id: Uuid) -> ServiceResult<Vec<Subject>> {
        let roles = self
            .store
            .list_edges_by_object(EdgeTable::RoleCapabilitySet, set_id)
            .await?;
        let users = self
            .store
            .list_edges_by_object(EdgeTable::UserCapabilitySet, set_id)
            .await?;
        let mut subjects = Vec::new();
        for Edge { subject_id, .. } in roles {
            push_unique(&mut subjects, Subject::Role(subject_id));
        }
        for Edge { subject_id, .. } in users {
            push_unique(&mut subjects, Subject::User(subject_id));
        }
        Ok(subjects)
    }

    async fn snapshot_endpoints(
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

    async fn sync_subjects(
        &self,
        ctx: &ExecutionContext,
        subjects: &[(Subject, Vec<Endpoint>)],
    ) -> ServiceResult<()> {
        let mut results = Vec::with_capacity(subjects.len());
        for (subject, before) in subjects {
            let result = match subject_endpoints(self.store.as_ref(), subject).await {
                Ok(after) => self.permissions.sync(ctx, subject, before, &after).await,
                Err(err) => Err(err),
            };
            results.push(result);
        }
        aggregate(results).map(|_| ())
    }
}

fn push_unique(subjects: &mut Vec<Subject>, subject: Subject) {
    if !subjects.contains(&subject) {
        subjects.push(subject);
    }
}

#[cfg(test)]
mod tests;
