//! Catalog service: applies module registration events to the catalog.
//!
//! # Event handling
//!
//! - **Create**: merge the declared resources and upsert the result
//! - **Update**: as create, then drop endpoints, members and records the
//!   module declared before but no longer declares
//! - **Delete**: remove every record the module declared
//!
//! Upserts are idempotent: applying the same event twice leaves the catalog
//! as applying it once did. An existing capability keeps its permission name;
//! endpoints always union. A placeholder created for a set member is promoted
//! in place once the real capability arrives.
//!
//! An event is applied inside one unit of work, so catalog events reach
//! listeners only after the whole module event has been applied. Every local
//! write registers its undo on that unit of work: an event that fails partway
//! leaves the catalog as it found it, and re-applying it publishes its events.

use std::sync::Arc;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use rsroles_domain::descriptor::{CapabilitySetDescriptor, ModuleEvent, ModuleEventType};
use rsroles_domain::model::{
    union_endpoints, Capability, CapabilitySet, Edge, EdgeTable, Endpoint, Grant,
};
use rsroles_domain::{DescriptorMerger, MergeResult};
use rsroles_storage::CatalogStore;

use super::assignment::AssignmentService;
use crate::authz::AuthorizationServer;
use crate::context::ExecutionContext;
use crate::error::{ServiceError, ServiceResult};
use crate::events::{CatalogChange, CatalogEventBus};

/// Records touched by one module event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogDelta {
    pub capabilities_created: usize,
    pub capabilities_updated: usize,
    pub capabilities_deleted: usize,
    pub sets_created: usize,
    pub sets_updated: usize,
    pub sets_deleted: usize,
}

impl CatalogDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct CatalogService<S, A> {
    store: Arc<S>,
    assignments: AssignmentService<S, A>,
    events: CatalogEventBus,
    merger: DescriptorMerger,
}

impl<S, A> Clone for CatalogService<S, A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            assignments: self.assignments.clone(),
            events: self.events.clone(),
            merger: self.merger,
        }
    }
}

impl<S: CatalogStore, A: AuthorizationServer> CatalogService<S, A> {
    pub fn new(
        store: Arc<S>,
        assignments: AssignmentService<S, A>,
        events: CatalogEventBus,
    ) -> Self {
        Self {
            store,
            assignments,
            events,
            merger: DescriptorMerger::new(),
        }
    }

    /// Applies a module event, joining the caller's unit of work if it has one.
    pub async fn apply(
        &self,
        ctx: &ExecutionContext,
        event: &ModuleEvent,
    ) -> ServiceResult<CatalogDelta> {
        if ctx.active_unit_of_work().is_some() {
            return self.apply_event(ctx, event).await;
        }
        ctx.transaction(|tx| async move { self.apply_event(&tx, event).await })
            .await
    }

    pub async fn get_capability(&self, id: Uuid) -> ServiceResult<Capability> {
        self.store
            .find_capability(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("capability", id))
    }

    pub async fn find_capability_by_name(&self, name: &str) -> ServiceResult<Option<Capability>> {
        Ok(self.store.find_capability_by_name(name).await?)
    }

    pub async fn get_capability_set(&self, id: Uuid) -> ServiceResult<CapabilitySet> {
        self.store
            .find_capability_set(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("capability set", id))
    }

    pub async fn find_capability_set_by_name(
        &self,
        name: &str,
    ) -> ServiceResult<Option<CapabilitySet>> {
        Ok(self.store.find_capability_set_by_name(name).await?)
    }

    /// Capabilities registered by a module.
    pub async fn module_capabilities(
        &self,
        application_id: &str,
        module_id: &str,
    ) -> ServiceResult<Vec<Capability>> {
        Ok(self
            .store
            .list_capabilities_by_module(application_id, module_id)
            .await?)
    }

    #[instrument(skip_all, fields(
        module_id = %event.module_id,
        application_id = %event.application_id,
        event_type = ?event.event_type,
    ))]
    async fn apply_event(
        &self,
        ctx: &ExecutionContext,
        event: &ModuleEvent,
    ) -> ServiceResult<CatalogDelta> {
        let mut delta = CatalogDelta::default();
        match event.event_type {
            ModuleEventType::Create => {
                let merged = self.merger.merge(event);
                self.upsert(ctx, &merged, None, &mut delta).await?;
            }
            ModuleEventType::Update => {
                let merged = self.merger.merge(event);
                let previous = event.previous_resources.as_deref().map(|resources| {
                    self.merger.merge_resources(
                        &event.application_id,
                        &event.module_id,
                        event.module_type,
                        resources,
                    )
                });
                self.upsert(ctx, &merged, previous.as_ref(), &mut delta)
                    .await?;
                self.remove_stale(ctx, event, &merged, previous.as_ref(), &mut delta)
                    .await?;
            }
            ModuleEventType::Delete => {
                let declared = self.merger.merge(event);
                self.remove_module(ctx, event, &declared, &mut delta).await?;
            }
        }

        info!(
            capabilities_created = delta.capabilities_created,
            capabilities_updated = delta.capabilities_updated,
            capabilities_deleted = delta.capabilities_deleted,
            sets_created = delta.sets_created,
            sets_updated = delta.sets_updated,
            sets_deleted = delta.sets_deleted,
            "Module event applied"
        );
        Ok(delta)
    }

    async fn upsert(
        &self,
        ctx: &ExecutionContext,
        merged: &MergeResult,
        previous: Option<&MergeResult>,
        delta: &mut CatalogDelta,
    ) -> ServiceResult<()> {
        for incoming in &merged.capabilities {
            let withdrawn: Vec<Endpoint> = previous
                .and_then(|p| p.capabilities.iter().find(|c| c.name == incoming.name))
                .map(|before| {
                    before
                        .endpoints
                        .iter()
                        .filter(|e| !incoming.endpoints.contains(e))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            self.upsert_capability(ctx, incoming, &withdrawn, delta)
                .await?;
        }

        for descriptor in &merged.capability_sets {
            let withdrawn: Vec<String> = previous
                .and_then(|p| p.capability_sets.iter().find(|s| s.key == descriptor.key))
                .map(|before| {
                    before
                        .members
                        .iter()
                        .filter(|m| !descriptor.members.iter().any(|n| n.key == m.key))
                        .map(|m| m.key.capability_name())
                        .collect()
                })
                .unwrap_or_default();
            self.upsert_capability_set(ctx, descriptor, &withdrawn, delta)
                .await?;
        }
        Ok(())
    }

    async fn upsert_capability(
        &self,
        ctx: &ExecutionContext,
        incoming: &Capability,
        withdrawn: &[Endpoint],
        delta: &mut CatalogDelta,
    ) -> ServiceResult<()> {
        let Some(existing) = self.store.find_capability_by_name(&incoming.name).await? else {
            let created = self.store.create_capability(incoming).await?;
            let id = created.id;
            ctx.undo_local(&self.store, "create capability", move |store| async move {
                store.delete_capability(id).await
            });
            delta.capabilities_created += 1;
            self.events
                .publish(ctx, CatalogChange::CapabilityCreated { new: created });
            return Ok(());
        };

        let mut updated = existing.clone();
        updated.endpoints.retain(|e| !withdrawn.contains(e));
        union_endpoints(&mut updated.endpoints, incoming.endpoints.iter().cloned());
        if existing.dummy {
            debug!(capability = %existing.name, "Promoting placeholder capability");
            updated.dummy = false;
            updated.permission = incoming.permission.clone();
            updated.capability_type = incoming.capability_type;
        }
        updated.application_id = incoming.application_id.clone();
        updated.module_id = incoming.module_id.clone();
        if incoming.description.is_some() {
            updated.description = incoming.description.clone();
        }
        if updated == existing {
            return Ok(());
        }

        let snapshot = if updated.endpoints != existing.endpoints {
            let subjects = self
                .assignments
                .subjects_of(&Grant::Capability(existing.id))
                .await?;
            self.assignments.endpoint_snapshot(subjects).await?
        } else {
            Vec::new()
        };

        let saved = self.store.update_capability(&updated).await?;
        let restore = existing.clone();
        ctx.undo_local(&self.store, "update capability", move |store| async move {
            store.update_capability(&restore).await.map(|_| ())
        });
        self.assignments.sync_snapshot(ctx, &snapshot).await?;
        delta.capabilities_updated += 1;
        self.events.publish(
            ctx,
            CatalogChange::CapabilityUpdated {
                old: existing,
                new: saved,
            },
        );
        Ok(())
    }

    async fn upsert_capability_set(
        &self,
        ctx: &ExecutionContext,
        descriptor: &CapabilitySetDescriptor,
        withdrawn: &[String],
        delta: &mut CatalogDelta,
    ) -> ServiceResult<()> {
        let member_ids = self.resolve_members(ctx, descriptor).await?;
        let mut withdrawn_ids = Vec::new();
        for name in withdrawn {
            if let Some(capability) = self.store.find_capability_by_name(name).await? {
                if !member_ids.contains(&capability.id) {
                    withdrawn_ids.push(capability.id);
                }
            }
        }

        let Some(existing) = self
            .store
            .find_capability_set_by_name(&descriptor.name())
            .await?
        else {
            let mut set = CapabilitySet::new(
                &descriptor.key,
                descriptor.permission.clone(),
                descriptor.capability_type,
                descriptor.application_id.clone(),
            );
            set.description = descriptor.description.clone();
            set.module_id = Some(descriptor.module_id.clone());
            set.visible = descriptor.visible;
            set.add_members(member_ids);

            let created = self.store.create_capability_set(&set).await?;
            let id = created.id;
            ctx.undo_local(&self.store, "create capability set", move |store| async move {
                store.delete_capability_set(id).await
            });
            self.insert_members(ctx, created.id, &created.capabilities).await?;
            delta.sets_created += 1;
            self.events
                .publish(ctx, CatalogChange::CapabilitySetCreated { new: created });
            return Ok(());
        };

        let mut updated = existing.clone();
        updated.capabilities.retain(|id| !withdrawn_ids.contains(id));
        updated.add_members(member_ids);
        updated.application_id = descriptor.application_id.clone();
        updated.module_id = Some(descriptor.module_id.clone());
        updated.visible = descriptor.visible;
        if descriptor.description.is_some() {
            updated.description = descriptor.description.clone();
        }
        if updated == existing {
            return Ok(());
        }

        let added: Vec<Uuid> = updated
            .capabilities
            .iter()
            .filter(|id| !existing.capabilities.contains(id))
            .copied()
            .collect();
        let dropped: Vec<Uuid> = existing
            .capabilities
            .iter()
            .filter(|id| !updated.capabilities.contains(id))
            .copied()
            .collect();

        let snapshot = if added.is_empty() && dropped.is_empty() {
            Vec::new()
        } else {
            let subjects = self
                .assignments
                .subjects_of(&Grant::CapabilitySet(existing.id))
                .await?;
            self.assignments.endpoint_snapshot(subjects).await?
        };

        let saved = self.store.update_capability_set(&updated).await?;
        self.undo_set_update(ctx, &existing);
        self.insert_members(ctx, saved.id, &added).await?;
        self.delete_members(ctx, saved.id, &dropped).await?;
        self.assignments.sync_snapshot(ctx, &snapshot).await?;
        delta.sets_updated += 1;
        self.events.publish(
            ctx,
            CatalogChange::CapabilitySetUpdated {
                old: existing,
                new: saved,
            },
        );
        Ok(())
    }

    /// Member ids of a set, creating placeholders for members not yet in the catalog.
    async fn resolve_members(
        &self,
        ctx: &ExecutionContext,
        descriptor: &CapabilitySetDescriptor,
    ) -> ServiceResult<Vec<Uuid>> {
        let mut ids = Vec::with_capacity(descriptor.members.len());
        for member in &descriptor.members {
            let name = member.key.capability_name();
            let id = match self.store.find_capability_by_name(&name).await? {
                Some(capability) => capability.id,
                None => {
                    debug!(
                        set = %descriptor.permission,
                        capability = %name,
                        "Creating placeholder for capability set member"
                    );
                    let mut placeholder = Capability::placeholder(
                        &member.key,
                        member.permission.clone(),
                        descriptor.application_id.clone(),
                    );
                    placeholder.module_id = Some(descriptor.module_id.clone());
                    let id = self.store.create_capability(&placeholder).await?.id;
                    ctx.undo_local(&self.store, "create placeholder", move |store| async move {
                        store.delete_capability(id).await
                    });
                    id
                }
            };
            ids.push(id);
        }
        Ok(ids)
    }

    async fn insert_members(
        &self,
        ctx: &ExecutionContext,
        set_id: Uuid,
        capability_ids: &[Uuid],
    ) -> ServiceResult<()> {
        if capability_ids.is_empty() {
            return Ok(());
        }
        let edges: Vec<Edge> = capability_ids
            .iter()
            .map(|id| Edge::new(EdgeTable::CapabilitySetMember, set_id, *id))
            .collect();
        self.store.insert_edges(&edges).await?;
        let ids = capability_ids.to_vec();
        ctx.undo_local(&self.store, "insert set members", move |store| async move {
            store
                .delete_edges(EdgeTable::CapabilitySetMember, set_id, &ids)
                .await
                .map(|_| ())
        });
        Ok(())
    }

    async fn delete_members(
        &self,
        ctx: &ExecutionContext,
        set_id: Uuid,
        capability_ids: &[Uuid],
    ) -> ServiceResult<()> {
        if capability_ids.is_empty() {
            return Ok(());
        }
        let edges: Vec<Edge> = self
            .store
            .list_edges_by_subject(EdgeTable::CapabilitySetMember, set_id)
            .await?
            .into_iter()
            .filter(|edge| capability_ids.contains(&edge.object_id))
            .collect();
        self.store
            .delete_edges(EdgeTable::CapabilitySetMember, set_id, capability_ids)
            .await?;
        self.undo_edge_delete(ctx, edges);
        Ok(())
    }

    /// Deletes every edge of `table` pointing at `object_id`, undoably.
    async fn delete_edges_to(
        &self,
        ctx: &ExecutionContext,
        table: EdgeTable,
        object_id: Uuid,
    ) -> ServiceResult<()> {
        let edges = self.store.list_edges_by_object(table, object_id).await?;
        if edges.is_empty() {
            return Ok(());
        }
        self.store.delete_edges_by_object(table, object_id).await?;
        self.undo_edge_delete(ctx, edges);
        Ok(())
    }

    fn undo_edge_delete(&self, ctx: &ExecutionContext, edges: Vec<Edge>) {
        if edges.is_empty() {
            return;
        }
        ctx.undo_local(&self.store, "delete edges", move |store| async move {
            store.insert_edges(&edges).await
        });
    }

    fn undo_set_update(&self, ctx: &ExecutionContext, previous: &CapabilitySet) {
        let restore = previous.clone();
        ctx.undo_local(&self.store, "update capability set", move |store| async move {
            store.update_capability_set(&restore).await.map(|_| ())
        });
    }

    /// Removes what the module declared before the update but no longer declares.
    async fn remove_stale(
        &self,
        ctx: &ExecutionContext,
        event: &ModuleEvent,
        merged: &MergeResult,
        previous: Option<&MergeResult>,
        delta: &mut CatalogDelta,
    ) -> ServiceResult<()> {
        let declared = |name: &str| merged.capabilities.iter().any(|c| c.name == name);
        let declared_set = |name: &str| merged.capability_sets.iter().any(|s| s.name() == name);

        let mut stale_sets: Vec<CapabilitySet> = self
            .store
            .list_capability_sets_by_module(&event.application_id, &event.module_id)
            .await?
            .into_iter()
            .filter(|s| !declared_set(&s.name))
            .collect();
        let mut stale: Vec<Capability> = self
            .store
            .list_capabilities_by_module(&event.application_id, &event.module_id)
            .await?
            .into_iter()
            .filter(|c| !c.dummy && !declared(&c.name))
            .collect();

        if let Some(previous) = previous {
            for descriptor in &previous.capability_sets {
                let name = descriptor.name();
                if declared_set(&name) || stale_sets.iter().any(|s| s.name == name) {
                    continue;
                }
                if let Some(set) = self.store.find_capability_set_by_name(&name).await? {
                    if set.module_id.as_deref() == Some(event.module_id.as_str()) {
                        stale_sets.push(set);
                    }
                }
            }
            for capability in &previous.capabilities {
                if declared(&capability.name) || stale.iter().any(|c| c.name == capability.name) {
                    continue;
                }
                if let Some(found) = self.store.find_capability_by_name(&capability.name).await? {
                    if !found.dummy && found.module_id.as_deref() == Some(event.module_id.as_str()) {
                        stale.push(found);
                    }
                }
            }
        }

        for set in stale_sets {
            self.delete_capability_set(ctx, set, delta).await?;
        }
        for capability in stale {
            self.delete_capability(ctx, capability, delta).await?;
        }
        Ok(())
    }

    async fn remove_module(
        &self,
        ctx: &ExecutionContext,
        event: &ModuleEvent,
        declared: &MergeResult,
        delta: &mut CatalogDelta,
    ) -> ServiceResult<()> {
        let mut sets = self
            .store
            .list_capability_sets_by_module(&event.application_id, &event.module_id)
            .await?;
        for descriptor in &declared.capability_sets {
            let name = descriptor.name();
            if sets.iter().any(|s| s.name == name) {
                continue;
            }
            if let Some(set) = self.store.find_capability_set_by_name(&name).await? {
                sets.push(set);
            }
        }

        let mut capabilities = self
            .store
            .list_capabilities_by_module(&event.application_id, &event.module_id)
            .await?;
        for capability in &declared.capabilities {
            if capabilities.iter().any(|c| c.name == capability.name) {
                continue;
            }
            if let Some(found) = self.store.find_capability_by_name(&capability.name).await? {
                capabilities.push(found);
            }
        }

        for set in sets {
            self.delete_capability_set(ctx, set, delta).await?;
        }
        for capability in capabilities {
            self.delete_capability(ctx, capability, delta).await?;
        }
        Ok(())
    }

    /// Deletes a capability with its assignments, memberships and loadable links.
    async fn delete_capability(
        &self,
        ctx: &ExecutionContext,
        capability: Capability,
        delta: &mut CatalogDelta,
    ) -> ServiceResult<()> {
        let id = capability.id;
        let subjects = self.assignments.subjects_of(&Grant::Capability(id)).await?;
        let snapshot = self.assignments.endpoint_snapshot(subjects).await?;

        self.delete_edges_to(ctx, EdgeTable::RoleCapability, id).await?;
        self.delete_edges_to(ctx, EdgeTable::UserCapability, id).await?;
        for membership in self
            .store
            .list_edges_by_object(EdgeTable::CapabilitySetMember, id)
            .await?
        {
            if let Some(set) = self.store.find_capability_set(membership.subject_id).await? {
                let mut updated = set.clone();
                updated.capabilities.retain(|member| *member != id);
                let saved = self.store.update_capability_set(&updated).await?;
                self.undo_set_update(ctx, &set);
                self.events.publish(
                    ctx,
                    CatalogChange::CapabilitySetUpdated {
                        old: set,
                        new: saved,
                    },
                );
            }
        }
        self.delete_edges_to(ctx, EdgeTable::CapabilitySetMember, id)
            .await?;
        for permission in self
            .store
            .find_loadable_permissions_by_capability(id)
            .await?
        {
            let mut unlinked = permission.clone();
            unlinked.capability_id = None;
            self.store.update_loadable_permission(&unlinked).await?;
            ctx.undo_local(&self.store, "unlink loadable permission", move |store| async move {
                store.update_loadable_permission(&permission).await.map(|_| ())
            });
        }
        self.store.delete_capability(id).await?;
        let restore = capability.clone();
        ctx.undo_local(&self.store, "delete capability", move |store| async move {
            store.create_capability(&restore).await.map(|_| ())
        });

        self.assignments.sync_snapshot(ctx, &snapshot).await?;
        delta.capabilities_deleted += 1;
        self.events
            .publish(ctx, CatalogChange::CapabilityDeleted { old: capability });
        Ok(())
    }

    async fn delete_capability_set(
        &self,
        ctx: &ExecutionContext,
        set: CapabilitySet,
        delta: &mut CatalogDelta,
    ) -> ServiceResult<()> {
        let id = set.id;
        let subjects = self
            .assignments
            .subjects_of(&Grant::CapabilitySet(id))
            .await?;
        let snapshot = self.assignments.endpoint_snapshot(subjects).await?;

        self.delete_edges_to(ctx, EdgeTable::RoleCapabilitySet, id).await?;
        self.delete_edges_to(ctx, EdgeTable::UserCapabilitySet, id).await?;
        self.delete_members(ctx, id, &set.capabilities).await?;
        for permission in self
            .store
            .find_loadable_permissions_by_capability_set(id)
            .await?
        {
            let mut unlinked = permission.clone();
            unlinked.capability_set_id = None;
            self.store.update_loadable_permission(&unlinked).await?;
            ctx.undo_local(&self.store, "unlink loadable permission", move |store| async move {
                store.update_loadable_permission(&permission).await.map(|_| ())
            });
        }
        self.store.delete_capability_set(id).await?;
        let restore = set.clone();
        ctx.undo_local(&self.store, "delete capability set", move |store| async move {
            store.create_capability_set(&restore).await.map(|_| ())
        });

        self.assignments.sync_snapshot(ctx, &snapshot).await?;
        delta.sets_deleted += 1;
        self.events
            .publish(ctx, CatalogChange::CapabilitySetDeleted { old: set });
        Ok(())
    }
}
