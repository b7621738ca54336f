//! Catalog-changed events.
//!
//! Events are delivered over a tokio broadcast channel. A publish made inside
//! an active unit of work is deferred to its commit, so listeners never
//! observe a change that may still roll back.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use rsroles_domain::model::{Capability, CapabilitySet};

use crate::context::ExecutionContext;

#[derive(Debug, Clone, PartialEq)]
pub enum CatalogChange {
    CapabilityCreated { new: Capability },
    CapabilityUpdated { old: Capability, new: Capability },
    CapabilityDeleted { old: Capability },
    CapabilitySetCreated { new: CapabilitySet },
    CapabilitySetUpdated { old: CapabilitySet, new: CapabilitySet },
    CapabilitySetDeleted { old: CapabilitySet },
    /// Permissions granted through a role changed (role deleted or reassigned).
    RolePermissionsChanged { role_id: Uuid },
}

impl CatalogChange {
    pub fn name(&self) -> &'static str {
        match self {
            CatalogChange::CapabilityCreated { .. } => "CapabilityCreated",
            CatalogChange::CapabilityUpdated { .. } => "CapabilityUpdated",
            CatalogChange::CapabilityDeleted { .. } => "CapabilityDeleted",
            CatalogChange::CapabilitySetCreated { .. } => "CapabilitySetCreated",
            CatalogChange::CapabilitySetUpdated { .. } => "CapabilitySetUpdated",
            CatalogChange::CapabilitySetDeleted { .. } => "CapabilitySetDeleted",
            CatalogChange::RolePermissionsChanged { .. } => "RolePermissionsChanged",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogEvent {
    pub change: CatalogChange,
    /// Originating context, detached from its unit of work.
    pub context: ExecutionContext,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CatalogEventBus {
    sender: broadcast::Sender<CatalogEvent>,
}

impl CatalogEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.sender.subscribe()
    }

    /// Publishes `change`, after commit if `ctx` carries an active unit of work.
    pub fn publish(&self, ctx: &ExecutionContext, change: CatalogChange) {
        let event = CatalogEvent {
            change,
            context: ctx.detached(),
            occurred_at: Utc::now(),
        };

        match ctx.active_unit_of_work() {
            Some(uow) => {
                let sender = self.sender.clone();
                debug!(event = event.change.name(), unit_of_work = %uow.id(), "Deferring catalog event to commit");
                uow.after_commit(move || send(&sender, event));
            }
            None => send(&self.sender, event),
        }
    }
}

impl Default for CatalogEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

fn send(sender: &broadcast::Sender<CatalogEvent>, event: CatalogEvent) {
    let name = event.change.name();
    if sender.send(event).is_err() {
        trace!(event = name, "No catalog event listeners");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::UnitOfWork;
    use rsroles_domain::model::{CapabilityAction, CapabilityKey, CapabilityType};
    use std::sync::Arc;

    fn capability() -> Capability {
        Capability::new(
            &CapabilityKey::new("Foo", CapabilityAction::View),
            "foo.get",
            CapabilityType::Data,
            "app-foo-1.0.0",
        )
    }

    #[tokio::test]
    async fn test_publish_without_transaction_is_immediate() {
        let bus = CatalogEventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(
            &ExecutionContext::new("diku"),
            CatalogChange::CapabilityCreated { new: capability() },
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(event.change.name(), "CapabilityCreated");
        assert_eq!(event.context.tenant, "diku");
    }

    #[tokio::test]
    async fn test_publish_in_transaction_waits_for_commit() {
        let bus = CatalogEventBus::new(8);
        let mut rx = bus.subscribe();
        let uow = Arc::new(UnitOfWork::begin());
        let ctx = ExecutionContext::new("diku").with_unit_of_work(Arc::clone(&uow));

        bus.publish(&ctx, CatalogChange::CapabilityCreated { new: capability() });
        assert!(rx.try_recv().is_err());

        uow.commit().unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_publish_in_rolled_back_transaction_is_dropped() {
        let bus = CatalogEventBus::new(8);
        let mut rx = bus.subscribe();
        let uow = Arc::new(UnitOfWork::begin());
        let ctx = ExecutionContext::new("diku").with_unit_of_work(Arc::clone(&uow));

        bus.publish(&ctx, CatalogChange::CapabilityDeleted { old: capability() });
        let _ = uow
            .rollback(crate::error::ServiceError::validation("abort"))
            .await;

        assert!(rx.try_recv().is_err());
    }
}
