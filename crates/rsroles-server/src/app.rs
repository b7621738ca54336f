//! Service wiring.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use rsroles_storage::CatalogStore;

use crate::authz::AuthorizationServer;
use crate::config::ServiceConfig;
use crate::events::CatalogEventBus;
use crate::services::{
    AssignmentService, CatalogService, LoadableRoleService, MigrationService, PolicyService,
    ReconciliationTrigger, RoleService,
};
use crate::sync::{
    BatchExecutor, DualWriteCoordinator, DuplicateRewriter, EndpointPermissionSync,
    ReconciliationRetrier, RetryPolicy,
};

/// Every service, built over one store, one authorization server and one event bus.
pub struct SyncServices<S, A> {
    pub store: Arc<S>,
    pub authz: Arc<A>,
    pub events: CatalogEventBus,
    pub policies: PolicyService<S, A>,
    pub roles: RoleService<S, A>,
    pub assignments: AssignmentService<S, A>,
    pub catalog: CatalogService<S, A>,
    pub loadable_roles: LoadableRoleService<S, A>,
    pub migrations: MigrationService<S, A>,
    pub rewriter: DuplicateRewriter<S, A>,
}

impl<S: CatalogStore, A: AuthorizationServer> SyncServices<S, A> {
    pub fn new(config: &ServiceConfig, store: Arc<S>, authz: Arc<A>) -> Self {
        let events = CatalogEventBus::new(config.events.channel_capacity);
        let coordinator = DualWriteCoordinator::new();
        let permissions = EndpointPermissionSync::new(
            Arc::clone(&authz),
            BatchExecutor::new(config.batch.max_concurrency),
        );
        let retrier = ReconciliationRetrier::new(RetryPolicy::from(&config.retry));

        let policies = PolicyService::new(Arc::clone(&store), Arc::clone(&authz), coordinator);
        let roles = RoleService::new(
            Arc::clone(&store),
            Arc::clone(&authz),
            coordinator,
            permissions.clone(),
            events.clone(),
        );
        let assignments = AssignmentService::new(
            Arc::clone(&store),
            Arc::clone(&authz),
            coordinator,
            policies.clone(),
            permissions.clone(),
        );
        let catalog = CatalogService::new(Arc::clone(&store), assignments.clone(), events.clone());
        let loadable_roles = LoadableRoleService::new(
            Arc::clone(&store),
            roles.clone(),
            assignments.clone(),
            retrier,
        );
        let rewriter = DuplicateRewriter::new(Arc::clone(&store), permissions, events.clone());
        let migrations =
            MigrationService::new(Arc::clone(&store), loadable_roles.clone(), rewriter.clone());

        info!(
            batch_concurrency = config.batch.max_concurrency,
            retry_attempts = config.retry.max_attempts,
            "Sync services initialized"
        );

        Self {
            store,
            authz,
            events,
            policies,
            roles,
            assignments,
            catalog,
            loadable_roles,
            migrations,
            rewriter,
        }
    }

    /// Starts resolving loadable permissions on catalog changes.
    pub fn start_reconciliation_trigger(&self) -> JoinHandle<()> {
        ReconciliationTrigger::new(self.loadable_roles.clone()).spawn(&self.events)
    }
}
