//! Execution context carried by every service call.

use std::future::Future;
use std::sync::Arc;

use uuid::Uuid;

use rsroles_storage::StorageResult;

use crate::error::ServiceResult;
use crate::transaction::UnitOfWork;

/// Tenant, request identity and the active unit of work, if any.
///
/// Tenant-scoped state (tokens, client ids) is looked up by `tenant`, never
/// held in globals.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub tenant: String,
    pub request_id: Uuid,
    unit_of_work: Option<Arc<UnitOfWork>>,
}

impl ExecutionContext {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            request_id: Uuid::new_v4(),
            unit_of_work: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_unit_of_work(&self, unit_of_work: Arc<UnitOfWork>) -> Self {
        Self {
            tenant: self.tenant.clone(),
            request_id: self.request_id,
            unit_of_work: Some(unit_of_work),
        }
    }

    /// Same tenant and request, without the unit of work.
    ///
    /// Used for work that outlives the originating transaction, such as
    /// event delivery and background reconciliation.
    pub fn detached(&self) -> Self {
        Self {
            tenant: self.tenant.clone(),
            request_id: self.request_id,
            unit_of_work: None,
        }
    }

    /// The unit of work, if one is present and still active.
    pub fn active_unit_of_work(&self) -> Option<&Arc<UnitOfWork>> {
        self.unit_of_work.as_ref().filter(|uow| uow.is_active())
    }

    /// Registers the undo of a local store write on the active unit of work.
    ///
    /// Without an active unit of work there is nothing to roll back and
    /// `undo` is dropped.
    pub fn undo_local<S, F, Fut>(&self, store: &Arc<S>, write: &str, undo: F)
    where
        S: Send + Sync + 'static,
        F: FnOnce(Arc<S>) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<()>> + Send + 'static,
    {
        if let Some(uow) = self.active_unit_of_work() {
            let store = Arc::clone(store);
            uow.on_rollback(format!("undo {write}"), move || async move {
                Ok(undo(store).await?)
            });
        }
    }

    /// Runs `work` inside a new unit of work.
    ///
    /// Commits when `work` succeeds. When it fails, rolls back, which runs
    /// registered compensations, and returns the (possibly wrapped) failure.
    pub async fn transaction<T, F, Fut>(&self, work: F) -> ServiceResult<T>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = ServiceResult<T>>,
    {
        let uow = Arc::new(UnitOfWork::begin());
        match work(self.with_unit_of_work(Arc::clone(&uow))).await {
            Ok(value) => {
                uow.commit()?;
                Ok(value)
            }
            Err(err) => Err(uow.rollback(err).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let ctx = ExecutionContext::new("diku");
        let compensated = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&compensated);
        let result: ServiceResult<()> = ctx
            .transaction(|tx| async move {
                let uow = tx.active_unit_of_work().cloned().unwrap();
                uow.on_rollback("undo", move || async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                });
                Err(ServiceError::validation("fail"))
            })
            .await;

        assert!(result.is_err());
        assert!(compensated.load(Ordering::SeqCst));
    }

    #[test]
    fn test_detached_context_has_no_unit_of_work() {
        let ctx = ExecutionContext::new("diku").with_unit_of_work(Arc::new(UnitOfWork::begin()));
        assert!(ctx.active_unit_of_work().is_some());

        let detached = ctx.detached();
        assert!(detached.active_unit_of_work().is_none());
        assert_eq!(detached.request_id, ctx.request_id);
    }
}
