//! Dual-write coordinator.
//!
//! Writes that touch both the catalog store and the authorization server
//! go through here, in one of two shapes:
//!
//! - **Remote first** (create/update): remote action, then local action;
//!   the compensation undoes the remote effect.
//! - **Local first** (delete): local action, then remote action; the
//!   compensation restores the local snapshot taken before the delete.
//!
//! Inside an active unit of work the compensation is registered on it and
//! runs only if the unit of work rolls back. Without one, a failure of the
//! second step runs the compensation inline. A failed compensation never
//! hides the original error: both surface together as an `Inconsistency`.

use std::future::Future;

use tracing::{error, warn};

use crate::context::ExecutionContext;
use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct DualWriteCoordinator;

impl DualWriteCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Remote action, then local action, compensating the remote on local failure.
    ///
    /// The remote action's output is handed to the local action.
    pub async fn execute_with_compensation<R, T, Remote, RemoteFut, Local, LocalFut, Comp, CompFut>(
        &self,
        ctx: &ExecutionContext,
        operation: &str,
        remote: Remote,
        local: Local,
        compensation: Comp,
    ) -> ServiceResult<T>
    where
        Remote: FnOnce() -> RemoteFut,
        RemoteFut: Future<Output = ServiceResult<R>>,
        Local: FnOnce(R) -> LocalFut,
        LocalFut: Future<Output = ServiceResult<T>>,
        Comp: FnOnce() -> CompFut + Send + 'static,
        CompFut: Future<Output = ServiceResult<()>> + Send + 'static,
    {
        let remote_output = remote().await?;
        self.second_step(ctx, operation, local(remote_output), compensation)
            .await
    }

    /// Local action, then remote action, restoring the local snapshot on remote failure.
    pub async fn execute_delete_with_restore<T, Local, LocalFut, Remote, RemoteFut, Restore, RestoreFut>(
        &self,
        ctx: &ExecutionContext,
        operation: &str,
        local: Local,
        remote: Remote,
        restore: Restore,
    ) -> ServiceResult<T>
    where
        Local: FnOnce() -> LocalFut,
        LocalFut: Future<Output = ServiceResult<()>>,
        Remote: FnOnce() -> RemoteFut,
        RemoteFut: Future<Output = ServiceResult<T>>,
        Restore: FnOnce() -> RestoreFut + Send + 'static,
        RestoreFut: Future<Output = ServiceResult<()>> + Send + 'static,
    {
        local().await?;
        self.second_step(ctx, operation, remote(), restore).await
    }

    async fn second_step<T, Step, Comp, CompFut>(
        &self,
        ctx: &ExecutionContext,
        operation: &str,
        step: Step,
        compensation: Comp,
    ) -> ServiceResult<T>
    where
        Step: Future<Output = ServiceResult<T>>,
        Comp: FnOnce() -> CompFut + Send + 'static,
        CompFut: Future<Output = ServiceResult<()>> + Send + 'static,
    {
        if let Some(uow) = ctx.active_unit_of_work() {
            if uow.on_rollback(operation, compensation) {
                return step.await;
            }
            return Err(ServiceError::validation(format!(
                "unit of work {} completed during {operation}",
                uow.id()
            )));
        }

        let err = match step.await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match compensation().await {
            Ok(()) => {
                warn!(operation, error = %err, "Second write failed, first write compensated");
                Err(err)
            }
            Err(compensation_err) => {
                error!(
                    operation,
                    error = %err,
                    compensation_error = %compensation_err,
                    "Compensation failed, stores are inconsistent"
                );
                Err(ServiceError::inconsistency(err, vec![compensation_err]))
            }
        }
    }
}
