//! Unit of work with commit and rollback hooks.
//!
//! The unit of work does not own a database transaction. It is the hook
//! registry a transaction boundary drives: compensations registered with
//! [`UnitOfWork::on_rollback`] undo remote effects if the boundary rolls
//! back, and callbacks registered with [`UnitOfWork::after_commit`] run only
//! once the boundary has committed.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use futures::future::BoxFuture;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};

type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, ServiceResult<()>> + Send>;
type CommitHook = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkStatus {
    Active,
    Committed,
    RolledBack,
}

struct Hooks {
    status: UnitOfWorkStatus,
    compensations: Vec<(String, Compensation)>,
    after_commit: Vec<CommitHook>,
}

pub struct UnitOfWork {
    id: Uuid,
    hooks: Mutex<Hooks>,
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::begin()
    }
}

impl UnitOfWork {
    /// Starts a new, active unit of work.
    pub fn begin() -> Self {
        Self {
            id: Uuid::new_v4(),
            hooks: Mutex::new(Hooks {
                status: UnitOfWorkStatus::Active,
                compensations: Vec::new(),
                after_commit: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> UnitOfWorkStatus {
        self.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == UnitOfWorkStatus::Active
    }

    /// Registers a compensation to run if this unit of work rolls back.
    ///
    /// Compensations run in reverse registration order. Returns `false` and
    /// drops `compensation` if the unit of work is no longer active.
    pub fn on_rollback<F, Fut>(&self, description: impl Into<String>, compensation: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ServiceResult<()>> + Send + 'static,
    {
        let mut hooks = self.lock();
        if hooks.status != UnitOfWorkStatus::Active {
            return false;
        }
        hooks.compensations.push((
            description.into(),
            Box::new(move || Box::pin(compensation())),
        ));
        true
    }

    /// Registers a callback to run once this unit of work commits.
    ///
    /// Returns `false` and drops `hook` if the unit of work is no longer active.
    pub fn after_commit<F>(&self, hook: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = self.lock();
        if hooks.status != UnitOfWorkStatus::Active {
            return false;
        }
        hooks.after_commit.push(Box::new(hook));
        true
    }

    /// Commits: discards compensations and runs after-commit callbacks in order.
    pub fn commit(&self) -> ServiceResult<()> {
        let after_commit = {
            let mut hooks = self.lock();
            if hooks.status != UnitOfWorkStatus::Active {
                return Err(ServiceError::validation(format!(
                    "unit of work {} is already {:?}",
                    self.id, hooks.status
                )));
            }
            hooks.status = UnitOfWorkStatus::Committed;
            hooks.compensations.clear();
            std::mem::take(&mut hooks.after_commit)
        };

        debug!(unit_of_work = %self.id, hooks = after_commit.len(), "Unit of work committed");
        for hook in after_commit {
            hook();
        }
        Ok(())
    }

    /// Rolls back after `cause`: runs every compensation, last registered first.
    ///
    /// Returns `cause` itself if all compensations succeed. Otherwise returns
    /// an `Inconsistency` carrying `cause` and every compensation failure.
    pub async fn rollback(&self, cause: ServiceError) -> ServiceError {
        let compensations = {
            let mut hooks = self.lock();
            if hooks.status != UnitOfWorkStatus::Active {
                return cause;
            }
            hooks.status = UnitOfWorkStatus::RolledBack;
            hooks.after_commit.clear();
            std::mem::take(&mut hooks.compensations)
        };

        let mut failures = Vec::new();
        for (description, compensation) in compensations.into_iter().rev() {
            if let Err(err) = compensation().await {
                error!(
                    unit_of_work = %self.id,
                    compensation = %description,
                    error = %err,
                    cause = %cause,
                    "Compensation failed, stores are inconsistent"
                );
                failures.push(err);
            }
        }

        if failures.is_empty() {
            debug!(unit_of_work = %self.id, cause = %cause, "Unit of work rolled back");
            cause
        } else {
            ServiceError::inconsistency(cause, failures)
        }
    }

    fn lock(&self) -> MutexGuard<'_, Hooks> {
        // Hooks are only pushed or taken while locked, so a poisoned lock
        // still holds a usable registry.
        self.hooks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        let hooks = self.lock();
        if hooks.status == UnitOfWorkStatus::Active && !hooks.compensations.is_empty() {
            warn!(
                unit_of_work = %self.id,
                pending = hooks.compensations.len(),
                "Unit of work dropped while active, compensations discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    #[tokio::test]
    async fn test_rollback_runs_compensations_in_reverse_order() {
        // Arrange
        let uow = UnitOfWork::begin();
        let order = Arc::new(StdMutex::new(Vec::new()));
        for step in 1..=3 {
            let order = Arc::clone(&order);
            uow.on_rollback(format!("step {step}"), move || async move {
                order.lock().unwrap().push(step);
                Ok(())
            });
        }

        // Act
        let err = uow.rollback(ServiceError::validation("boom")).await;

        // Assert
        assert!(matches!(err, ServiceError::Validation { .. }));
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
        assert_eq!(uow.status(), UnitOfWorkStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_failed_compensation_yields_inconsistency() {
        let uow = UnitOfWork::begin();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        uow.on_rollback("ok", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        uow.on_rollback("fails", || async {
            Err(ServiceError::RemoteService {
                message: "unreachable".to_string(),
                retryable: true,
            })
        });

        let err = uow.rollback(ServiceError::validation("local failed")).await;

        assert!(err.is_inconsistency());
        assert!(matches!(err.primary(), ServiceError::Validation { .. }));
        assert_eq!(err.suppressed().len(), 1);
        // The remaining compensation still ran.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_commit_runs_after_commit_hooks_and_drops_compensations() {
        let uow = UnitOfWork::begin();
        let committed = Arc::new(AtomicUsize::new(0));
        let compensated = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&committed);
        uow.after_commit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&compensated);
        uow.on_rollback("never", move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        uow.commit().unwrap();
        let err = uow.rollback(ServiceError::validation("late")).await;

        assert_eq!(committed.load(Ordering::SeqCst), 1);
        assert_eq!(compensated.load(Ordering::SeqCst), 0);
        assert!(matches!(err, ServiceError::Validation { .. }));
        assert!(uow.commit().is_err());
    }

    #[test]
    fn test_hooks_rejected_once_completed() {
        let uow = UnitOfWork::begin();
        uow.commit().unwrap();

        assert!(!uow.after_commit(|| {}));
        assert!(!uow.on_rollback("late", || async { Ok(()) }));
    }
}
