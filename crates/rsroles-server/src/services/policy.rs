//! Policy service: dual-written policy CRUD.

use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use rsroles_domain::model::{ExternalPolicy, Policy, Subject};
use rsroles_storage::{CatalogStore, StorageError};

use super::ignore_not_found;
use crate::authz::AuthorizationServer;
use crate::context::ExecutionContext;
use crate::error::{ServiceError, ServiceResult};
use crate::sync::DualWriteCoordinator;

pub struct PolicyService<S, A> {
    store: Arc<S>,
    authz: Arc<A>,
    coordinator: DualWriteCoordinator,
}

impl<S, A> Clone for PolicyService<S, A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            authz: Arc::clone(&self.authz),
            coordinator: self.coordinator,
        }
    }
}

impl<S: CatalogStore, A: AuthorizationServer> PolicyService<S, A> {
    pub fn new(store: Arc<S>, authz: Arc<A>, coordinator: DualWriteCoordinator) -> Self {
        Self {
            store,
            authz,
            coordinator,
        }
    }

    /// Creates the policy remotely, then locally. The remote policy is
    /// deleted again if the local insert fails.
    #[instrument(skip(self, ctx, policy), fields(policy = %policy.name))]
    pub async fn create(&self, ctx: &ExecutionContext, policy: Policy) -> ServiceResult<Policy> {
        if self.store.find_policy_by_name(&policy.name).await?.is_some() {
            return Err(ServiceError::conflict(format!(
                "policy name is already taken: {}",
                policy.name
            )));
        }

        let external = ExternalPolicy::from(&policy);
        let authz = Arc::clone(&self.authz);
        let detached = ctx.detached();
        let id = policy.id;

        self.coordinator
            .execute_with_compensation(
                ctx,
                "create policy",
                || async { Ok(self.authz.create_policy(ctx, &external).await?) },
                |()| async { Ok(self.store.create_policy(&policy).await?) },
                move || async move { Ok(authz.delete_policy(&detached, id).await?) },
            )
            .await
    }

    /// Replaces a policy. The remote policy is reverted if the local update fails.
    #[instrument(skip(self, ctx, policy), fields(policy_id = %policy.id))]
    pub async fn update(&self, ctx: &ExecutionContext, policy: Policy) -> ServiceResult<Policy> {
        let existing = self.get(policy.id).await?;
        if let Some(other) = self.store.find_policy_by_name(&policy.name).await? {
            if other.id != policy.id {
                return Err(ServiceError::conflict(format!(
                    "policy name is already taken: {}",
                    policy.name
                )));
            }
        }

        let external = ExternalPolicy::from(&policy);
        let previous = ExternalPolicy::from(&existing);
        let authz = Arc::clone(&self.authz);
        let detached = ctx.detached();

        self.coordinator
            .execute_with_compensation(
                ctx,
                "update policy",
                || async { Ok(self.authz.update_policy(ctx, &external).await?) },
                |()| async { Ok(self.store.update_policy(&policy).await?) },
                move || async move { Ok(authz.update_policy(&detached, &previous).await?) },
            )
            .await
    }

    /// Deletes the policy locally, then remotely. The local row is restored
    /// if the remote delete fails; a policy already gone remotely is fine.
    #[instrument(skip(self, ctx))]
    pub async fn delete(&self, ctx: &ExecutionContext, id: Uuid) -> ServiceResult<()> {
        let snapshot = self.get(id).await?;
        let store = Arc::clone(&self.store);

        self.coordinator
            .execute_delete_with_restore(
                ctx,
                "delete policy",
                || async { Ok(self.store.delete_policy(id).await?) },
                || async { ignore_not_found(self.authz.delete_policy(ctx, id).await) },
                move || async move {
                    store.create_policy(&snapshot).await?;
                    Ok(())
                },
            )
            .await
    }

    pub async fn get(&self, id: Uuid) -> ServiceResult<Policy> {
        self.store
            .find_policy(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("policy", id))
    }

    pub async fn find_by_name(&self, name: &str) -> ServiceResult<Option<Policy>> {
        Ok(self.store.find_policy_by_name(name).await?)
    }

    /// Returns the policy bound to `subject`, creating it on both sides if needed.
    ///
    /// Safe to call concurrently for the same subject: a remote or local
    /// conflict means another call created it first.
    pub async fn ensure_subject_policy(
        &self,
        ctx: &ExecutionContext,
        subject: &Subject,
    ) -> ServiceResult<Policy> {
        let policy = match subject {
            Subject::Role(id) => Policy::for_role(*id),
            Subject::User(id) => Policy::for_user(*id),
        };
        if let Some(existing) = self.store.find_policy(policy.id).await? {
            return Ok(existing);
        }

        debug!(subject = %subject, policy = %policy.name, "Creating subject policy");
        let external = ExternalPolicy::from(&policy);
        let authz = Arc::clone(&self.authz);
        let detached = ctx.detached();
        let id = policy.id;

        self.coordinator
            .execute_with_compensation(
                ctx,
                "create subject policy",
                || async {
                    match self.authz.create_policy(ctx, &external).await {
                        Err(err) if err.is_conflict() => Ok(()),
                        other => Ok(other?),
                    }
                },
                |()| async {
                    match self.store.create_policy(&policy).await {
                        Ok(created) => Ok(created),
                        Err(StorageError::AlreadyExists { .. }) => self.get(id).await,
                        Err(err) => Err(err.into()),
                    }
                },
                move || async move { Ok(authz.delete_policy(&detached, id).await?) },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::InMemoryAuthorizationServer;
    use rsroles_domain::model::{Logic, PolicyKind, UserPolicy};
    use rsroles_storage::MemoryCatalogStore;

    fn service() -> (
        PolicyService<MemoryCatalogStore, InMemoryAuthorizationServer>,
        Arc<MemoryCatalogStore>,
        Arc<InMemoryAuthorizationServer>,
    ) {
        let store = MemoryCatalogStore::new_shared();
        let authz = Arc::new(InMemoryAuthorizationServer::new());
        let service = PolicyService::new(
            Arc::clone(&store),
            Arc::clone(&authz),
            DualWriteCoordinator::new(),
        );
        (service, store, authz)
    }

    fn user_policy(name: &str) -> Policy {
        Policy::new(
            name,
            PolicyKind::User(UserPolicy {
                users: vec![Uuid::new_v4()],
                logic: Logic::Positive,
            }),
        )
    }

    #[tokio::test]
    async fn test_create_writes_both_stores() {
        let (service, store, authz) = service();
        let policy = user_policy("staff");

        let created = service
            .create(&ExecutionContext::new("diku"), policy.clone())
            .await
            .unwrap();

        assert_eq!(created.id, policy.id);
        assert!(authz.has_policy(policy.id));
        assert!(store.find_policy(policy.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_local_failure_deletes_remote_policy() {
        // Arrange
        let (service, store, authz) = service();
        let ctx = ExecutionContext::new("diku");
        let policy = user_policy("staff");
        store.fail_next("create_policy", 1);

        // Act
        let result = service.create(&ctx, policy.clone()).await;

        // Assert
        assert!(result.is_err());
        assert!(!authz.has_policy(policy.id));
        assert!(service.create(&ctx, policy.clone()).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict_without_remote_call() {
        let (service, _, authz) = service();
        let ctx = ExecutionContext::new("diku");
        service.create(&ctx, user_policy("staff")).await.unwrap();
        authz.clear_calls();

        let err = service.create(&ctx, user_policy("staff")).await.unwrap_err();

        assert!(err.is_conflict());
        assert!(authz.calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_reverts_remote_on_local_failure() {
        let (service, store, authz) = service();
        let ctx = ExecutionContext::new("diku");
        let policy = service.create(&ctx, user_policy("staff")).await.unwrap();
        let mut renamed = policy.clone();
        renamed.name = "faculty".to_string();
        store.fail_next("update_policy", 1);

        assert!(service.update(&ctx, renamed).await.is_err());

        let remote = authz.find_policy(&ctx, "staff").await.unwrap();
        assert!(remote.is_some());
        assert_eq!(service.get(policy.id).await.unwrap().name, "staff");
    }

    #[tokio::test]
    async fn test_delete_restores_local_row_on_remote_failure() {
        let (service, store, authz) = service();
        let ctx = ExecutionContext::new("diku");
        let policy = service.create(&ctx, user_policy("staff")).await.unwrap();
        authz.fail_next("delete_policy", 1);

        let err = service.delete(&ctx, policy.id).await.unwrap_err();

        assert!(err.is_retryable());
        assert!(store.find_policy(policy.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ensure_subject_policy_is_idempotent() {
        let (service, _, authz) = service();
        let ctx = ExecutionContext::new("diku");
        let subject = Subject::Role(Uuid::new_v4());

        let first = service.ensure_subject_policy(&ctx, &subject).await.unwrap();
        let second = service.ensure_subject_policy(&ctx, &subject).await.unwrap();

        assert_eq!(first.id, subject.id());
        assert_eq!(first, second);
        assert_eq!(authz.calls_of("create_policy").len(), 1);
    }
}
