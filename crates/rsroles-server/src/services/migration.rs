//! Migration jobs: bulk import of legacy roles and collapse of duplicates.
//!
//! Only one job may be in progress at a time. A record that fails is stored
//! as a [`MigrationError`] on the job and the run moves on; the job still
//! ends `FINISHED`. `FAILED` is reserved for failures of the pipeline itself,
//! such as the store rejecting the error rows.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use rsroles_domain::model::{
    LoadableRole, MigrationError, MigrationErrorType, MigrationJob, MigrationStatus,
};
use rsroles_storage::CatalogStore;

use super::loadable::LoadableRoleService;
use crate::authz::AuthorizationServer;
use crate::context::ExecutionContext;
use crate::error::{ServiceError, ServiceResult};
use crate::sync::{ArtifactKind, DuplicateRewriter, RewriteOutcome};

/// One duplicate pair: references to `old` move to `new`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicatePair {
    pub kind: ArtifactKind,
    pub old: String,
    pub new: String,
}

impl DuplicatePair {
    pub fn capability(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            kind: ArtifactKind::Capability,
            old: old.into(),
            new: new.into(),
        }
    }

    pub fn capability_set(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            kind: ArtifactKind::CapabilitySet,
            old: old.into(),
            new: new.into(),
        }
    }

    fn error_type(&self) -> MigrationErrorType {
        match self.kind {
            ArtifactKind::Capability => MigrationErrorType::Capability,
            ArtifactKind::CapabilitySet => MigrationErrorType::CapabilitySet,
        }
    }
}

pub struct MigrationService<S, A> {
    store: Arc<S>,
    loadable_roles: LoadableRoleService<S, A>,
    rewriter: DuplicateRewriter<S, A>,
}

impl<S, A> Clone for MigrationService<S, A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            loadable_roles: self.loadable_roles.clone(),
            rewriter: self.rewriter.clone(),
        }
    }
}

impl<S: CatalogStore, A: AuthorizationServer> MigrationService<S, A> {
    pub fn new(
        store: Arc<S>,
        loadable_roles: LoadableRoleService<S, A>,
        rewriter: DuplicateRewriter<S, A>,
    ) -> Self {
        Self {
            store,
            loadable_roles,
            rewriter,
        }
    }

    /// Starts a job. Fails with `Conflict` while another job is in progress.
    pub async fn start_job(&self) -> ServiceResult<MigrationJob> {
        let job = self.store.create_migration_job(&MigrationJob::start()).await?;
        info!(job_id = %job.id, "Migration job started");
        Ok(job)
    }

    pub async fn get_job(&self, id: Uuid) -> ServiceResult<MigrationJob> {
        self.store
            .find_migration_job(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("migration job", id))
    }

    /// Jobs, newest first, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<MigrationStatus>) -> ServiceResult<Vec<MigrationJob>> {
        Ok(self.store.list_migration_jobs(status).await?)
    }

    pub async fn job_errors(&self, job_id: Uuid) -> ServiceResult<Vec<MigrationError>> {
        self.get_job(job_id).await?;
        Ok(self.store.list_migration_errors(job_id).await?)
    }

    /// Creates each legacy role as a loadable role.
    ///
    /// Permissions that do not resolve yet are left to background
    /// reconciliation and are not recorded as errors.
    #[instrument(skip(self, ctx, roles), fields(records = roles.len()))]
    pub async fn migrate_loadable_roles(
        &self,
        ctx: &ExecutionContext,
        roles: Vec<LoadableRole>,
    ) -> ServiceResult<MigrationJob> {
        let job = self.start_job().await?;
        let total = roles.len();

        let mut outcome = Ok(());
        for role in roles {
            let name = role.name.clone();
            if let Err(err) = self.loadable_roles.create(ctx, role).await {
                warn!(job_id = %job.id, role = %name, error = %err, "Role migration failed");
                let record = MigrationError::new(job.id, MigrationErrorType::Role, name, err.to_string());
                if let Err(err) = self.store.add_migration_error(&record).await {
                    outcome = Err(err.into());
                    break;
                }
            }
        }

        self.finish(job, total, outcome).await
    }

    /// Collapses each duplicate pair through the [`DuplicateRewriter`].
    ///
    /// A pair whose target is missing is skipped and recorded as an error.
    #[instrument(skip(self, ctx, pairs), fields(records = pairs.len()))]
    pub async fn migrate_duplicates(
        &self,
        ctx: &ExecutionContext,
        pairs: Vec<DuplicatePair>,
    ) -> ServiceResult<MigrationJob> {
        let job = self.start_job().await?;
        let total = pairs.len();

        let mut outcome = Ok(());
        for pair in pairs {
            let failure = match self.rewriter.rewrite(ctx, pair.kind, &pair.old, &pair.new).await {
                Ok(RewriteOutcome::SkippedMissingTarget) => {
                    Some(format!("{} '{}' does not exist", pair.kind, pair.new))
                }
                Ok(_) => None,
                Err(err) => Some(err.to_string()),
            };
            let Some(message) = failure else {
                continue;
            };

            let record = MigrationError::new(
                job.id,
                pair.error_type(),
                format!("{} -> {}", pair.old, pair.new),
                message,
            );
            if let Err(err) = self.store.add_migration_error(&record).await {
                outcome = Err(err.into());
                break;
            }
        }

        self.finish(job, total, outcome).await
    }

    async fn finish(
        &self,
        mut job: MigrationJob,
        total: usize,
        outcome: ServiceResult<()>,
    ) -> ServiceResult<MigrationJob> {
        job.total_records = u64::try_from(total).unwrap_or(u64::MAX);
        job.finished_at = Some(Utc::now());
        job.status = match outcome {
            Ok(()) => MigrationStatus::Finished,
            Err(_) => MigrationStatus::Failed,
        };

        let saved = self.store.update_migration_job(&job).await;
        match (outcome, saved) {
            (Ok(()), Ok(job)) => {
                info!(job_id = %job.id, total_records = job.total_records, "Migration job finished");
                Ok(job)
            }
            (Ok(()), Err(err)) => Err(err.into()),
            (Err(err), saved) => {
                error!(job_id = %job.id, error = %err, "Migration job failed");
                if let Err(save_err) = saved {
                    return Err(err.with_suppressed(vec![save_err.into()]));
                }
                Err(err)
            }
        }
    }
}
