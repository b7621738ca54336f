//! Catalog services.
//!
//! Each service owns one slice of the catalog and keeps it in step with the
//! authorization server through the [`crate::sync`] building blocks.

mod assignment;
mod catalog;
mod loadable;
mod migration;
mod policy;
mod role;

pub use assignment::AssignmentService;
pub use catalog::{CatalogDelta, CatalogService};
pub use loadable::{LoadableRoleCreation, LoadableRoleService, ReconciliationTrigger};
pub use migration::{DuplicatePair, MigrationService};
pub use policy::PolicyService;
pub use role::RoleService;

use crate::authz::AuthzResult;
use crate::error::ServiceResult;

/// Treats a remote `NotFound` as success: the object is already gone.
pub(crate) fn ignore_not_found(result: AuthzResult<()>) -> ServiceResult<()> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => Ok(other?),
    }
}
