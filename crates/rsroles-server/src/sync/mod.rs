//! Synchronization core.
//!
//! Building blocks that keep the catalog store and the authorization server
//! consistent:
//!
//! - [`DualWriteCoordinator`]: two-store writes with compensation
//! - [`BatchExecutor`]: bounded fan-out with failure aggregation
//! - [`ReconciliationRetrier`]: background retry with backoff
//! - [`DuplicateRewriter`]: collapses duplicate catalog records
//! - [`EndpointPermissionSync`]: scope permissions for subject endpoints

mod batch;
mod coordinator;
mod lock;
mod permissions;
mod retrier;
mod rewriter;

pub use batch::{aggregate, BatchExecutor};
pub use coordinator::DualWriteCoordinator;
pub use lock::{KeyedLockGuard, KeyedLocks};
pub use permissions::{endpoint_diff, subject_endpoints, EndpointPermissionSync};
pub use retrier::{ReconciliationRetrier, RetryPolicy};
pub use rewriter::{ArtifactKind, DuplicateRewriter, RewriteOutcome};
