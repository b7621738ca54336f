//! Authorization-server client.
//!
//! The authorization server enforces access decisions; this service mirrors
//! roles, policies, resources and scope permissions into it. Two
//! implementations are provided:
//!
//! - [`HttpAuthorizationServer`]: admin REST API over `reqwest`
//! - [`InMemoryAuthorizationServer`]: in-process fake for tests
//!
//! Every call takes the [`ExecutionContext`] so tenant-scoped credentials
//! are resolved per call.

mod cache;
mod error;
mod http;
mod memory;
mod types;

pub use cache::{AccessToken, TenantCache};
pub use error::{AuthzError, AuthzResult};
pub use http::HttpAuthorizationServer;
pub use memory::InMemoryAuthorizationServer;
pub use types::{RemoteResource, RemoteRole, RemoteScope, ScopePermission};

use async_trait::async_trait;
use uuid::Uuid;

use rsroles_domain::model::{ExternalPolicy, Role};

use crate::context::ExecutionContext;

#[async_trait]
pub trait AuthorizationServer: Send + Sync + 'static {
    // Roles

    async fn create_role(&self, ctx: &ExecutionContext, role: &Role) -> AuthzResult<()>;

    async fn update_role(
        &self,
        ctx: &ExecutionContext,
        previous_name: &str,
        role: &Role,
    ) -> AuthzResult<()>;

    async fn delete_role(&self, ctx: &ExecutionContext, name: &str) -> AuthzResult<()>;

    async fn find_role(&self, ctx: &ExecutionContext, name: &str)
        -> AuthzResult<Option<RemoteRole>>;

    async fn assign_role(
        &self,
        ctx: &ExecutionContext,
        user_id: Uuid,
        role_name: &str,
    ) -> AuthzResult<()>;

    async fn unassign_role(
        &self,
        ctx: &ExecutionContext,
        user_id: Uuid,
        role_name: &str,
    ) -> AuthzResult<()>;

    // Resources and scopes

    /// Finds the resource registered for a static endpoint path.
    async fn find_resource(
        &self,
        ctx: &ExecutionContext,
        path: &str,
    ) -> AuthzResult<Option<RemoteResource>>;

    async fn create_resource(
        &self,
        ctx: &ExecutionContext,
        path: &str,
        scopes: &[RemoteScope],
    ) -> AuthzResult<RemoteResource>;

    async fn delete_resource(&self, ctx: &ExecutionContext, id: &str) -> AuthzResult<()>;

    async fn find_scope(&self, ctx: &ExecutionContext, name: &str)
        -> AuthzResult<Option<RemoteScope>>;

    // Policies

    async fn create_policy(&self, ctx: &ExecutionContext, policy: &ExternalPolicy)
        -> AuthzResult<()>;

    async fn update_policy(&self, ctx: &ExecutionContext, policy: &ExternalPolicy)
        -> AuthzResult<()>;

    async fn delete_policy(&self, ctx: &ExecutionContext, id: Uuid) -> AuthzResult<()>;

    async fn find_policy(
        &self,
        ctx: &ExecutionContext,
        name: &str,
    ) -> AuthzResult<Option<ExternalPolicy>>;

    // Scope permissions

    async fn create_permission(
        &self,
        ctx: &ExecutionContext,
        permission: &ScopePermission,
    ) -> AuthzResult<()>;

    async fn find_permission(
        &self,
        ctx: &ExecutionContext,
        name: &str,
    ) -> AuthzResult<Option<ScopePermission>>;

    async fn delete_permission(&self, ctx: &ExecutionContext, name: &str) -> AuthzResult<()>;
}
