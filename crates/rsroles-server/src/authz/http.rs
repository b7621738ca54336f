//! Authorization server over its admin REST API.
//!
//! Each tenant is a realm. Admin tokens are issued per realm through the
//! client-credentials grant and cached per tenant; the id of the tenant's
//! resource-server client is looked up once and cached as well. A 401 from
//! any call drops the tenant's cached token so the next call re-authenticates.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};
use uuid::Uuid;

use rsroles_domain::model::{ExternalPolicy, Role};

use super::cache::{AccessToken, TenantCache};
use super::error::{AuthzError, AuthzResult};
use super::types::{RemoteResource, RemoteRole, RemoteScope, ScopePermission};
use super::AuthorizationServer;
use crate::config::AuthzServerSettings;
use crate::context::ExecutionContext;

#[derive(Debug, Deserialize)]
struct ClientRepresentation {
    id: String,
}

#[derive(Debug)]
pub struct HttpAuthorizationServer {
    client: Client,
    settings: AuthzServerSettings,
    tokens: TenantCache<AccessToken>,
    client_ids: TenantCache<String>,
}

impl HttpAuthorizationServer {
    pub fn new(settings: AuthzServerSettings) -> AuthzResult<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout())
            .timeout(settings.read_timeout())
            .build()
            .map_err(|e| AuthzError::Unavailable {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            tokens: TenantCache::new(settings.token_ttl()),
            client_ids: TenantCache::new(settings.client_id_ttl()),
            settings,
        })
    }

    fn base_url(&self) -> &str {
        self.settings.base_url.trim_end_matches('/')
    }

    fn admin_url(&self, tenant: &str, path: &str) -> String {
        format!("{}/admin/realms/{}/{}", self.base_url(), tenant, path)
    }

    async fn authz_url(&self, ctx: &ExecutionContext, path: &str) -> AuthzResult<String> {
        let client_id = self.client_id(ctx).await?;
        Ok(self.admin_url(
            &ctx.tenant,
            &format!("clients/{client_id}/authz/resource-server/{path}"),
        ))
    }

    async fn token(&self, ctx: &ExecutionContext) -> AuthzResult<String> {
        let token = self
            .tokens
            .get_or_try_insert(&ctx.tenant, self.fetch_token(&ctx.tenant))
            .await?;
        Ok(token.access_token)
    }

    #[instrument(skip(self))]
    async fn fetch_token(&self, tenant: &str) -> AuthzResult<AccessToken> {
        let url = format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.base_url(),
            tenant
        );
        let response = self
            .client
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(transport)?;

        debug!(tenant, status = %response.status(), "Requested admin token");
        let response = check(response, "token", tenant).await?;
        decode(response).await
    }

    async fn client_id(&self, ctx: &ExecutionContext) -> AuthzResult<String> {
        self.client_ids
            .get_or_try_insert(&ctx.tenant, self.fetch_client_id(ctx))
            .await
    }

    async fn fetch_client_id(&self, ctx: &ExecutionContext) -> AuthzResult<String> {
        let client_name = format!("{}{}", ctx.tenant, self.settings.tenant_client_suffix);
        let url = self.admin_url(&ctx.tenant, "clients");
        let request = self
            .client
            .get(url)
            .query(&[("clientId", client_name.as_str())]);
        let clients: Vec<ClientRepresentation> = self.fetch(ctx, request, "client", &client_name).await?;

        clients
            .into_iter()
            .next()
            .map(|c| c.id)
            .ok_or(AuthzError::NotFound {
                kind: "client",
                name: client_name,
            })
    }

    /// Sends an authenticated request and checks its status.
    async fn send(
        &self,
        ctx: &ExecutionContext,
        request: RequestBuilder,
        kind: &'static str,
        name: &str,
    ) -> AuthzResult<Response> {
        let token = self.token(ctx).await?;
        let response = request.bearer_auth(token).send().await.map_err(transport)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate(&ctx.tenant).await;
        }
        check(response, kind, name).await
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        ctx: &ExecutionContext,
        request: RequestBuilder,
        kind: &'static str,
        name: &str,
    ) -> AuthzResult<T> {
        let response = self.send(ctx, request, kind, name).await?;
        decode(response).await
    }

    /// Like `fetch`, but a 404 or an empty body is `None`.
    async fn fetch_optional<T: DeserializeOwned>(
        &self,
        ctx: &ExecutionContext,
        request: RequestBuilder,
        kind: &'static str,
        name: &str,
    ) -> AuthzResult<Option<T>> {
        let response = match self.send(ctx, request, kind, name).await {
            Ok(response) => response,
            Err(AuthzError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response.bytes().await.map_err(transport)?;
        if body.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| AuthzError::Decode {
                message: e.to_string(),
            })
    }

    async fn authz_request(
        &self,
        ctx: &ExecutionContext,
        method: Method,
        path: &str,
    ) -> AuthzResult<RequestBuilder> {
        let url = self.authz_url(ctx, path).await?;
        Ok(self.client.request(method, url))
    }
}

async fn check(response: Response, kind: &'static str, name: &str) -> AuthzResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AuthzError::from_status(status.as_u16(), kind, name, body))
}

async fn decode<T: DeserializeOwned>(response: Response) -> AuthzResult<T> {
    response.json::<T>().await.map_err(|e| AuthzError::Decode {
        message: e.to_string(),
    })
}

fn transport(err: reqwest::Error) -> AuthzError {
    AuthzError::Unavailable {
        message: err.to_string(),
    }
}

/// Path segment of a policy type, e.g. `role` in `policy/role`.
fn policy_path(policy: &ExternalPolicy) -> String {
    format!("policy/{}", policy.policy_type.to_lowercase())
}

#[async_trait]
impl AuthorizationServer for HttpAuthorizationServer {
    #[instrument(skip(self, ctx, role), fields(tenant = %ctx.tenant, role = %role.name))]
    async fn create_role(&self, ctx: &ExecutionContext, role: &Role) -> AuthzResult<()> {
        let request = self
            .client
            .post(self.admin_url(&ctx.tenant, "roles"))
            .json(&RemoteRole::from(role));
        self.send(ctx, request, "role", &role.name).await?;
        Ok(())
    }

    #[instrument(skip(self, ctx, role), fields(tenant = %ctx.tenant, role = %role.name))]
    async fn update_role(
        &self,
        ctx: &ExecutionContext,
        previous_name: &str,
        role: &Role,
    ) -> AuthzResult<()> {
        let request = self
            .client
            .put(self.admin_url(&ctx.tenant, &format!("roles/{previous_name}")))
            .json(&RemoteRole::from(role));
        self.send(ctx, request, "role", previous_name).await?;
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(tenant = %ctx.tenant))]
    async fn delete_role(&self, ctx: &ExecutionContext, name: &str) -> AuthzResult<()> {
        let request = self
            .client
            .delete(self.admin_url(&ctx.tenant, &format!("roles/{name}")));
        self.send(ctx, request, "role", name).await?;
        Ok(())
    }

    async fn find_role(
        &self,
        ctx: &ExecutionContext,
        name: &str,
    ) -> AuthzResult<Option<RemoteRole>> {
        let request = self
            .client
            .get(self.admin_url(&ctx.tenant, &format!("roles/{name}")));
        self.fetch_optional(ctx, request, "role", name).await
    }

    #[instrument(skip(self, ctx), fields(tenant = %ctx.tenant))]
    async fn assign_role(
        &self,
        ctx: &ExecutionContext,
        user_id: Uuid,
        role_name: &str,
    ) -> AuthzResult<()> {
        let role = self
            .find_role(ctx, role_name)
            .await?
            .ok_or_else(|| AuthzError::NotFound {
                kind: "role",
                name: role_name.to_string(),
            })?;
        let request = self
            .client
            .post(self.admin_url(
                &ctx.tenant,
                &format!("users/{user_id}/role-mappings/realm"),
            ))
            .json(&[role]);
        self.send(ctx, request, "user", &user_id.to_string()).await?;
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(tenant = %ctx.tenant))]
    async fn unassign_role(
        &self,
        ctx: &ExecutionContext,
        user_id: Uuid,
        role_name: &str,
    ) -> AuthzResult<()> {
        let Some(role) = self.find_role(ctx, role_name).await? else {
            return Ok(());
        };
        let request = self
            .client
            .delete(self.admin_url(
                &ctx.tenant,
                &format!("users/{user_id}/role-mappings/realm"),
            ))
            .json(&[role]);
        self.send(ctx, request, "user", &user_id.to_string()).await?;
        Ok(())
    }

    async fn find_resource(
        &self,
        ctx: &ExecutionContext,
        path: &str,
    ) -> AuthzResult<Option<RemoteResource>> {
        let request = self
            .authz_request(ctx, Method::GET, "resource")
            .await?
            .query(&[("name", path), ("exactName", "true")]);
        let resources: Vec<RemoteResource> = self.fetch(ctx, request, "resource", path).await?;
        Ok(resources.into_iter().find(|r| r.name == path))
    }

    #[instrument(skip(self, ctx, scopes), fields(tenant = %ctx.tenant))]
    async fn create_resource(
        &self,
        ctx: &ExecutionContext,
        path: &str,
        scopes: &[RemoteScope],
    ) -> AuthzResult<RemoteResource> {
        let body = json!({
            "name": path,
            "uris": [path],
            "scopes": scopes,
        });
        let request = self
            .authz_request(ctx, Method::POST, "resource")
            .await?
            .json(&body);
        self.fetch(ctx, request, "resource", path).await
    }

    async fn delete_resource(&self, ctx: &ExecutionContext, id: &str) -> AuthzResult<()> {
        let request = self
            .authz_request(ctx, Method::DELETE, &format!("resource/{id}"))
            .await?;
        self.send(ctx, request, "resource", id).await?;
        Ok(())
    }

    async fn find_scope(
        &self,
        ctx: &ExecutionContext,
        name: &str,
    ) -> AuthzResult<Option<RemoteScope>> {
        let request = self
            .authz_request(ctx, Method::GET, "scope")
            .await?
            .query(&[("name", name), ("exactName", "true")]);
        let scopes: Vec<RemoteScope> = self.fetch(ctx, request, "scope", name).await?;
        Ok(scopes.into_iter().find(|s| s.name == name))
    }

    #[instrument(skip(self, ctx, policy), fields(tenant = %ctx.tenant, policy = %policy.name))]
    async fn create_policy(
        &self,
        ctx: &ExecutionContext,
        policy: &ExternalPolicy,
    ) -> AuthzResult<()> {
        let request = self
            .authz_request(ctx, Method::POST, &policy_path(policy))
            .await?
            .json(policy);
        self.send(ctx, request, "policy", &policy.name).await?;
        Ok(())
    }

    #[instrument(skip(self, ctx, policy), fields(tenant = %ctx.tenant, policy = %policy.name))]
    async fn update_policy(
        &self,
        ctx: &ExecutionContext,
        policy: &ExternalPolicy,
    ) -> AuthzResult<()> {
        let path = format!("{}/{}", policy_path(policy), policy.id);
        let request = self
            .authz_request(ctx, Method::PUT, &path)
            .await?
            .json(policy);
        self.send(ctx, request, "policy", &policy.name).await?;
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(tenant = %ctx.tenant))]
    async fn delete_policy(&self, ctx: &ExecutionContext, id: Uuid) -> AuthzResult<()> {
        let request = self
            .authz_request(ctx, Method::DELETE, &format!("policy/{id}"))
            .await?;
        self.send(ctx, request, "policy", &id.to_string()).await?;
        Ok(())
    }

    async fn find_policy(
        &self,
        ctx: &ExecutionContext,
        name: &str,
    ) -> AuthzResult<Option<ExternalPolicy>> {
        let request = self
            .authz_request(ctx, Method::GET, "policy/search")
            .await?
            .query(&[("name", name)]);
        self.fetch_optional(ctx, request, "policy", name).await
    }

    #[instrument(skip(self, ctx, permission), fields(tenant = %ctx.tenant, permission = %permission.name))]
    async fn create_permission(
        &self,
        ctx: &ExecutionContext,
        permission: &ScopePermission,
    ) -> AuthzResult<()> {
        let request = self
            .authz_request(ctx, Method::POST, "permission/scope")
            .await?
            .json(permission);
        self.send(ctx, request, "permission", &permission.name).await?;
        Ok(())
    }

    async fn find_permission(
        &self,
        ctx: &ExecutionContext,
        name: &str,
    ) -> AuthzResult<Option<ScopePermission>> {
        let request = self
            .authz_request(ctx, Method::GET, "permission/search")
            .await?
            .query(&[("name", name)]);
        self.fetch_optional(ctx, request, "permission", name).await
    }

    #[instrument(skip(self, ctx), fields(tenant = %ctx.tenant))]
    async fn delete_permission(&self, ctx: &ExecutionContext, name: &str) -> AuthzResult<()> {
        let permission = self
            .find_permission(ctx, name)
            .await?
            .ok_or_else(|| AuthzError::NotFound {
                kind: "permission",
                name: name.to_string(),
            })?;
        let id = permission.id.ok_or_else(|| AuthzError::Decode {
            message: format!("permission '{name}' has no id"),
        })?;
        let request = self
            .authz_request(ctx, Method::DELETE, &format!("permission/{id}"))
            .await?;
        self.send(ctx, request, "permission", name).await?;
        Ok(())
    }
}
