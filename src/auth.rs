use crate::dispatch::PATH_SEGMENT;
use crate::error::{ApiError, ApiResult};
use crate::types::AuthUser;
use crate::AppState;
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use percent_encoding::utf8_percent_encode;
use reqwest::Client;
use serde::Deserialize;

/// Resolves a bearer token into the calling user.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> ApiResult<AuthUser>;
}

#[derive(Debug, Deserialize)]
struct Introspection {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    sub: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PermissionGrant {
    user_id: String,
    organization_id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default = "default_active")]
    is_active: bool,
    #[serde(default)]
    profile_pic_url: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    permissions: Vec<String>,
}

fn default_active() -> bool {
    true
}

/// OAuth2 token introspection followed by a permission lookup at the user service.
#[derive(Debug, Clone)]
pub struct HttpIdentityResolver {
    http: Client,
    introspect_url: String,
    permission_url: String,
    required_scope: String,
}

impl HttpIdentityResolver {
    pub fn new(
        http: Client,
        introspect_url: impl Into<String>,
        permission_url: impl Into<String>,
        required_scope: impl Into<String>,
    ) -> Self {
        Self {
            http,
            introspect_url: introspect_url.into(),
            permission_url: permission_url.into().trim_end_matches('/').to_string(),
            required_scope: required_scope.into(),
        }
    }

    async fn introspect(&self, token: &str) -> ApiResult<String> {
        let resp = self
            .http
            .post(&self.introspect_url)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|err| ApiError::Internal(anyhow::anyhow!("introspection failed: {err}")))?;
        if !resp.status().is_success() {
            return Err(ApiError::Authorization("token rejected".to_string()));
        }
        let body: Introspection = resp
            .json()
            .await
            .map_err(|err| ApiError::Internal(anyhow::anyhow!("bad introspection body: {err}")))?;
        match (body.active, body.sub) {
            (true, Some(sub)) if !sub.is_empty() => Ok(sub),
            _ => Err(ApiError::Authorization("token is not active".to_string())),
        }
    }
}

#[async_trait]
impl IdentityResolver for HttpIdentityResolver {
    async fn resolve(&self, token: &str) -> ApiResult<AuthUser> {
        let username = self.introspect(token).await?;
        let url = format!(
            "{}/{}",
            self.permission_url,
            utf8_percent_encode(&username, PATH_SEGMENT)
        );
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| ApiError::Internal(anyhow::anyhow!("permission lookup failed: {err}")))?;
        if !resp.status().is_success() {
            return Err(ApiError::Authorization(format!(
                "no permissions for {username}"
            )));
        }
        let grant: PermissionGrant = resp
            .json()
            .await
            .map_err(|err| ApiError::Internal(anyhow::anyhow!("bad permission body: {err}")))?;

        if !grant.is_active {
            return Err(ApiError::Authorization("user is inactive".to_string()));
        }
        if !grant.permissions.iter().any(|p| p == &self.required_scope) {
            return Err(ApiError::Authorization(format!(
                "missing permission {}",
                self.required_scope
            )));
        }

        Ok(AuthUser {
            id: grant.user_id,
            organization_id: grant.organization_id,
            username: grant.username.or(Some(username)),
            first_name: grant.first_name,
            is_active: grant.is_active,
            profile_pic_url: grant.profile_pic_url,
            role: grant.role,
            permissions: grant.permissions,
        })
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Rejects requests without a valid bearer token and makes the resolved
/// [`AuthUser`] available as an extension.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(req.headers()).map(|t| t.to_string()) else {
        return ApiError::Authorization("missing bearer token".to_string()).into_response();
    };
    match state.identity.resolve(&token).await {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(err) => err.into_response(),
    }
}
