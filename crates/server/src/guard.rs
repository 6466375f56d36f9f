//! Guard checks: ordered authorization predicates run before any protocol handling.

use crate::auth::public_base_url;
use crate::config::{AuthConfig, GuardCheckConfig};
use crate::error::{Result, ServerError};
use crate::oidc::OidcValidator;
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse as _, Response};
use serde_json::Value;
use std::sync::Arc;

/// Why a guard check refused a request. Logged, never sent to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct GuardRejection(pub String);

/// Identity established by the guard chain, stored in request extensions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    /// Claims of a validated JWT, if a `jwt` check ran.
    pub claims: Option<Value>,
}

#[async_trait]
pub trait GuardCheck: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(Some(claims))` passes and contributes identity claims, `Ok(None)` passes.
    async fn check(&self, headers: &HeaderMap) -> std::result::Result<Option<Value>, GuardRejection>;
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())?;
    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .map(str::trim)?;
    (!token.is_empty()).then_some(token)
}

/// Passes when a non-empty bearer token is present.
#[derive(Debug, Clone, Copy, Default)]
pub struct BearerCheck;

#[async_trait]
impl GuardCheck for BearerCheck {
    fn name(&self) -> &'static str {
        "bearer"
    }

    async fn check(&self, headers: &HeaderMap) -> std::result::Result<Option<Value>, GuardRejection> {
        bearer_token(headers)
            .map(|_| None)
            .ok_or_else(|| GuardRejection("bearer token is required".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ApiKeyCheck {
    header: String,
    values: Vec<String>,
}

impl ApiKeyCheck {
    #[must_use]
    pub fn new(header: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            header: header.into(),
            values,
        }
    }
}

#[async_trait]
impl GuardCheck for ApiKeyCheck {
    fn name(&self) -> &'static str {
        "api_key"
    }

    async fn check(&self, headers: &HeaderMap) -> std::result::Result<Option<Value>, GuardRejection> {
        let presented = headers
            .get(self.header.as_str())
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GuardRejection(format!("{} header is required", self.header)))?;
        if self.values.iter().any(|v| v == presented) {
            Ok(None)
        } else {
            Err(GuardRejection("invalid API key".to_string()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct JwtCheck {
    validator: OidcValidator,
}

impl JwtCheck {
    #[must_use]
    pub fn new(validator: OidcValidator) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl GuardCheck for JwtCheck {
    fn name(&self) -> &'static str {
        "jwt"
    }

    async fn check(&self, headers: &HeaderMap) -> std::result::Result<Option<Value>, GuardRejection> {
        let jwt = bearer_token(headers)
            .ok_or_else(|| GuardRejection("bearer token is required".to_string()))?;
        self.validator
            .validate(jwt)
            .await
            .map(Some)
            .map_err(|e| GuardRejection(format!("invalid bearer token: {e:#}")))
    }
}

/// The configured checks, run in order; the first failure aborts.
#[derive(Clone, Default)]
pub struct GuardChain {
    checks: Vec<Arc<dyn GuardCheck>>,
    /// Advertise protected-resource metadata in `WWW-Authenticate`.
    advertise_resource_metadata: bool,
    public_url: Option<String>,
}

impl std::fmt::Debug for GuardChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.checks.iter().map(|c| c.name()).collect();
        f.debug_struct("GuardChain")
            .field("checks", &names)
            .field("advertise_resource_metadata", &self.advertise_resource_metadata)
            .finish_non_exhaustive()
    }
}

impl GuardChain {
    #[must_use]
    pub fn new(checks: Vec<Arc<dyn GuardCheck>>) -> Self {
        Self {
            checks,
            advertise_resource_metadata: false,
            public_url: None,
        }
    }

    /// Build the chain described by `auth.guard_checks`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Configuration`] when a JWT issuer cannot be discovered.
    pub async fn from_config(auth: &AuthConfig, http: &reqwest::Client) -> Result<Self> {
        let mut checks: Vec<Arc<dyn GuardCheck>> = Vec::with_capacity(auth.guard_checks.len());
        for check in &auth.guard_checks {
            let built: Arc<dyn GuardCheck> = match check {
                GuardCheckConfig::Bearer => Arc::new(BearerCheck),
                GuardCheckConfig::ApiKey { header, values } => {
                    Arc::new(ApiKeyCheck::new(header.clone(), values.clone()))
                }
                GuardCheckConfig::Jwt {
                    issuer,
                    audiences,
                    jwks_uri,
                    leeway_secs,
                } => {
                    let validator = OidcValidator::discover(
                        http.clone(),
                        issuer,
                        audiences.clone(),
                        jwks_uri.clone(),
                        *leeway_secs,
                    )
                    .await
                    .map_err(|e| {
                        ServerError::Configuration(format!(
                            "jwt guard check for issuer '{issuer}': {e:#}"
                        ))
                    })?;
                    Arc::new(JwtCheck::new(validator))
                }
            };
            checks.push(built);
        }
        Ok(Self {
            checks,
            advertise_resource_metadata: auth.serves_metadata(),
            public_url: auth.public_url.clone(),
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check against `headers`.
    ///
    /// # Errors
    ///
    /// Returns the first [`GuardRejection`].
    pub async fn run(&self, headers: &HeaderMap) -> std::result::Result<Identity, GuardRejection> {
        let mut identity = Identity::default();
        for check in &self.checks {
            if let Some(claims) = check.check(headers).await? {
                identity.claims = Some(claims);
            }
        }
        Ok(identity)
    }

    /// Uniform `401`. The body says nothing about the requested resource.
    #[must_use]
    pub fn unauthorized(&self, headers: &HeaderMap) -> Response {
        let challenge = if self.advertise_resource_metadata {
            let base = public_base_url(self.public_url.as_deref(), headers);
            format!(
                "Bearer resource_metadata=\"{base}/.well-known/oauth-protected-resource\""
            )
        } else {
            "Bearer".to_string()
        };
        let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

/// axum middleware running the guard chain ahead of the protocol routes.
pub async fn require_guards(
    State(guard): State<Arc<GuardChain>>,
    mut req: Request,
    next: Next,
) -> Response {
    match guard.run(req.headers()).await {
        Ok(identity) => {
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(rejection) => {
            tracing::warn!(reason = %rejection, path = %req.uri().path(), "Guard check failed");
            guard.unauthorized(req.headers())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl GuardCheck for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn check(&self, _headers: &HeaderMap) -> std::result::Result<Option<Value>, GuardRejection> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(json!({"sub": "u1"})))
        }
    }

    #[tokio::test]
    async fn bearer_check_requires_a_token() {
        let chain = GuardChain::new(vec![Arc::new(BearerCheck)]);
        assert!(chain.run(&HeaderMap::new()).await.is_err());
        assert!(chain.run(&headers(&[("authorization", "Bearer ")])).await.is_err());
        assert!(chain.run(&headers(&[("authorization", "Bearer t")])).await.is_ok());
    }

    #[tokio::test]
    async fn api_key_check_matches_configured_values() {
        let chain = GuardChain::new(vec![Arc::new(ApiKeyCheck::new(
            "x-api-key",
            vec!["k1".into(), "k2".into()],
        ))]);
        assert!(chain.run(&headers(&[("x-api-key", "k2")])).await.is_ok());
        let err = chain.run(&headers(&[("x-api-key", "nope")])).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid API key");
    }

    #[tokio::test]
    async fn first_failure_stops_the_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = GuardChain::new(vec![
            Arc::new(BearerCheck),
            Arc::new(Counting(Arc::clone(&calls))),
        ]);
        assert!(chain.run(&HeaderMap::new()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let identity = chain
            .run(&headers(&[("authorization", "Bearer t")]))
            .await
            .unwrap();
        assert_eq!(identity.claims, Some(json!({"sub": "u1"})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unauthorized_points_at_resource_metadata() {
        let chain = GuardChain {
            checks: Vec::new(),
            advertise_resource_metadata: true,
            public_url: Some("https://api.example.com".into()),
        };
        let response = chain.unauthorized(&HeaderMap::new());
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            "Bearer resource_metadata=\"https://api.example.com/.well-known/oauth-protected-resource\""
        );
    }
}
