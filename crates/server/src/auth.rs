//! OAuth compatibility proxy.
//!
//! Fills the gaps between agent clients and OAuth providers: a discovery document (custom,
//! fetched from upstream, or synthesized), authorize/token proxies that add `audience` and
//! default scopes the clients forget, and an optional fake dynamic client registration that
//! hands out one pre-registered client.
//!
//! With a callback route configured, the authorize proxy points the provider at this server
//! and carries the client's redirect URI in `state`. The callback exchanges the code itself and
//! redirects to the client with the token, so only this server's callback has to be registered
//! with the provider.
//!
//! The fake registration is a compatibility shim for providers without RFC 7591 support; it
//! gives no security guarantee.

use crate::config::AuthConfig;
use crate::error::{Result, ServerError};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Form, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use url::Url;

pub const PROTECTED_RESOURCE_PATH: &str = "/.well-known/oauth-protected-resource";

/// How far the proxy got when it was configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthProxyState {
    /// No auth config: no proxy routes exist.
    Unconfigured,
    /// A discovery document is served.
    MetadataReady,
    /// Fake dynamic registration is served as well.
    RegistrationProxied,
    /// Authorize and token requests are rewritten and forwarded.
    TokenProxied,
}

#[derive(Debug, Clone)]
enum MetadataSource {
    Custom(Value),
    Upstream(Map<String, Value>),
    Synthesized {
        issuer: String,
        authorization_endpoint: String,
        token_endpoint: String,
    },
}

#[derive(Debug, Clone)]
pub struct AuthProxy {
    config: AuthConfig,
    metadata: MetadataSource,
    /// Upstream authorize/token endpoints; set when the proxies are enabled.
    upstream: Option<(String, String)>,
    fake_registration: bool,
    http: reqwest::Client,
}

/// Base URL of this server as seen by the caller, without a trailing `/`.
#[must_use]
pub fn public_base_url(configured: Option<&str>, headers: &HeaderMap) -> String {
    if let Some(url) = configured {
        return url.trim_end_matches('/').to_string();
    }
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let scheme = header_str("x-forwarded-proto").unwrap_or("http");
    let host = header_str("x-forwarded-host")
        .or_else(|| header_str(header::HOST.as_str()))
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

impl AuthProxy {
    /// Set up the proxy described by `config`.
    ///
    /// Returns `Ok(None)` when no document would be served (guard checks only).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Auth`] if upstream metadata cannot be fetched and
    /// [`ServerError::Configuration`] if a required field cannot be resolved.
    pub async fn new(config: &AuthConfig, http: reqwest::Client) -> Result<Option<Self>> {
        if !config.serves_metadata() && !config.setup_fake_dynamic_registration {
            return Ok(None);
        }

        let metadata = if let Some(custom) = &config.custom_oauth_metadata {
            MetadataSource::Custom(custom.clone())
        } else if let Some(url) = config.oauth_metadata_url.as_deref() {
            MetadataSource::Upstream(fetch_metadata(&http, url).await?)
        } else {
            let required = |value: &Option<String>, field: &str| {
                value.clone().ok_or_else(|| {
                    ServerError::Configuration(format!(
                        "auth.{field} is required to synthesize the discovery document"
                    ))
                })
            };
            MetadataSource::Synthesized {
                issuer: required(&config.issuer, "issuer")?,
                authorization_endpoint: required(&config.authorize_url, "authorize_url")?,
                token_endpoint: required(&config.token_url, "token_url")?,
            }
        };
        if let Some(url) = &config.user_info_url {
            Url::parse(url).map_err(|e| {
                ServerError::Configuration(format!("invalid auth.user_info_url '{url}': {e}"))
            })?;
        }

        let upstream = if config.setup_proxies {
            let authorize = config
                .authorize_url
                .clone()
                .or_else(|| metadata_field(&metadata, "authorization_endpoint"))
                .ok_or_else(|| {
                    ServerError::Configuration(
                        "auth.authorize_url is required when setup_proxies is enabled".to_string(),
                    )
                })?;
            let token = config
                .token_url
                .clone()
                .or_else(|| metadata_field(&metadata, "token_endpoint"))
                .ok_or_else(|| {
                    ServerError::Configuration(
                        "auth.token_url is required when setup_proxies is enabled".to_string(),
                    )
                })?;
            for url in [&authorize, &token] {
                Url::parse(url).map_err(|e| {
                    ServerError::Configuration(format!("invalid upstream OAuth URL '{url}': {e}"))
                })?;
            }
            Some((authorize, token))
        } else {
            None
        };

        let native_registration = match &metadata {
            MetadataSource::Upstream(map) => map.contains_key("registration_endpoint"),
            MetadataSource::Custom(_) | MetadataSource::Synthesized { .. } => false,
        };
        let fake_registration = config.setup_fake_dynamic_registration && !native_registration;
        if config.setup_fake_dynamic_registration && native_registration {
            tracing::info!("Upstream supports dynamic client registration; fake registration disabled");
        }

        let proxy = Self {
            config: config.clone(),
            metadata,
            upstream,
            fake_registration,
            http,
        };
        tracing::info!(state = ?proxy.state(), "OAuth proxy configured");
        Ok(Some(proxy))
    }

    #[must_use]
    pub fn state(&self) -> AuthProxyState {
        if self.upstream.is_some() {
            AuthProxyState::TokenProxied
        } else if self.fake_registration {
            AuthProxyState::RegistrationProxied
        } else {
            AuthProxyState::MetadataReady
        }
    }

    /// The authorization server discovery document, with proxy endpoints under `base`.
    #[must_use]
    pub fn discovery_document(&self, base: &str) -> Value {
        match &self.metadata {
            MetadataSource::Custom(doc) => doc.clone(),
            MetadataSource::Upstream(map) => {
                let mut doc = map.clone();
                if self.upstream.is_some() {
                    doc.insert(
                        "authorization_endpoint".to_string(),
                        json!(endpoint(base, &self.config.authorize_path)),
                    );
                    doc.insert(
                        "token_endpoint".to_string(),
                        json!(endpoint(base, &self.config.token_path)),
                    );
                }
                if self.fake_registration {
                    doc.insert(
                        "registration_endpoint".to_string(),
                        json!(endpoint(base, &self.config.register_path)),
                    );
                }
                if let Some(url) = &self.config.user_info_url {
                    doc.insert("userinfo_endpoint".to_string(), json!(url));
                }
                Value::Object(doc)
            }
            MetadataSource::Synthesized {
                issuer,
                authorization_endpoint,
                token_endpoint,
            } => {
                let (authorize, token) = match &self.upstream {
                    Some(_) => (
                        endpoint(base, &self.config.authorize_path),
                        endpoint(base, &self.config.token_path),
                    ),
                    None => (authorization_endpoint.clone(), token_endpoint.clone()),
                };
                let mut doc = json!({
                    "issuer": issuer,
                    "authorization_endpoint": authorize,
                    "token_endpoint": token,
                    "scopes_supported": self.scopes(),
                    "response_types_supported": ["code"],
                    "grant_types_supported": ["authorization_code", "refresh_token"],
                    "token_endpoint_auth_methods_supported": ["client_secret_post", "none"],
                    "code_challenge_methods_supported": ["S256"],
                });
                if let Some(obj) = doc.as_object_mut() {
                    if self.fake_registration {
                        obj.insert(
                            "registration_endpoint".to_string(),
                            json!(endpoint(base, &self.config.register_path)),
                        );
                    }
                    if let Some(url) = &self.config.user_info_url {
                        obj.insert("userinfo_endpoint".to_string(), json!(url));
                    }
                }
                doc
            }
        }
    }

    /// RFC 9728 protected resource metadata.
    #[must_use]
    pub fn protected_resource_metadata(&self, base: &str) -> Value {
        // With the proxies on, clients must discover this server's document, not upstream's.
        let authorization_server = if self.upstream.is_some() {
            base.to_string()
        } else {
            self.config
                .issuer
                .clone()
                .or_else(|| metadata_field(&self.metadata, "issuer"))
                .unwrap_or_else(|| base.to_string())
        };
        let mut doc = json!({
            "resource": base,
            "authorization_servers": [authorization_server],
            "scopes_supported": self.scopes(),
            "bearer_methods_supported": ["header"],
        });
        if let Some(audience) = &self.config.audience
            && let Some(obj) = doc.as_object_mut()
        {
            obj.insert("audience".to_string(), json!([audience]));
        }
        doc
    }

    fn scopes(&self) -> Vec<&str> {
        self.config.default_scope.split_whitespace().collect()
    }

    /// Rewrite an authorize request and return the upstream URL to redirect to.
    ///
    /// With a callback route, `redirect_uri` becomes `{base}{callback_path}` and `state` carries
    /// the client's redirect URI and original state.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidArguments`] when `redirect_uri` is missing (or not absolute
    /// in callback mode) and [`ServerError::Configuration`] when the proxies are off.
    pub fn authorize_redirect(&self, params: &[(String, String)], base: &str) -> Result<String> {
        let (authorize_url, _) = self.upstream.as_ref().ok_or_else(|| {
            ServerError::Configuration("authorize proxy is not enabled".to_string())
        })?;

        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .filter(|v| !v.is_empty())
        };
        let Some(redirect_uri) = get("redirect_uri") else {
            return Err(ServerError::InvalidArguments {
                message: "redirect_uri parameter is required".to_string(),
                details: json!({"parameter": "redirect_uri"}),
            });
        };
        let callback = self.config.callback_path.as_deref();

        let scope = merge_scopes(get("scope"), &self.config.default_scope);
        if get("scope").is_none() {
            tracing::warn!("Authorize request without scopes; using default scopes");
        }

        let mut out: Vec<(String, String)> = params
            .iter()
            .filter(|(k, _)| k != "scope")
            .filter(|(k, _)| callback.is_none() || (k != "redirect_uri" && k != "state"))
            .filter(|(_, v)| !v.is_empty())
            .cloned()
            .collect();
        if let Some(callback) = callback {
            Url::parse(redirect_uri).map_err(|e| ServerError::InvalidArguments {
                message: format!("redirect_uri must be an absolute URL: {e}"),
                details: json!({"parameter": "redirect_uri"}),
            })?;
            let state = CallbackState {
                client_redirect_uri: redirect_uri.to_string(),
                original_state: get("state").map(str::to_string),
            };
            out.push(("redirect_uri".to_string(), endpoint(base, callback)));
            out.push(("state".to_string(), state.encode()?));
        }
        let mut set_if_absent = |key: &str, value: Option<&str>| {
            if let Some(value) = value
                && !out.iter().any(|(k, _)| k == key)
            {
                out.push((key.to_string(), value.to_string()));
            }
        };
        set_if_absent("response_type", Some("code"));
        set_if_absent("client_id", self.config.client_id.as_deref());
        set_if_absent("audience", self.config.audience.as_deref());
        if !scope.is_empty() {
            out.push(("scope".to_string(), scope));
        }

        let mut url = Url::parse(authorize_url)
            .map_err(|e| ServerError::Configuration(format!("invalid authorize URL: {e}")))?;
        url.query_pairs_mut().extend_pairs(out.iter());
        Ok(url.to_string())
    }

    /// Fill in what a token request omitted. Explicit values are never replaced.
    #[must_use]
    pub fn rewrite_token_form(
        &self,
        mut form: Vec<(String, String)>,
        has_basic_auth: bool,
    ) -> Vec<(String, String)> {
        let present = |form: &[(String, String)], key: &str| {
            form.iter().any(|(k, v)| k == key && !v.is_empty())
        };
        let inject = |form: &mut Vec<(String, String)>, key: &str, value: Option<&str>| {
            if let Some(value) = value.filter(|v| !v.is_empty())
                && !present(form.as_slice(), key)
            {
                form.retain(|(k, _)| k != key);
                form.push((key.to_string(), value.to_string()));
            }
        };

        inject(&mut form, "scope", Some(self.config.default_scope.as_str()));
        inject(&mut form, "audience", self.config.audience.as_deref());
        if !has_basic_auth {
            inject(&mut form, "client_id", self.config.client_id.as_deref());
            inject(&mut form, "client_secret", self.config.client_secret.as_deref());
        }
        form
    }

    /// The fake dynamic registration response. Identical client credentials on every call.
    #[must_use]
    pub fn registration_response(&self, request: &Value) -> Value {
        let field = |key: &str| request.get(key).filter(|v| !v.is_null()).cloned();
        let mut doc = json!({
            "client_id": self.config.client_id,
            "client_name": field("client_name").unwrap_or_else(|| json!("MCP Server")),
            "redirect_uris": field("redirect_uris").unwrap_or_else(|| json!([])),
            "grant_types": field("grant_types").unwrap_or_else(|| json!(["authorization_code"])),
            "token_endpoint_auth_method": field("token_endpoint_auth_method")
                .unwrap_or_else(|| json!("none")),
        });
        if let Some(secret) = &self.config.client_secret
            && let Some(obj) = doc.as_object_mut()
        {
            obj.insert("client_secret".to_string(), json!(secret));
        }
        doc
    }

    /// Routes for the configured state.
    pub fn router(self: Arc<Self>) -> Router {
        let mut router = Router::new()
            .route(&self.config.metadata_path, get(discovery_handler))
            .route(PROTECTED_RESOURCE_PATH, get(protected_resource_handler));
        if self.upstream.is_some() {
            router = router
                .route(&self.config.authorize_path, get(authorize_handler))
                .route(&self.config.token_path, post(token_handler));
            if let Some(callback) = &self.config.callback_path {
                router = router.route(callback, get(callback_handler));
            }
        }
        if self.fake_registration {
            router = router.route(&self.config.register_path, post(register_handler));
        }
        router.with_state(self)
    }

    fn base_url(&self, headers: &HeaderMap) -> String {
        public_base_url(self.config.public_url.as_deref(), headers)
    }

    /// Trade an authorization code for tokens at the upstream token endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UpstreamUnavailable`] on network failure and [`ServerError::Auth`]
    /// when the provider rejects the code or answers without an access token.
    pub async fn exchange_code(&self, code: &str, callback_uri: &str) -> Result<Map<String, Value>> {
        let (_, token_url) = self.upstream.as_ref().ok_or_else(|| {
            ServerError::Configuration("token proxy is not enabled".to_string())
        })?;
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.config.client_id.as_deref().unwrap_or_default()),
            ("client_secret", self.config.client_secret.as_deref().unwrap_or_default()),
            ("redirect_uri", callback_uri),
        ];
        let response = self
            .http
            .post(token_url)
            .header(header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                ServerError::UpstreamUnavailable(
                    routebridge_http_tools::error::sanitize_reqwest_error(&e),
                )
            })?;
        if !response.status().is_success() {
            return Err(ServerError::Auth(format!(
                "token exchange failed with status {}",
                response.status().as_u16()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ServerError::Auth(format!("invalid token response: {e}")))?;
        match body {
            Value::Object(map)
                if map
                    .get("access_token")
                    .and_then(Value::as_str)
                    .is_some_and(|t| !t.is_empty()) =>
            {
                Ok(map)
            }
            _ => Err(ServerError::Auth(
                "token response carries no access_token".to_string(),
            )),
        }
    }

    /// The user info document for `access_token`, when a user info endpoint is configured.
    /// Failures are logged and yield `None`.
    async fn fetch_user_info(&self, access_token: &str) -> Option<Value> {
        let url = self.config.user_info_url.as_deref()?;
        let response = match self.http.get(url).bearer_auth(access_token).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(
                    error = %routebridge_http_tools::error::sanitize_reqwest_error(&e),
                    "User info request failed"
                );
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::warn!(status = response.status().as_u16(), "User info request rejected");
            return None;
        }
        match response.json::<Value>().await {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(error = %e, "User info response is not JSON");
                None
            }
        }
    }
}

/// Client callback details carried through the provider in the `state` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CallbackState {
    client_redirect_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_state: Option<String>,
}

impl CallbackState {
    fn encode(&self) -> Result<String> {
        let raw = serde_json::to_vec(self)
            .map_err(|e| ServerError::Auth(format!("failed to encode callback state: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    fn decode(encoded: &str) -> Option<Self> {
        let raw = URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('=')).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// The client's redirect URI with `pairs` and the original state appended.
    fn client_url(&self, pairs: &[(&str, String)]) -> Result<String> {
        let mut url = Url::parse(&self.client_redirect_uri).map_err(|e| {
            ServerError::InvalidArguments {
                message: format!("client redirect_uri is not a valid URL: {e}"),
                details: json!({"parameter": "redirect_uri"}),
            }
        })?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in pairs {
                query.append_pair(key, value);
            }
            if let Some(state) = &self.original_state {
                query.append_pair("state", state);
            }
        }
        Ok(url.to_string())
    }
}

/// Query parameters forwarded to the client after a successful code exchange.
fn token_callback_pairs(
    token: &Map<String, Value>,
    user_info: Option<&Value>,
) -> Vec<(&'static str, String)> {
    let text = |value: &Value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let field = |key: &str| token.get(key).filter(|v| !v.is_null()).map(text);

    let mut pairs = vec![
        ("access_token", field("access_token").unwrap_or_default()),
        (
            "token_type",
            field("token_type").unwrap_or_else(|| "Bearer".to_string()),
        ),
    ];
    for key in ["expires_in", "refresh_token", "scope"] {
        if let Some(value) = field(key) {
            pairs.push((key, value));
        }
    }
    if let Some(info) = user_info {
        pairs.push(("user_info", info.to_string()));
    }
    pairs
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{base}{path}")
}

/// `default_scope` merged into `requested` without duplicates, requested scopes first.
fn merge_scopes(requested: Option<&str>, default_scope: &str) -> String {
    let mut scopes: Vec<&str> = requested
        .unwrap_or_default()
        .split_whitespace()
        .collect();
    for scope in default_scope.split_whitespace() {
        if !scopes.contains(&scope) {
            scopes.push(scope);
        }
    }
    scopes.join(" ")
}

fn metadata_field(metadata: &MetadataSource, key: &str) -> Option<String> {
    let value = match metadata {
        MetadataSource::Custom(doc) => doc.get(key),
        MetadataSource::Upstream(map) => map.get(key),
        MetadataSource::Synthesized {
            issuer,
            authorization_endpoint,
            token_endpoint,
        } => {
            return match key {
                "issuer" => Some(issuer.clone()),
                "authorization_endpoint" => Some(authorization_endpoint.clone()),
                "token_endpoint" => Some(token_endpoint.clone()),
                _ => None,
            };
        }
    };
    value.and_then(Value::as_str).map(str::to_string)
}

async fn fetch_metadata(http: &reqwest::Client, url: &str) -> Result<Map<String, Value>> {
    tracing::info!(url = %url, "Fetching upstream OAuth metadata");
    let response = http
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| {
            ServerError::Auth(format!(
                "failed to fetch OAuth metadata from '{url}': {}",
                routebridge_http_tools::error::sanitize_reqwest_error(&e)
            ))
        })?;
    let doc: Value = response
        .json()
        .await
        .map_err(|e| ServerError::Auth(format!("invalid OAuth metadata from '{url}': {e}")))?;
    match doc {
        Value::Object(map) => Ok(map),
        _ => Err(ServerError::Auth(format!(
            "OAuth metadata from '{url}' is not an object"
        ))),
    }
}

fn oauth_error(status: StatusCode, error: &str, description: &str) -> Response {
    (
        status,
        axum::Json(json!({"error": error, "error_description": description})),
    )
        .into_response()
}

async fn discovery_handler(State(proxy): State<Arc<AuthProxy>>, headers: HeaderMap) -> Response {
    let base = proxy.base_url(&headers);
    axum::Json(proxy.discovery_document(&base)).into_response()
}

async fn protected_resource_handler(
    State(proxy): State<Arc<AuthProxy>>,
    headers: HeaderMap,
) -> Response {
    let base = proxy.base_url(&headers);
    axum::Json(proxy.protected_resource_metadata(&base)).into_response()
}

fn redirect(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = StatusCode::FOUND.into_response();
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "redirect parameters are not valid header text",
        ),
    }
}

async fn authorize_handler(
    State(proxy): State<Arc<AuthProxy>>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let base = proxy.base_url(&headers);
    match proxy.authorize_redirect(&params, &base) {
        Ok(location) => {
            tracing::debug!("Redirecting authorize request upstream");
            redirect(&location)
        }
        Err(e @ ServerError::InvalidArguments { .. }) => {
            oauth_error(StatusCode::BAD_REQUEST, "invalid_request", &e.to_string())
        }
        Err(e) => {
            tracing::error!(error = %e, "Authorize proxy failed");
            oauth_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", "authorize proxy failed")
        }
    }
}

async fn token_handler(
    State(proxy): State<Arc<AuthProxy>>,
    headers: HeaderMap,
    Form(form): Form<Vec<(String, String)>>,
) -> Response {
    let Some((_, token_url)) = proxy.upstream.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let basic_auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| v.starts_with("Basic "));
    let form = proxy.rewrite_token_form(form, basic_auth.is_some());

    let mut request = proxy
        .http
        .post(token_url)
        .header(header::ACCEPT, "application/json")
        .form(&form);
    if let Some(basic) = basic_auth {
        request = request.header(header::AUTHORIZATION, basic);
    }

    let upstream = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(
                error = %routebridge_http_tools::error::sanitize_reqwest_error(&e),
                "Token endpoint unreachable"
            );
            return oauth_error(
                StatusCode::BAD_GATEWAY,
                "temporarily_unavailable",
                "Network error communicating with OAuth provider",
            );
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream.headers().get(header::CONTENT_TYPE).cloned();
    let body = match upstream.bytes().await {
        Ok(b) => b,
        Err(_) => {
            return oauth_error(
                StatusCode::BAD_GATEWAY,
                "temporarily_unavailable",
                "Failed to read OAuth provider response",
            );
        }
    };
    tracing::debug!(status = status.as_u16(), "Relayed token response");

    let mut response = (status, body).into_response();
    if let Some(ct) = content_type {
        response.headers_mut().insert(header::CONTENT_TYPE, ct);
    }
    response
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn callback_handler(
    State(proxy): State<Arc<AuthProxy>>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let state = query.state.as_deref().and_then(CallbackState::decode);

    if let Some(error) = query.error.as_deref() {
        tracing::warn!(
            error,
            description = ?query.error_description,
            "OAuth provider returned an error"
        );
        if let Some(state) = &state {
            let mut pairs = vec![("error", error.to_string())];
            if let Some(description) = &query.error_description {
                pairs.push(("error_description", description.clone()));
            }
            if let Ok(location) = state.client_url(&pairs) {
                return redirect(&location);
            }
        }
        let description = query.error_description.as_deref().unwrap_or(error);
        return oauth_error(
            StatusCode::BAD_REQUEST,
            error,
            &format!("OAuth error: {description}"),
        );
    }

    let Some(code) = query.code.as_deref().filter(|c| !c.is_empty()) else {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Authorization code is required",
        );
    };
    if query.state.is_none() {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "State parameter is required");
    }
    let Some(state) = state else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "Invalid state parameter");
    };
    let Some(callback_path) = proxy.config.callback_path.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let callback_uri = endpoint(&proxy.base_url(&headers), callback_path);
    let token = match proxy.exchange_code(code, &callback_uri).await {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(error = %e, "Authorization code exchange failed");
            let description = match e {
                ServerError::UpstreamUnavailable(_) => {
                    "Network error communicating with OAuth provider"
                }
                _ => "Failed to exchange authorization code for token",
            };
            return oauth_error(StatusCode::BAD_GATEWAY, "server_error", description);
        }
    };

    let access_token = token
        .get("access_token")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let user_info = proxy.fetch_user_info(access_token).await;
    match state.client_url(&token_callback_pairs(&token, user_info.as_ref())) {
        Ok(location) => {
            tracing::debug!("Forwarding token to client callback");
            redirect(&location)
        }
        Err(e) => oauth_error(StatusCode::BAD_REQUEST, "invalid_request", &e.to_string()),
    }
}

async fn register_handler(State(proxy): State<Arc<AuthProxy>>, body: Bytes) -> Response {
    let request: Value = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        match serde_json::from_slice(&body) {
            Ok(v @ Value::Object(_)) => v,
            _ => {
                return oauth_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_client_metadata",
                    "registration request must be a JSON object",
                );
            }
        }
    };
    (
        StatusCode::CREATED,
        axum::Json(proxy.registration_response(&request)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "http://127.0.0.1:8000";

    fn config() -> AuthConfig {
        AuthConfig {
            issuer: Some("https://idp.example.com/".into()),
            authorize_url: Some("https://idp.example.com/authorize".into()),
            token_url: Some("https://idp.example.com/oauth/token".into()),
            audience: Some("https://api.example.com".into()),
            client_id: Some("client-1".into()),
            client_secret: Some("secret-1".into()),
            setup_proxies: true,
            setup_fake_dynamic_registration: true,
            ..AuthConfig::default()
        }
    }

    async fn proxy(config: AuthConfig) -> AuthProxy {
        AuthProxy::new(&config, reqwest::Client::new())
            .await
            .unwrap()
            .unwrap()
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn query_of(url: &str) -> Vec<(String, String)> {
        Url::parse(url).unwrap().query_pairs().into_owned().collect()
    }

    fn get<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
        pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[tokio::test]
    async fn guard_only_config_is_unconfigured() {
        let cfg = AuthConfig {
            issuer: Some("https://idp.example.com/".into()),
            ..AuthConfig::default()
        };
        assert!(AuthProxy::new(&cfg, reqwest::Client::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn synthesized_discovery_document() {
        let p = proxy(config()).await;
        assert_eq!(p.state(), AuthProxyState::TokenProxied);
        let doc = p.discovery_document("http://127.0.0.1:8000");
        assert_eq!(doc["issuer"], "https://idp.example.com/");
        assert_eq!(doc["authorization_endpoint"], "http://127.0.0.1:8000/oauth/authorize");
        assert_eq!(doc["token_endpoint"], "http://127.0.0.1:8000/oauth/token");
        assert_eq!(doc["registration_endpoint"], "http://127.0.0.1:8000/oauth/register");
        assert_eq!(doc["scopes_supported"], json!(["openid", "profile", "email"]));
        assert_eq!(doc["code_challenge_methods_supported"], json!(["S256"]));
    }

    #[tokio::test]
    async fn custom_metadata_is_served_verbatim() {
        let custom = json!({"issuer": "https://custom.example.com", "x-extra": 1});
        let p = proxy(AuthConfig {
            custom_oauth_metadata: Some(custom.clone()),
            setup_proxies: false,
            setup_fake_dynamic_registration: false,
            ..config()
        })
        .await;
        assert_eq!(p.state(), AuthProxyState::MetadataReady);
        assert_eq!(p.discovery_document("http://x"), custom);
        assert_eq!(
            p.protected_resource_metadata("http://x")["authorization_servers"],
            json!(["https://idp.example.com/"])
        );
    }

    #[tokio::test]
    async fn authorize_merges_scopes_and_injects_audience() {
        let p = proxy(config()).await;
        let params = pairs(&[
            ("redirect_uri", "http://localhost:3334/callback"),
            ("scope", "read email"),
            ("state", "xyz"),
            ("code_challenge", "abc"),
            ("code_challenge_method", "S256"),
        ]);
        let location = p.authorize_redirect(&params, BASE).unwrap();
        assert!(location.starts_with("https://idp.example.com/authorize?"));
        let q = query_of(&location);
        assert_eq!(get(&q, "scope"), Some("read email openid profile"));
        assert_eq!(get(&q, "audience"), Some("https://api.example.com"));
        assert_eq!(get(&q, "client_id"), Some("client-1"));
        assert_eq!(get(&q, "response_type"), Some("code"));
        assert_eq!(get(&q, "redirect_uri"), Some("http://localhost:3334/callback"));
        assert_eq!(get(&q, "state"), Some("xyz"));
        assert_eq!(get(&q, "code_challenge"), Some("abc"));
    }

    #[tokio::test]
    async fn authorize_keeps_explicit_client_and_audience() {
        let p = proxy(config()).await;
        let params = pairs(&[
            ("redirect_uri", "http://localhost/cb"),
            ("client_id", "other"),
            ("audience", "aud-2"),
        ]);
        let location = p.authorize_redirect(&params, BASE).unwrap();
        let q = query_of(&location);
        assert_eq!(get(&q, "client_id"), Some("other"));
        assert_eq!(get(&q, "audience"), Some("aud-2"));
        assert_eq!(get(&q, "scope"), Some("openid profile email"));
    }

    #[tokio::test]
    async fn authorize_requires_redirect_uri() {
        let p = proxy(config()).await;
        let err = p
            .authorize_redirect(&pairs(&[("scope", "openid")]), BASE)
            .unwrap_err();
        assert_eq!(err.to_string(), "redirect_uri parameter is required");
    }

    #[tokio::test]
    async fn token_scope_is_injected_only_when_absent() {
        let p = proxy(config()).await;

        let form = p.rewrite_token_form(
            pairs(&[("grant_type", "authorization_code"), ("code", "c")]),
            false,
        );
        assert_eq!(get(&form, "scope"), Some("openid profile email"));
        assert_eq!(get(&form, "audience"), Some("https://api.example.com"));
        assert_eq!(get(&form, "client_id"), Some("client-1"));
        assert_eq!(get(&form, "client_secret"), Some("secret-1"));

        let form = p.rewrite_token_form(
            pairs(&[("grant_type", "authorization_code"), ("scope", "foo")]),
            true,
        );
        assert_eq!(get(&form, "scope"), Some("foo"));
        assert_eq!(get(&form, "client_secret"), None);
    }

    #[tokio::test]
    async fn fake_registration_is_stable() {
        let p = proxy(config()).await;
        let request = json!({"client_name": "Inspector", "redirect_uris": ["http://localhost/cb"]});
        let first = p.registration_response(&request);
        let second = p.registration_response(&json!({}));
        assert_eq!(first["client_id"], "client-1");
        assert_eq!(first["client_id"], second["client_id"]);
        assert_eq!(first["client_secret"], second["client_secret"]);
        assert_eq!(first["client_name"], "Inspector");
        assert_eq!(second["client_name"], "MCP Server");
        assert_eq!(second["grant_types"], json!(["authorization_code"]));
        assert_eq!(second["token_endpoint_auth_method"], "none");
    }

    #[tokio::test]
    async fn synthesized_metadata_without_upstream_endpoints_is_rejected() {
        let cfg = AuthConfig {
            issuer: Some("https://idp.example.com/".into()),
            client_id: Some("client-1".into()),
            client_secret: Some("secret-1".into()),
            setup_fake_dynamic_registration: true,
            ..AuthConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("auth.authorize_url"), "{err}");

        let err = AuthProxy::new(&cfg, reqwest::Client::new()).await.unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
        assert!(err.to_string().contains("authorize_url"), "{err}");
    }

    #[tokio::test]
    async fn registration_only_document_names_upstream_endpoints() {
        let p = proxy(AuthConfig {
            setup_proxies: false,
            user_info_url: Some("https://idp.example.com/userinfo".into()),
            ..config()
        })
        .await;
        assert_eq!(p.state(), AuthProxyState::RegistrationProxied);
        let doc = p.discovery_document("http://x");
        assert_eq!(doc["authorization_endpoint"], "https://idp.example.com/authorize");
        assert_eq!(doc["token_endpoint"], "https://idp.example.com/oauth/token");
        assert_eq!(doc["registration_endpoint"], "http://x/oauth/register");
        assert_eq!(doc["userinfo_endpoint"], "https://idp.example.com/userinfo");
    }

    #[tokio::test]
    async fn callback_mode_routes_the_provider_back_here() {
        let p = proxy(AuthConfig {
            callback_path: Some("/oauth/callback".into()),
            ..config()
        })
        .await;
        let location = p
            .authorize_redirect(
                &pairs(&[
                    ("redirect_uri", "http://localhost:3334/cb?x=1"),
                    ("state", "client-state"),
                ]),
                "https://mcp.example.com",
            )
            .unwrap();
        let q = query_of(&location);
        assert_eq!(get(&q, "redirect_uri"), Some("https://mcp.example.com/oauth/callback"));
        assert_eq!(q.iter().filter(|(k, _)| k == "state").count(), 1);

        let state = CallbackState::decode(get(&q, "state").unwrap()).unwrap();
        assert_eq!(state.client_redirect_uri, "http://localhost:3334/cb?x=1");
        assert_eq!(state.original_state.as_deref(), Some("client-state"));

        let err = p
            .authorize_redirect(&pairs(&[("redirect_uri", "/relative")]), "https://mcp.example.com")
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_arguments");
    }

    #[test]
    fn corrupted_callback_state_is_rejected() {
        assert!(CallbackState::decode("not base64 !").is_none());
        assert!(CallbackState::decode(&URL_SAFE_NO_PAD.encode(b"{\"x\": 1}")).is_none());
    }

    #[test]
    fn token_results_are_appended_to_the_client_redirect() {
        let state = CallbackState {
            client_redirect_uri: "http://localhost:3334/cb?x=1".into(),
            original_state: Some("s1".into()),
        };
        let token = json!({
            "access_token": "at",
            "expires_in": 3600,
            "refresh_token": "rt",
            "id_token": "not forwarded"
        });
        let info = json!({"sub": "u1"});
        let url = state
            .client_url(&token_callback_pairs(token.as_object().unwrap(), Some(&info)))
            .unwrap();
        let q = query_of(&url);
        assert_eq!(get(&q, "x"), Some("1"));
        assert_eq!(get(&q, "access_token"), Some("at"));
        assert_eq!(get(&q, "token_type"), Some("Bearer"));
        assert_eq!(get(&q, "expires_in"), Some("3600"));
        assert_eq!(get(&q, "refresh_token"), Some("rt"));
        assert_eq!(get(&q, "user_info"), Some(r#"{"sub":"u1"}"#));
        assert_eq!(get(&q, "state"), Some("s1"));
        assert_eq!(get(&q, "id_token"), None);
        assert_eq!(get(&q, "scope"), None);
    }

    #[test]
    fn base_url_prefers_configuration_then_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("internal:8000"));
        assert_eq!(public_base_url(None, &headers), "http://internal:8000");
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("api.example.com"));
        assert_eq!(public_base_url(None, &headers), "https://api.example.com");
        assert_eq!(
            public_base_url(Some("https://mcp.example.com/"), &headers),
            "https://mcp.example.com"
        );
    }

    #[test]
    fn scopes_merge_without_duplicates() {
        assert_eq!(merge_scopes(None, "openid profile"), "openid profile");
        assert_eq!(merge_scopes(Some("profile read"), "openid profile"), "profile read openid");
    }
}
