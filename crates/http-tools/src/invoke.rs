//! Invocation capability: send an [`ApiRequest`] somewhere and get an [`ApiResponse`] back.
//!
//! Two implementations ship here:
//! - [`HttpInvoker`] talks to a remote base URL over HTTP.
//! - [`InProcessInvoker`] hands the request to a local async function (no network hop).

use crate::error::InvokeError;
use crate::marshal::encode_component;
use async_trait::async_trait;
use futures::future::BoxFuture;
use mime::Mime;
use reqwest::{Client, Method};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// A fully marshalled request, relative to the invoker's target.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path with parameters substituted (percent-encoded), always starting with `/`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// JSON body, if any.
    pub body: Option<Value>,
}

impl ApiRequest {
    /// Append a header unless one with the same (case-insensitive) name is already set.
    pub fn set_header_if_absent(&mut self, name: &str, value: impl Into<String>) {
        if !self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name)) {
            self.headers.push((name.to_string(), value.into()));
        }
    }
}

/// Raw response of an invoked operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    #[must_use]
    pub fn new(status: u16, content_type: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: content_type
                .map(|ct| vec![("content-type".to_string(), ct.to_string())])
                .unwrap_or_default(),
            body: body.into(),
        }
    }

    /// Convenience constructor for a JSON response.
    #[must_use]
    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(status, Some("application/json"), value.to_string())
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn mime(&self) -> Option<Mime> {
        self.content_type()?.parse::<Mime>().ok()
    }

    #[must_use]
    pub fn is_image(&self) -> bool {
        self.mime().is_some_and(|m| m.type_() == mime::IMAGE)
    }

    /// `application/json` and `+json` suffixed types.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.mime()
            .is_some_and(|m| m.subtype() == mime::JSON || m.suffix() == Some(mime::JSON))
    }

    /// The body as UTF-8 text, if it is valid UTF-8.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Something that can execute an [`ApiRequest`].
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Execute the request.
    ///
    /// HTTP error statuses are *not* errors at this level; they come back as an
    /// [`ApiResponse`].
    ///
    /// # Errors
    ///
    /// Returns [`InvokeError`] when the request could not be completed at all.
    async fn invoke(&self, request: ApiRequest) -> Result<ApiResponse, InvokeError>;
}

/// Invoker targeting a remote base URL.
#[derive(Clone, Debug)]
pub struct HttpInvoker {
    client: Client,
    base_url: String,
    timeout: Option<Duration>,
    default_headers: Vec<(String, String)>,
    max_response_bytes: Option<usize>,
}

impl HttpInvoker {
    /// Build an invoker for `base_url` with a fresh HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`InvokeError::Request`] if the base URL does not parse or the client cannot be
    /// built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, InvokeError> {
        let client = Client::builder()
            .build()
            .map_err(|e| InvokeError::Request(crate::error::sanitize_reqwest_error(&e)))?;
        Self::with_client(client, base_url)
    }

    /// Build an invoker sharing an existing client.
    ///
    /// # Errors
    ///
    /// Returns [`InvokeError::Request`] if the base URL does not parse.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Result<Self, InvokeError> {
        let base_url = base_url.into();
        Url::parse(&base_url)
            .map_err(|e| InvokeError::Request(format!("Invalid base URL '{base_url}': {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: None,
            default_headers: Vec::new(),
            max_response_bytes: None,
        })
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn max_response_bytes(mut self, max: usize) -> Self {
        self.max_response_bytes = Some(max);
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_url(&self, path: &str, query: &[(String, String)]) -> Result<Url, InvokeError> {
        let raw = format!("{}{}", self.base_url, path);
        let mut url =
            Url::parse(&raw).map_err(|e| InvokeError::Request(format!("Invalid URL: {e}")))?;
        if !query.is_empty() {
            let encoded: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", encode_component(k, false), encode_component(v, false)))
                .collect();
            url.set_query(Some(&encoded.join("&")));
        }
        Ok(url)
    }
}

#[async_trait]
impl Invoker for HttpInvoker {
    async fn invoke(&self, request: ApiRequest) -> Result<ApiResponse, InvokeError> {
        let url = self.build_url(&request.path, &request.query)?;
        tracing::debug!(method = %request.method, path = %request.path, "Invoking upstream operation");

        let mut builder = self.client.request(request.method, url);
        for (key, value) in &self.default_headers {
            builder = builder.header(key, value);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = read_body_limited(response, self.max_response_bytes).await?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

async fn read_body_limited(
    mut response: reqwest::Response,
    max_bytes: Option<usize>,
) -> Result<Vec<u8>, InvokeError> {
    let Some(max) = max_bytes else {
        return Ok(response.bytes().await?.to_vec());
    };

    if let Some(len) = response.content_length()
        && len > max as u64
    {
        return Err(InvokeError::Request(format!(
            "Response too large: {len} bytes (limit {max})"
        )));
    }

    let mut out: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if out.len().saturating_add(chunk.len()) > max {
            return Err(InvokeError::Request(format!(
                "Response too large: exceeded {max} bytes"
            )));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

type Handler =
    dyn Fn(ApiRequest) -> BoxFuture<'static, Result<ApiResponse, InvokeError>> + Send + Sync;

/// Invoker that dispatches to an in-process async handler.
#[derive(Clone)]
pub struct InProcessInvoker {
    handler: Arc<Handler>,
}

impl InProcessInvoker {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(ApiRequest) -> BoxFuture<'static, Result<ApiResponse, InvokeError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl std::fmt::Debug for InProcessInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessInvoker").finish_non_exhaustive()
    }
}

#[async_trait]
impl Invoker for InProcessInvoker {
    async fn invoke(&self, request: ApiRequest) -> Result<ApiResponse, InvokeError> {
        (self.handler)(request).await
    }
}
