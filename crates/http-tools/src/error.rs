//! Error types for `routebridge-http-tools`.

use thiserror::Error;

/// Failures while turning tool arguments into a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    #[error("Missing required parameter: {0}")]
    MissingArgument(String),

    #[error("Invalid value for parameter '{name}': {message}")]
    InvalidValue { name: String, message: String },
}

/// Failures of the invocation capability itself (not HTTP error statuses).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// The request did not complete within the configured window.
    #[error("Request timed out")]
    Timeout,

    /// The target could not be reached (connection refused, DNS, TLS).
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    /// The request could not be built or sent.
    #[error("Request error: {0}")]
    Request(String),
}

impl InvokeError {
    /// Whether a caller may reasonably retry the same call.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}

impl From<reqwest::Error> for InvokeError {
    fn from(e: reqwest::Error) -> Self {
        let message = sanitize_reqwest_error(&e);
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Unavailable(message)
        } else {
            Self::Request(message)
        }
    }
}

/// Render a reqwest error without leaking query strings (which may carry credentials).
#[must_use]
pub fn sanitize_reqwest_error(e: &reqwest::Error) -> String {
    let mut msg = e.to_string();
    if let Some(u) = e.url() {
        msg = msg.replace(u.as_str(), &redact_url(u));
    }
    msg
}

fn redact_url(u: &url::Url) -> String {
    let mut out = u.clone();
    if out.query().is_some() {
        out.set_query(Some("redacted"));
    }
    let _ = out.set_password(None);
    out.to_string()
}
