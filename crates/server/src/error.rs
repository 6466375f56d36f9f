//! Error types for the server.

use routebridge_http_tools::error::{InvokeError, MarshalError};
use routebridge_openapi_tools::error::OpenApiToolsError;
use serde_json::Value;
use thiserror::Error;

/// Main error type for the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid configuration (exclusive filters, missing auth fields, name collisions).
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Tool '{0}' not found")]
    ToolNotFound(String),

    /// Arguments rejected before anything was sent upstream.
    #[error("{message}")]
    InvalidArguments { message: String, details: Value },

    #[error("Upstream call timed out after {0} seconds")]
    UpstreamTimeout(u64),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Unauthorized")]
    Unauthorized,

    /// OAuth proxy failures (discovery fetch, upstream token endpoint).
    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Prompt '{0}' not found")]
    PromptNotFound(String),

    #[error("Missing required argument '{argument}' for prompt '{prompt}'")]
    PromptArgument { prompt: String, argument: String },

    #[error("Error rendering prompt '{prompt}': {message}")]
    PromptRender { prompt: String, message: String },

    #[error(transparent)]
    Conversion(#[from] OpenApiToolsError),

    #[error("Invocation error: {0}")]
    Invoke(InvokeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ServerError {
    /// Stable machine-readable kind, carried in structured tool errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) | Self::Conversion(_) | Self::Io(_) | Self::Yaml(_) => {
                "configuration_error"
            }
            Self::ToolNotFound(_) => "tool_not_found",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::Unauthorized => "unauthorized",
            Self::Auth(_) => "auth_error",
            Self::PromptNotFound(_) | Self::PromptArgument { .. } | Self::PromptRender { .. } => {
                "prompt_error"
            }
            Self::Invoke(_) => "invocation_error",
        }
    }

    /// Whether the agent may reasonably retry the same call.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTimeout(_) | Self::UpstreamUnavailable(_))
    }
}

impl From<InvokeError> for ServerError {
    fn from(e: InvokeError) -> Self {
        match e {
            InvokeError::Unavailable(msg) => Self::UpstreamUnavailable(msg),
            other => Self::Invoke(other),
        }
    }
}

impl From<MarshalError> for ServerError {
    fn from(e: MarshalError) -> Self {
        let parameter = match &e {
            MarshalError::MissingArgument(name) | MarshalError::InvalidValue { name, .. } => {
                name.clone()
            }
        };
        Self::InvalidArguments {
            message: e.to_string(),
            details: serde_json::json!({ "parameter": parameter }),
        }
    }
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
