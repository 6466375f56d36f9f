//! Error types for `routebridge-openapi-tools`.

use thiserror::Error;

/// Main error type for the conversion engine.
#[derive(Error, Debug)]
pub enum OpenApiToolsError {
    /// Configuration errors (conflicting filters, invalid options).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Two distinct operations resolved to the same tool name.
    #[error(
        "Configuration error: tool name '{name}' is produced by both {first} and {second}"
    )]
    ToolNameCollision {
        name: String,
        first: String,
        second: String,
    },

    /// `OpenAPI` errors (structure, unsupported constructs).
    #[error("OpenAPI error: {0}")]
    OpenApi(String),

    #[error("OpenAPI error: failed to fetch spec from '{url}': {message}")]
    OpenApiSpecFetch { url: String, message: String },

    #[error("OpenAPI error: failed to read spec file '{path}': {source}")]
    OpenApiSpecReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("OpenAPI error: failed to parse OpenAPI spec from '{location}': {source}")]
    OpenApiSpecParse {
        location: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// Parameter collision errors (a parameter and a body field share a name).
    #[error("Parameter collision: {0}")]
    ParamCollision(String),

    /// JSON errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for conversion operations.
pub type Result<T> = std::result::Result<T, OpenApiToolsError>;
