//! HTTP semantics helpers.
//!
//! Tools backed by HTTP operations get behavioural hints derived from RFC 9110 method
//! semantics. The hints are plain data here; the server maps them onto MCP tool annotations.

use reqwest::Method;

/// Behavioural hints for an HTTP-backed tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ToolHints {
    pub read_only: bool,
    pub destructive: bool,
    /// `None` when the method does not say (PATCH, extension methods).
    pub idempotent: Option<bool>,
    /// HTTP tools always talk to an external system.
    pub open_world: bool,
}

/// Derive [`ToolHints`] from the HTTP method of an operation.
#[must_use]
pub fn hints_for_method(method: &Method) -> ToolHints {
    let open_world = true;

    if method == Method::GET || method == Method::HEAD || method == Method::OPTIONS {
        return ToolHints {
            read_only: true,
            destructive: false,
            idempotent: Some(true),
            open_world,
        };
    }

    if method == Method::POST {
        return ToolHints {
            read_only: false,
            destructive: false,
            idempotent: Some(false),
            open_world,
        };
    }

    // Only DELETE is flagged destructive; PUT and PATCH update in place.
    if method == Method::PUT || method == Method::DELETE {
        return ToolHints {
            read_only: false,
            destructive: method == Method::DELETE,
            idempotent: Some(true),
            open_world,
        };
    }

    if method == Method::PATCH {
        return ToolHints {
            read_only: false,
            destructive: false,
            // PATCH may or may not be idempotent; do not guess.
            idempotent: None,
            open_world,
        };
    }

    ToolHints {
        read_only: false,
        destructive: false,
        idempotent: None,
        open_world,
    }
}
