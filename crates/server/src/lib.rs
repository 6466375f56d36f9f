//! Serve an `OpenAPI`-described API as MCP tools and prompts.
//!
//! [`app::App`] ties the pieces together: [`snapshot`] derives tools and prompts from the
//! operation catalog, [`dispatch`] runs tool calls against the API, [`guard`] and [`auth`]
//! cover authorization, and [`mcp`] / [`sse`] expose the protocol over HTTP.

pub mod app;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod mcp;
pub mod oidc;
pub mod prompts;
pub mod snapshot;
pub mod sse;
pub mod validate;
