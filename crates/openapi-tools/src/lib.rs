//! Conversion engine: `OpenAPI` operation catalog -> MCP tool definitions.
//!
//! Pipeline: [`catalog`] reads operations, [`filter`] selects the exposed set, [`schema`] and
//! [`describe`] translate each operation, and [`tools`] assembles the final records.
//!
//! The crate is synchronous and transport-agnostic; invoking the resulting tools is the job of
//! `routebridge-http-tools`.

pub mod catalog;
pub mod config;
pub mod describe;
pub mod error;
pub mod filter;
pub mod naming;
pub mod resolver;
pub mod schema;
pub mod tools;
