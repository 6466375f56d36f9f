//! Invocation capability for generated tools.
//!
//! [`marshal`] turns a tool's argument map into an [`invoke::ApiRequest`] according to the
//! operation's request layout; [`invoke`] defines the [`invoke::Invoker`] seam with an HTTP
//! implementation and an in-process one.

pub mod error;
pub mod invoke;
pub mod marshal;
pub mod semantics;
