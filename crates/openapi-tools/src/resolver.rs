//! Local `$ref` resolution over a parsed document.
//!
//! Host frameworks emit a single self-contained document, so only local refs (`#/...`) are
//! followed. External references are reported as unresolvable and the schema translator
//! degrades them to placeholders.

use crate::error::{OpenApiToolsError, Result};
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy)]
pub struct RefResolver<'a> {
    root: &'a Value,
}

impl<'a> RefResolver<'a> {
    #[must_use]
    pub fn new(root: &'a Value) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &'a Value {
        self.root
    }

    /// Look up the value a single `$ref` points at (one hop, no chasing).
    ///
    /// # Errors
    ///
    /// Returns an error for non-local references or pointers that do not exist.
    pub fn lookup(&self, reference: &str) -> Result<&'a Value> {
        let pointer = parse_local_ref(reference)?;
        match pointer {
            None => Ok(self.root),
            Some(ptr) => self.root.pointer(&ptr).ok_or_else(|| {
                OpenApiToolsError::OpenApi(format!(
                    "Unresolved $ref '{reference}' (missing pointer '{ptr}')"
                ))
            }),
        }
    }

    /// Follow a chain of `$ref` objects until a concrete value is reached.
    ///
    /// Used for parameters, request bodies and responses, which are never legitimately
    /// recursive. Schemas go through [`crate::schema::SchemaTranslator`] instead.
    ///
    /// # Errors
    ///
    /// Returns an error if a reference cannot be resolved or the chain loops.
    pub fn resolve<'v>(&self, value: &'v Value) -> Result<&'v Value>
    where
        'a: 'v,
    {
        let mut seen: HashSet<&'v str> = HashSet::new();
        let mut cur = value;
        while let Some(reference) = ref_of(cur) {
            if !seen.insert(reference) {
                return Err(OpenApiToolsError::OpenApi(format!(
                    "Cyclic $ref detected while resolving: {reference}",
                )));
            }
            cur = self.lookup(reference)?;
        }
        Ok(cur)
    }
}

/// The `$ref` string of a reference object, if `value` is one.
#[must_use]
pub fn ref_of(value: &Value) -> Option<&str> {
    value.get("$ref").and_then(Value::as_str)
}

/// The last pointer segment of a reference (`#/components/schemas/Pet` -> `Pet`).
#[must_use]
pub fn ref_name(reference: &str) -> &str {
    reference.rsplit('/').next().unwrap_or(reference)
}

fn parse_local_ref(reference: &str) -> Result<Option<String>> {
    let Some(frag) = reference.strip_prefix('#') else {
        return Err(OpenApiToolsError::OpenApi(format!(
            "External $ref is not supported: {reference}"
        )));
    };
    if frag.is_empty() {
        Ok(None)
    } else if frag.starts_with('/') {
        Ok(Some(frag.to_string()))
    } else {
        Err(OpenApiToolsError::OpenApi(format!(
            "Unsupported $ref fragment (expected JSON pointer starting with '/'): {reference}",
        )))
    }
}
