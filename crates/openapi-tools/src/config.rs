use crate::error::{OpenApiToolsError, Result};
use crate::naming::MIN_TOOL_NAME_LENGTH;
use serde::{Deserialize, Serialize};

/// Default cap for generated tool names.
pub const DEFAULT_MAX_TOOL_NAME_LENGTH: usize = 60;

/// Options controlling how operations are turned into tools.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ConversionOptions {
    /// Describe every declared response (keyed by status code), not only the success one.
    #[serde(default)]
    pub describe_all_responses: bool,

    /// Inline the complete response schema in tool descriptions.
    #[serde(default)]
    pub describe_full_response_schema: bool,

    /// Identifiers longer than this are shortened deterministically. `None` disables shortening.
    #[serde(default = "default_max_tool_name_length")]
    pub max_tool_name_length: Option<usize>,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            describe_all_responses: false,
            describe_full_response_schema: false,
            max_tool_name_length: default_max_tool_name_length(),
        }
    }
}

impl ConversionOptions {
    /// # Errors
    ///
    /// Returns [`OpenApiToolsError::Config`] when the name limit is too small to hold a
    /// shortened name.
    pub fn validate(&self) -> Result<()> {
        match self.max_tool_name_length {
            Some(max) if max < MIN_TOOL_NAME_LENGTH => Err(OpenApiToolsError::Config(format!(
                "max_tool_name_length must be at least {MIN_TOOL_NAME_LENGTH}, got {max}"
            ))),
            _ => Ok(()),
        }
    }
}

#[allow(clippy::unnecessary_wraps)]
fn default_max_tool_name_length() -> Option<usize> {
    Some(DEFAULT_MAX_TOOL_NAME_LENGTH)
}

/// Include/exclude rules applied to the catalog.
///
/// Entries are operation identifiers or tag names; `*` and `?` glob wildcards are accepted.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct FilterRules {
    #[serde(default)]
    pub include_operations: Vec<String>,
    #[serde(default)]
    pub exclude_operations: Vec<String>,
    #[serde(default)]
    pub include_tags: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
}

impl FilterRules {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.include_operations.is_empty()
            && self.exclude_operations.is_empty()
            && self.include_tags.is_empty()
            && self.exclude_tags.is_empty()
    }
}
