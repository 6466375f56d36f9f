//! Reduce a catalog to the set of operations exposed as tools.
//!
//! Include/exclude pairs are mutually exclusive. An operation rule and a tag rule are
//! combined with OR: an operation is exposed when either rule selects it.

use crate::catalog::{Operation, OperationCatalog};
use crate::config::FilterRules;
use crate::error::{OpenApiToolsError, Result};
use std::collections::HashSet;

/// Identifiers of the exposed operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExposedSet {
    ids: HashSet<String>,
}

impl ExposedSet {
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Exposed operations in catalog order.
    pub fn operations<'c>(
        &'c self,
        catalog: &'c OperationCatalog,
    ) -> impl Iterator<Item = &'c Operation> + 'c {
        catalog
            .operations()
            .iter()
            .filter(|op| self.ids.contains(&op.id))
    }
}

/// Check that no exclusive pair of rules is set on both sides.
///
/// # Errors
///
/// Returns [`OpenApiToolsError::Config`] naming the conflicting pair.
pub fn validate_rules(rules: &FilterRules) -> Result<()> {
    if !rules.include_operations.is_empty() && !rules.exclude_operations.is_empty() {
        return Err(OpenApiToolsError::Config(
            "Cannot use both include_operations and exclude_operations at the same time"
                .to_string(),
        ));
    }
    if !rules.include_tags.is_empty() && !rules.exclude_tags.is_empty() {
        return Err(OpenApiToolsError::Config(
            "Cannot use both include_tags and exclude_tags at the same time".to_string(),
        ));
    }
    Ok(())
}

/// Compute the exposed set for `catalog` under `rules`.
///
/// # Errors
///
/// Returns [`OpenApiToolsError::Config`] if the rules are contradictory.
pub fn exposed_set(catalog: &OperationCatalog, rules: &FilterRules) -> Result<ExposedSet> {
    validate_rules(rules)?;

    let all = catalog.operations();
    if rules.is_empty() {
        return Ok(ExposedSet {
            ids: all.iter().map(|op| op.id.clone()).collect(),
        });
    }

    let mut ids: HashSet<String> = HashSet::new();

    if !rules.include_operations.is_empty() {
        ids.extend(
            all.iter()
                .filter(|op| matches_any(&rules.include_operations, &op.id))
                .map(|op| op.id.clone()),
        );
    } else if !rules.exclude_operations.is_empty() {
        ids.extend(
            all.iter()
                .filter(|op| !matches_any(&rules.exclude_operations, &op.id))
                .map(|op| op.id.clone()),
        );
    }

    if !rules.include_tags.is_empty() {
        ids.extend(
            all.iter()
                .filter(|op| op.tags.iter().any(|t| matches_any(&rules.include_tags, t)))
                .map(|op| op.id.clone()),
        );
    } else if !rules.exclude_tags.is_empty() {
        ids.extend(
            all.iter()
                .filter(|op| !op.tags.iter().any(|t| matches_any(&rules.exclude_tags, t)))
                .map(|op| op.id.clone()),
        );
    }

    Ok(ExposedSet { ids })
}

fn matches_any(patterns: &[String], text: &str) -> bool {
    patterns.iter().any(|p| glob_match(p, text))
}

fn glob_match(pattern: &str, text: &str) -> bool {
    // Simple glob matching on bytes:
    //   * => any sequence
    //   ? => any single character
    let pattern_bytes = pattern.as_bytes();
    let text_bytes = text.as_bytes();

    let mut pattern_index = 0usize;
    let mut text_index = 0usize;
    let mut star_index: Option<usize> = None;
    let mut star_text_index: usize = 0;

    while text_index < text_bytes.len() {
        match pattern_bytes.get(pattern_index) {
            Some(b'*') => {
                star_index = Some(pattern_index);
                pattern_index += 1;
                star_text_index = text_index;
            }
            Some(b'?') => {
                pattern_index += 1;
                text_index += 1;
            }
            Some(&b) if b == text_bytes[text_index] => {
                pattern_index += 1;
                text_index += 1;
            }
            _ => {
                let Some(si) = star_index else {
                    return false;
                };
                pattern_index = si + 1;
                star_text_index += 1;
                text_index = star_text_index;
            }
        }
    }

    while matches!(pattern_bytes.get(pattern_index), Some(b'*')) {
        pattern_index += 1;
    }

    pattern_index == pattern_bytes.len()
}
