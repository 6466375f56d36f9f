//! Tool construction: one tool per exposed operation.

use crate::catalog::OperationCatalog;
use crate::config::ConversionOptions;
use crate::describe::describe_operation;
use crate::error::{OpenApiToolsError, Result};
use crate::filter::ExposedSet;
use crate::naming::{is_valid_tool_name, sanitize_tool_name, shorten_operation_id};
use crate::schema::SchemaTranslator;
use routebridge_http_tools::marshal::RequestLayout;
use routebridge_http_tools::semantics::{ToolHints, hints_for_method};
use serde_json::Value;
use std::collections::HashMap;

/// A tool derived from one cataloged operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    /// Identifier of the operation behind the tool (before any shortening).
    pub operation_id: String,
    pub title: Option<String>,
    pub description: String,
    pub input_schema: Value,
    pub layout: RequestLayout,
    pub hints: ToolHints,
    pub tags: Vec<String>,
}

impl ToolDefinition {
    /// Names of the tool's arguments, required ones first.
    pub fn argument_names(&self) -> impl Iterator<Item = (&str, bool)> {
        let required = self.layout.arguments.iter().filter(|a| a.required);
        let optional = self.layout.arguments.iter().filter(|a| !a.required);
        required
            .chain(optional)
            .map(|a| (a.name.as_str(), a.required))
    }
}

/// Build the tools for every exposed operation, in catalog order.
///
/// # Errors
///
/// Returns [`OpenApiToolsError::ToolNameCollision`] when two operations map to the same tool
/// name. Operations whose arguments cannot be laid out are skipped with a warning.
pub fn build_tools(
    catalog: &OperationCatalog,
    exposed: &ExposedSet,
    options: &ConversionOptions,
) -> Result<Vec<ToolDefinition>> {
    options.validate()?;
    let translator = SchemaTranslator::new(catalog.document());
    let mut owners: HashMap<String, String> = HashMap::new();
    let mut tools = Vec::with_capacity(exposed.len());

    for op in exposed.operations(catalog) {
        let name = tool_name_for(&op.id, options);
        if let Some(first) = owners.get(&name) {
            return Err(OpenApiToolsError::ToolNameCollision {
                name,
                first: first.clone(),
                second: op.display_name(),
            });
        }
        owners.insert(name.clone(), op.display_name());

        let input = match translator.input_schema(op) {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!(operation = %op.id, error = %e, "Skipping operation");
                continue;
            }
        };
        for note in &input.notes {
            tracing::warn!(tool = %name, note = %note, "Degraded schema translation");
        }

        tools.push(ToolDefinition {
            description: describe_operation(op, &translator, options),
            title: op.summary.clone(),
            input_schema: input.schema,
            layout: RequestLayout {
                method: op.method.clone(),
                path: op.path.clone(),
                arguments: input.arguments,
            },
            hints: hints_for_method(&op.method),
            tags: op.tags.clone(),
            operation_id: op.id.clone(),
            name,
        });
    }

    tracing::debug!(tools = tools.len(), "Built tools from catalog");
    Ok(tools)
}

fn tool_name_for(operation_id: &str, options: &ConversionOptions) -> String {
    let mut name = operation_id.to_string();
    if let Some(max) = options.max_tool_name_length {
        name = shorten_operation_id(&name, max);
    }
    if !is_valid_tool_name(&name) {
        let sanitized = sanitize_tool_name(&name);
        tracing::warn!(
            operation = %operation_id,
            tool = %sanitized,
            "Operation identifier is not a valid tool name; sanitized"
        );
        name = sanitized;
    }
    name
}
