//! Human-readable tool descriptions with embedded response examples and schemas.

use crate::catalog::{Operation, ResponseSpec};
use crate::config::ConversionOptions;
use crate::schema::SchemaTranslator;
use serde_json::{Map, Value, json};
use std::fmt::Write as _;

const EXAMPLE_MAX_DEPTH: usize = 16;

/// Annotations that only add noise for agents reading a description.
const DISPLAY_NOISE: &[&str] = &[
    "nullable",
    "discriminator",
    "readOnly",
    "writeOnly",
    "xml",
    "externalDocs",
];

/// Build the description text of the tool generated for `op`.
#[must_use]
pub fn describe_operation(
    op: &Operation,
    translator: &SchemaTranslator<'_>,
    options: &ConversionOptions,
) -> String {
    let mut text = op
        .summary
        .clone()
        .unwrap_or_else(|| format!("{} {}", op.method, op.path));
    if let Some(desc) = op.description.as_deref()
        && Some(desc) != op.summary.as_deref()
    {
        text.push_str("\n\n");
        text.push_str(desc);
    }
    if op.deprecated {
        text.push_str("\n\nDeprecated.");
    }

    let responses: Vec<(&str, &ResponseSpec)> = if options.describe_all_responses {
        op.responses.iter().map(|(k, v)| (k.as_str(), v)).collect()
    } else {
        op.success_response().into_iter().collect()
    };
    if responses.is_empty() {
        return text;
    }

    text.push_str("\n\n### Responses:\n");
    for (status, response) in responses {
        let _ = write!(
            text,
            "\n**{status}**: {}",
            response.description.as_deref().unwrap_or("Unknown")
        );

        let Some(schema) = response.schema.as_ref().filter(|_| response.is_json()) else {
            continue;
        };
        let display_schema = clean_schema_for_display(&translator.translate(schema).schema);

        let example = response
            .example
            .clone()
            .or_else(|| generate_example(&display_schema));
        if let Some(example) = example {
            let _ = write!(
                text,
                "\n\n**Example Response:**\n```json\n{}\n```",
                pretty(&example)
            );
        }
        if options.describe_full_response_schema {
            let _ = write!(
                text,
                "\n\n**Output Schema:**\n```json\n{}\n```",
                pretty(&display_schema)
            );
        }
    }
    text
}

/// Strip annotations that do not help an agent read a schema.
///
/// `anyOf`/`oneOf` unions that only add `null` to a single alternative collapse to that
/// alternative; other unions are kept.
#[must_use]
pub fn clean_schema_for_display(schema: &Value) -> Value {
    let Value::Object(map) = schema else {
        return schema.clone();
    };

    let mut out = Map::new();
    for (key, value) in map {
        if DISPLAY_NOISE.contains(&key.as_str()) {
            continue;
        }
        let cleaned = match key.as_str() {
            "properties" => match value {
                Value::Object(props) => Value::Object(
                    props
                        .iter()
                        .map(|(k, v)| (k.clone(), clean_schema_for_display(v)))
                        .collect(),
                ),
                other => other.clone(),
            },
            "items" | "additionalProperties" => clean_schema_for_display(value),
            "anyOf" | "oneOf" | "allOf" => match value {
                Value::Array(items) => {
                    Value::Array(items.iter().map(clean_schema_for_display).collect())
                }
                other => other.clone(),
            },
            _ => value.clone(),
        };
        out.insert(key.clone(), cleaned);
    }

    for union in ["anyOf", "oneOf"] {
        let Some(Value::Array(branches)) = out.get(union) else {
            continue;
        };
        let non_null: Vec<&Value> = branches.iter().filter(|b| !is_null_schema(b)).collect();
        if non_null.len() == 1 && branches.len() > 1 {
            let only = non_null[0].clone();
            out.remove(union);
            if let Value::Object(inner) = only {
                for (k, v) in inner {
                    out.entry(k).or_insert(v);
                }
            }
        }
    }

    if let Some(Value::Array(types)) = out.get("type") {
        let non_null: Vec<Value> = types.iter().filter(|t| *t != "null").cloned().collect();
        if non_null.len() == 1 {
            out.insert("type".to_string(), non_null[0].clone());
        }
    }

    Value::Object(out)
}

/// Generate a plausible example value for a (translated) schema.
#[must_use]
pub fn generate_example(schema: &Value) -> Option<Value> {
    example_at_depth(schema, 0)
}

fn example_at_depth(schema: &Value, depth: usize) -> Option<Value> {
    if depth > EXAMPLE_MAX_DEPTH {
        return None;
    }
    let obj = schema.as_object()?;

    if let Some(example) = obj.get("example") {
        return Some(example.clone());
    }
    if let Some(first) = obj
        .get("examples")
        .and_then(Value::as_array)
        .and_then(|e| e.first())
    {
        return Some(first.clone());
    }
    if let Some(value) = obj.get("default").or_else(|| obj.get("const")) {
        return Some(value.clone());
    }
    if let Some(first) = obj.get("enum").and_then(Value::as_array).and_then(|e| e.first()) {
        return Some(first.clone());
    }

    for union in ["anyOf", "oneOf"] {
        if let Some(branches) = obj.get(union).and_then(Value::as_array) {
            return branches
                .iter()
                .filter(|b| !is_null_schema(b))
                .find_map(|b| example_at_depth(b, depth + 1));
        }
    }
    if let Some(parts) = obj.get("allOf").and_then(Value::as_array) {
        let mut merged = Map::new();
        for part in parts {
            match example_at_depth(part, depth + 1) {
                Some(Value::Object(m)) => merged.extend(m),
                Some(other) if parts.len() == 1 => return Some(other),
                _ => {}
            }
        }
        return Some(Value::Object(merged));
    }

    let ty = match obj.get("type") {
        Some(Value::String(t)) => Some(t.as_str()),
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).find(|t| *t != "null"),
        _ => None,
    };
    let ty = ty.or_else(|| obj.contains_key("properties").then_some("object"))?;

    match ty {
        "object" => {
            let mut out = Map::new();
            if let Some(props) = obj.get("properties").and_then(Value::as_object) {
                for (name, prop) in props {
                    if let Some(v) = example_at_depth(prop, depth + 1) {
                        out.insert(name.clone(), v);
                    }
                }
            }
            Some(Value::Object(out))
        }
        "array" => Some(Value::Array(
            obj.get("items")
                .and_then(|items| example_at_depth(items, depth + 1))
                .into_iter()
                .collect(),
        )),
        "string" => Some(match obj.get("format").and_then(Value::as_str) {
            Some("date-time") => json!("2023-01-01T00:00:00Z"),
            Some("date") => json!("2023-01-01"),
            Some("email") => json!("user@example.com"),
            Some("uri" | "url") => json!("https://example.com"),
            Some("uuid") => json!("00000000-0000-0000-0000-000000000000"),
            _ => obj
                .get("title")
                .filter(|t| t.is_string())
                .cloned()
                .unwrap_or_else(|| json!("string")),
        }),
        "integer" => Some(json!(1)),
        "number" => Some(json!(1.0)),
        "boolean" => Some(json!(true)),
        _ => None,
    }
}

fn is_null_schema(schema: &Value) -> bool {
    schema.get("type").and_then(Value::as_str) == Some("null")
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

// ============================================================================
// Tests
// ============================================================================
