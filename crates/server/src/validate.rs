//! Tool argument validation against the tool's input schema.

use crate::error::ServerError;
use serde_json::{Map, Value};

/// Check `args` against `schema` before anything is sent upstream.
///
/// Reports unknown names (with suggestions), missing required arguments and JSON Schema
/// violations together. Null values count as absent.
///
/// # Errors
///
/// Returns [`ServerError::InvalidArguments`] with a `validation-errors` detail object.
pub fn validate_tool_arguments(schema: &Value, args: &Map<String, Value>) -> Result<(), ServerError> {
    let props = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .collect();

    let present: Map<String, Value> = args
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let valid_params: Vec<&str> = props.keys().map(String::as_str).collect();

    let mut violations: Vec<Value> = Vec::new();

    for k in present.keys() {
        if props.contains_key(k) {
            continue;
        }
        let suggestions = find_similar_strings(k, &valid_params);
        violations.push(serde_json::json!({
            "type": "invalid-parameter",
            "parameter": k,
            "suggestions": suggestions,
            "validParameters": valid_params,
        }));
    }

    for r in &required {
        if !present.contains_key(*r) {
            violations.push(serde_json::json!({
                "type": "missing-required-parameter",
                "parameter": r,
            }));
        }
    }

    let instance = Value::Object(present);
    if let Ok(compiled) = jsonschema::validator_for(schema) {
        for e in compiled.iter_errors(&instance) {
            // Already reported above with a nicer shape.
            if matches!(
                e.kind(),
                jsonschema::error::ValidationErrorKind::Required { .. }
                    | jsonschema::error::ValidationErrorKind::AdditionalProperties { .. }
            ) {
                continue;
            }
            violations.push(serde_json::json!({
                "type": "constraint-violation",
                "message": e.to_string(),
                "instancePath": e.instance_path().to_string(),
            }));
        }
    } else {
        tracing::debug!("Input schema does not compile; skipping constraint checks");
    }

    if violations.is_empty() {
        return Ok(());
    }

    let message = summarize(&violations);
    Err(ServerError::InvalidArguments {
        message,
        details: serde_json::json!({
            "type": "validation-errors",
            "violations": violations,
        }),
    })
}

fn summarize(violations: &[Value]) -> String {
    let of_type = |ty: &str| {
        violations
            .iter()
            .find(|v| v.get("type").and_then(Value::as_str) == Some(ty))
    };

    if let Some(v) = of_type("invalid-parameter") {
        let p = v.get("parameter").and_then(Value::as_str).unwrap_or("?");
        let suggestion = v
            .get("suggestions")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .and_then(Value::as_str);
        return match suggestion {
            Some(s) => format!("Invalid params: unknown parameter '{p}' (did you mean '{s}'?)"),
            None => format!("Invalid params: unknown parameter '{p}'"),
        };
    }
    if let Some(v) = of_type("missing-required-parameter") {
        let p = v.get("parameter").and_then(Value::as_str).unwrap_or("?");
        return format!("Missing required parameter: {p}");
    }
    format!(
        "Invalid params: validation failed with {} error(s)",
        violations.len()
    )
}

fn find_similar_strings(unknown: &str, known: &[&str]) -> Vec<String> {
    let mut candidates: Vec<(f64, String)> = Vec::new();
    for k in known {
        let score = strsim::jaro(unknown, k);
        if score > 0.7 {
            candidates.push((score, (*k).to_string()));
        }
    }
    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    candidates.into_iter().map(|(_, s)| s).collect()
}
