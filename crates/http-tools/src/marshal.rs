//! Argument marshalling: tool argument map -> path/query/header/body placement.

use crate::error::MarshalError;
use crate::invoke::ApiRequest;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where a tool argument goes in the outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentLocation {
    Path,
    Query,
    Header,
    /// One property of a flattened JSON object body.
    BodyField,
    /// The whole request body.
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentSpec {
    pub name: String,
    pub location: ArgumentLocation,
    pub required: bool,
}

/// How a tool's arguments map onto one HTTP operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLayout {
    pub method: Method,
    /// Path template with `{name}` placeholders.
    pub path: String,
    pub arguments: Vec<ArgumentSpec>,
}

/// Place `arguments` into a request following `layout`.
///
/// Null values count as absent. Arguments not named by the layout are ignored; validation
/// against the input schema happens before marshalling.
///
/// # Errors
///
/// Returns [`MarshalError::MissingArgument`] for a required argument that is absent, before
/// anything is sent.
pub fn marshal(layout: &RequestLayout, arguments: &Map<String, Value>) -> Result<ApiRequest, MarshalError> {
    let mut path = layout.path.clone();
    let mut query: Vec<(String, String)> = Vec::new();
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut body_fields = Map::new();
    let mut body_payload: Option<Value> = None;

    for spec in &layout.arguments {
        let value = arguments.get(&spec.name).filter(|v| !v.is_null());
        let Some(value) = value else {
            if spec.required {
                return Err(MarshalError::MissingArgument(spec.name.clone()));
            }
            continue;
        };

        match spec.location {
            ArgumentLocation::Path => {
                if value.is_object() || value.is_array() {
                    return Err(MarshalError::InvalidValue {
                        name: spec.name.clone(),
                        message: "path parameters must be scalar".to_string(),
                    });
                }
                let encoded = encode_component(&value_to_string(value), false);
                path = path.replace(&format!("{{{}}}", spec.name), &encoded);
            }
            ArgumentLocation::Query => {
                query.extend(serialize_query_param(&spec.name, value, spec.required));
            }
            ArgumentLocation::Header => {
                headers.push((spec.name.clone(), value_to_string(value)));
            }
            ArgumentLocation::BodyField => {
                body_fields.insert(spec.name.clone(), value.clone());
            }
            ArgumentLocation::Body => {
                body_payload = Some(value.clone());
            }
        }
    }

    if !path.starts_with('/') {
        path = format!("/{path}");
    }

    let body = body_payload.or_else(|| (!body_fields.is_empty()).then_some(Value::Object(body_fields)));

    Ok(ApiRequest {
        method: layout.method.clone(),
        path,
        query,
        headers,
        body,
    })
}

/// Serialize one query parameter in `form` style with `explode=true`.
///
/// Arrays repeat the key; objects use `name[key]` pairs.
fn serialize_query_param(name: &str, value: &Value, required: bool) -> Vec<(String, String)> {
    match value {
        Value::String(s) if s.is_empty() => {
            if required {
                vec![(name.to_string(), String::new())]
            } else {
                Vec::new()
            }
        }
        Value::Array(items) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| (name.to_string(), value_to_string(v)))
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (format!("{name}[{k}]"), value_to_string(v)))
            .collect(),
        _ => vec![(name.to_string(), value_to_string(value))],
    }
}

/// Render a scalar the way it appears in a URL or header.
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

/// Percent-encode everything except RFC 3986 unreserved characters (plus a safe reserved
/// subset when `allow_reserved`). `&` and `=` are always encoded.
#[must_use]
pub fn encode_component(s: &str, allow_reserved: bool) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        let keep = is_unreserved(b) || (allow_reserved && is_reserved_but_safe_in_pairs(b));
        if keep {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}

fn is_unreserved(b: u8) -> bool {
    matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~')
}

fn is_reserved_but_safe_in_pairs(b: u8) -> bool {
    matches!(
        b,
        b':' | b'/'
            | b'?'
            | b'['
            | b']'
            | b'@'
            | b'!'
            | b'$'
            | b'\''
            | b'('
            | b')'
            | b'*'
            | b'+'
            | b','
            | b';'
    )
}
