//! Schema translation: `OpenAPI` schema fragments to self-contained JSON Schema.
//!
//! Every `$ref` is inlined. References that loop back onto the current expansion path, or
//! that nest deeper than [`MAX_REF_DEPTH`], become named placeholders, so translation always
//! terminates. Unions (`anyOf`/`oneOf`/`allOf`), `enum`, `const` and `default` are carried
//! over verbatim; `OpenAPI` 3.0 `nullable` is rewritten into a JSON Schema type union.

use crate::catalog::Operation;
use crate::error::{OpenApiToolsError, Result};
use crate::resolver::{RefResolver, ref_name};
use routebridge_http_tools::marshal::{ArgumentLocation, ArgumentSpec};
use serde_json::{Map, Value, json};

/// Maximum number of nested `$ref` expansions on one path.
pub const MAX_REF_DEPTH: usize = 8;

/// Keywords whose value is a single subschema.
const SUBSCHEMA_KEYWORDS: &[&str] = &[
    "items",
    "additionalProperties",
    "additionalItems",
    "not",
    "contains",
    "propertyNames",
    "if",
    "then",
    "else",
    "unevaluatedItems",
    "unevaluatedProperties",
];

/// Keywords whose value is a list of subschemas.
const SUBSCHEMA_LIST_KEYWORDS: &[&str] = &["anyOf", "oneOf", "allOf", "prefixItems"];

/// Keywords whose value maps names to subschemas.
const SUBSCHEMA_MAP_KEYWORDS: &[&str] = &["properties", "patternProperties", "$defs", "definitions"];

/// `OpenAPI`-only annotations with no JSON Schema meaning.
const DROPPED_KEYWORDS: &[&str] = &["xml", "externalDocs"];

#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedSchema {
    pub schema: Value,
    /// Degradations applied along the way (truncated cycles, unresolved references).
    pub notes: Vec<String>,
}

/// A tool input schema plus the request layout of its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSchema {
    pub schema: Value,
    pub arguments: Vec<ArgumentSpec>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct SchemaTranslator<'a> {
    resolver: RefResolver<'a>,
}

impl<'a> SchemaTranslator<'a> {
    /// Create a translator resolving references against `document`.
    #[must_use]
    pub fn new(document: &'a Value) -> Self {
        Self {
            resolver: RefResolver::new(document),
        }
    }

    #[must_use]
    pub fn translate(&self, schema: &Value) -> TranslatedSchema {
        let mut stack = Vec::new();
        let mut notes = Vec::new();
        let schema = self.translate_inner(schema, &mut stack, &mut notes);
        TranslatedSchema { schema, notes }
    }

    /// Assemble the tool input schema for `op`.
    ///
    /// Path, query and header parameters become top-level properties. An object request body
    /// is flattened into further top-level properties; any other body shape is exposed as a
    /// single `body` argument.
    ///
    /// # Errors
    ///
    /// Returns [`OpenApiToolsError::ParamCollision`] if two arguments end up with the same name.
    pub fn input_schema(&self, op: &Operation) -> Result<InputSchema> {
        let mut properties = Map::new();
        let mut required: Vec<String> = Vec::new();
        let mut arguments: Vec<ArgumentSpec> = Vec::new();
        let mut notes = Vec::new();

        let mut add = |name: &str,
                       location: ArgumentLocation,
                       is_required: bool,
                       schema: Value,
                       properties: &mut Map<String, Value>|
         -> Result<()> {
            if properties.contains_key(name) {
                return Err(OpenApiToolsError::ParamCollision(format!(
                    "argument '{name}' of operation '{}' is declared more than once",
                    op.id
                )));
            }
            properties.insert(name.to_string(), schema);
            if is_required {
                required.push(name.to_string());
            }
            arguments.push(ArgumentSpec {
                name: name.to_string(),
                location,
                required: is_required,
            });
            Ok(())
        };

        for param in &op.parameters {
            let translated = self.translate(&param.schema);
            notes.extend(translated.notes);
            let mut schema = translated.schema;
            if let (Some(desc), Some(obj)) = (&param.description, schema.as_object_mut()) {
                obj.entry("description")
                    .or_insert_with(|| Value::String(desc.clone()));
            }
            add(
                &param.name,
                param.location.into(),
                param.required,
                schema,
                &mut properties,
            )?;
        }

        if let Some(body) = &op.request_body {
            let translated = self.translate(&body.schema);
            notes.extend(translated.notes);
            let body_schema = translated.schema;

            let flattened: Option<Vec<(String, Value)>> = flattenable_properties(&body_schema)
                .map(|props| props.iter().map(|(k, v)| (k.clone(), v.clone())).collect());

            match flattened {
                Some(props) => {
                    let body_required_fields: Vec<String> = body_schema
                        .get("required")
                        .and_then(Value::as_array)
                        .into_iter()
                        .flatten()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect();
                    for (name, schema) in props {
                        let is_required = body.required && body_required_fields.contains(&name);
                        add(
                            &name,
                            ArgumentLocation::BodyField,
                            is_required,
                            schema,
                            &mut properties,
                        )?;
                    }
                }
                None => {
                    let mut schema = body_schema;
                    if let (Some(desc), Some(obj)) = (&body.description, schema.as_object_mut()) {
                        obj.entry("description")
                            .or_insert_with(|| Value::String(desc.clone()));
                    }
                    add(
                        "body",
                        ArgumentLocation::Body,
                        body.required,
                        schema,
                        &mut properties,
                    )?;
                }
            }
        }

        let mut schema = json!({
            "type": "object",
            "properties": properties,
        });
        if !required.is_empty() {
            schema["required"] = json!(required);
        }

        Ok(InputSchema {
            schema,
            arguments,
            notes,
        })
    }

    fn translate_inner(
        &self,
        schema: &Value,
        stack: &mut Vec<String>,
        notes: &mut Vec<String>,
    ) -> Value {
        let Value::Object(map) = schema else {
            // Boolean schemas are valid as-is.
            return schema.clone();
        };

        if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
            return self.expand_ref(reference, map, stack, notes);
        }

        let mut out = Map::new();
        for (key, value) in map {
            let key_str = key.as_str();
            if DROPPED_KEYWORDS.contains(&key_str) || key_str == "nullable" {
                continue;
            }
            let translated = if SUBSCHEMA_MAP_KEYWORDS.contains(&key_str) {
                match value {
                    Value::Object(props) => Value::Object(
                        props
                            .iter()
                            .map(|(k, v)| (k.clone(), self.translate_inner(v, stack, notes)))
                            .collect(),
                    ),
                    other => other.clone(),
                }
            } else if SUBSCHEMA_LIST_KEYWORDS.contains(&key_str)
                || (SUBSCHEMA_KEYWORDS.contains(&key_str) && value.is_array())
            {
                match value {
                    Value::Array(items) => Value::Array(
                        items
                            .iter()
                            .map(|v| self.translate_inner(v, stack, notes))
                            .collect(),
                    ),
                    other => other.clone(),
                }
            } else if SUBSCHEMA_KEYWORDS.contains(&key_str) {
                self.translate_inner(value, stack, notes)
            } else {
                value.clone()
            };
            out.insert(key.clone(), translated);
        }

        if map.get("nullable").and_then(Value::as_bool) == Some(true) {
            return make_nullable(out);
        }
        Value::Object(out)
    }

    fn expand_ref(
        &self,
        reference: &str,
        map: &Map<String, Value>,
        stack: &mut Vec<String>,
        notes: &mut Vec<String>,
    ) -> Value {
        let name = ref_name(reference);
        let target = match self.resolver.lookup(reference) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(reference = %reference, error = %e, "Unresolved schema reference");
                notes.push(e.to_string());
                return json!({
                    "description": format!("Unresolved schema reference '{reference}'"),
                });
            }
        };

        let recursive = stack.iter().any(|r| r == reference);
        if recursive || stack.len() >= MAX_REF_DEPTH {
            let description = if recursive {
                notes.push(format!("Recursive reference to {name} truncated"));
                format!("Recursive reference to {name} (not expanded)")
            } else {
                notes.push(format!("Reference to {name} truncated at depth {MAX_REF_DEPTH}"));
                format!("Nested reference to {name} (not expanded)")
            };
            let mut placeholder = json!({
                "title": name,
                "description": description,
            });
            if let Some(ty) = target.get("type").filter(|t| t.is_string()) {
                placeholder["type"] = ty.clone();
            }
            return placeholder;
        }

        stack.push(reference.to_string());
        let mut resolved = self.translate_inner(target, stack, notes);
        // Sibling keywords (description, default, ...) refine the referenced schema.
        let siblings: Vec<(String, Value)> = map
            .iter()
            .filter(|(k, _)| {
                let k = k.as_str();
                k != "$ref" && k != "nullable" && !DROPPED_KEYWORDS.contains(&k)
            })
            .filter_map(|(k, v)| {
                let mut single = Map::new();
                single.insert(k.clone(), v.clone());
                let translated = self.translate_inner(&Value::Object(single), stack, notes);
                translated.get(k).cloned().map(|v| (k.clone(), v))
            })
            .collect();
        stack.pop();

        if let Value::Object(obj) = &mut resolved {
            obj.extend(siblings);
        }
        if map.get("nullable").and_then(Value::as_bool) == Some(true)
            && let Value::Object(obj) = resolved
        {
            return make_nullable(obj);
        }
        resolved
    }
}

/// Properties of an object body that can be flattened into top-level arguments.
fn flattenable_properties(schema: &Value) -> Option<&Map<String, Value>> {
    let obj = schema.as_object()?;
    let is_object = match obj.get("type") {
        None => true,
        Some(Value::String(t)) => t == "object",
        Some(_) => false,
    };
    let is_union = ["anyOf", "oneOf", "allOf"]
        .iter()
        .any(|k| obj.contains_key(*k));
    if !is_object || is_union {
        return None;
    }
    obj.get("properties")
        .and_then(Value::as_object)
        .filter(|p| !p.is_empty())
}

fn make_nullable(mut schema: Map<String, Value>) -> Value {
    match schema.get_mut("type") {
        Some(Value::String(t)) => {
            let t = std::mem::take(t);
            schema.insert("type".to_string(), json!([t, "null"]));
        }
        Some(Value::Array(types)) => {
            if !types.iter().any(|t| t == "null") {
                types.push(json!("null"));
            }
        }
        _ => {
            return json!({"anyOf": [Value::Object(schema), {"type": "null"}]});
        }
    }
    if let Some(Value::Array(values)) = schema.get_mut("enum")
        && !values.contains(&Value::Null)
    {
        values.push(Value::Null);
    }
    Value::Object(schema)
}

// ============================================================================
// Tests
// ============================================================================
