//! The operation catalog: an immutable snapshot of every API operation.
//!
//! The conversion engine consumes catalogs through [`CatalogSource`] so it never depends on a
//! particular host framework. [`OpenApiDocument`] is the reader for `OpenAPI` 3.0/3.1
//! documents, which is what web frameworks publish for their routes.

use crate::error::{OpenApiToolsError, Result};
use crate::naming::fallback_operation_id;
use crate::resolver::RefResolver;
use reqwest::Method;
use routebridge_http_tools::marshal::ArgumentLocation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

const METHODS: &[&str] = &[
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Path,
    Query,
    Header,
}

impl From<ParamLocation> for ArgumentLocation {
    fn from(location: ParamLocation) -> Self {
        match location {
            ParamLocation::Path => ArgumentLocation::Path,
            ParamLocation::Query => ArgumentLocation::Query,
            ParamLocation::Header => ArgumentLocation::Header,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationParameter {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    /// Raw schema as declared (may still contain `$ref`s).
    pub schema: Value,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestBodySpec {
    pub required: bool,
    pub content_type: String,
    pub schema: Value,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSpec {
    pub description: Option<String>,
    pub content_type: Option<String>,
    pub schema: Option<Value>,
    pub example: Option<Value>,
}

impl ResponseSpec {
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.content_type.as_deref().is_some_and(is_json_media_type)
    }
}

/// One API route + method with its schema metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: String,
    pub method: Method,
    pub path: String,
    pub tags: Vec<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub deprecated: bool,
    pub parameters: Vec<OperationParameter>,
    pub request_body: Option<RequestBodySpec>,
    /// Status code (`"200"`, `"4XX"`, `"default"`) to response.
    pub responses: BTreeMap<String, ResponseSpec>,
}

impl Operation {
    /// Human-readable handle used in error messages (`GET /items (list_items)`).
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} {} ({})", self.method, self.path, self.id)
    }

    /// The lowest declared 2xx response.
    #[must_use]
    pub fn success_response(&self) -> Option<(&str, &ResponseSpec)> {
        self.responses
            .iter()
            .filter_map(|(code, r)| {
                let n: u16 = code.parse().ok()?;
                (200..300).contains(&n).then_some((n, code.as_str(), r))
            })
            .min_by_key(|(n, _, _)| *n)
            .map(|(_, code, r)| (code, r))
    }
}

/// Immutable set of operations plus the document their schemas point into.
#[derive(Debug, Clone)]
pub struct OperationCatalog {
    document: Arc<Value>,
    operations: Vec<Operation>,
    base_url: Option<String>,
    title: Option<String>,
}

impl OperationCatalog {
    #[must_use]
    pub fn new(document: Arc<Value>, operations: Vec<Operation>) -> Self {
        Self {
            document,
            operations,
            base_url: None,
            title: None,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|o| o.id == id)
    }

    /// The document that `$ref`s inside operation schemas resolve against.
    #[must_use]
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Base URL declared by the document (`servers[0].url`), resolved to an absolute URL when
    /// possible.
    #[must_use]
    pub fn declared_base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    #[must_use]
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// A read-only provider of operation catalogs.
pub trait CatalogSource: Send + Sync {
    /// Read a fresh catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying description is malformed.
    fn read_catalog(&self) -> Result<OperationCatalog>;
}

/// An `OpenAPI` document held in memory.
#[derive(Debug, Clone)]
pub struct OpenApiDocument {
    document: Arc<Value>,
    location: Option<String>,
}

impl OpenApiDocument {
    #[must_use]
    pub fn from_value(document: Value) -> Self {
        Self {
            document: Arc::new(document),
            location: None,
        }
    }

    /// Parse JSON or YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is neither valid JSON nor valid YAML.
    pub fn parse(content: &str, location: &str) -> Result<Self> {
        // JSON first: YAML would read unquoted numeric response keys as integers.
        let document: Value = match serde_json::from_str(content) {
            Ok(v) => v,
            Err(_) => serde_yaml::from_str(content).map_err(|e| {
                OpenApiToolsError::OpenApiSpecParse {
                    location: location.to_string(),
                    source: e,
                }
            })?,
        };
        if !document.is_object() {
            return Err(OpenApiToolsError::OpenApi(format!(
                "Document at '{location}' is not an object"
            )));
        }
        Ok(Self {
            document: Arc::new(document),
            location: Some(location.to_string()),
        })
    }

    /// Load a document from a local path or an `http(s)` URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be fetched, read or parsed.
    pub async fn load(location: &str, client: &reqwest::Client) -> Result<Self> {
        let content = if is_url(location) {
            tracing::info!(spec = %location, "Fetching OpenAPI document");
            let url = Url::parse(location).map_err(|e| {
                OpenApiToolsError::OpenApi(format!("Invalid OpenAPI spec URL '{location}': {e}"))
            })?;
            let resp = client
                .get(url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| OpenApiToolsError::OpenApiSpecFetch {
                    url: location.to_string(),
                    message: e.to_string(),
                })?;
            resp.text()
                .await
                .map_err(|e| OpenApiToolsError::OpenApiSpecFetch {
                    url: location.to_string(),
                    message: e.to_string(),
                })?
        } else {
            tracing::info!(spec = %location, "Loading OpenAPI document");
            tokio::fs::read_to_string(location).await.map_err(|e| {
                OpenApiToolsError::OpenApiSpecReadFile {
                    path: location.to_string(),
                    source: e,
                }
            })?
        };
        Self::parse(&content, location)
    }

    #[must_use]
    pub fn document(&self) -> &Value {
        &self.document
    }

    fn declared_base_url(&self) -> Option<String> {
        let raw = self
            .document
            .pointer("/servers/0/url")
            .and_then(Value::as_str)?
            .trim();
        if raw.is_empty() {
            return None;
        }
        if is_url(raw) {
            return Some(raw.trim_end_matches('/').to_string());
        }
        // Relative server URLs resolve against the document URL.
        let base = self.location.as_deref().filter(|l| is_url(l))?;
        let joined = Url::parse(base).ok()?.join(raw).ok()?;
        Some(joined.as_str().trim_end_matches('/').to_string())
    }
}

impl CatalogSource for OpenApiDocument {
    fn read_catalog(&self) -> Result<OperationCatalog> {
        let resolver = RefResolver::new(&self.document);
        let mut operations = Vec::new();

        let Some(paths) = self.document.get("paths").and_then(Value::as_object) else {
            tracing::warn!("OpenAPI document has no paths");
            return Ok(OperationCatalog::new(Arc::clone(&self.document), operations));
        };

        for (path, item) in paths {
            let item = match resolver.resolve(item) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Skipping unresolvable path item");
                    continue;
                }
            };
            let shared_params = item.get("parameters");

            for method in METHODS {
                let Some(op) = item.get(*method).filter(|v| v.is_object()) else {
                    continue;
                };
                operations.push(read_operation(&resolver, path, method, op, shared_params)?);
            }
        }

        let title = self
            .document
            .pointer("/info/title")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(OperationCatalog::new(Arc::clone(&self.document), operations)
            .with_base_url(self.declared_base_url())
            .with_title(title))
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn read_operation(
    resolver: &RefResolver<'_>,
    path: &str,
    method: &str,
    op: &Value,
    shared_params: Option<&Value>,
) -> Result<Operation> {
    let http_method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| OpenApiToolsError::OpenApi(format!("Invalid HTTP method '{method}': {e}")))?;

    let id = op
        .get("operationId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map_or_else(|| fallback_operation_id(method, path), str::to_string);

    let tags = op
        .get("tags")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();

    let parameters = merge_parameters(resolver, &id, shared_params, op.get("parameters"));

    let request_body = match op.get("requestBody") {
        Some(body) => match resolver.resolve(body) {
            Ok(body) => read_request_body(body),
            Err(e) => {
                tracing::warn!(operation = %id, error = %e, "Ignoring unresolvable request body");
                None
            }
        },
        None => None,
    };

    let mut responses = BTreeMap::new();
    if let Some(map) = op.get("responses").and_then(Value::as_object) {
        for (code, resp) in map {
            match resolver.resolve(resp) {
                Ok(resp) => {
                    responses.insert(code.clone(), read_response(resp));
                }
                Err(e) => {
                    tracing::warn!(operation = %id, status = %code, error = %e, "Ignoring unresolvable response");
                }
            }
        }
    }

    Ok(Operation {
        id,
        method: http_method,
        path: path.to_string(),
        tags,
        summary: string_field(op, "summary"),
        description: string_field(op, "description"),
        deprecated: op.get("deprecated").and_then(Value::as_bool).unwrap_or(false),
        parameters,
        request_body,
        responses,
    })
}

/// Merge path-item and operation parameters; the operation wins on the same name+location.
fn merge_parameters(
    resolver: &RefResolver<'_>,
    operation_id: &str,
    shared: Option<&Value>,
    own: Option<&Value>,
) -> Vec<OperationParameter> {
    let mut merged: Vec<OperationParameter> = Vec::new();
    let all = shared
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .chain(own.and_then(Value::as_array).into_iter().flatten());

    for raw in all {
        let param = match resolver.resolve(raw) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(operation = %operation_id, error = %e, "Skipping unresolvable parameter");
                continue;
            }
        };
        let Some(param) = read_parameter(operation_id, param) else {
            continue;
        };
        if let Some(existing) = merged
            .iter_mut()
            .find(|p| p.name == param.name && p.location == param.location)
        {
            *existing = param;
        } else {
            merged.push(param);
        }
    }
    merged
}

fn read_parameter(operation_id: &str, param: &Value) -> Option<OperationParameter> {
    let name = param.get("name").and_then(Value::as_str)?.to_string();
    let location = match param.get("in").and_then(Value::as_str) {
        Some("path") => ParamLocation::Path,
        Some("query") => ParamLocation::Query,
        Some("header") => ParamLocation::Header,
        other => {
            tracing::warn!(
                operation = %operation_id,
                parameter = %name,
                location = ?other,
                "Skipping parameter in unsupported location"
            );
            return None;
        }
    };

    let schema = param
        .get("schema")
        .cloned()
        .or_else(|| {
            param
                .get("content")
                .and_then(Value::as_object)
                .and_then(|c| c.values().next())
                .and_then(|m| m.get("schema"))
                .cloned()
        })
        .unwrap_or_else(|| serde_json::json!({"type": "string"}));

    let required = location == ParamLocation::Path
        || param.get("required").and_then(Value::as_bool).unwrap_or(false);

    Some(OperationParameter {
        name,
        location,
        required,
        schema,
        description: string_field(param, "description"),
    })
}

fn read_request_body(body: &Value) -> Option<RequestBodySpec> {
    let content = body.get("content").and_then(Value::as_object)?;
    let (content_type, media) = pick_media_type(content)?;
    Some(RequestBodySpec {
        required: body.get("required").and_then(Value::as_bool).unwrap_or(false),
        content_type: content_type.to_string(),
        schema: media
            .get("schema")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({})),
        description: string_field(body, "description"),
    })
}

fn read_response(resp: &Value) -> ResponseSpec {
    let media = resp
        .get("content")
        .and_then(Value::as_object)
        .and_then(pick_media_type);
    let (content_type, schema, example) = match media {
        Some((ct, media)) => {
            let example = media.get("example").cloned().or_else(|| {
                media
                    .get("examples")
                    .and_then(Value::as_object)
                    .and_then(|ex| ex.values().next())
                    .and_then(|ex| ex.get("value"))
                    .cloned()
            });
            (Some(ct.to_string()), media.get("schema").cloned(), example)
        }
        None => (None, None, None),
    };
    ResponseSpec {
        description: string_field(resp, "description"),
        content_type,
        schema,
        example,
    }
}

fn pick_media_type(content: &serde_json::Map<String, Value>) -> Option<(&str, &Value)> {
    content
        .get_key_value("application/json")
        .or_else(|| content.iter().find(|(k, _)| is_json_media_type(k)))
        .or_else(|| content.iter().next())
        .map(|(k, v)| (k.as_str(), v))
}

fn is_json_media_type(ct: &str) -> bool {
    let ct = ct.split(';').next().unwrap_or_default().trim();
    ct == "application/json" || ct.ends_with("+json")
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

fn string_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// ============================================================================
// Tests
// ============================================================================
