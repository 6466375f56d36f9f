//! Tool call dispatch: validate, marshal, invoke, shape the result.

use crate::error::{Result, ServerError};
use crate::snapshot::Snapshot;
use crate::validate::validate_tool_arguments;
use base64::Engine as _;
use rmcp::model::{CallToolResult, Content};
use routebridge_http_tools::error::InvokeError;
use routebridge_http_tools::invoke::{ApiResponse, Invoker};
use routebridge_http_tools::marshal::marshal;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Headers of the inbound protocol request that may be forwarded upstream.
pub type CallerHeaders = Vec<(String, String)>;

#[derive(Clone)]
pub struct Dispatcher {
    invoker: Arc<dyn Invoker>,
    timeout: Duration,
    /// Lower-case names of caller headers copied onto upstream requests.
    forward_headers: Vec<String>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("timeout", &self.timeout)
            .field("forward_headers", &self.forward_headers)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(invoker: Arc<dyn Invoker>, timeout: Duration, forward_headers: &[String]) -> Self {
        Self {
            invoker,
            timeout,
            forward_headers: forward_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Run tool `name` against `snapshot`.
    ///
    /// Failures become error results; only a dropped future stops the call early (the in-flight
    /// request is dropped with it).
    pub async fn call(
        &self,
        snapshot: &Snapshot,
        name: &str,
        arguments: Option<Map<String, Value>>,
        caller_headers: &[(String, String)],
    ) -> CallToolResult {
        let started = Instant::now();
        let outcome = self
            .invoke(snapshot, name, arguments.unwrap_or_default(), caller_headers)
            .await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(response) => {
                tracing::debug!(tool = %name, status = response.status, elapsed_ms, "Tool call finished");
                response_to_result(name, &response)
            }
            Err(e) => {
                tracing::debug!(tool = %name, error = %e, elapsed_ms, "Tool call failed");
                error_result(&e)
            }
        }
    }

    async fn invoke(
        &self,
        snapshot: &Snapshot,
        name: &str,
        arguments: Map<String, Value>,
        caller_headers: &[(String, String)],
    ) -> Result<ApiResponse> {
        let tool = snapshot
            .tool(name)
            .ok_or_else(|| ServerError::ToolNotFound(name.to_string()))?;

        validate_tool_arguments(&tool.input_schema, &arguments)?;
        let mut request = marshal(&tool.layout, &arguments)?;

        for (key, value) in caller_headers {
            if self.forward_headers.iter().any(|h| h.eq_ignore_ascii_case(key)) {
                request.set_header_if_absent(key, value.clone());
            }
        }

        match tokio::time::timeout(self.timeout, self.invoker.invoke(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(InvokeError::Timeout)) | Err(_) => {
                Err(ServerError::UpstreamTimeout(self.timeout.as_secs()))
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

/// Shape an upstream response into a tool result.
#[must_use]
pub fn response_to_result(tool: &str, response: &ApiResponse) -> CallToolResult {
    if (400..=599).contains(&response.status) {
        let text = response
            .text()
            .map_or_else(|| String::from_utf8_lossy(&response.body).into_owned(), str::to_string);
        return CallToolResult {
            content: vec![Content::text(format!(
                "Error calling {tool}. Status code: {}. Response: {text}",
                response.status
            ))],
            structured_content: None,
            is_error: Some(true),
            meta: None,
        };
    }

    if response.is_image() {
        let mime = response.content_type().unwrap_or("image/png");
        let mime = mime.split(';').next().unwrap_or(mime).trim().to_string();
        let data = base64::engine::general_purpose::STANDARD.encode(&response.body);
        return success(vec![Content::image(data, mime)], None);
    }

    let Some(text) = response.text() else {
        let mime = response
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let wrapper = json!({
            "encoding": "base64",
            "mimeType": mime,
            "data": base64::engine::general_purpose::STANDARD.encode(&response.body),
        });
        return success(vec![Content::text(wrapper.to_string())], None);
    };

    if (response.is_json() || looks_like_json(text))
        && let Ok(value) = serde_json::from_str::<Value>(text)
    {
        let pretty = serde_json::to_string_pretty(&value).unwrap_or_else(|_| text.to_string());
        let structured = value.is_object().then_some(value);
        return success(vec![Content::text(pretty)], structured);
    }

    success(vec![Content::text(text.to_string())], None)
}

fn looks_like_json(text: &str) -> bool {
    let t = text.trim_start();
    t.starts_with('{') || t.starts_with('[')
}

fn success(content: Vec<Content>, structured_content: Option<Value>) -> CallToolResult {
    CallToolResult {
        content,
        structured_content,
        is_error: Some(false),
        meta: None,
    }
}

/// Error result with a `{"kind", "message", "retryable"}` structured payload.
#[must_use]
pub fn error_result(e: &ServerError) -> CallToolResult {
    let mut structured = json!({
        "kind": e.kind(),
        "message": e.to_string(),
        "retryable": e.is_retryable(),
    });
    if let ServerError::InvalidArguments { details, .. } = e
        && let Some(obj) = structured.as_object_mut()
    {
        obj.insert("details".to_string(), details.clone());
    }
    CallToolResult {
        content: vec![Content::text(e.to_string())],
        structured_content: Some(structured),
        is_error: Some(true),
        meta: None,
    }
}
