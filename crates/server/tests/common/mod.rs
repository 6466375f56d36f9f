#![allow(dead_code)]

use anyhow::Context as _;
use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use futures::StreamExt as _;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub use routebridge_test_support::{RunningServer, serve_router, start_server};

pub const BIN: &str = env!("CARGO_BIN_EXE_routebridge");

/// Counts requests that reached the fake API's operations.
#[derive(Clone, Default)]
pub struct Hits(Arc<AtomicUsize>);

impl Hits {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

fn items_document() -> Value {
    json!({
        "openapi": "3.1.0",
        "info": {"title": "Items API", "version": "1.0.0"},
        "paths": {
            "/items": {
                "get": {
                    "operationId": "list_items",
                    "summary": "List items",
                    "tags": ["items"],
                    "parameters": [
                        {"name": "limit", "in": "query", "schema": {"type": "integer", "default": 10}}
                    ],
                    "responses": {"200": {"description": "Items"}}
                },
                "post": {
                    "operationId": "create_item",
                    "summary": "Create an item",
                    "tags": ["items"],
                    "requestBody": {
                        "required": true,
                        "content": {"application/json": {"schema": {"$ref": "#/components/schemas/NewItem"}}}
                    },
                    "responses": {"201": {"description": "Created"}}
                }
            },
            "/items/{item_id}": {
                "get": {
                    "operationId": "get_item",
                    "summary": "Get one item",
                    "tags": ["items"],
                    "parameters": [
                        {"name": "item_id", "in": "path", "required": true, "schema": {"type": "integer"}}
                    ],
                    "responses": {"200": {"description": "Item"}, "404": {"description": "Missing"}}
                }
            }
        },
        "components": {
            "schemas": {
                "NewItem": {
                    "type": "object",
                    "required": ["name"],
                    "properties": {
                        "name": {"type": "string"},
                        "age": {"type": "integer"}
                    }
                }
            }
        }
    })
}

fn authorization(headers: &HeaderMap) -> Value {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map_or(Value::Null, |v| json!(v))
}

/// Start the fake API: its `OpenAPI` document at `/openapi.json` plus the three item routes.
pub async fn start_items_api() -> anyhow::Result<(String, Hits)> {
    let hits = Hits::default();
    let router = Router::new()
        .route("/openapi.json", get(|| async { Json(items_document()) }))
        .route(
            "/items",
            get(
                |State(hits): State<Hits>, Query(q): Query<HashMap<String, String>>| async move {
                    hits.0.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"items": [], "limit": q.get("limit")}))
                },
            )
            .post(
                |State(hits): State<Hits>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    hits.0.fetch_add(1, Ordering::SeqCst);
                    (
                        StatusCode::CREATED,
                        Json(json!({"received": body, "authorization": authorization(&headers)})),
                    )
                },
            ),
        )
        .route(
            "/items/{item_id}",
            get(|State(hits): State<Hits>, Path(item_id): Path<u64>| async move {
                hits.0.fetch_add(1, Ordering::SeqCst);
                if item_id == 404 {
                    (StatusCode::NOT_FOUND, Json(json!({"detail": "Item not found"})))
                } else {
                    (StatusCode::OK, Json(json!({"id": item_id, "name": "Lamp"})))
                }
            }),
        )
        .with_state(hits.clone());
    let base = serve_router(router).await?;
    Ok((base, hits))
}

/// Write `yaml` to `config.yaml` in `dir`.
pub fn write_config(dir: &tempfile::TempDir, yaml: &str) -> anyhow::Result<std::path::PathBuf> {
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, yaml).context("write config")?;
    Ok(path)
}

/// Minimal client for the streamable HTTP binding at `/mcp`.
pub struct McpStreamableHttpSession {
    client: reqwest::Client,
    url: String,
    session_id: String,
    bearer: Option<String>,
}

impl McpStreamableHttpSession {
    pub async fn connect(base_url: &str, bearer: Option<&str>) -> anyhow::Result<Self> {
        let client = reqwest::Client::new();
        let url = format!("{}/mcp", base_url.trim_end_matches('/'));
        let bearer = bearer.map(str::to_string);

        let init_resp = post_mcp(&client, &url, None, bearer.as_deref(), json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "routebridge-integration-tests", "version": "0" }
            }
        }))
        .await?;

        let session_id = init_resp
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|h| h.to_str().ok())
            .context("missing Mcp-Session-Id header")?
            .to_string();

        let init_msg = read_first_event_stream_json_message(init_resp).await?;
        anyhow::ensure!(init_msg.get("id") == Some(&json!(0)), "unexpected init id");

        let initialized_resp = post_mcp(
            &client,
            &url,
            Some(&session_id),
            bearer.as_deref(),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .await?;
        anyhow::ensure!(
            initialized_resp.status().as_u16() == 202,
            "POST /mcp notifications/initialized returned {}",
            initialized_resp.status()
        );

        Ok(Self {
            client,
            url,
            session_id,
            bearer,
        })
    }

    pub async fn request(&self, id: u64, method: &str, params: Value) -> anyhow::Result<Value> {
        let resp = post_mcp(
            &self.client,
            &self.url,
            Some(&self.session_id),
            self.bearer.as_deref(),
            json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}),
        )
        .await?;

        tokio::time::timeout(
            Duration::from_secs(20),
            read_first_event_stream_json_message(resp),
        )
        .await
        .context("timeout waiting for event-stream response")?
    }
}

async fn post_mcp(
    client: &reqwest::Client,
    url: &str,
    session_id: Option<&str>,
    bearer: Option<&str>,
    body: Value,
) -> anyhow::Result<reqwest::Response> {
    let mut req = client
        .post(url)
        .header("Accept", "application/json, text/event-stream")
        .header("Content-Type", "application/json")
        .json(&body);
    if let Some(session_id) = session_id {
        req = req.header("Mcp-Session-Id", session_id);
    }
    if let Some(token) = bearer {
        req = req.bearer_auth(token);
    }

    req.send()
        .await
        .context("POST /mcp")?
        .error_for_status()
        .context("POST /mcp status")
}

/// First non-empty JSON payload of an event stream.
pub async fn read_first_event_stream_json_message(resp: reqwest::Response) -> anyhow::Result<Value> {
    let mut stream = sse_stream::SseStream::from_byte_stream(resp.bytes_stream());
    while let Some(evt) = stream.next().await {
        let evt = evt.context("read SSE event")?;
        let payload = evt.data.unwrap_or_default();
        if payload.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&payload).context("parse SSE data as JSON");
    }
    anyhow::bail!("event-stream ended without a JSON message")
}

/// The parsed JSON text of a `tools/call` result.
pub fn tool_call_json(msg: &Value) -> anyhow::Result<Value> {
    let text = msg
        .pointer("/result/content/0/text")
        .and_then(Value::as_str)
        .context("tools/call missing result.content[0].text")?;
    serde_json::from_str(text).context("tools/call text is not JSON")
}
