//! Legacy server-push binding.
//!
//! `GET {mount}/sse` opens an event stream whose first `endpoint` event names the URL to POST
//! JSON-RPC messages to. POSTs are acknowledged with `202` and answered on the stream.
//!
//! Requests in flight are tied to their session: closing the stream, or a
//! `notifications/cancelled` naming the request, drops the work and any upstream call with it.

use crate::app::{App, caller_headers};
use crate::dispatch::CallerHeaders;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse as _, Response};
use axum::routing::{get, post};
use futures::Stream;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

type Sessions = Arc<Mutex<HashMap<String, Session>>>;

#[derive(Clone)]
struct Session {
    tx: mpsc::Sender<Value>,
    /// Cancelled when the stream goes away; parent of every in-flight request token.
    closed: CancellationToken,
    /// In-flight requests keyed by their JSON-RPC id.
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

#[derive(Clone)]
struct SseState {
    app: App,
    sessions: Sessions,
    messages_path: Arc<str>,
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session_id: String,
}

pub fn router(app: App, mount_path: &str) -> Router {
    let messages_path = format!("{mount_path}/messages/");
    let state = SseState {
        app,
        sessions: Arc::default(),
        messages_path: Arc::from(messages_path.as_str()),
    };
    Router::new()
        .route(&format!("{mount_path}/sse"), get(open_stream))
        .route(&messages_path, post(post_message))
        .route(&format!("{mount_path}/messages"), post(post_message))
        .with_state(state)
}

/// Drops the session from the table when its stream goes away.
struct SessionGuard {
    id: String,
    sessions: Sessions,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.sessions.lock().remove(&self.id) {
            session.closed.cancel();
        }
        tracing::debug!(session_id = %self.id, "SSE session closed");
    }
}

async fn open_stream(
    State(state): State<SseState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let (tx, rx) = mpsc::channel::<Value>(64);
    state.sessions.lock().insert(
        id.clone(),
        Session {
            tx,
            closed: CancellationToken::new(),
            in_flight: Arc::default(),
        },
    );
    tracing::debug!(session_id = %id, "SSE session opened");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("{}?session_id={id}", state.messages_path));
    let guard = SessionGuard {
        id,
        sessions: Arc::clone(&state.sessions),
    };
    let messages = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let message = rx.recv().await?;
        let event = Event::default().event("message").data(message.to_string());
        Some((Ok(event), (rx, guard)))
    });

    let stream = futures::StreamExt::chain(futures::stream::once(async { Ok(endpoint) }), messages);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn post_message(
    State(state): State<SseState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(session) = state.sessions.lock().get(&query.session_id).cloned() else {
        return (StatusCode::NOT_FOUND, "Could not find session").into_response();
    };
    let message: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("Invalid JSON-RPC message: {e}"))
                .into_response();
        }
    };

    accept(&state.app, &session, message, caller_headers(&headers));
    (StatusCode::ACCEPTED, "Accepted").into_response()
}

/// Key of a JSON-RPC id in the in-flight table.
fn request_key(id: &Value) -> String {
    id.to_string()
}

/// Start answering `message` on `session`. Returns at once; the reply goes to the stream.
fn accept(app: &App, session: &Session, message: Value, headers: CallerHeaders) {
    if message.get("method").and_then(Value::as_str) == Some("notifications/cancelled") {
        if let Some(id) = message.pointer("/params/requestId")
            && let Some(token) = session.in_flight.lock().remove(&request_key(id))
        {
            tracing::debug!(request_id = %id, "Request cancelled by client");
            token.cancel();
        }
        return;
    }

    let key = message
        .get("id")
        .filter(|id| !id.is_null())
        .map(request_key);
    let cancel = session.closed.child_token();
    if let Some(key) = &key {
        session.in_flight.lock().insert(key.clone(), cancel.clone());
    }

    let app = app.clone();
    let session = session.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(request_id = ?key, "Dropped cancelled request");
            }
            reply = handle_message(&app, message, &headers) => {
                if let Some(reply) = reply
                    && session.tx.send(reply).await.is_err()
                {
                    tracing::debug!("SSE session closed before the reply was sent");
                }
            }
        }
        if let Some(key) = &key {
            session.in_flight.lock().remove(key);
        }
    });
}

/// Answer one JSON-RPC message. Notifications get no reply.
async fn handle_message(app: &App, message: Value, headers: &[(String, String)]) -> Option<Value> {
    let id = message.get("id").cloned().filter(|id| !id.is_null())?;
    let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
    let params = message.get("params").cloned().unwrap_or_else(|| json!({}));

    Some(match dispatch(app, method, &params, headers).await {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => {
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
        }
    })
}

async fn dispatch(
    app: &App,
    method: &str,
    params: &Value,
    headers: &[(String, String)],
) -> Result<Value, (i64, String)> {
    let name = || params.get("name").and_then(Value::as_str);
    let arguments = || params.get("arguments").and_then(Value::as_object);
    match method {
        "initialize" => to_result(&app.server_info()),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": to_result(&app.list_tools())? })),
        "tools/call" => {
            let name =
                name().ok_or_else(|| (INVALID_PARAMS, "tools/call requires a tool name".to_string()))?;
            to_result(&app.call_tool(name, arguments().cloned(), headers).await)
        }
        "prompts/list" => Ok(json!({ "prompts": to_result(&app.list_prompts())? })),
        "prompts/get" => {
            let name = name()
                .ok_or_else(|| (INVALID_PARAMS, "prompts/get requires a prompt name".to_string()))?;
            let result = app
                .get_prompt(name, arguments())
                .map_err(|e| (INVALID_PARAMS, e.to_string()))?;
            to_result(&result)
        }
        other => Err((METHOD_NOT_FOUND, format!("Method not found: {other}"))),
    }
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, (i64, String)> {
    serde_json::to_value(value).map_err(|e| (INTERNAL_ERROR, e.to_string()))
}
