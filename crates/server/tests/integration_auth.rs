mod common;

use axum::Json;
use axum::Router;
use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse as _;
use axum::routing::{get, post};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

use common::{BIN, McpStreamableHttpSession, RunningServer, serve_router, start_items_api, start_server, write_config};

/// Last token form the fake upstream received.
type SeenForm = Arc<Mutex<Option<HashMap<String, String>>>>;

/// Fake upstream authorization server. The token endpoint echoes the form it received and
/// rejects the code `bad`; the user info endpoint accepts the token it hands out.
async fn start_upstream() -> anyhow::Result<(String, SeenForm)> {
    let seen = SeenForm::default();
    let router = Router::new()
        .route(
            "/token",
            post(
                |State(seen): State<SeenForm>, Form(form): Form<HashMap<String, String>>| async move {
                    *seen.lock().unwrap() = Some(form.clone());
                    if form.get("code").map(String::as_str) == Some("bad") {
                        return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_grant"})))
                            .into_response();
                    }
                    Json(json!({
                        "access_token": "upstream-token",
                        "token_type": "Bearer",
                        "expires_in": 3600,
                        "form": form
                    }))
                    .into_response()
                },
            ),
        )
        .route(
            "/userinfo",
            get(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                if auth == "Bearer upstream-token" {
                    Json(json!({"sub": "user-1"})).into_response()
                } else {
                    StatusCode::UNAUTHORIZED.into_response()
                }
            }),
        )
        .with_state(Arc::clone(&seen));
    Ok((serve_router(router).await?, seen))
}

struct Proxy {
    server: RunningServer,
    upstream: String,
    seen: SeenForm,
    dir: tempfile::TempDir,
}

async fn start_proxy_with(extra_auth: &str) -> anyhow::Result<Proxy> {
    let (api, _hits) = start_items_api().await?;
    let (upstream, seen) = start_upstream().await?;
    let dir = tempdir()?;
    let cfg = write_config(
        &dir,
        &format!(
            r#"spec: {api}/openapi.json
base_url: {api}
auth:
  issuer: {upstream}
  authorize_url: {upstream}/authorize
  token_url: {upstream}/token
  client_id: test-client
  client_secret: test-secret
  audience: https://api.example.com
  default_scope: "openid profile"
  setup_proxies: true
  setup_fake_dynamic_registration: true
{extra_auth}  guard_checks:
    - kind: bearer
"#
        ),
    )?;
    let server = start_server(BIN, &cfg).await?;
    Ok(Proxy {
        server,
        upstream,
        seen,
        dir,
    })
}

async fn start_proxy() -> anyhow::Result<(RunningServer, String, tempfile::TempDir)> {
    let proxy = start_proxy_with("").await?;
    Ok((proxy.server, proxy.upstream, proxy.dir))
}

fn no_redirects() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?)
}

fn location_params(resp: &reqwest::Response) -> anyhow::Result<(url::Url, HashMap<String, String>)> {
    let location = url::Url::parse(
        resp.headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default(),
    )?;
    let params = location.query_pairs().into_owned().collect();
    Ok((location, params))
}

#[tokio::test]
async fn discovery_points_at_the_proxy_routes() -> anyhow::Result<()> {
    let (server, upstream, _dir) = start_proxy().await?;
    let base = &server.base_url;

    let doc: Value = reqwest::get(format!("{base}/.well-known/oauth-authorization-server"))
        .await?
        .error_for_status()?
        .json()
        .await?;
    assert_eq!(doc["issuer"], json!(upstream));
    assert_eq!(doc["authorization_endpoint"], json!(format!("{base}/oauth/authorize")));
    assert_eq!(doc["token_endpoint"], json!(format!("{base}/oauth/token")));
    assert_eq!(doc["registration_endpoint"], json!(format!("{base}/oauth/register")));
    assert_eq!(doc["scopes_supported"], json!(["openid", "profile"]));
    assert_eq!(doc["code_challenge_methods_supported"], json!(["S256"]));

    let resource: Value = reqwest::get(format!("{base}/.well-known/oauth-protected-resource"))
        .await?
        .json()
        .await?;
    assert_eq!(resource["authorization_servers"], json!([base]));
    Ok(())
}

#[tokio::test]
async fn fake_registration_is_stable() -> anyhow::Result<()> {
    let (server, _upstream, _dir) = start_proxy().await?;
    let client = reqwest::Client::new();
    let url = format!("{}/oauth/register", server.base_url);

    let mut seen = Vec::new();
    for name in ["first", "second"] {
        let resp = client
            .post(&url)
            .json(&json!({"client_name": name, "redirect_uris": ["http://localhost/cb"]}))
            .send()
            .await?;
        assert_eq!(resp.status().as_u16(), 201);
        let body: Value = resp.json().await?;
        assert_eq!(body["client_name"], name);
        seen.push((body["client_id"].clone(), body["client_secret"].clone()));
    }
    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[0].0, "test-client");
    Ok(())
}

#[tokio::test]
async fn authorize_redirects_upstream_with_defaults() -> anyhow::Result<()> {
    let (server, upstream, _dir) = start_proxy().await?;
    let client = no_redirects()?;

    let resp = client
        .get(format!("{}/oauth/authorize", server.base_url))
        .query(&[
            ("redirect_uri", "http://localhost/cb"),
            ("state", "xyz"),
            ("scope", "items:read"),
        ])
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 302);
    let (location, params) = location_params(&resp)?;
    assert!(location.as_str().starts_with(&format!("{upstream}/authorize")));
    assert_eq!(params["scope"], "items:read openid profile");
    assert_eq!(params["state"], "xyz");
    assert_eq!(params["client_id"], "test-client");
    assert_eq!(params["audience"], "https://api.example.com");
    assert_eq!(params["response_type"], "code");

    let missing = client
        .get(format!("{}/oauth/authorize", server.base_url))
        .send()
        .await?;
    assert_eq!(missing.status().as_u16(), 400);
    Ok(())
}

#[tokio::test]
async fn token_requests_get_scope_only_when_absent() -> anyhow::Result<()> {
    let (server, _upstream, _dir) = start_proxy().await?;
    let client = reqwest::Client::new();
    let url = format!("{}/oauth/token", server.base_url);

    let body: Value = client
        .post(&url)
        .form(&[("grant_type", "authorization_code"), ("code", "c1")])
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["access_token"], "upstream-token");
    assert_eq!(body["form"]["scope"], "openid profile");
    assert_eq!(body["form"]["audience"], "https://api.example.com");
    assert_eq!(body["form"]["client_secret"], "test-secret");

    let body: Value = client
        .post(&url)
        .form(&[("grant_type", "authorization_code"), ("code", "c2"), ("scope", "foo")])
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["form"]["scope"], "foo");
    Ok(())
}

#[tokio::test]
async fn guard_checks_run_before_the_protocol() -> anyhow::Result<()> {
    let (server, _upstream, _dir) = start_proxy().await?;

    let resp = reqwest::Client::new()
        .post(format!("{}/mcp", server.base_url))
        .header("Accept", "application/json, text/event-stream")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 401);
    let challenge = resp
        .headers()
        .get("www-authenticate")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert_eq!(
        challenge,
        format!(
            "Bearer resource_metadata=\"{}/.well-known/oauth-protected-resource\"",
            server.base_url
        )
    );
    assert_eq!(resp.text().await?, "Unauthorized");

    let sse = reqwest::get(format!("{}/mcp/sse", server.base_url)).await?;
    assert_eq!(sse.status().as_u16(), 401);

    let session = McpStreamableHttpSession::connect(&server.base_url, Some("token")).await?;
    let tools = session.request(1, "tools/list", json!({})).await?;
    assert_eq!(tools["result"]["tools"].as_array().map(Vec::len), Some(3));
    Ok(())
}

const CALLBACK_AUTH: &str = "  callback_path: /oauth/callback\n";

#[tokio::test]
async fn callback_exchanges_the_code_and_redirects_to_the_client() -> anyhow::Result<()> {
    let proxy = start_proxy_with(CALLBACK_AUTH).await?;
    let base = &proxy.server.base_url;
    let client = no_redirects()?;

    let resp = client
        .get(format!("{base}/oauth/authorize"))
        .query(&[("redirect_uri", "http://localhost:3334/cb"), ("state", "client-state")])
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 302);
    let (_, upstream_params) = location_params(&resp)?;
    assert_eq!(upstream_params["redirect_uri"], format!("{base}/oauth/callback"));
    let state = upstream_params["state"].clone();
    assert_ne!(state, "client-state");

    let resp = client
        .get(format!("{base}/oauth/callback"))
        .query(&[("code", "good"), ("state", state.as_str())])
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 302);
    let (location, params) = location_params(&resp)?;
    assert!(location.as_str().starts_with("http://localhost:3334/cb?"));
    assert_eq!(params["access_token"], "upstream-token");
    assert_eq!(params["token_type"], "Bearer");
    assert_eq!(params["expires_in"], "3600");
    assert_eq!(params["state"], "client-state");
    assert!(!params.contains_key("user_info"));

    let form = proxy.seen.lock().unwrap().clone().unwrap_or_default();
    assert_eq!(form["grant_type"], "authorization_code");
    assert_eq!(form["code"], "good");
    assert_eq!(form["client_id"], "test-client");
    assert_eq!(form["client_secret"], "test-secret");
    assert_eq!(form["redirect_uri"], format!("{base}/oauth/callback"));

    let bad = client
        .get(format!("{base}/oauth/callback"))
        .query(&[("code", "bad"), ("state", state.as_str())])
        .send()
        .await?;
    assert_eq!(bad.status().as_u16(), 502);

    let corrupted = client
        .get(format!("{base}/oauth/callback"))
        .query(&[("code", "good"), ("state", "garbage")])
        .send()
        .await?;
    assert_eq!(corrupted.status().as_u16(), 400);
    Ok(())
}

#[tokio::test]
async fn callback_forwards_user_info_and_provider_errors() -> anyhow::Result<()> {
    let (api, _hits) = start_items_api().await?;
    let (upstream, _seen) = start_upstream().await?;
    let dir = tempdir()?;
    let cfg = write_config(
        &dir,
        &format!(
            r#"spec: {api}/openapi.json
base_url: {api}
auth:
  issuer: {upstream}
  authorize_url: {upstream}/authorize
  token_url: {upstream}/token
  client_id: test-client
  client_secret: test-secret
  setup_proxies: true
  callback_path: /oauth/callback
  user_info_url: {upstream}/userinfo
"#
        ),
    )?;
    let server = start_server(BIN, &cfg).await?;
    let base = &server.base_url;
    let client = no_redirects()?;

    let doc: Value = reqwest::get(format!("{base}/.well-known/oauth-authorization-server"))
        .await?
        .json()
        .await?;
    assert_eq!(doc["userinfo_endpoint"], json!(format!("{upstream}/userinfo")));

    let resp = client
        .get(format!("{base}/oauth/authorize"))
        .query(&[("redirect_uri", "http://localhost:3334/cb")])
        .send()
        .await?;
    let (_, upstream_params) = location_params(&resp)?;
    let state = upstream_params["state"].clone();

    let resp = client
        .get(format!("{base}/oauth/callback"))
        .query(&[("code", "good"), ("state", state.as_str())])
        .send()
        .await?;
    let (_, params) = location_params(&resp)?;
    let info: Value = serde_json::from_str(&params["user_info"])?;
    assert_eq!(info["sub"], "user-1");
    assert!(!params.contains_key("state"));

    let resp = client
        .get(format!("{base}/oauth/callback"))
        .query(&[
            ("error", "access_denied"),
            ("error_description", "User said no"),
            ("state", state.as_str()),
        ])
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 302);
    let (location, params) = location_params(&resp)?;
    assert!(location.as_str().starts_with("http://localhost:3334/cb?"));
    assert_eq!(params["error"], "access_denied");
    assert_eq!(params["error_description"], "User said no");

    let resp = client
        .get(format!("{base}/oauth/callback"))
        .query(&[("error", "access_denied")])
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 400);
    Ok(())
}
