//! Helpers shared by the integration tests: ports, readiness polling, in-process fake
//! servers and the spawned `routebridge` binary.

use anyhow::Context as _;
use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
    }
}

/// Pick an unused TCP port on localhost.
///
/// Note: this does not reserve the port; it's still possible for another process to bind it
/// before you do.
///
/// # Errors
///
/// Returns an error if binding an ephemeral localhost port fails or if the bound socket's
/// local address cannot be read.
pub fn pick_unused_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("bind ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

/// Poll an HTTP URL until it returns a success status (2xx/3xx).
///
/// # Errors
///
/// Returns an error if the timeout elapses before the endpoint returns a success status.
pub async fn wait_http_ok(url: &str, timeout_dur: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout_dur {
            anyhow::bail!("timed out waiting for {url}");
        }

        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }
}

/// Serve `router` on an ephemeral localhost port in the current runtime.
///
/// Returns the base URL (`http://127.0.0.1:<port>`). The server lives until the runtime stops.
///
/// # Errors
///
/// Returns an error if no port can be bound.
pub async fn serve_router(router: axum::Router) -> anyhow::Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind fake server")?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok(format!("http://{addr}"))
}

/// A spawned `routebridge` process and the base URL it listens on.
pub struct RunningServer {
    pub base_url: String,
    _child: KillOnDrop,
}

/// Spawn the server binary at `bin` with `config` and wait for `/health`.
///
/// # Errors
///
/// Returns an error if the process cannot be spawned or never becomes healthy.
pub async fn start_server(bin: &str, config: &Path) -> anyhow::Result<RunningServer> {
    let port = pick_unused_port()?;
    let child = Command::new(bin)
        .arg("--config")
        .arg(config)
        .arg("--bind")
        .arg(format!("127.0.0.1:{port}"))
        .arg("--log-level")
        .arg("info")
        .spawn()
        .context("spawn routebridge")?;
    let child = KillOnDrop(child);

    let base_url = format!("http://127.0.0.1:{port}");
    wait_http_ok(&format!("{base_url}/health"), Duration::from_secs(20)).await?;
    Ok(RunningServer {
        base_url,
        _child: child,
    })
}
