use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use routebridge_server::app::App;
use routebridge_server::config::ServerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "routebridge", version, about = "Serve an OpenAPI-described API as MCP tools")]
struct Cli {
    /// YAML config file.
    #[arg(long, env = "ROUTEBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "ROUTEBRIDGE_BIND", default_value = "127.0.0.1:8000")]
    bind: SocketAddr,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, env = "ROUTEBRIDGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, env = "ROUTEBRIDGE_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Path or URL of the `OpenAPI` document; overrides `spec` in the config.
    #[arg(long, env = "ROUTEBRIDGE_SPEC")]
    spec: Option<String>,

    /// Overrides `base_url` in the config.
    #[arg(long, env = "ROUTEBRIDGE_BASE_URL")]
    base_url: Option<String>,
}

fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(spec) = &cli.spec {
        config.spec = Some(spec.clone());
    }
    if let Some(base_url) = &cli.base_url {
        config.base_url = Some(base_url.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = load_config(&cli)?;
    let app = App::from_config(&config).await.context("build server")?;

    #[cfg(unix)]
    spawn_refresh_on_hangup(app.clone())?;

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("bind {}", cli.bind))?;
    tracing::info!(
        bind = %cli.bind,
        mount_path = %app.options().mount_path,
        tools = app.snapshot().tool_count(),
        "Listening"
    );

    axum::serve(listener, app.router())
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
            }
        })
        .await
        .context("serve")?;
    Ok(())
}

#[cfg(unix)]
fn spawn_refresh_on_hangup(app: App) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            if let Err(e) = app.refresh().await {
                tracing::warn!(error = %e, "Catalog refresh failed; keeping current tools");
            }
        }
    });
    Ok(())
}
