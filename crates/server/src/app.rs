//! The assembled server: snapshot, dispatcher, guards and the OAuth proxy behind one handle.

use crate::auth::AuthProxy;
use crate::config::ServerConfig;
use crate::dispatch::{CallerHeaders, Dispatcher};
use crate::error::{Result, ServerError};
use crate::guard::{GuardChain, require_guards};
use crate::mcp::McpHandler;
use crate::prompts::PromptDefinition;
use crate::snapshot::{CatalogProvider, Snapshot, SnapshotFactory, SnapshotHandle};
use crate::sse;
use axum::Router;
use axum::http::HeaderMap;
use axum::routing::get;
use parking_lot::Mutex;
use rmcp::model::{
    CallToolResult, GetPromptResult, Implementation, Prompt, PromptArgument, PromptMessage,
    PromptMessageRole, ProtocolVersion, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::{StreamableHttpServerConfig, StreamableHttpService};
use routebridge_http_tools::invoke::HttpInvoker;
use routebridge_openapi_tools::catalog::OperationCatalog;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;

/// Identity and mount point of the protocol surface.
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub name: String,
    /// Sent to agents as the server instructions.
    pub description: Option<String>,
    pub mount_path: String,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            name: "routebridge".to_string(),
            description: None,
            mount_path: crate::config::DEFAULT_MOUNT_PATH.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct App {
    options: Arc<AppOptions>,
    provider: CatalogProvider,
    factory: Arc<Mutex<SnapshotFactory>>,
    snapshot: SnapshotHandle,
    dispatcher: Dispatcher,
    guards: Arc<GuardChain>,
    auth: Option<Arc<AuthProxy>>,
    refresh_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("options", &self.options)
            .field("provider", &self.provider)
            .field("guards", &self.guards)
            .finish_non_exhaustive()
    }
}

impl App {
    /// Build an app from a catalog that has already been read from `provider`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the snapshot cannot be derived.
    pub fn from_catalog(
        options: AppOptions,
        provider: CatalogProvider,
        factory: SnapshotFactory,
        dispatcher: Dispatcher,
        catalog: &OperationCatalog,
    ) -> Result<Self> {
        let snapshot = factory.build(catalog)?;
        Ok(Self {
            options: Arc::new(options),
            provider,
            factory: Arc::new(Mutex::new(factory)),
            snapshot: SnapshotHandle::new(snapshot),
            dispatcher,
            guards: Arc::new(GuardChain::default()),
            auth: None,
            refresh_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Read the catalog from `provider` and build the app.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read or converted.
    pub async fn new(
        options: AppOptions,
        provider: CatalogProvider,
        factory: SnapshotFactory,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        let catalog = provider.read().await?;
        Self::from_catalog(options, provider, factory, dispatcher, &catalog)
    }

    /// Build everything `config` describes: catalog, HTTP invoker, guard checks and OAuth proxy.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be loaded, no base URL is known, or the auth
    /// settings cannot be resolved.
    pub async fn from_config(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        let spec = config
            .spec
            .clone()
            .ok_or_else(|| ServerError::Configuration("spec is required".to_string()))?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ServerError::Configuration(format!("failed to build HTTP client: {e}")))?;

        let provider = CatalogProvider::remote(spec, http.clone());
        let catalog = provider.read().await?;

        let base_url = config
            .base_url
            .clone()
            .or_else(|| catalog.declared_base_url().map(str::to_string))
            .ok_or_else(|| {
                ServerError::Configuration(
                    "base_url is required when the document declares no servers".to_string(),
                )
            })?;
        let timeout = Duration::from_secs(config.timeout_secs);
        let invoker = HttpInvoker::with_client(http.clone(), base_url.as_str())?.timeout(timeout);
        tracing::info!(base_url = %invoker.base_url(), timeout_secs = config.timeout_secs, "Invoking API over HTTP");
        let dispatcher = Dispatcher::new(Arc::new(invoker), timeout, &config.forward_headers);

        let prompts = config
            .prompts
            .iter()
            .map(PromptDefinition::explicit)
            .collect::<Result<Vec<_>>>()?;
        let factory = SnapshotFactory {
            conversion: config.conversion.clone(),
            filters: config.filters.clone(),
            auto_generate_prompts: config.auto_generate_prompts,
            prompts,
        };

        let options = AppOptions {
            name: config.name.clone(),
            description: config
                .description
                .clone()
                .or_else(|| catalog.title().map(str::to_string)),
            mount_path: config.mount_path.clone(),
        };
        let mut app = Self::from_catalog(options, provider, factory, dispatcher, &catalog)?;

        if let Some(auth) = &config.auth {
            app = app.with_guards(GuardChain::from_config(auth, &http).await?);
            if let Some(proxy) = AuthProxy::new(auth, http).await? {
                app = app.with_auth_proxy(proxy);
            }
        }
        Ok(app)
    }

    #[must_use]
    pub fn with_guards(mut self, guards: GuardChain) -> Self {
        self.guards = Arc::new(guards);
        self
    }

    #[must_use]
    pub fn with_auth_proxy(mut self, proxy: AuthProxy) -> Self {
        self.auth = Some(Arc::new(proxy));
        self
    }

    #[must_use]
    pub fn options(&self) -> &AppOptions {
        &self.options
    }

    /// The snapshot calls should run against right now.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load()
    }

    /// Re-read the catalog and swap in a snapshot derived from scratch.
    ///
    /// Returns the number of tools now exposed. On failure the current snapshot stays.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read or converted.
    pub async fn refresh(&self) -> Result<usize> {
        let _serialized = self.refresh_lock.lock().await;
        let catalog = self.provider.read().await?;
        // Build and swap under the factory lock so a concurrent `register_prompt` lands either in
        // the factory before the build or on the swapped-in snapshot.
        let tools = {
            let factory = self.factory.lock();
            let snapshot = factory.build(&catalog)?;
            let tools = snapshot.tool_count();
            self.snapshot.swap(snapshot);
            tools
        };
        tracing::info!(tools, "Catalog refreshed");
        Ok(tools)
    }

    /// Register an explicit prompt. It replaces any prompt of the same name and survives
    /// refreshes.
    pub fn register_prompt(&self, prompt: PromptDefinition) {
        let mut factory = self.factory.lock();
        factory.prompts.retain(|p| p.name != prompt.name);
        factory.prompts.push(prompt.clone());
        self.snapshot.update(|current| current.with_prompt(prompt));
    }

    #[must_use]
    pub fn list_tools(&self) -> Vec<Tool> {
        self.snapshot().tools().as_ref().clone()
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        caller_headers: &[(String, String)],
    ) -> CallToolResult {
        let snapshot = self.snapshot();
        self.dispatcher
            .call(&snapshot, name, arguments, caller_headers)
            .await
    }

    #[must_use]
    pub fn list_prompts(&self) -> Vec<Prompt> {
        self.snapshot()
            .prompts()
            .list()
            .map(|def| {
                let arguments = def
                    .arguments
                    .iter()
                    .map(|a| PromptArgument {
                        name: a.name.clone(),
                        title: None,
                        description: a.description.clone(),
                        required: Some(a.required),
                    })
                    .collect();
                let mut prompt = Prompt::new(&def.name, Some(&def.description), Some(arguments));
                prompt.title = Some(def.title.clone());
                prompt
            })
            .collect()
    }

    /// Render prompt `name` into a single user message.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::PromptNotFound`], [`ServerError::PromptArgument`] or
    /// [`ServerError::PromptRender`].
    pub fn get_prompt(
        &self,
        name: &str,
        arguments: Option<&Map<String, Value>>,
    ) -> Result<GetPromptResult> {
        let empty = Map::new();
        let snapshot = self.snapshot();
        let (def, text) = snapshot
            .prompts()
            .render(name, arguments.unwrap_or(&empty))?;
        Ok(GetPromptResult {
            description: Some(def.description.clone()),
            messages: vec![PromptMessage::new_text(PromptMessageRole::User, text)],
        })
    }

    #[must_use]
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_prompts()
                .build(),
            server_info: Implementation {
                name: self.options.name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: self.options.description.clone(),
        }
    }

    /// `/health`, the OAuth routes (when configured) and both protocol bindings under
    /// `mount_path`. Guard checks wrap only the protocol bindings.
    pub fn router(&self) -> Router {
        let mount = self.options.mount_path.as_str();
        let handler = McpHandler::new(self.clone());
        let streamable = StreamableHttpService::new(
            move || Ok(handler.clone()),
            Arc::new(LocalSessionManager::default()),
            StreamableHttpServerConfig::default(),
        );

        let mut protocol = Router::new()
            .route_service(mount, streamable)
            .merge(sse::router(self.clone(), mount));
        if !self.guards.is_empty() {
            protocol = protocol.layer(axum::middleware::from_fn_with_state(
                Arc::clone(&self.guards),
                require_guards,
            ));
        }

        let app = self.clone();
        let mut router = Router::new()
            .route(
                "/health",
                get(move || {
                    let tools = app.snapshot().tool_count();
                    async move { axum::Json(json!({"status": "ok", "tools": tools})) }
                }),
            )
            .merge(protocol);
        if let Some(auth) = &self.auth {
            router = router.merge(Arc::clone(auth).router());
        }
        router
    }
}

/// Inbound headers as name/value pairs; the dispatcher picks the forwarded ones.
pub(crate) fn caller_headers(headers: &HeaderMap) -> CallerHeaders {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
