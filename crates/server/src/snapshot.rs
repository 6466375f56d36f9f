//! Immutable tool/prompt snapshots and the catalog sources they are built from.
//!
//! A refresh never patches a snapshot in place: the whole catalog -> exposed set -> tools and
//! prompts derivation runs again and the result replaces the previous snapshot in one swap.
//! In-flight calls keep the `Arc<Snapshot>` they started with.

use crate::error::Result;
use crate::prompts::{PromptDefinition, PromptRegistry};
use parking_lot::RwLock;
use rmcp::model::{JsonObject, Tool, ToolAnnotations};
use routebridge_openapi_tools::catalog::{CatalogSource, OpenApiDocument, OperationCatalog};
use routebridge_openapi_tools::config::{ConversionOptions, FilterRules};
use routebridge_openapi_tools::filter::exposed_set;
use routebridge_openapi_tools::tools::{ToolDefinition, build_tools};
use std::collections::HashMap;
use std::sync::Arc;

/// Everything the protocol surface serves, derived from one catalog read.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    tools: Arc<Vec<Tool>>,
    definitions: Arc<HashMap<String, ToolDefinition>>,
    prompts: PromptRegistry,
}

impl Snapshot {
    /// Tools in catalog order, ready to list.
    #[must_use]
    pub fn tools(&self) -> Arc<Vec<Tool>> {
        Arc::clone(&self.tools)
    }

    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.definitions.get(name)
    }

    #[must_use]
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn prompts(&self) -> &PromptRegistry {
        &self.prompts
    }

    /// A copy of this snapshot with `prompt` registered on top.
    #[must_use]
    pub fn with_prompt(&self, prompt: PromptDefinition) -> Self {
        let mut next = self.clone();
        next.prompts.register(prompt);
        next
    }
}

/// Builds snapshots from catalogs with a fixed set of options.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFactory {
    pub conversion: ConversionOptions,
    pub filters: FilterRules,
    pub auto_generate_prompts: bool,
    pub prompts: Vec<PromptDefinition>,
}

impl SnapshotFactory {
    /// Derive a snapshot from `catalog`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for contradictory filters or colliding tool names.
    pub fn build(&self, catalog: &OperationCatalog) -> Result<Snapshot> {
        let exposed = exposed_set(catalog, &self.filters)?;
        let definitions = build_tools(catalog, &exposed, &self.conversion)?;
        let prompts = PromptRegistry::build(&definitions, self.auto_generate_prompts, &self.prompts);
        let tools: Vec<Tool> = definitions.iter().map(to_protocol_tool).collect();

        tracing::info!(
            operations = catalog.len(),
            tools = tools.len(),
            prompts = prompts.len(),
            "Built tool snapshot"
        );

        Ok(Snapshot {
            tools: Arc::new(tools),
            definitions: Arc::new(
                definitions
                    .into_iter()
                    .map(|d| (d.name.clone(), d))
                    .collect(),
            ),
            prompts,
        })
    }
}

fn to_protocol_tool(def: &ToolDefinition) -> Tool {
    let schema = def
        .input_schema
        .as_object()
        .cloned()
        .unwrap_or_else(JsonObject::new);
    let mut tool = Tool::new(def.name.clone(), def.description.clone(), Arc::new(schema));
    tool.title.clone_from(&def.title);
    tool.annotations = Some(ToolAnnotations {
        title: def.title.clone(),
        read_only_hint: Some(def.hints.read_only),
        destructive_hint: Some(def.hints.destructive),
        idempotent_hint: def.hints.idempotent,
        open_world_hint: Some(def.hints.open_world),
    });
    tool
}

/// Shared handle to the current snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotHandle {
    inner: Arc<RwLock<Arc<Snapshot>>>,
}

impl SnapshotHandle {
    #[must_use]
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    #[must_use]
    pub fn load(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.read())
    }

    pub fn swap(&self, snapshot: Snapshot) {
        *self.inner.write() = Arc::new(snapshot);
    }

    /// Replace the snapshot with `f(current)` under the write lock.
    pub fn update(&self, f: impl FnOnce(&Snapshot) -> Snapshot) {
        let mut guard = self.inner.write();
        let next = f(&guard);
        *guard = Arc::new(next);
    }
}

/// Where catalogs come from.
#[derive(Clone)]
pub enum CatalogProvider {
    /// A document at a path or URL, re-read on every refresh.
    Remote {
        location: String,
        http: reqwest::Client,
    },
    /// An in-process source.
    Static(Arc<dyn CatalogSource>),
}

impl CatalogProvider {
    #[must_use]
    pub fn remote(location: impl Into<String>, http: reqwest::Client) -> Self {
        Self::Remote {
            location: location.into(),
            http,
        }
    }

    #[must_use]
    pub fn document(document: OpenApiDocument) -> Self {
        Self::Static(Arc::new(document))
    }

    /// Read a fresh catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be loaded or read.
    pub async fn read(&self) -> Result<OperationCatalog> {
        match self {
            Self::Remote { location, http } => {
                let document = OpenApiDocument::load(location, http).await?;
                Ok(document.read_catalog()?)
            }
            Self::Static(source) => Ok(source.read_catalog()?),
        }
    }
}

impl std::fmt::Debug for CatalogProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote { location, .. } => f
                .debug_struct("Remote")
                .field("location", location)
                .finish_non_exhaustive(),
            Self::Static(_) => f.debug_tuple("Static").finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> OperationCatalog {
        OpenApiDocument::from_value(json!({
            "openapi": "3.1.0",
            "info": {"title": "Items", "version": "1"},
            "paths": {
                "/items": {
                    "get": {"operationId": "list_items", "summary": "List items", "tags": ["items"]},
                    "post": {"operationId": "create_item", "tags": ["items"]}
                },
                "/login": {
                    "post": {"operationId": "login", "tags": ["auth"]}
                },
                "/status": {
                    "get": {"operationId": "status", "tags": ["public"]}
                }
            }
        }))
        .read_catalog()
        .unwrap()
    }

    fn factory() -> SnapshotFactory {
        SnapshotFactory {
            auto_generate_prompts: true,
            ..SnapshotFactory::default()
        }
    }

    #[test]
    fn builds_one_tool_and_prompt_per_operation() {
        let snap = factory().build(&catalog()).unwrap();
        let tools = snap.tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(names, vec!["list_items", "create_item", "login", "status"]);
        assert_eq!(snap.prompts().len(), 4);
        assert!(snap.tool("create_item").is_some());

        let list = &tools[0];
        let annotations = list.annotations.as_ref().unwrap();
        assert_eq!(annotations.read_only_hint, Some(true));
        assert_eq!(annotations.open_world_hint, Some(true));
        assert_eq!(list.title.as_deref(), Some("List items"));
    }

    #[test]
    fn include_filters_are_combined_with_or() {
        let factory = SnapshotFactory {
            filters: FilterRules {
                include_operations: vec!["login".into()],
                include_tags: vec!["public".into()],
                ..FilterRules::default()
            },
            ..factory()
        };
        let snap = factory.build(&catalog()).unwrap();
        let mut names: Vec<String> = snap.tools().iter().map(|t| t.name.to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["login".to_string(), "status".to_string()]);
    }

    #[test]
    fn swap_does_not_disturb_loaded_snapshots() {
        let handle = SnapshotHandle::new(factory().build(&catalog()).unwrap());
        let before = handle.load();
        handle.swap(Snapshot::default());
        assert_eq!(before.tool_count(), 4);
        assert_eq!(handle.load().tool_count(), 0);
    }

    #[tokio::test]
    async fn static_provider_reads_catalog() {
        let provider = CatalogProvider::document(OpenApiDocument::from_value(json!({
            "openapi": "3.1.0",
            "info": {"title": "t", "version": "1"},
            "paths": {"/a": {"get": {"operationId": "a"}}}
        })));
        let catalog = provider.read().await.unwrap();
        assert_eq!(catalog.len(), 1);
    }
}
