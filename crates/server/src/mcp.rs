//! rmcp `ServerHandler` over [`App`], served by the streamable HTTP binding.

use crate::app::{App, caller_headers};
use rmcp::model::{
    CallToolRequestParams, CallToolResult, ErrorData, GetPromptRequestParams, GetPromptResult,
    ListPromptsResult, ListToolsResult, PaginatedRequestParams, ServerInfo,
};
use rmcp::{RoleServer, ServerHandler, service::RequestContext};

#[derive(Debug, Clone)]
pub struct McpHandler {
    app: App,
}

impl McpHandler {
    #[must_use]
    pub fn new(app: App) -> Self {
        Self { app }
    }
}

impl ServerHandler for McpHandler {
    fn get_info(&self) -> ServerInfo {
        self.app.server_info()
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, ErrorData>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult::with_all_items(self.app.list_tools())))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, ErrorData>> + Send + '_ {
        // The HTTP request parts ride along in the context extensions.
        let headers = context
            .extensions
            .get::<axum::http::request::Parts>()
            .map(|parts| caller_headers(&parts.headers))
            .unwrap_or_default();
        async move {
            Ok(self
                .app
                .call_tool(&request.name, request.arguments, &headers)
                .await)
        }
    }

    fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListPromptsResult, ErrorData>> + Send + '_ {
        std::future::ready(Ok(ListPromptsResult::with_all_items(self.app.list_prompts())))
    }

    fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<GetPromptResult, ErrorData>> + Send + '_ {
        std::future::ready(
            self.app
                .get_prompt(&request.name, request.arguments.as_ref())
                .map_err(|e| ErrorData::invalid_params(e.to_string(), None)),
        )
    }
}
