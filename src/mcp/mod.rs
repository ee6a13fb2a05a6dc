//! MCP (Model Context Protocol) server for the C++ index.
//!
//! Tools answer with JSON documents carrying full symbol records, so
//! consumers can rely on template metadata, header-split locations, and
//! documentation fields being present (possibly null). New fields are
//! additive; clients tolerate unknown keys.
//!
//! Indexing runs on a background thread holding the indexer lock;
//! `get_indexing_status` reads a separate status handle and never blocks.
//! Query tools that hit the held lock answer with an indexing-in-progress
//! document instead of waiting.

use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{ErrorData as McpError, *},
    schemars,
    tool, tool_handler, tool_router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

use crate::config::Settings;
use crate::error::QueryResult;
use crate::indexing::{ProjectIndexer, StatusHandle};
use crate::query::QueryEngine;
use crate::symbol::SymbolKind;

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct SetProjectRequest {
    /// Absolute or relative path of the project root
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct EmptyRequest {}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct RefreshRequest {
    /// Re-index every file even when hashes match
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct SearchClassesRequest {
    /// Identifier for exact lookup, or a regular expression
    pub pattern: String,
    /// Restrict results to project (non-dependency) code
    #[serde(default)]
    pub project_only: bool,
    /// Filter by kind: class, struct, class_template, partial_specialization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct SearchFunctionsRequest {
    /// Identifier for exact lookup, or a regular expression
    pub pattern: String,
    /// Only functions that are methods of this class
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Only functions taking this parameter type (alias-aware)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param_type: Option<String>,
    #[serde(default)]
    pub project_only: bool,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct SearchSymbolsRequest {
    /// Identifier for exact lookup, or a regular expression
    pub pattern: String,
    /// Filter by symbol kind (e.g. "class", "function", "using")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub project_only: bool,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct NameRequest {
    /// Symbol name (short or qualified)
    pub name: String,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct FunctionRequest {
    /// Function or method name
    pub function: String,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct CallPathRequest {
    /// Caller function name
    pub from: String,
    /// Callee function name
    pub to: String,
    /// Maximum path length in edges (default 5)
    #[serde(default = "default_call_path_depth")]
    pub max_depth: usize,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct FindInFileRequest {
    /// Absolute file path
    pub file: String,
    /// Identifier or regular expression
    pub pattern: String,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct FilesContainingRequest {
    /// Symbol name (short or qualified)
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub project_only: bool,
}

fn default_call_path_depth() -> usize {
    5
}

#[derive(Clone)]
pub struct CodeIndexServer {
    indexer: Arc<Mutex<Option<ProjectIndexer>>>,
    status: Arc<Mutex<Option<StatusHandle>>>,
    settings: Arc<Settings>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl CodeIndexServer {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            indexer: Arc::new(Mutex::new(None)),
            status: Arc::new(Mutex::new(None)),
            settings,
            tool_router: Self::tool_router(),
        }
    }

    /// Server with a project already opened (CLI embedded mode).
    pub fn with_indexer(settings: Arc<Settings>, indexer: ProjectIndexer) -> Self {
        let server = Self::new(settings);
        *server.status.lock().expect("status lock") = Some(indexer.status_handle());
        *server.indexer.lock().expect("indexer lock") = Some(indexer);
        server
    }

    fn json_response<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    fn busy_response(&self) -> Result<CallToolResult, McpError> {
        let status = self
            .status
            .lock()
            .expect("status lock")
            .as_ref()
            .map(|handle| handle.snapshot());
        Self::json_response(&serde_json::json!({
            "error_kind": "store_busy",
            "message": "indexing in progress; results are not yet queryable",
            "status": status,
        }))
    }

    /// Run a query against the engine, or explain why it cannot run yet.
    fn with_engine<T, F>(&self, run: F) -> Result<CallToolResult, McpError>
    where
        T: Serialize,
        F: FnOnce(&QueryEngine) -> QueryResult<T>,
    {
        let Ok(guard) = self.indexer.try_lock() else {
            return self.busy_response();
        };
        let Some(indexer) = guard.as_ref() else {
            return Ok(CallToolResult::error(vec![Content::text(
                "No project set. Call set_project_directory first.",
            )]));
        };
        let engine = QueryEngine::new(
            indexer.indexes(),
            Some(indexer.store()),
            &indexer.settings().query,
        );
        match run(&engine) {
            Ok(value) => Self::json_response(&value),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(
                serde_json::json!({
                    "error_kind": e.kind().as_str(),
                    "message": e.to_string(),
                })
                .to_string(),
            )])),
        }
    }

    fn spawn_index_thread(&self, force: bool, refresh: bool) {
        let indexer = self.indexer.clone();
        std::thread::spawn(move || {
            let mut guard = indexer.lock().expect("indexer lock");
            let Some(indexer) = guard.as_mut() else {
                return;
            };
            let result = if refresh {
                indexer.refresh(force)
            } else {
                indexer.index_all(force)
            };
            match result {
                Ok(outcome) => info!(
                    "background index finished: {} indexed, {} failed",
                    outcome.indexed, outcome.failed
                ),
                Err(e) => error!("background index failed: {e}"),
            }
        });
    }

    #[tool(description = "Set the active C++ project; loads its cache and starts indexing if stale")]
    pub async fn set_project_directory(
        &self,
        Parameters(SetProjectRequest { path }): Parameters<SetProjectRequest>,
    ) -> Result<CallToolResult, McpError> {
        let settings = self.settings.clone();
        let root = PathBuf::from(&path);
        let opened = tokio::task::spawn_blocking(move || ProjectIndexer::open(&root, settings))
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        let indexer = match opened {
            Ok(indexer) => indexer,
            Err(e) => {
                return Ok(CallToolResult::error(vec![Content::text(
                    serde_json::json!({
                        "error_kind": e.kind().as_str(),
                        "message": e.to_string(),
                    })
                    .to_string(),
                )]));
            }
        };

        let handle = indexer.status_handle();
        // Anything short of a fully current cache schedules an index pass.
        let needs_index = handle.state() != crate::symbol::AnalyzerState::ReadyFromCache;
        *self.status.lock().expect("status lock") = Some(handle.clone());
        *self.indexer.lock().expect("indexer lock") = Some(indexer);
        if needs_index {
            self.spawn_index_thread(false, false);
        }

        Self::json_response(&serde_json::json!({
            "project": path,
            "state": handle.state().as_str(),
            "indexing_scheduled": needs_index,
        }))
    }

    #[tool(description = "Current indexing state and progress; never blocks")]
    pub async fn get_indexing_status(
        &self,
        Parameters(EmptyRequest {}): Parameters<EmptyRequest>,
    ) -> Result<CallToolResult, McpError> {
        let status = self.status.lock().expect("status lock");
        match status.as_ref() {
            Some(handle) => Self::json_response(&handle.snapshot()),
            None => Self::json_response(&serde_json::json!({
                "state": "uninitialized",
            })),
        }
    }

    #[tool(description = "Re-scan the project and index added, changed, and removed files")]
    pub async fn refresh_project(
        &self,
        Parameters(RefreshRequest { force }): Parameters<RefreshRequest>,
    ) -> Result<CallToolResult, McpError> {
        if self.indexer.try_lock().is_err() {
            return self.busy_response();
        }
        if self.indexer.lock().expect("indexer lock").is_none() {
            return Ok(CallToolResult::error(vec![Content::text(
                "No project set. Call set_project_directory first.",
            )]));
        }
        self.spawn_index_thread(force, true);
        Self::json_response(&serde_json::json!({
            "refresh_scheduled": true,
            "force": force,
        }))
    }

    #[tool(description = "Search classes/structs/templates by identifier or regex; template names aggregate their specializations")]
    pub async fn search_classes(
        &self,
        Parameters(SearchClassesRequest {
            pattern,
            project_only,
            kind,
        }): Parameters<SearchClassesRequest>,
    ) -> Result<CallToolResult, McpError> {
        let kind = kind.as_deref().and_then(SymbolKind::parse);
        self.with_engine(|engine| engine.search_classes(&pattern, project_only, kind))
    }

    #[tool(description = "Search functions and methods; param_type matches through type aliases")]
    pub async fn search_functions(
        &self,
        Parameters(SearchFunctionsRequest {
            pattern,
            class_name,
            param_type,
            project_only,
        }): Parameters<SearchFunctionsRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.with_engine(|engine| {
            engine.search_functions(
                &pattern,
                class_name.as_deref(),
                param_type.as_deref(),
                project_only,
            )
        })
    }

    #[tool(description = "Search symbols of any kind by identifier or regex")]
    pub async fn search_symbols(
        &self,
        Parameters(SearchSymbolsRequest {
            pattern,
            kind,
            project_only,
        }): Parameters<SearchSymbolsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let kind = kind.as_deref().and_then(SymbolKind::parse);
        self.with_engine(|engine| engine.search_symbols(&pattern, kind, project_only))
    }

    #[tool(description = "Class details: location, bases, derived classes, methods, docs")]
    pub async fn get_class_info(
        &self,
        Parameters(NameRequest { name }): Parameters<NameRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.with_engine(|engine| engine.get_class_info(&name))
    }

    #[tool(description = "All overloads of a function with signatures and canonical parameter types")]
    pub async fn get_function_info(
        &self,
        Parameters(NameRequest { name }): Parameters<NameRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.with_engine(|engine| engine.get_function_info(&name))
    }

    #[tool(description = "Call sites that invoke the given function, with source context")]
    pub async fn find_callers(
        &self,
        Parameters(FunctionRequest { function }): Parameters<FunctionRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.with_engine(|engine| engine.find_callers(&function))
    }

    #[tool(description = "Call sites inside the given function, with source context")]
    pub async fn get_call_sites(
        &self,
        Parameters(FunctionRequest { function }): Parameters<FunctionRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.with_engine(|engine| engine.get_call_sites(&function))
    }

    #[tool(description = "All shortest call paths between two functions, bounded by max_depth")]
    pub async fn get_call_path(
        &self,
        Parameters(CallPathRequest {
            from,
            to,
            max_depth,
        }): Parameters<CallPathRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.with_engine(|engine| engine.get_call_path(&from, &to, max_depth))
    }

    #[tool(description = "Recursive base and derived class hierarchy for a class")]
    pub async fn get_class_hierarchy(
        &self,
        Parameters(NameRequest { name }): Parameters<NameRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.with_engine(|engine| engine.get_class_hierarchy(&name))
    }

    #[tool(description = "Symbols in one file whose name matches a pattern")]
    pub async fn find_in_file(
        &self,
        Parameters(FindInFileRequest { file, pattern }): Parameters<FindInFileRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.with_engine(|engine| engine.find_in_file(&file, &pattern))
    }

    #[tool(description = "Files defining, declaring, or calling a symbol")]
    pub async fn get_files_containing_symbol(
        &self,
        Parameters(FilesContainingRequest {
            name,
            kind,
            project_only,
        }): Parameters<FilesContainingRequest>,
    ) -> Result<CallToolResult, McpError> {
        let kind = kind.as_deref().and_then(SymbolKind::parse);
        self.with_engine(|engine| engine.get_files_containing_symbol(&name, kind, project_only))
    }

    #[tool(description = "Cache statistics: symbol counts by kind, top files, database size")]
    pub async fn get_stats(
        &self,
        Parameters(EmptyRequest {}): Parameters<EmptyRequest>,
    ) -> Result<CallToolResult, McpError> {
        let Ok(guard) = self.indexer.try_lock() else {
            return self.busy_response();
        };
        let Some(indexer) = guard.as_ref() else {
            return Ok(CallToolResult::error(vec![Content::text(
                "No project set. Call set_project_directory first.",
            )]));
        };
        match indexer.store().cache_stats() {
            Ok(stats) => Self::json_response(&stats),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }

    #[tool(description = "Call-graph statistics: busiest callers and callees")]
    pub async fn get_call_statistics(
        &self,
        Parameters(EmptyRequest {}): Parameters<EmptyRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.with_engine(|engine| {
            Ok::<_, crate::error::QueryError>(engine.get_call_statistics())
        })
    }

    #[tool(description = "Deprecated: explicit cross-references are not extracted; returns an empty list")]
    pub async fn get_cross_references(
        &self,
        Parameters(NameRequest { name }): Parameters<NameRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.with_engine(|engine| {
            Ok::<_, crate::error::QueryError>(engine.get_cross_references(&name))
        })
    }
}

#[tool_handler]
impl ServerHandler for CodeIndexServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_protocol_version(ProtocolVersion::V_2024_11_05)
            .with_server_info(
                Implementation::new("clangmap", env!("CARGO_PKG_VERSION"))
                    .with_title("clangmap C++ Code Intelligence"),
            )
            .with_instructions(
                "C++ code intelligence over a libclang index. Start with \
                 'set_project_directory', then poll 'get_indexing_status' until the state is \
                 'indexed' or 'ready_from_cache'. Use 'search_classes'/'search_functions' for \
                 name lookup (identifiers are exact, anything else is a regex), \
                 'get_class_info'/'get_class_hierarchy' for structure, and \
                 'find_callers'/'get_call_sites'/'get_call_path' for call-graph questions.",
            )
    }
}

/// Serve the MCP server over stdio until the client disconnects.
pub async fn serve_stdio(server: CodeIndexServer) -> Result<(), Box<dyn std::error::Error>> {
    use rmcp::{ServiceExt, transport::stdio};
    info!("MCP server listening on stdio");
    let service = server.serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}
