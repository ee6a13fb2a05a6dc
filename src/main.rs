use clap::{Parser, Subcommand};
use clangmap::config::Settings;
use clangmap::indexing::ProjectIndexer;
use clangmap::mcp::{CodeIndexServer, serve_stdio};
use clangmap::query::QueryEngine;
use clangmap::symbol::SymbolKind;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "clangmap")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "C++ code intelligence: libclang indexing, SQLite cache, MCP tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a .clangmap/settings.toml in the current directory
    Init {
        /// Overwrite an existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Index a project directory
    Index {
        /// Project root (defaults to the current directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Re-index every file even when hashes match
        #[arg(short, long)]
        force: bool,

        /// Number of worker processes (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Show indexing state and cache statistics
    Status {
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Re-scan the project: index added and changed files, drop removed ones
    Refresh {
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Re-index every file even when hashes match
        #[arg(short, long)]
        force: bool,
    },

    /// Query the index
    Retrieve {
        #[arg(long, default_value = ".")]
        path: PathBuf,

        #[command(subcommand)]
        query: RetrieveQuery,
    },

    /// Run the MCP server on stdio
    Serve {
        /// Open this project before serving
        #[arg(long)]
        project: Option<PathBuf>,
    },

    /// Call one MCP tool in-process and print its JSON result
    Mcp {
        /// Tool name (e.g. search_classes)
        tool: String,

        /// Tool arguments as JSON
        #[arg(long, default_value = "{}")]
        args: String,

        #[arg(long, default_value = ".")]
        path: PathBuf,
    },

    /// Parser worker child; reads jobs on stdin (internal)
    #[command(hide = true)]
    Worker,
}

#[derive(Subcommand)]
enum RetrieveQuery {
    /// Search classes, structs, and templates
    Classes {
        pattern: String,
        #[arg(long)]
        project_only: bool,
        #[arg(long)]
        kind: Option<String>,
    },

    /// Search functions and methods
    Functions {
        pattern: String,
        #[arg(long)]
        class: Option<String>,
        #[arg(long)]
        param_type: Option<String>,
        #[arg(long)]
        project_only: bool,
    },

    /// Class details with hierarchy and methods
    ClassInfo { name: String },

    /// All overloads of a function
    FunctionInfo { name: String },

    /// Who calls this function
    Callers { function: String },

    /// What this function calls
    Calls { function: String },

    /// Shortest call paths between two functions
    CallPath {
        from: String,
        to: String,
        #[arg(short, long, default_value = "5")]
        depth: usize,
    },

    /// Base and derived class tree
    Hierarchy { name: String },

    /// Symbols in one file matching a pattern
    File { file: String, pattern: String },

    /// Files defining, declaring, or calling a symbol
    Files { name: String },

    /// Cache statistics
    Stats,

    /// Call-graph statistics
    CallStats,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Warning: using default configuration: {e}");
            Settings::default()
        }
    };
    clangmap::logging::init_with_config(&settings.logging);
    let settings = Arc::new(settings);

    match cli.command {
        Commands::Worker => {
            let code = clangmap::parsing::run_worker_stdio();
            ExitCode::from(code as u8)
        }
        Commands::Init { force } => match Settings::init_config_file(force) {
            Ok(path) => {
                println!("Created configuration at {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        },
        Commands::Index {
            path,
            force,
            workers,
        } => {
            let mut settings = (*settings).clone();
            if let Some(workers) = workers {
                settings.indexing.worker_count = workers;
            }
            run_index(&path, Arc::new(settings), force, false)
        }
        Commands::Refresh { path, force } => run_index(&path, settings, force, true),
        Commands::Status { path } => match ProjectIndexer::open(&path, settings) {
            Ok(indexer) => {
                let status = indexer.status_handle().snapshot();
                print_json(&status);
                match indexer.store().cache_stats() {
                    Ok(stats) => print_json(&stats),
                    Err(e) => eprintln!("Error reading cache stats: {e}"),
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        },
        Commands::Retrieve { path, query } => run_retrieve(&path, settings, query),
        Commands::Serve { project } => {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Error: {e}");
                    return ExitCode::FAILURE;
                }
            };
            let server = match project {
                Some(project) => match ProjectIndexer::open(&project, settings.clone()) {
                    Ok(indexer) => CodeIndexServer::with_indexer(settings, indexer),
                    Err(e) => {
                        eprintln!("Error opening project: {e}");
                        return ExitCode::FAILURE;
                    }
                },
                None => CodeIndexServer::new(settings),
            };
            match runtime.block_on(serve_stdio(server)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("MCP server error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Mcp { tool, args, path } => run_embedded_tool(&path, settings, &tool, &args),
    }
}

fn run_index(path: &PathBuf, settings: Arc<Settings>, force: bool, refresh: bool) -> ExitCode {
    let mut indexer = match ProjectIndexer::open(path, settings) {
        Ok(indexer) => indexer,
        Err(e) => {
            eprintln!("Error: {e}");
            for hint in e.recovery_suggestions() {
                eprintln!("  hint: {hint}");
            }
            return ExitCode::FAILURE;
        }
    };

    let outcome = if refresh {
        indexer.refresh(force)
    } else {
        indexer.index_all(force)
    };
    match outcome {
        Ok(outcome) => {
            println!(
                "Indexed {} files ({} cache hits, {} failed, {} removed) in {} ms",
                outcome.indexed,
                outcome.cache_hits,
                outcome.failed,
                outcome.removed,
                outcome.duration_ms
            );
            if outcome.failed > 0 {
                println!("Run 'clangmap status' to inspect recent parse errors.");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            for hint in e.recovery_suggestions() {
                eprintln!("  hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run_retrieve(path: &PathBuf, settings: Arc<Settings>, query: RetrieveQuery) -> ExitCode {
    let indexer = match ProjectIndexer::open(path, settings) {
        Ok(indexer) => indexer,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let engine = QueryEngine::new(
        indexer.indexes(),
        Some(indexer.store()),
        &indexer.settings().query,
    );

    let result = match query {
        RetrieveQuery::Classes {
            pattern,
            project_only,
            kind,
        } => {
            let kind = kind.as_deref().and_then(SymbolKind::parse);
            engine
                .search_classes(&pattern, project_only, kind)
                .map(|v| serde_json::to_value(v).unwrap_or_default())
        }
        RetrieveQuery::Functions {
            pattern,
            class,
            param_type,
            project_only,
        } => engine
            .search_functions(&pattern, class.as_deref(), param_type.as_deref(), project_only)
            .map(|v| serde_json::to_value(v).unwrap_or_default()),
        RetrieveQuery::ClassInfo { name } => engine
            .get_class_info(&name)
            .map(|v| serde_json::to_value(v).unwrap_or_default()),
        RetrieveQuery::FunctionInfo { name } => engine
            .get_function_info(&name)
            .map(|v| serde_json::to_value(v).unwrap_or_default()),
        RetrieveQuery::Callers { function } => engine
            .find_callers(&function)
            .map(|v| serde_json::to_value(v).unwrap_or_default()),
        RetrieveQuery::Calls { function } => engine
            .get_call_sites(&function)
            .map(|v| serde_json::to_value(v).unwrap_or_default()),
        RetrieveQuery::CallPath { from, to, depth } => engine
            .get_call_path(&from, &to, depth)
            .map(|v| serde_json::to_value(v).unwrap_or_default()),
        RetrieveQuery::Hierarchy { name } => engine
            .get_class_hierarchy(&name)
            .map(|v| serde_json::to_value(v).unwrap_or_default()),
        RetrieveQuery::File { file, pattern } => engine
            .find_in_file(&file, &pattern)
            .map(|v| serde_json::to_value(v).unwrap_or_default()),
        RetrieveQuery::Files { name } => engine
            .get_files_containing_symbol(&name, None, false)
            .map(|v| serde_json::to_value(v).unwrap_or_default()),
        RetrieveQuery::Stats => match indexer.store().cache_stats() {
            Ok(stats) => {
                print_json(&stats);
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::FAILURE;
            }
        },
        RetrieveQuery::CallStats => {
            print_json(&engine.get_call_statistics());
            return ExitCode::SUCCESS;
        }
    };

    match result {
        Ok(value) => {
            print_json(&value);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error ({}): {e}", e.kind().as_str());
            ExitCode::FAILURE
        }
    }
}

/// Embedded mode: run one MCP tool without a server process.
fn run_embedded_tool(path: &PathBuf, settings: Arc<Settings>, tool: &str, args: &str) -> ExitCode {
    use clangmap::mcp::*;
    use rmcp::handler::server::wrapper::Parameters;

    let args: serde_json::Value = match serde_json::from_str(args) {
        Ok(value) => value,
        Err(e) => {
            eprintln!("Invalid --args JSON: {e}");
            return ExitCode::FAILURE;
        }
    };

    let indexer = match ProjectIndexer::open(path, settings.clone()) {
        Ok(indexer) => indexer,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let server = CodeIndexServer::with_indexer(settings, indexer);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    macro_rules! call {
        ($method:ident, $req:ty) => {{
            match serde_json::from_value::<$req>(args) {
                Ok(request) => runtime.block_on(server.$method(Parameters(request))),
                Err(e) => {
                    eprintln!("Invalid arguments for {tool}: {e}");
                    return ExitCode::FAILURE;
                }
            }
        }};
    }

    let result = match tool {
        "get_indexing_status" => call!(get_indexing_status, EmptyRequest),
        "refresh_project" => call!(refresh_project, RefreshRequest),
        "search_classes" => call!(search_classes, SearchClassesRequest),
        "search_functions" => call!(search_functions, SearchFunctionsRequest),
        "search_symbols" => call!(search_symbols, SearchSymbolsRequest),
        "get_class_info" => call!(get_class_info, NameRequest),
        "get_function_info" => call!(get_function_info, NameRequest),
        "find_callers" => call!(find_callers, FunctionRequest),
        "get_call_sites" => call!(get_call_sites, FunctionRequest),
        "get_call_path" => call!(get_call_path, CallPathRequest),
        "get_class_hierarchy" => call!(get_class_hierarchy, NameRequest),
        "find_in_file" => call!(find_in_file, FindInFileRequest),
        "get_files_containing_symbol" => call!(get_files_containing_symbol, FilesContainingRequest),
        "get_stats" => call!(get_stats, EmptyRequest),
        "get_call_statistics" => call!(get_call_statistics, EmptyRequest),
        "get_cross_references" => call!(get_cross_references, NameRequest),
        other => {
            eprintln!("Unknown tool: {other}");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(result) => {
            print_json(&result);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Tool error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("Error serializing output: {e}"),
    }
}
