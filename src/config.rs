//! Configuration for the indexing service.
//!
//! Layered configuration:
//! - Default values
//! - TOML configuration file (`.clangmap/settings.toml`)
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables are prefixed with `CLANGMAP_` and use double
//! underscores to separate nested levels:
//! - `CLANGMAP_INDEXING__WORKER_COUNT=8` sets `indexing.worker_count`
//! - `CLANGMAP_PROJECT__INCLUDE_DEPENDENCIES=true` sets `project.include_dependencies`
//! - `CLANGMAP_LOGGING__DEFAULT=debug` sets `logging.default`
//!
//! The parser library itself is discovered by clang-sys at runtime; set
//! `LIBCLANG_PATH` to point at a specific libclang build.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Root directory for per-project caches.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,

    #[serde(default)]
    pub project: ProjectConfig,

    #[serde(default)]
    pub indexing: IndexingConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What counts as the project and how to compile it.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProjectConfig {
    /// Path of the compilation database, relative to the project root.
    #[serde(default = "default_compile_commands_path")]
    pub compile_commands_path: PathBuf,

    /// Extensions of files worth parsing.
    #[serde(default = "default_extensions")]
    pub supported_extensions: Vec<String>,

    /// Path prefixes (relative to the project root) treated as third-party.
    #[serde(default = "default_dependency_roots")]
    pub dependency_roots: Vec<String>,

    /// Whether dependency files are indexed at all.
    #[serde(default = "default_false")]
    pub include_dependencies: bool,

    /// Compiler arguments used when a file is absent from the compile DB.
    #[serde(default = "default_fallback_args")]
    pub fallback_compile_args: Vec<String>,

    /// Directory names excluded from the scan.
    #[serde(default = "default_excluded_dirs")]
    pub excluded_dirs: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IndexingConfig {
    /// Number of parser worker processes.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Jobs a worker child handles before it is recycled.
    #[serde(default = "default_max_tasks_per_child")]
    pub worker_max_tasks_per_child: usize,

    /// Per-file parse deadline in seconds.
    #[serde(default = "default_file_timeout_s")]
    pub worker_file_timeout_s: u64,

    /// How long cancellation waits for outstanding workers before killing.
    #[serde(default = "default_join_deadline_s")]
    pub cancellation_join_deadline_s: u64,

    /// Files merged and flushed to the store per transaction.
    #[serde(default = "default_batch_flush_size")]
    pub batch_flush_size: usize,

    /// Retries allowed for a failing file across indexing sessions.
    #[serde(default = "default_max_retries")]
    pub max_parse_retries: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueryConfig {
    /// Safety ceiling on result counts for regex scans.
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Bound on hierarchy and call-path traversal depth.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    /// Run VACUUM when free pages exceed this fraction of the database.
    #[serde(default = "default_vacuum_free_fraction")]
    pub vacuum_free_fraction: f64,

    /// Run ANALYZE when this many rows changed since the last one.
    #[serde(default = "default_analyze_changed_rows")]
    pub analyze_changed_rows: u64,

    /// Keep a `.backup` copy after successful full indexing runs.
    #[serde(default = "default_true")]
    pub backup_after_index: bool,

    /// Mirror parse errors into `parse_errors.jsonl` in the cache dir.
    #[serde(default = "default_true")]
    pub parse_error_log: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default log level (error, warn, info, debug, trace).
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module level overrides.
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("clangmap")
}

fn default_compile_commands_path() -> PathBuf {
    PathBuf::from("compile_commands.json")
}

fn default_extensions() -> Vec<String> {
    [".cpp", ".cc", ".cxx", ".c++", ".h", ".hpp", ".hxx", ".h++"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_dependency_roots() -> Vec<String> {
    vec!["vcpkg_installed".to_string()]
}

fn default_fallback_args() -> Vec<String> {
    vec![
        "-std=c++17".to_string(),
        "-x".to_string(),
        "c++".to_string(),
        "-Wno-pragma-once-outside-header".to_string(),
    ]
}

fn default_excluded_dirs() -> Vec<String> {
    ["build", "out", ".git", ".cache"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_worker_count() -> usize {
    (num_cpus::get() * 2).min(16)
}

fn default_max_tasks_per_child() -> usize {
    10
}

fn default_file_timeout_s() -> u64 {
    120
}

fn default_join_deadline_s() -> u64 {
    5
}

fn default_batch_flush_size() -> usize {
    25
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_results() -> usize {
    10_000
}

fn default_max_depth() -> usize {
    10
}

fn default_vacuum_free_fraction() -> f64 {
    0.25
}

fn default_analyze_changed_rows() -> u64 {
    50_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            cache_root: default_cache_root(),
            project: ProjectConfig::default(),
            indexing: IndexingConfig::default(),
            query: QueryConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            compile_commands_path: default_compile_commands_path(),
            supported_extensions: default_extensions(),
            dependency_roots: default_dependency_roots(),
            include_dependencies: false,
            fallback_compile_args: default_fallback_args(),
            excluded_dirs: default_excluded_dirs(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            worker_max_tasks_per_child: default_max_tasks_per_child(),
            worker_file_timeout_s: default_file_timeout_s(),
            cancellation_join_deadline_s: default_join_deadline_s(),
            batch_flush_size: default_batch_flush_size(),
            max_parse_retries: default_max_retries(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            max_depth: default_max_depth(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            vacuum_free_fraction: default_vacuum_free_fraction(),
            analyze_changed_rows: default_analyze_changed_rows(),
            backup_after_index: true,
            parse_error_log: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(".clangmap/settings.toml"));
        Self::figment(config_path).extract()
    }

    /// Load configuration from a specific file (plus defaults and env).
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref().to_path_buf()).extract()
    }

    fn figment(config_path: PathBuf) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_path))
            // Double underscore separates nesting levels; single underscores
            // stay inside field names.
            .merge(Env::prefixed("CLANGMAP_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
    }

    /// Find the workspace config by walking ancestors for `.clangmap/`.
    pub fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;
        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(".clangmap");
            if config_dir.is_dir() {
                return Some(config_dir.join("settings.toml"));
            }
        }
        None
    }

    /// Workspace root directory (where `.clangmap/` lives), if any.
    pub fn workspace_root() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;
        for ancestor in current.ancestors() {
            if ancestor.join(".clangmap").is_dir() {
                return Some(ancestor.to_path_buf());
            }
        }
        None
    }

    /// Cache directory for one project: `<cache_root>/<fingerprint>`.
    ///
    /// The fingerprint is a stable hash of the absolute project path, so two
    /// checkouts of the same project at different paths get separate caches.
    pub fn cache_dir_for_project(&self, project_root: &Path) -> PathBuf {
        let canonical = project_root
            .canonicalize()
            .unwrap_or_else(|_| project_root.to_path_buf());
        let fingerprint = format!("{:x}", md5::compute(canonical.to_string_lossy().as_bytes()));
        self.cache_root.join(fingerprint)
    }

    /// Save current configuration to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Create a default settings file under `.clangmap/`.
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(".clangmap/settings.toml");
        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }
        Settings::default().save(&config_path)?;
        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert!(settings.indexing.worker_count >= 1);
        assert!(settings.indexing.worker_count <= 16);
        assert_eq!(settings.indexing.worker_max_tasks_per_child, 10);
        assert_eq!(settings.indexing.worker_file_timeout_s, 120);
        assert!(!settings.project.include_dependencies);
        assert!(settings.project.supported_extensions.contains(&".hpp".to_string()));
        assert_eq!(settings.query.max_results, 10_000);
    }

    #[test]
    fn load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let toml_content = r#"
[project]
compile_commands_path = "build/compile_commands.json"
dependency_roots = ["third_party", "vcpkg_installed"]

[indexing]
worker_count = 4
worker_file_timeout_s = 30

[query]
max_results = 500
"#;
        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(
            settings.project.compile_commands_path,
            PathBuf::from("build/compile_commands.json")
        );
        assert_eq!(settings.project.dependency_roots.len(), 2);
        assert_eq!(settings.indexing.worker_count, 4);
        assert_eq!(settings.indexing.worker_file_timeout_s, 30);
        assert_eq!(settings.query.max_results, 500);
        // Untouched values keep their defaults.
        assert_eq!(settings.indexing.worker_max_tasks_per_child, 10);
    }

    #[test]
    fn save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let mut settings = Settings::default();
        settings.indexing.worker_count = 2;
        settings.query.max_depth = 3;
        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded.indexing.worker_count, 2);
        assert_eq!(loaded.query.max_depth, 3);
    }

    #[test]
    fn project_fingerprint_is_stable() {
        let settings = Settings::default();
        let a = settings.cache_dir_for_project(Path::new("/tmp/does-not-exist-a"));
        let b = settings.cache_dir_for_project(Path::new("/tmp/does-not-exist-a"));
        let c = settings.cache_dir_for_project(Path::new("/tmp/does-not-exist-b"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(&settings.cache_root));
    }
}
