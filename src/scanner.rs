//! File system scanner: enumerate the C++ files of a project.
//!
//! Walks the project root, skips configured directories and the cache
//! directory, and classifies every hit as project or dependency code.
//! Output is absolute, deduplicated, and lexicographically ordered so runs
//! are reproducible.

use ignore::WalkBuilder;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::compiledb::{CompilationDatabase, normalize};
use crate::config::ProjectConfig;

/// One file the scanner decided to index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub is_project: bool,
}

pub struct FileScanner {
    root: PathBuf,
    excluded_dirs: Vec<String>,
    dependency_roots: Vec<String>,
    include_dependencies: bool,
    /// Extra directory to skip (the project's cache dir, when it lives
    /// inside the project tree).
    cache_dir: Option<PathBuf>,
}

impl FileScanner {
    pub fn new(root: &Path, config: &ProjectConfig, cache_dir: Option<&Path>) -> Self {
        Self {
            root: root.to_path_buf(),
            excluded_dirs: config.excluded_dirs.clone(),
            dependency_roots: config.dependency_roots.clone(),
            include_dependencies: config.include_dependencies,
            cache_dir: cache_dir.map(Path::to_path_buf),
        }
    }

    /// Walk the project and return every processable file.
    pub fn scan(&self, db: &CompilationDatabase) -> Vec<ScannedFile> {
        let mut found: BTreeMap<PathBuf, bool> = BTreeMap::new();

        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            // Scanning must be deterministic across checkouts, so ignore
            // files are not consulted; exclusions come from config alone.
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .follow_links(false)
            .filter_entry({
                let excluded = self.excluded_dirs.clone();
                let cache_dir = self.cache_dir.clone();
                move |entry| {
                    if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                        if let Some(name) = entry.file_name().to_str() {
                            if excluded.iter().any(|ex| ex == name) {
                                return false;
                            }
                        }
                        if let Some(cache) = &cache_dir {
                            if entry.path() == cache.as_path() {
                                return false;
                            }
                        }
                    }
                    true
                }
            })
            .build();

        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let path = entry.path();
            if !db.should_process(path) {
                continue;
            }
            let absolute = if path.is_absolute() {
                normalize(path)
            } else {
                normalize(&self.root.join(path))
            };
            let is_project = self.classify(&absolute);
            if !is_project && !self.include_dependencies {
                continue;
            }
            found.insert(absolute, is_project);
        }

        debug!("Scanner found {} files under {}", found.len(), self.root.display());
        found
            .into_iter()
            .map(|(path, is_project)| ScannedFile { path, is_project })
            .collect()
    }

    /// A file is dependency code when its path relative to the project root
    /// starts with a configured dependency root.
    fn classify(&self, absolute: &Path) -> bool {
        let Ok(relative) = absolute.strip_prefix(&self.root) else {
            return true;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");
        !self
            .dependency_roots
            .iter()
            .any(|root| relative.starts_with(&format!("{root}/")) || relative == *root)
    }
}
