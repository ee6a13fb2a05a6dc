//! Compilation database: map source files to compiler argument vectors.
//!
//! Loads `compile_commands.json` (the format CMake emits with
//! `CMAKE_EXPORT_COMPILE_COMMANDS=ON`), caches the parsed map in memory, and
//! re-reads only when the file's mtime moves forward. Files absent from the
//! database fall back to a configured argument set plus auto-discovered
//! dependency-manager include roots.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::config::ProjectConfig;
use crate::error::{IndexError, IndexResult};

/// One entry of `compile_commands.json`.
///
/// Exactly one of `command` (a shell string) or `arguments` (pre-split argv)
/// is present in practice; `arguments` wins when both are.
#[derive(Debug, Deserialize)]
struct CompileCommand {
    directory: String,
    file: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    arguments: Option<Vec<String>>,
}

/// In-memory view of the compilation database.
pub struct CompilationDatabase {
    project_root: PathBuf,
    db_path: PathBuf,
    /// Absolute file path -> sanitized parser argv.
    entries: HashMap<PathBuf, Vec<String>>,
    mtime: Option<SystemTime>,
    fallback_args: Vec<String>,
    extensions: Vec<String>,
}

impl CompilationDatabase {
    /// Create a database view for `project_root` and load it if present.
    ///
    /// A missing file is not an error: the database runs in fallback-only
    /// mode until `refresh_if_modified` sees one appear.
    pub fn open(project_root: &Path, config: &ProjectConfig) -> IndexResult<Self> {
        let db_path = project_root.join(&config.compile_commands_path);
        let mut db = Self {
            project_root: project_root.to_path_buf(),
            db_path,
            entries: HashMap::new(),
            mtime: None,
            fallback_args: build_fallback_args(project_root, &config.fallback_compile_args),
            extensions: config.supported_extensions.clone(),
        };
        if db.db_path.exists() {
            db.load()?;
        } else {
            info!(
                "No compilation database at {}; using fallback arguments",
                db.db_path.display()
            );
        }
        Ok(db)
    }

    /// Parse the database file, replacing the in-memory map.
    ///
    /// Malformed JSON keeps the previous map and returns `ConfigError`.
    pub fn load(&mut self) -> IndexResult<()> {
        let text = std::fs::read_to_string(&self.db_path).map_err(|e| IndexError::FileRead {
            path: self.db_path.clone(),
            source: e,
        })?;
        let commands: Vec<CompileCommand> =
            serde_json::from_str(&text).map_err(|e| IndexError::Config {
                reason: format!(
                    "malformed compilation database {}: {e}",
                    self.db_path.display()
                ),
            })?;

        let mut entries = HashMap::with_capacity(commands.len());
        for cc in commands {
            let argv = match (&cc.arguments, &cc.command) {
                (Some(args), _) => args.clone(),
                (None, Some(cmd)) => match shell_words::split(cmd) {
                    Ok(args) => args,
                    Err(e) => {
                        warn!("Unparseable command for {}: {e}", cc.file);
                        continue;
                    }
                },
                (None, None) => continue,
            };

            let dir = Path::new(&cc.directory);
            let file = Path::new(&cc.file);
            let absolute = if file.is_absolute() {
                file.to_path_buf()
            } else {
                dir.join(file)
            };
            let absolute = normalize(&absolute);
            let args = sanitize_argv(argv, &absolute, dir);
            entries.insert(absolute, args);
        }

        self.mtime = std::fs::metadata(&self.db_path).and_then(|m| m.modified()).ok();
        debug!("Loaded {} compile commands", entries.len());
        self.entries = entries;
        Ok(())
    }

    /// Re-read the database if its mtime increased. Idempotent.
    pub fn refresh_if_modified(&mut self) -> IndexResult<bool> {
        let Ok(meta) = std::fs::metadata(&self.db_path) else {
            return Ok(false);
        };
        let current = meta.modified().ok();
        if current.is_some() && current != self.mtime {
            self.load()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Parser argv for `path`, if the database has an entry.
    pub fn args_for(&self, path: &Path) -> Option<&[String]> {
        self.entries.get(&normalize(path)).map(|v| v.as_slice())
    }

    /// Parser argv for `path`, falling back to the default flag set.
    pub fn args_for_with_fallback(&self, path: &Path) -> Vec<String> {
        match self.args_for(path) {
            Some(args) => args.to_vec(),
            None => self.fallback_args.clone(),
        }
    }

    /// Whether this path is worth parsing: known extension, or explicitly
    /// listed in the compilation database.
    pub fn should_process(&self, path: &Path) -> bool {
        let name = path.to_string_lossy();
        if self
            .extensions
            .iter()
            .any(|ext| name.ends_with(ext.as_str()))
        {
            return true;
        }
        self.entries.contains_key(&normalize(path))
    }

    /// All files the database knows about.
    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn fallback_args(&self) -> &[String] {
        &self.fallback_args
    }
}

/// Hash of an argument vector, used to detect configuration changes.
///
/// Arguments are joined with a unit separator so `["-DA", "B"]` and
/// `["-DA B"]` hash differently.
pub fn compile_args_hash(args: &[String]) -> String {
    format!("{:x}", md5::compute(args.join("\x1f").as_bytes()))
}

/// Strip pieces libclang must not see: the compiler executable, `-c`,
/// `-o <path>`, and the source file itself (possibly spelled relative to
/// the entry's directory).
fn sanitize_argv(argv: Vec<String>, source: &Path, dir: &Path) -> Vec<String> {
    let is_source = |arg: &str| {
        let path = Path::new(arg);
        let resolved = if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&dir.join(path))
        };
        resolved == source
    };

    let mut out = Vec::with_capacity(argv.len());
    let mut iter = argv.into_iter();

    // argv[0] is the compiler (possibly an absolute path); drop it when it
    // looks like one, keep it otherwise to avoid eating a real flag.
    if let Some(first) = iter.next() {
        let base = Path::new(&first)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| first.clone());
        let is_compiler = ["cc", "c++", "cl", "cl.exe"]
            .iter()
            .any(|c| base == *c)
            || base.starts_with("clang")
            || base.starts_with("gcc")
            || base.starts_with("g++");
        if !is_compiler {
            out.push(first);
        }
    }

    let mut skip_next = false;
    for arg in iter {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == "-c" {
            continue;
        }
        if arg == "-o" {
            skip_next = true;
            continue;
        }
        if is_source(&arg) {
            continue;
        }
        out.push(arg);
    }
    out
}

/// Fallback arguments: configured flags plus platform SDK include roots and
/// dependency-manager include directories discovered under the project root.
fn build_fallback_args(project_root: &Path, configured: &[String]) -> Vec<String> {
    let mut args: Vec<String> = configured.to_vec();

    #[cfg(target_os = "macos")]
    {
        const SDK_ROOTS: &[&str] = &[
            "/Library/Developer/CommandLineTools/SDKs/MacOSX.sdk/usr/include",
            "/Applications/Xcode.app/Contents/Developer/Platforms/MacOSX.platform/Developer/SDKs/MacOSX.sdk/usr/include",
        ];
        for root in SDK_ROOTS {
            if Path::new(root).is_dir() {
                args.push("-isystem".to_string());
                args.push(root.to_string());
                break;
            }
        }
    }

    let pattern = project_root
        .join("vcpkg_installed")
        .join("*")
        .join("include");
    if let Some(pattern) = pattern.to_str() {
        if let Ok(paths) = glob::glob(pattern) {
            for include_dir in paths.flatten() {
                if include_dir.is_dir() {
                    args.push(format!("-I{}", include_dir.display()));
                }
            }
        }
    }

    args
}

/// Lexically normalize a path: resolve `.` and `..` components without
/// touching the filesystem, so missing files still normalize consistently.
pub fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
