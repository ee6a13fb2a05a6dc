//! Wire protocol between the coordinator and its worker processes.
//!
//! One JSON document per line, jobs on the worker's stdin, replies on its
//! stdout. Lines keep the framing trivial and debuggable; a worker can be
//! driven by hand with `echo '{"id":1,...}' | clangmap worker`.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::io::{BufRead, Write};

use crate::symbol::FileRecord;

/// One translation unit to parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJob {
    pub id: u64,
    /// Absolute path of the translation unit.
    pub file: String,
    /// Sanitized parser arguments.
    pub args: Vec<String>,
    pub is_project: bool,
    pub file_hash: String,
    pub compile_args_hash: String,
    /// Project root, for classifying headers reached via includes.
    pub project_root: String,
    /// Dependency roots relative to the project root (e.g. `vcpkg_installed`).
    #[serde(default)]
    pub dependency_roots: Vec<String>,
    /// Cache directory for read-only header-claim checks, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,
}

/// A finished job. The record is best-effort: parse failures come back as
/// a partial record with `errors` populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
    pub id: u64,
    pub record: FileRecord,
}

/// Write one message as a JSON line and flush.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> std::io::Result<()> {
    let line = serde_json::to_string(message)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Read one message from a JSON line. `Ok(None)` means clean EOF.
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> std::io::Result<Option<T>> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed)
            .map(Some)
            .map_err(std::io::Error::other);
    }
}
