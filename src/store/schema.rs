//! Schema DDL and versioning for the symbol cache.
//!
//! The schema version is compared on every open. A mismatch deletes and
//! recreates the database (development-mode policy: caches are cheap to
//! rebuild, migrations are not worth their risk here). `schema_version` is
//! an append-only log inside each database generation.

use rusqlite::Connection;

use crate::error::StoreResult;

/// Bump on any schema change. Mismatched caches are rebuilt from scratch.
pub const SCHEMA_VERSION: i64 = 4;

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS symbols (
    usr TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    qualified_name TEXT NOT NULL,
    kind TEXT NOT NULL,
    file TEXT NOT NULL,
    line INTEGER NOT NULL,
    column INTEGER NOT NULL,
    signature TEXT,
    is_project INTEGER NOT NULL DEFAULT 1,
    namespace TEXT NOT NULL DEFAULT '',
    access TEXT NOT NULL DEFAULT 'public',
    parent_class TEXT NOT NULL DEFAULT '',
    base_classes_json TEXT NOT NULL DEFAULT '[]',
    calls_json TEXT NOT NULL DEFAULT '[]',
    called_by_json TEXT NOT NULL DEFAULT '[]',
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    header_file TEXT,
    header_line INTEGER,
    header_start_line INTEGER,
    header_end_line INTEGER,
    brief TEXT,
    doc_comment TEXT,
    is_template INTEGER NOT NULL DEFAULT 0,
    template_parameters_json TEXT NOT NULL DEFAULT '[]',
    template_kind TEXT NOT NULL DEFAULT 'primary',
    primary_template_usr TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name);
CREATE INDEX IF NOT EXISTS idx_symbols_kind ON symbols(kind);
CREATE INDEX IF NOT EXISTS idx_symbols_file ON symbols(file);
CREATE INDEX IF NOT EXISTS idx_symbols_parent_class ON symbols(parent_class);
CREATE INDEX IF NOT EXISTS idx_symbols_primary_template ON symbols(primary_template_usr);

CREATE VIRTUAL TABLE IF NOT EXISTS symbols_fts USING fts5(
    name,
    content='symbols',
    content_rowid='rowid'
);
CREATE TRIGGER IF NOT EXISTS symbols_fts_insert AFTER INSERT ON symbols BEGIN
    INSERT INTO symbols_fts(rowid, name) VALUES (new.rowid, new.name);
END;
CREATE TRIGGER IF NOT EXISTS symbols_fts_delete AFTER DELETE ON symbols BEGIN
    INSERT INTO symbols_fts(symbols_fts, rowid, name) VALUES ('delete', old.rowid, old.name);
END;
CREATE TRIGGER IF NOT EXISTS symbols_fts_update AFTER UPDATE ON symbols BEGIN
    INSERT INTO symbols_fts(symbols_fts, rowid, name) VALUES ('delete', old.rowid, old.name);
    INSERT INTO symbols_fts(rowid, name) VALUES (new.rowid, new.name);
END;

CREATE TABLE IF NOT EXISTS call_sites (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    caller_usr TEXT NOT NULL,
    callee_usr TEXT NOT NULL,
    file TEXT NOT NULL,
    line INTEGER NOT NULL,
    column INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_call_sites_caller ON call_sites(caller_usr);
CREATE INDEX IF NOT EXISTS idx_call_sites_callee ON call_sites(callee_usr);
CREATE INDEX IF NOT EXISTS idx_call_sites_location ON call_sites(file, line);

CREATE TABLE IF NOT EXISTS type_aliases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alias_name TEXT NOT NULL,
    qualified_name TEXT NOT NULL,
    target_type TEXT NOT NULL,
    canonical_type TEXT NOT NULL,
    file TEXT NOT NULL,
    line INTEGER NOT NULL,
    column INTEGER NOT NULL,
    alias_kind TEXT NOT NULL,
    namespace TEXT NOT NULL DEFAULT '',
    is_template_alias INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    UNIQUE(file, line, column)
);
CREATE INDEX IF NOT EXISTS idx_aliases_name ON type_aliases(alias_name);
CREATE INDEX IF NOT EXISTS idx_aliases_qualified ON type_aliases(qualified_name);
CREATE INDEX IF NOT EXISTS idx_aliases_canonical ON type_aliases(canonical_type);
CREATE INDEX IF NOT EXISTS idx_aliases_canonical_name ON type_aliases(canonical_type, alias_name);

CREATE TABLE IF NOT EXISTS file_metadata (
    file_path TEXT PRIMARY KEY,
    file_hash TEXT NOT NULL,
    compile_args_hash TEXT NOT NULL,
    indexed_at INTEGER NOT NULL,
    symbol_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS header_tracker (
    header_path TEXT PRIMARY KEY,
    processed_by TEXT NOT NULL,
    file_hash TEXT NOT NULL,
    compile_commands_hash TEXT NOT NULL,
    processed_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS parse_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL,
    error_kind TEXT NOT NULL,
    message TEXT NOT NULL,
    stack TEXT,
    file_hash TEXT NOT NULL,
    compile_args_hash TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_parse_errors_file ON parse_errors(file_path);
CREATE INDEX IF NOT EXISTS idx_parse_errors_time ON parse_errors(timestamp);
"#;

/// Create all tables, indexes, triggers, and the version log row.
pub fn create_schema(conn: &Connection, now: u64) -> StoreResult<()> {
    conn.execute_batch(DDL)?;
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![SCHEMA_VERSION, now as i64],
    )?;
    Ok(())
}

/// Read the latest recorded schema version, or `None` for a database
/// without a version table (pre-versioning or foreign file).
pub fn stored_version(conn: &Connection) -> Option<i64> {
    let has_table: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n > 0)
        .unwrap_or(false);
    if !has_table {
        return None;
    }
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, Option<i64>>(0)
    })
    .ok()
    .flatten()
}
