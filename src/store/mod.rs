//! SQLite-backed persistence for the symbol cache.
//!
//! One database file per project cache directory, WAL journaling, FTS5 name
//! search, and a busy handler with exponential backoff. The coordinator is
//! the only writer; workers and status readers open read-only connections
//! (WAL keeps them unblocked during commits).

pub mod schema;

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::symbol::{
    AliasKind, Access, CallSite, FileMetadata, FileRecord, HeaderClaim, ParseErrorRecord, Symbol,
    SymbolKind, TemplateKind, TypeAlias,
};

pub use schema::SCHEMA_VERSION;

/// Database file name inside a project cache directory.
pub const DB_FILE: &str = "symbols.db";

/// Marker proving the one-time migration from the legacy JSON cache ran.
pub const MIGRATION_MARKER: &str = ".migrated_to_sqlite";

const BUSY_INITIAL_MS: u64 = 10;
const BUSY_CEILING_MS: u64 = 1_000;
const BUSY_DEADLINE_MS: u64 = 30_000;

/// Busy handler: exponential backoff from 10 ms up to 1 s per retry, giving
/// up once the cumulative wait passes 30 s.
fn busy_backoff(attempts: i32) -> bool {
    let mut waited = 0u64;
    let mut delay = BUSY_INITIAL_MS;
    for _ in 0..attempts {
        waited += delay;
        delay = (delay * 2).min(BUSY_CEILING_MS);
    }
    if waited >= BUSY_DEADLINE_MS {
        return false;
    }
    std::thread::sleep(Duration::from_millis(delay.min(BUSY_DEADLINE_MS - waited)));
    true
}

/// Integrity check depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityLevel {
    Quick,
    Full,
}

/// Result of `health_status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub integrity: bool,
    pub journal_mode: String,
    pub fts_present: bool,
    pub db_size_bytes: u64,
    pub table_counts: HashMap<String, u64>,
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub symbol_count: u64,
    pub counts_by_kind: HashMap<String, u64>,
    pub alias_count: u64,
    pub call_site_count: u64,
    pub file_count: u64,
    pub parse_error_count: u64,
    /// Files with the most symbols, descending.
    pub top_files: Vec<(String, u64)>,
    pub db_size_bytes: u64,
}

pub struct SymbolStore {
    conn: Connection,
    dir: PathBuf,
    db_path: PathBuf,
    /// Rows written since the last ANALYZE, for auto-maintenance.
    rows_since_analyze: u64,
}

const SYMBOL_COLUMNS: &str = "usr, name, qualified_name, kind, file, line, column, signature, \
     is_project, namespace, access, parent_class, base_classes_json, calls_json, \
     called_by_json, start_line, end_line, header_file, header_line, header_start_line, \
     header_end_line, brief, doc_comment, is_template, template_parameters_json, \
     template_kind, primary_template_usr";

impl SymbolStore {
    /// Open (or create) the cache under `dir`, migrating as needed.
    ///
    /// A schema version mismatch deletes the database and starts fresh; the
    /// cache is derived data and a re-index is always safe.
    pub fn open(dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let db_path = dir.join(DB_FILE);

        let mut fresh = !db_path.exists();
        if !fresh {
            match Self::try_open_versioned(&db_path) {
                Ok(conn) => {
                    let store = Self::finish_open(conn, dir, db_path);
                    return Ok(store);
                }
                Err(reason) => {
                    warn!("Cache at {} unusable: {reason}", db_path.display());
                    delete_database_files(&db_path)?;
                    // A corrupt database gets one shot at the last backup
                    // before the cache is rebuilt from scratch.
                    if Self::restore_from_backup(dir)? {
                        if let Ok(conn) = Self::try_open_versioned(&db_path) {
                            info!("Cache restored from backup");
                            return Ok(Self::finish_open(conn, dir, db_path));
                        }
                        delete_database_files(&db_path)?;
                    }
                    warn!("Recreating cache at {}", db_path.display());
                    fresh = true;
                }
            }
        }

        let conn = Connection::open(&db_path)?;
        configure_connection(&conn)?;
        schema::create_schema(&conn, now_ts())?;
        if fresh {
            info!("Created cache database at {}", db_path.display());
        }
        let store = Self::finish_open(conn, dir, db_path);
        Ok(store)
    }

    /// Open an existing cache read-only (worker-side header claim checks).
    pub fn open_read_only(dir: &Path) -> StoreResult<Self> {
        let db_path = dir.join(DB_FILE);
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_handler(Some(busy_backoff))?;
        Ok(Self {
            conn,
            dir: dir.to_path_buf(),
            db_path,
            rows_since_analyze: 0,
        })
    }

    fn try_open_versioned(db_path: &Path) -> Result<Connection, String> {
        let conn = Connection::open(db_path).map_err(|e| format!("open failed: {e}"))?;
        configure_connection(&conn).map_err(|e| format!("pragma setup failed: {e}"))?;
        match schema::stored_version(&conn) {
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(format!(
                    "schema version {v} does not match current {SCHEMA_VERSION}"
                ));
            }
            None => return Err("no schema version recorded".to_string()),
        }
        let ok = conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .map(|s| s == "ok")
            .unwrap_or(false);
        if !ok {
            return Err("integrity check failed".to_string());
        }
        Ok(conn)
    }

    fn finish_open(conn: Connection, dir: &Path, db_path: PathBuf) -> Self {
        let marker = dir.join(MIGRATION_MARKER);
        if !marker.exists() {
            let _ = std::fs::write(&marker, "1\n");
        }
        Self {
            conn,
            dir: dir.to_path_buf(),
            db_path,
            rows_since_analyze: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---- writes ---------------------------------------------------------

    /// Insert or replace a batch of symbols in a single transaction.
    pub fn save_symbols_batch(&mut self, symbols: &[Symbol]) -> StoreResult<()> {
        let now = now_ts();
        let tx = self.conn.transaction()?;
        for symbol in symbols {
            insert_symbol(&tx, symbol, now)?;
        }
        tx.commit()?;
        self.rows_since_analyze += symbols.len() as u64;
        Ok(())
    }

    /// The incremental primitive: replace everything belonging to one file.
    pub fn update_file_symbols(&mut self, record: &FileRecord) -> StoreResult<()> {
        self.apply_file_records(std::slice::from_ref(record))
    }

    /// Replace the contents of several files in one transaction.
    ///
    /// Per file: delete old symbols/call sites/aliases, insert the new ones,
    /// upsert `file_metadata`, claim headers, and record parse errors. Any
    /// failure rolls back the whole batch.
    pub fn apply_file_records(&mut self, records: &[FileRecord]) -> StoreResult<()> {
        let now = now_ts();
        let mut rows = 0u64;
        let tx = self.conn.transaction()?;
        for record in records {
            delete_file_rows(&tx, &record.file)?;
            // This file's previous header claims are void; survivors are
            // re-claimed below.
            tx.execute(
                "DELETE FROM header_tracker WHERE processed_by = ?1",
                params![record.file],
            )?;
            for symbol in &record.symbols {
                insert_symbol(&tx, symbol, now)?;
            }
            for site in &record.call_sites {
                tx.execute(
                    "INSERT INTO call_sites (caller_usr, callee_usr, file, line, column) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        site.caller_usr,
                        site.callee_usr,
                        site.file,
                        site.line,
                        site.column
                    ],
                )?;
            }
            for alias in &record.aliases {
                tx.execute(
                    "INSERT OR REPLACE INTO type_aliases \
                     (alias_name, qualified_name, target_type, canonical_type, file, line, \
                      column, alias_kind, namespace, is_template_alias, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        alias.alias_name,
                        alias.qualified_name,
                        alias.target_type,
                        alias.canonical_type,
                        alias.file,
                        alias.line,
                        alias.column,
                        alias.alias_kind.as_str(),
                        alias.namespace,
                        alias.is_template_alias,
                        now as i64,
                    ],
                )?;
            }
            tx.execute(
                "INSERT OR REPLACE INTO file_metadata \
                 (file_path, file_hash, compile_args_hash, indexed_at, symbol_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.file,
                    record.file_hash,
                    record.compile_args_hash,
                    now as i64,
                    record.symbols.len() as i64,
                ],
            )?;
            for claim in &record.headers {
                // First claimant wins while the header is unchanged; a new
                // content or args hash supersedes the stale claim.
                tx.execute(
                    "INSERT INTO header_tracker \
                     (header_path, processed_by, file_hash, compile_commands_hash, processed_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(header_path) DO UPDATE SET \
                       processed_by = excluded.processed_by, \
                       file_hash = excluded.file_hash, \
                       compile_commands_hash = excluded.compile_commands_hash, \
                       processed_at = excluded.processed_at \
                     WHERE header_tracker.file_hash != excluded.file_hash \
                        OR header_tracker.compile_commands_hash != excluded.compile_commands_hash",
                    params![
                        claim.header_path,
                        claim.processed_by,
                        claim.file_hash,
                        claim.compile_args_hash,
                        now as i64,
                    ],
                )?;
            }
            for error in &record.errors {
                record_parse_error_tx(&tx, error)?;
            }
            rows += (record.symbols.len() + record.call_sites.len() + record.aliases.len()) as u64;
        }
        tx.commit()?;
        self.rows_since_analyze += rows;
        Ok(())
    }

    /// Remove a file that disappeared from the project.
    pub fn delete_file(&mut self, file: &str) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        delete_file_rows(&tx, file)?;
        tx.execute("DELETE FROM file_metadata WHERE file_path = ?1", params![file])?;
        tx.execute(
            "DELETE FROM header_tracker WHERE processed_by = ?1 OR header_path = ?1",
            params![file],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Record a parse failure outside a batch (worker crash, timeout).
    pub fn record_parse_error(&mut self, error: &ParseErrorRecord) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        record_parse_error_tx(&tx, error)?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO cache_metadata (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now_ts() as i64],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM cache_metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ---- reads ----------------------------------------------------------

    pub fn load_all_symbols(&self) -> StoreResult<Vec<Symbol>> {
        self.query_symbols(&format!("SELECT {SYMBOL_COLUMNS} FROM symbols"), params![])
    }

    pub fn load_symbol_by_usr(&self, usr: &str) -> StoreResult<Option<Symbol>> {
        let mut rows = self.query_symbols(
            &format!("SELECT {SYMBOL_COLUMNS} FROM symbols WHERE usr = ?1"),
            params![usr],
        )?;
        Ok(rows.pop())
    }

    pub fn load_symbols_by_name(&self, name: &str) -> StoreResult<Vec<Symbol>> {
        self.query_symbols(
            &format!("SELECT {SYMBOL_COLUMNS} FROM symbols WHERE name = ?1"),
            params![name],
        )
    }

    pub fn load_symbols_in_file(&self, file: &str) -> StoreResult<Vec<Symbol>> {
        self.query_symbols(
            &format!("SELECT {SYMBOL_COLUMNS} FROM symbols WHERE file = ?1 ORDER BY start_line"),
            params![file],
        )
    }

    /// FTS5 lookup by name: exact token or prefix match.
    ///
    /// This is the accelerator for plain-identifier patterns; anything with
    /// regex metacharacters must go through the in-memory regex scan.
    pub fn search_symbols_fts(
        &self,
        ident: &str,
        prefix: bool,
        kind: Option<SymbolKind>,
        project_only: bool,
        limit: usize,
    ) -> StoreResult<Vec<Symbol>> {
        // Quote the token for the FTS query language; embedded quotes are
        // doubled per SQL quoting rules.
        let escaped = ident.replace('"', "\"\"");
        let match_expr = if prefix {
            format!("\"{escaped}\"*")
        } else {
            format!("\"{escaped}\"")
        };
        // Qualify columns: `name` exists in both the table and the FTS index.
        let qualified = SYMBOL_COLUMNS
            .split(", ")
            .map(|c| format!("s.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {qualified} FROM symbols s \
             JOIN symbols_fts f ON s.rowid = f.rowid \
             WHERE symbols_fts MATCH ?1"
        );
        if kind.is_some() {
            sql.push_str(" AND s.kind = ?2");
        }
        if project_only {
            sql.push_str(" AND s.is_project = 1");
        }
        sql.push_str(" LIMIT ?3");

        let kind_str = kind.map(|k| k.as_str()).unwrap_or("");
        self.query_symbols(&sql, params![match_expr, kind_str, limit as i64])
    }

    pub fn load_all_aliases(&self) -> StoreResult<Vec<TypeAlias>> {
        self.query_aliases("SELECT alias_name, qualified_name, target_type, canonical_type, \
             namespace, alias_kind, is_template_alias, file, line, column FROM type_aliases", params![])
    }

    pub fn get_aliases_for_canonical(&self, canonical: &str) -> StoreResult<Vec<TypeAlias>> {
        self.query_aliases(
            "SELECT alias_name, qualified_name, target_type, canonical_type, namespace, \
             alias_kind, is_template_alias, file, line, column \
             FROM type_aliases WHERE canonical_type = ?1 ORDER BY alias_name",
            params![canonical],
        )
    }

    pub fn get_canonical_for_alias(&self, alias_name: &str) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT canonical_type FROM type_aliases \
                 WHERE alias_name = ?1 OR qualified_name = ?1 LIMIT 1",
                params![alias_name],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn load_all_call_sites(&self) -> StoreResult<Vec<CallSite>> {
        let mut stmt = self
            .conn
            .prepare("SELECT caller_usr, callee_usr, file, line, column FROM call_sites")?;
        let rows = stmt.query_map([], |row| {
            Ok(CallSite {
                caller_usr: row.get(0)?,
                callee_usr: row.get(1)?,
                file: row.get(2)?,
                line: row.get(3)?,
                column: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn file_metadata(&self, file: &str) -> StoreResult<Option<FileMetadata>> {
        Ok(self
            .conn
            .query_row(
                "SELECT file_path, file_hash, compile_args_hash, indexed_at, symbol_count \
                 FROM file_metadata WHERE file_path = ?1",
                params![file],
                |row| {
                    Ok(FileMetadata {
                        path: row.get(0)?,
                        file_hash: row.get(1)?,
                        compile_args_hash: row.get(2)?,
                        indexed_at: row.get::<_, i64>(3)? as u64,
                        symbol_count: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()?)
    }

    pub fn all_file_metadata(&self) -> StoreResult<Vec<FileMetadata>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_path, file_hash, compile_args_hash, indexed_at, symbol_count \
             FROM file_metadata",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FileMetadata {
                path: row.get(0)?,
                file_hash: row.get(1)?,
                compile_args_hash: row.get(2)?,
                indexed_at: row.get::<_, i64>(3)? as u64,
                symbol_count: row.get::<_, i64>(4)? as u64,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Whether a header is already claimed under this exact content and
    /// compile-args hash. An unchanged claim means re-extraction is wasted
    /// work; a changed hash invalidates the claim.
    pub fn is_header_claimed(
        &self,
        header_path: &str,
        file_hash: &str,
        compile_args_hash: &str,
    ) -> StoreResult<bool> {
        let claim: Option<HeaderClaim> = self
            .conn
            .query_row(
                "SELECT header_path, processed_by, file_hash, compile_commands_hash \
                 FROM header_tracker WHERE header_path = ?1",
                params![header_path],
                |row| {
                    Ok(HeaderClaim {
                        header_path: row.get(0)?,
                        processed_by: row.get(1)?,
                        file_hash: row.get(2)?,
                        compile_args_hash: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(claim.is_some_and(|c| c.file_hash == file_hash && c.compile_args_hash == compile_args_hash))
    }

    /// Highest retry count recorded for a file, `None` if it never failed.
    pub fn parse_error_retries(&self, file: &str) -> StoreResult<Option<u32>> {
        let n: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(retry_count) FROM parse_errors WHERE file_path = ?1",
                params![file],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(n.map(|v| v.max(0) as u32))
    }

    pub fn recent_parse_errors(&self, limit: usize) -> StoreResult<Vec<ParseErrorRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_path, error_kind, message, stack, file_hash, compile_args_hash, \
             retry_count, timestamp FROM parse_errors ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ParseErrorRecord {
                file_path: row.get(0)?,
                error_kind: row.get(1)?,
                message: row.get(2)?,
                stack: row.get(3)?,
                file_hash: row.get(4)?,
                compile_args_hash: row.get(5)?,
                retry_count: row.get::<_, i64>(6)? as u32,
                timestamp: row.get::<_, i64>(7)? as u64,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ---- maintenance ----------------------------------------------------

    pub fn vacuum(&self) -> StoreResult<()> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    pub fn analyze(&mut self) -> StoreResult<()> {
        self.conn.execute_batch("ANALYZE")?;
        self.rows_since_analyze = 0;
        Ok(())
    }

    pub fn optimize(&self) -> StoreResult<()> {
        self.conn.execute_batch("PRAGMA optimize")?;
        Ok(())
    }

    pub fn check_integrity(&self, level: IntegrityLevel) -> StoreResult<bool> {
        let pragma = match level {
            IntegrityLevel::Quick => "PRAGMA quick_check",
            IntegrityLevel::Full => "PRAGMA integrity_check",
        };
        let mut stmt = self.conn.prepare(pragma)?;
        let rows: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let ok = rows.len() == 1 && rows[0] == "ok";
        if !ok {
            warn!("Integrity check failed: {rows:?}");
        }
        Ok(ok)
    }

    pub fn health_status(&self) -> StoreResult<HealthStatus> {
        let integrity = self.check_integrity(IntegrityLevel::Quick)?;
        let journal_mode: String =
            self.conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let fts_present: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='symbols_fts'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)?;

        let mut table_counts = HashMap::new();
        for table in [
            "symbols",
            "call_sites",
            "type_aliases",
            "file_metadata",
            "header_tracker",
            "parse_errors",
        ] {
            let count: i64 =
                self.conn
                    .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                        row.get(0)
                    })?;
            table_counts.insert(table.to_string(), count as u64);
        }

        let db_size_bytes = self.db_size_bytes()?;
        Ok(HealthStatus {
            ok: integrity && fts_present,
            integrity,
            journal_mode,
            fts_present,
            db_size_bytes,
            table_counts,
        })
    }

    /// Run vacuum/analyze when their thresholds trip. Returns what ran.
    pub fn auto_maintenance(
        &mut self,
        config: &crate::config::StoreConfig,
    ) -> StoreResult<Vec<&'static str>> {
        let mut actions = Vec::new();

        let page_count: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let freelist: i64 = self
            .conn
            .query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
        if page_count > 0 {
            let free_fraction = freelist as f64 / page_count as f64;
            if free_fraction > config.vacuum_free_fraction {
                debug!("auto_maintenance: vacuum (free fraction {free_fraction:.2})");
                self.vacuum()?;
                actions.push("vacuum");
            }
        }

        if self.rows_since_analyze >= config.analyze_changed_rows {
            debug!(
                "auto_maintenance: analyze ({} rows since last)",
                self.rows_since_analyze
            );
            self.analyze()?;
            actions.push("analyze");
        }

        self.optimize()?;
        Ok(actions)
    }

    /// Checkpoint the WAL and copy the database to `<db>.backup`.
    pub fn backup(&self) -> StoreResult<PathBuf> {
        self.checkpoint()?;
        let backup_path = self.dir.join(format!("{DB_FILE}.backup"));
        std::fs::copy(&self.db_path, &backup_path).map_err(|e| StoreError::Io {
            path: backup_path.clone(),
            source: e,
        })?;
        info!("Cache backed up to {}", backup_path.display());
        Ok(backup_path)
    }

    /// Replace a corrupt database with the last backup, if one exists.
    ///
    /// Call with the store closed. Returns false when no backup is present.
    pub fn restore_from_backup(dir: &Path) -> StoreResult<bool> {
        let db_path = dir.join(DB_FILE);
        let backup_path = dir.join(format!("{DB_FILE}.backup"));
        if !backup_path.exists() {
            return Ok(false);
        }
        delete_database_files(&db_path)?;
        std::fs::copy(&backup_path, &db_path).map_err(|e| StoreError::Io {
            path: db_path.clone(),
            source: e,
        })?;
        info!("Cache restored from {}", backup_path.display());
        Ok(true)
    }

    pub fn checkpoint(&self) -> StoreResult<()> {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
        Ok(())
    }

    pub fn db_size_bytes(&self) -> StoreResult<u64> {
        let page_count: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = self
            .conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok((page_count * page_size) as u64)
    }

    pub fn cache_stats(&self) -> StoreResult<CacheStats> {
        let mut counts_by_kind = HashMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT kind, COUNT(*) FROM symbols GROUP BY kind")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        for row in rows {
            let (kind, count) = row?;
            counts_by_kind.insert(kind, count);
        }

        let symbol_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM symbols", [], |row| row.get(0))?;
        let alias_count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM type_aliases", [], |row| row.get(0))?;
        let call_site_count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM call_sites", [], |row| row.get(0))?;
        let file_count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM file_metadata", [], |row| row.get(0))?;
        let parse_error_count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM parse_errors", [], |row| row.get(0))?;

        let mut stmt = self.conn.prepare(
            "SELECT file, COUNT(*) AS n FROM symbols GROUP BY file ORDER BY n DESC LIMIT 10",
        )?;
        let top_files = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CacheStats {
            symbol_count: symbol_count as u64,
            counts_by_kind,
            alias_count: alias_count as u64,
            call_site_count: call_site_count as u64,
            file_count: file_count as u64,
            parse_error_count: parse_error_count as u64,
            top_files,
            db_size_bytes: self.db_size_bytes()?,
        })
    }

    fn query_symbols(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Vec<Symbol>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, symbol_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn query_aliases(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Vec<TypeAlias>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok(TypeAlias {
                alias_name: row.get(0)?,
                qualified_name: row.get(1)?,
                target_type: row.get(2)?,
                canonical_type: row.get(3)?,
                namespace: row.get(4)?,
                alias_kind: AliasKind::parse(&row.get::<_, String>(5)?)
                    .unwrap_or(AliasKind::Using),
                is_template_alias: row.get(6)?,
                file: row.get(7)?,
                line: row.get(8)?,
                column: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn configure_connection(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.busy_handler(Some(busy_backoff))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    // Negative cache_size is KiB: 64 MiB page cache.
    conn.pragma_update(None, "cache_size", -65536)?;
    conn.pragma_update(None, "mmap_size", 268_435_456i64)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(())
}

fn delete_database_files(db_path: &Path) -> StoreResult<()> {
    for suffix in ["", "-wal", "-shm"] {
        let path = PathBuf::from(format!("{}{suffix}", db_path.display()));
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| StoreError::Io { path, source: e })?;
        }
    }
    Ok(())
}

fn delete_file_rows(tx: &rusqlite::Transaction<'_>, file: &str) -> Result<(), rusqlite::Error> {
    tx.execute("DELETE FROM symbols WHERE file = ?1", params![file])?;
    tx.execute("DELETE FROM call_sites WHERE file = ?1", params![file])?;
    tx.execute("DELETE FROM type_aliases WHERE file = ?1", params![file])?;
    Ok(())
}

fn insert_symbol(
    tx: &rusqlite::Transaction<'_>,
    symbol: &Symbol,
    now: u64,
) -> StoreResult<()> {
    tx.execute(
        "INSERT OR REPLACE INTO symbols \
         (usr, name, qualified_name, kind, file, line, column, signature, is_project, \
          namespace, access, parent_class, base_classes_json, calls_json, called_by_json, \
          start_line, end_line, header_file, header_line, header_start_line, header_end_line, \
          brief, doc_comment, is_template, template_parameters_json, template_kind, \
          primary_template_usr, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
                 ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, \
                 COALESCE((SELECT created_at FROM symbols WHERE usr = ?1), ?28), ?28)",
        params![
            symbol.usr,
            symbol.name,
            symbol.qualified_name,
            symbol.kind.as_str(),
            symbol.file,
            symbol.line,
            symbol.column,
            symbol.signature,
            symbol.is_project,
            symbol.namespace,
            symbol.access.as_str(),
            symbol.parent_class,
            serde_json::to_string(&symbol.base_classes)?,
            serde_json::to_string(&symbol.calls)?,
            serde_json::to_string(&symbol.called_by)?,
            symbol.start_line,
            symbol.end_line,
            symbol.header_file,
            symbol.header_line,
            symbol.header_start_line,
            symbol.header_end_line,
            symbol.brief,
            symbol.doc_comment,
            symbol.is_template,
            serde_json::to_string(&symbol.template_parameters)?,
            symbol.template_kind.as_str(),
            symbol.primary_template_usr,
            now as i64,
        ],
    )?;
    Ok(())
}

fn record_parse_error_tx(
    tx: &rusqlite::Transaction<'_>,
    error: &ParseErrorRecord,
) -> Result<(), rusqlite::Error> {
    // Retry count continues from what earlier sessions recorded.
    let prior: Option<i64> = tx
        .query_row(
            "SELECT MAX(retry_count) FROM parse_errors WHERE file_path = ?1",
            params![error.file_path],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    let retry = match prior {
        Some(n) => (n + 1).max(error.retry_count as i64),
        None => error.retry_count as i64,
    };
    tx.execute(
        "INSERT INTO parse_errors \
         (file_path, error_kind, message, stack, file_hash, compile_args_hash, retry_count, timestamp) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            error.file_path,
            error.error_kind,
            error.message,
            error.stack,
            error.file_hash,
            error.compile_args_hash,
            retry,
            error.timestamp as i64,
        ],
    )?;
    Ok(())
}

fn symbol_from_row(row: &rusqlite::Row<'_>) -> Result<Symbol, rusqlite::Error> {
    let kind_str: String = row.get(3)?;
    let access_str: String = row.get(10)?;
    let template_kind_str: String = row.get(25)?;
    let base_classes_json: String = row.get(12)?;
    let calls_json: String = row.get(13)?;
    let called_by_json: String = row.get(14)?;
    let template_params_json: String = row.get(24)?;

    let start_line: u32 = row.get(15)?;
    let end_line: u32 = row.get(16)?;

    Ok(Symbol {
        usr: row.get(0)?,
        name: row.get(1)?,
        qualified_name: row.get(2)?,
        kind: SymbolKind::parse(&kind_str).unwrap_or(SymbolKind::Function),
        file: row.get(4)?,
        line: row.get(5)?,
        column: row.get(6)?,
        signature: row.get(7)?,
        is_project: row.get(8)?,
        namespace: row.get(9)?,
        access: Access::parse(&access_str).unwrap_or_default(),
        parent_class: row.get(11)?,
        base_classes: serde_json::from_str(&base_classes_json).unwrap_or_default(),
        start_line,
        end_line,
        header_file: row.get(17)?,
        header_line: row.get(18)?,
        header_start_line: row.get(19)?,
        header_end_line: row.get(20)?,
        brief: row.get(21)?,
        doc_comment: row.get(22)?,
        is_template: row.get(23)?,
        template_parameters: serde_json::from_str(&template_params_json).unwrap_or_default(),
        template_kind: TemplateKind::parse(&template_kind_str).unwrap_or_default(),
        primary_template_usr: row.get(26)?,
        // Persisted rows are resolved; a body implies a multi-line span for
        // every construct we index.
        is_definition: end_line > start_line,
        calls: serde_json::from_str(&calls_json).unwrap_or_default(),
        called_by: serde_json::from_str(&called_by_json).unwrap_or_default(),
    })
}

fn now_ts() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
