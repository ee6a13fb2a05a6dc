//! The indexing coordinator: one control thread that owns the store and the
//! in-memory indexes.
//!
//! Scanning, hashing, and merging happen here; parsing happens in worker
//! processes. Results drain in bounded batches, each batch is one store
//! transaction, and a shared cancel flag is polled between batches, so an
//! interrupted run always leaves whole files in the cache.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::compiledb::{CompilationDatabase, compile_args_hash};
use crate::config::Settings;
use crate::error::{IndexError, IndexResult};
use crate::indexing::file_info::{hash_file, utc_timestamp};
use crate::indexing::memory::SymbolIndexes;
use crate::indexing::pool::{Outcome, PoolConfig, WorkerCommand, WorkerPool, WorkerResult};
use crate::indexing::protocol::WorkerJob;
use crate::scanner::{FileScanner, ScannedFile};
use crate::store::SymbolStore;
use crate::symbol::{AnalyzerState, FileRecord, ParseErrorRecord, Progress};

const RECENT_ERROR_TAIL: usize = 20;

/// Lock-free progress counters, snapshotted into [`Progress`].
#[derive(Default)]
pub struct ProgressCounters {
    total: AtomicU64,
    indexed: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    start_time: AtomicU64,
    current_file: Mutex<Option<String>>,
}

impl ProgressCounters {
    fn begin(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.indexed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.start_time.store(utc_timestamp(), Ordering::Relaxed);
        *self.current_file.lock().expect("progress lock") = None;
    }

    fn set_current(&self, file: Option<String>) {
        *self.current_file.lock().expect("progress lock") = file;
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            total_files: self.total.load(Ordering::Relaxed),
            indexed_files: self.indexed.load(Ordering::Relaxed),
            failed_files: self.failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            current_file: self.current_file.lock().expect("progress lock").clone(),
            start_time: self.start_time.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot returned by `get_indexing_status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexingStatus {
    pub state: AnalyzerState,
    pub progress: Progress,
    pub recent_errors: Vec<ParseErrorRecord>,
}

/// Cloneable, never-blocking view of the coordinator's state.
///
/// Status queries must be answerable at any moment, including mid-index, so
/// everything here sits outside the coordinator's ownership.
#[derive(Clone, Default)]
pub struct StatusHandle {
    state: Arc<RwLock<AnalyzerState>>,
    progress: Arc<ProgressCounters>,
    errors: Arc<Mutex<VecDeque<ParseErrorRecord>>>,
    cancel: Arc<AtomicBool>,
}

impl StatusHandle {
    pub fn state(&self) -> AnalyzerState {
        *self.state.read().expect("state lock")
    }

    pub fn snapshot(&self) -> IndexingStatus {
        IndexingStatus {
            state: self.state(),
            progress: self.progress.snapshot(),
            recent_errors: self
                .errors
                .lock()
                .expect("error tail lock")
                .iter()
                .cloned()
                .collect(),
        }
    }

    /// Request cooperative cancellation of the current run.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn set_state(&self, next: AnalyzerState) {
        let mut state = self.state.write().expect("state lock");
        debug!("state: {} -> {}", state.as_str(), next.as_str());
        *state = next;
    }

    fn push_error(&self, error: ParseErrorRecord) {
        let mut errors = self.errors.lock().expect("error tail lock");
        if errors.len() == RECENT_ERROR_TAIL {
            errors.pop_front();
        }
        errors.push_back(error);
    }

    fn clear_cancel(&self) {
        self.cancel.store(false, Ordering::Relaxed);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Result of one indexing run.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IndexOutcome {
    pub scanned: u64,
    pub indexed: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub removed: u64,
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// Coordinator for one project: scanner, compile DB, worker pool, store,
/// and the in-memory indexes, driven from a single control thread.
pub struct ProjectIndexer {
    settings: Arc<Settings>,
    project_root: PathBuf,
    cache_dir: PathBuf,
    store: SymbolStore,
    compile_db: CompilationDatabase,
    indexes: SymbolIndexes,
    status: StatusHandle,
    worker_command: WorkerCommand,
}

impl ProjectIndexer {
    /// Open a project: create/open its cache, load cached symbols into
    /// memory, and decide whether the cache is current.
    pub fn open(project_root: &Path, settings: Arc<Settings>) -> IndexResult<Self> {
        let status = StatusHandle::default();
        status.set_state(AnalyzerState::LoadingCache);

        let project_root = project_root
            .canonicalize()
            .map_err(|e| IndexError::FileRead {
                path: project_root.to_path_buf(),
                source: e,
            })?;
        let cache_dir = settings.cache_dir_for_project(&project_root);
        let store = match SymbolStore::open(&cache_dir) {
            Ok(store) => store,
            Err(e) => {
                status.set_state(AnalyzerState::Error);
                return Err(e.into());
            }
        };
        let compile_db = CompilationDatabase::open(&project_root, &settings.project)?;

        let mut indexer = Self {
            settings,
            project_root,
            cache_dir,
            store,
            compile_db,
            indexes: SymbolIndexes::new(),
            status,
            worker_command: WorkerCommand::current_binary(),
        };
        indexer.load_cache()?;
        Ok(indexer)
    }

    /// Swap the worker launcher (tests drive the pool with stub commands).
    pub fn set_worker_command(&mut self, command: WorkerCommand) {
        self.worker_command = command;
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn indexes(&self) -> &SymbolIndexes {
        &self.indexes
    }

    pub fn store(&self) -> &SymbolStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SymbolStore {
        &mut self.store
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn load_cache(&mut self) -> IndexResult<()> {
        let symbols = self.store.load_all_symbols()?;
        let aliases = self.store.load_all_aliases()?;
        let call_sites = self.store.load_all_call_sites()?;
        let loaded = symbols.len();
        for symbol in symbols {
            self.indexes.insert_symbol(symbol);
        }
        for alias in aliases {
            self.indexes.insert_alias(alias);
        }
        for site in call_sites {
            self.indexes.insert_call_site(site);
        }

        let state = if loaded > 0 && self.cache_is_current()? {
            AnalyzerState::ReadyFromCache
        } else {
            // Stale or empty; the first index_all/refresh fills the gap.
            AnalyzerState::LoadingCache
        };
        self.status.set_state(state);
        info!(
            "loaded {loaded} cached symbols from {}",
            self.cache_dir.display()
        );
        Ok(())
    }

    /// True when every known file still matches its recorded hashes.
    pub fn cache_is_current(&self) -> IndexResult<bool> {
        for meta in self.store.all_file_metadata()? {
            let path = Path::new(&meta.path);
            let Ok(hash) = hash_file(path) else {
                return Ok(false);
            };
            if hash != meta.file_hash {
                return Ok(false);
            }
            let args = self.compile_db.args_for_with_fallback(path);
            if compile_args_hash(&args) != meta.compile_args_hash {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Index the project. `force` bypasses the hash gate entirely.
    pub fn index_all(&mut self, force: bool) -> IndexResult<IndexOutcome> {
        self.status.clear_cancel();
        self.status.set_state(AnalyzerState::Indexing);
        let outcome = self.run_index(force, 0);
        match &outcome {
            Ok(_) => self.status.set_state(AnalyzerState::Indexed),
            Err(_) => self.status.set_state(AnalyzerState::Error),
        }
        outcome
    }

    /// Recompute hashes for all known files; drop removed files, index new
    /// and changed ones.
    pub fn refresh(&mut self, force: bool) -> IndexResult<IndexOutcome> {
        self.status.clear_cancel();
        self.status.set_state(AnalyzerState::Indexing);
        self.compile_db.refresh_if_modified()?;

        let scanned: HashSet<String> = self
            .scan()
            .into_iter()
            .map(|f| f.path.to_string_lossy().into_owned())
            .collect();
        let mut removed = 0u64;
        for meta in self.store.all_file_metadata()? {
            if !scanned.contains(&meta.path) {
                info!("file removed: {}", meta.path);
                self.store.delete_file(&meta.path)?;
                self.indexes.remove_file(&meta.path);
                removed += 1;
            }
        }

        let outcome = self.run_index(force, removed);
        match &outcome {
            Ok(_) => self.status.set_state(AnalyzerState::Indexed),
            Err(_) => self.status.set_state(AnalyzerState::Error),
        }
        outcome
    }

    fn scan(&self) -> Vec<ScannedFile> {
        let scanner = FileScanner::new(
            &self.project_root,
            &self.settings.project,
            Some(&self.cache_dir),
        );
        scanner.scan(&self.compile_db)
    }

    fn run_index(&mut self, force: bool, removed: u64) -> IndexResult<IndexOutcome> {
        let started = Instant::now();
        let files = self.scan();
        let total = files.len() as u64;
        self.status.progress.begin(total);

        let mut outcome = IndexOutcome {
            scanned: total,
            removed,
            ..Default::default()
        };

        // Hash gate: a file is a cache hit iff content hash and args hash
        // both match its metadata row and it is not awaiting a retry.
        let mut jobs = Vec::new();
        let max_retries = self.settings.indexing.max_parse_retries;
        for (id, scanned) in files.into_iter().enumerate() {
            let path_str = scanned.path.to_string_lossy().into_owned();
            let file_hash = match hash_file(&scanned.path) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("cannot read {path_str}: {e}");
                    outcome.failed += 1;
                    self.status.progress.failed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let args = self.compile_db.args_for_with_fallback(&scanned.path);
            let args_hash = compile_args_hash(&args);

            if !force {
                if let Some(meta) = self.store.file_metadata(&path_str)? {
                    if meta.file_hash == file_hash && meta.compile_args_hash == args_hash {
                        // A file with recorded parse errors keeps retrying
                        // until its retry budget is spent.
                        let retry_pending = self
                            .store
                            .parse_error_retries(&path_str)?
                            .is_some_and(|r| r < max_retries);
                        if !retry_pending {
                            outcome.cache_hits += 1;
                            self.status.progress.cache_hits.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    }
                }
            }

            jobs.push(WorkerJob {
                id: id as u64,
                file: path_str,
                args,
                is_project: scanned.is_project,
                file_hash,
                compile_args_hash: args_hash,
                project_root: self.project_root.to_string_lossy().into_owned(),
                dependency_roots: self.settings.project.dependency_roots.clone(),
                cache_dir: Some(self.cache_dir.to_string_lossy().into_owned()),
            });
        }

        if !jobs.is_empty() {
            self.drive_pool(jobs, &mut outcome)?;
        }

        self.finish_run(&mut outcome)?;
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "index run: {} indexed, {} hits, {} failed, {} removed in {} ms",
            outcome.indexed, outcome.cache_hits, outcome.failed, outcome.removed, outcome.duration_ms
        );
        Ok(outcome)
    }

    fn drive_pool(&mut self, jobs: Vec<WorkerJob>, outcome: &mut IndexOutcome) -> IndexResult<()> {
        let indexing = &self.settings.indexing;
        let capacity = indexing.worker_count.max(1) * 2;
        let mut pool = WorkerPool::start(PoolConfig {
            worker_count: indexing.worker_count,
            max_tasks_per_child: indexing.worker_max_tasks_per_child,
            file_timeout: Duration::from_secs(indexing.worker_file_timeout_s),
            join_deadline: Duration::from_secs(indexing.cancellation_join_deadline_s),
            command: self.worker_command.clone(),
        });

        let batch_size = indexing.batch_flush_size.max(1);
        let mut pending = jobs.into_iter();
        let mut next = pending.next();
        let mut in_flight = 0usize;
        let mut batch: Vec<FileRecord> = Vec::with_capacity(batch_size);
        let mut pool_cancelled = false;

        while next.is_some() || in_flight > 0 {
            // Cancellation is observed between result batches: stop intake,
            // keep draining what workers already produced.
            if self.status.cancelled() && !pool_cancelled {
                info!("cancellation requested; stopping job intake");
                pool.cancel();
                pool_cancelled = true;
                outcome.cancelled = true;
                next = None;
                // Skipped jobs stay unindexed; a later refresh picks them up.
                pending.by_ref().count();
            }

            while in_flight < capacity {
                let Some(job) = next.take() else { break };
                self.status.progress.set_current(Some(job.file.clone()));
                if pool.submit(job) {
                    in_flight += 1;
                }
                next = pending.next();
            }

            match pool.recv_timeout(Duration::from_millis(100)) {
                Ok(result) => {
                    in_flight -= 1;
                    self.absorb_result(result, &mut batch, outcome)?;
                    if batch.len() >= batch_size {
                        self.flush_batch(&mut batch)?;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }

        self.flush_batch(&mut batch)?;
        for result in pool.join() {
            self.absorb_result(result, &mut batch, outcome)?;
        }
        self.flush_batch(&mut batch)?;
        self.status.progress.set_current(None);
        Ok(())
    }

    fn absorb_result(
        &mut self,
        result: WorkerResult,
        batch: &mut Vec<FileRecord>,
        outcome: &mut IndexOutcome,
    ) -> IndexResult<()> {
        match result.outcome {
            Outcome::Completed(mut record) => {
                // The job is authoritative for file identity and hashes;
                // never trust the reply's echo of them.
                record.file = result.job.file.clone();
                record.file_hash = result.job.file_hash.clone();
                record.compile_args_hash = result.job.compile_args_hash.clone();
                let fatal = record
                    .errors
                    .iter()
                    .any(|e| e.error_kind == "parse_failure" || e.error_kind == "parser_unavailable");
                for error in &record.errors {
                    self.status.push_error(error.clone());
                    self.mirror_error(error);
                }
                if fatal && record.symbols.is_empty() {
                    outcome.failed += 1;
                    self.status.progress.failed.fetch_add(1, Ordering::Relaxed);
                    for error in &record.errors {
                        self.store.record_parse_error(error)?;
                    }
                } else {
                    outcome.indexed += 1;
                    self.status.progress.indexed.fetch_add(1, Ordering::Relaxed);
                    batch.push(*record);
                }
            }
            Outcome::Failed { reason, timed_out } => {
                outcome.failed += 1;
                self.status.progress.failed.fetch_add(1, Ordering::Relaxed);
                let error = ParseErrorRecord {
                    file_path: result.job.file.clone(),
                    error_kind: if timed_out { "timeout" } else { "worker_crash" }.to_string(),
                    message: reason,
                    stack: None,
                    file_hash: result.job.file_hash.clone(),
                    compile_args_hash: result.job.compile_args_hash.clone(),
                    retry_count: 0,
                    timestamp: utc_timestamp(),
                };
                warn!("{}: {}", error.file_path, error.message);
                self.store.record_parse_error(&error)?;
                self.status.push_error(error.clone());
                self.mirror_error(&error);
            }
            Outcome::Cancelled => {
                outcome.cancelled = true;
            }
        }
        Ok(())
    }

    /// Merge already-extracted records exactly as a drained worker batch:
    /// definition-wins merge in memory, then one store transaction.
    pub fn apply_records(&mut self, records: Vec<FileRecord>) -> IndexResult<()> {
        let mut batch = records;
        self.flush_batch(&mut batch)
    }

    /// Merge a batch into the in-memory indexes, then flush the resolved
    /// rows to the store in one transaction.
    fn flush_batch(&mut self, batch: &mut Vec<FileRecord>) -> IndexResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut resolved = Vec::with_capacity(batch.len());
        for mut record in batch.drain(..) {
            self.indexes.remove_file(&record.file);
            let usrs: Vec<String> = record.symbols.iter().map(|s| s.usr.clone()).collect();
            for symbol in std::mem::take(&mut record.symbols) {
                self.indexes.insert_symbol(symbol);
            }
            for alias in record.aliases.clone() {
                self.indexes.insert_alias(alias);
            }
            for site in record.call_sites.clone() {
                self.indexes.insert_call_site(site);
            }

            // Persist what the merge resolved, not the raw sightings: the
            // definition-wins rule may have moved a symbol's home file.
            let mut seen = HashSet::new();
            for usr in usrs {
                if seen.insert(usr.clone()) {
                    if let Some(symbol) = self.indexes.get_by_usr(&usr) {
                        record.symbols.push(symbol.clone());
                    }
                }
            }
            resolved.push(record);
        }

        self.store.apply_file_records(&resolved)?;
        debug!("flushed {} files to store", resolved.len());
        Ok(())
    }

    fn finish_run(&mut self, outcome: &mut IndexOutcome) -> IndexResult<()> {
        self.store
            .set_meta("version", env!("CARGO_PKG_VERSION"))?;
        self.store.set_meta(
            "include_dependencies",
            &self.settings.project.include_dependencies.to_string(),
        )?;
        let count = self.store.all_file_metadata()?.len();
        self.store
            .set_meta("indexed_file_count", &count.to_string())?;

        let actions = self.store.auto_maintenance(&self.settings.store)?;
        if !actions.is_empty() {
            debug!("maintenance actions: {actions:?}");
        }
        if self.settings.store.backup_after_index && !outcome.cancelled && outcome.failed == 0 {
            self.store.backup()?;
        }
        Ok(())
    }

    /// Append an error to the cache-local `parse_errors.jsonl` stream.
    fn mirror_error(&self, error: &ParseErrorRecord) {
        if !self.settings.store.parse_error_log {
            return;
        }
        let path = self.cache_dir.join("parse_errors.jsonl");
        if let Ok(line) = serde_json::to_string(error) {
            let _ = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut f| {
                    use std::io::Write;
                    writeln!(f, "{line}")
                });
        }
    }
}
