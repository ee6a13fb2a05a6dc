//! Process pool for parser workers.
//!
//! Parsing runs in child processes, not threads: libclang keeps significant
//! per-TU state and long-lived parser processes grow their heap, so workers
//! are whole processes recycled after a bounded number of tasks. The
//! coordinator talks to each child over the JSON-lines protocol.
//!
//! Every wait in here has a deadline. A job that outlives its per-file
//! timeout gets its child killed and respawned; cancellation stops intake
//! immediately and gives outstanding children a bounded join window.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::io::BufReader;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::protocol::{self, WorkerJob, WorkerReply};
use crate::symbol::FileRecord;

/// How to launch one worker child.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// The production launcher: this binary's hidden `worker` subcommand.
    pub fn current_binary() -> Self {
        Self {
            program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("clangmap")),
            args: vec!["worker".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub max_tasks_per_child: usize,
    pub file_timeout: Duration,
    pub join_deadline: Duration,
    pub command: WorkerCommand,
}

/// Terminal state of one submitted job.
#[derive(Debug)]
pub enum Outcome {
    Completed(Box<FileRecord>),
    Failed { reason: String, timed_out: bool },
    Cancelled,
}

#[derive(Debug)]
pub struct WorkerResult {
    pub job: WorkerJob,
    pub outcome: Outcome,
}

struct ChildProc {
    child: Child,
    stdin: ChildStdin,
    replies: Receiver<std::io::Result<WorkerReply>>,
    tasks_done: usize,
}

pub struct WorkerPool {
    job_tx: Option<Sender<WorkerJob>>,
    result_rx: Receiver<WorkerResult>,
    cancel: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(config: PoolConfig) -> Self {
        let worker_count = config.worker_count.max(1);
        // Bounded intake gives natural backpressure against the scanner.
        let (job_tx, job_rx) = bounded::<WorkerJob>(worker_count * 2);
        let (result_tx, result_rx) = bounded::<WorkerResult>(worker_count * 4);
        let cancel = Arc::new(AtomicBool::new(false));

        let mut threads = Vec::with_capacity(worker_count);
        for slot in 0..worker_count {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let cfg = config.clone();
            let cancel = cancel.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("worker-{slot}"))
                    .spawn(move || worker_slot(slot, jobs, results, cfg, cancel))
                    .expect("spawn worker slot thread"),
            );
        }

        Self {
            job_tx: Some(job_tx),
            result_rx,
            cancel,
            threads,
        }
    }

    /// Submit a job; blocks when the intake queue is full.
    ///
    /// Returns false when the pool no longer accepts work (cancelled).
    pub fn submit(&self, job: WorkerJob) -> bool {
        if self.cancel.load(Ordering::Relaxed) {
            return false;
        }
        match &self.job_tx {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    /// No more jobs will be submitted; workers exit after draining.
    pub fn finish_submitting(&mut self) {
        self.job_tx = None;
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<WorkerResult, RecvTimeoutError> {
        self.result_rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<WorkerResult> {
        self.result_rx.try_recv().ok()
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Stop accepting work. Already-submitted jobs come back `Cancelled`
    /// unless a worker is mid-parse, in which case the parse is allowed to
    /// finish inside the join deadline.
    pub fn cancel(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.finish_submitting();
    }

    /// Wait for all worker threads to exit, draining stray results.
    ///
    /// Draining continues while waiting so a slot blocked on a full result
    /// channel can always make progress.
    pub fn join(mut self) -> Vec<WorkerResult> {
        self.finish_submitting();
        let mut leftovers = Vec::new();
        let threads = std::mem::take(&mut self.threads);
        for handle in threads {
            while !handle.is_finished() {
                while let Some(result) = self.try_recv() {
                    leftovers.push(result);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            // Slot threads bound every wait, so this cannot hang.
            if handle.join().is_err() {
                warn!("worker slot thread panicked");
            }
        }
        while let Some(result) = self.try_recv() {
            leftovers.push(result);
        }
        leftovers
    }
}

fn worker_slot(
    slot: usize,
    jobs: Receiver<WorkerJob>,
    results: Sender<WorkerResult>,
    config: PoolConfig,
    cancel: Arc<AtomicBool>,
) {
    let mut child: Option<ChildProc> = None;

    while let Ok(job) = jobs.recv() {
        if cancel.load(Ordering::Relaxed) {
            let _ = results.send(WorkerResult {
                job,
                outcome: Outcome::Cancelled,
            });
            continue;
        }

        let outcome = run_job(slot, &mut child, &job, &config, &cancel);

        if let Some(proc) = child.as_mut() {
            proc.tasks_done += 1;
            if proc.tasks_done >= config.max_tasks_per_child {
                debug!("worker-{slot}: recycling child after {} tasks", proc.tasks_done);
                shutdown_child(child.take(), config.join_deadline);
            }
        }

        if results
            .send(WorkerResult {
                job,
                outcome,
            })
            .is_err()
        {
            break;
        }
    }

    shutdown_child(child.take(), config.join_deadline);
}

fn run_job(
    slot: usize,
    child: &mut Option<ChildProc>,
    job: &WorkerJob,
    config: &PoolConfig,
    cancel: &AtomicBool,
) -> Outcome {
    // A dead child is replaced once; failing twice fails the job.
    for attempt in 0..2 {
        let proc = match ensure_child(child, &config.command) {
            Ok(proc) => proc,
            Err(e) => {
                return Outcome::Failed {
                    reason: format!("failed to spawn worker process: {e}"),
                    timed_out: false,
                };
            }
        };

        if let Err(e) = protocol::write_message(&mut proc.stdin, job) {
            debug!("worker-{slot}: stdin write failed (attempt {attempt}): {e}");
            kill_child(child.take());
            continue;
        }

        return await_reply(slot, child, job, config, cancel);
    }
    Outcome::Failed {
        reason: "worker process exited before accepting the job".to_string(),
        timed_out: false,
    }
}

fn await_reply(
    slot: usize,
    child: &mut Option<ChildProc>,
    job: &WorkerJob,
    config: &PoolConfig,
    cancel: &AtomicBool,
) -> Outcome {
    let started = Instant::now();
    let deadline = started + config.file_timeout;
    let mut cancel_seen: Option<Instant> = None;

    loop {
        if cancel_seen.is_none() && cancel.load(Ordering::Relaxed) {
            cancel_seen = Some(Instant::now());
        }
        // Cancellation shortens the wait to the join deadline; a laggard
        // child is killed rather than waited out.
        let effective_deadline = match cancel_seen {
            Some(seen) => deadline.min(seen + config.join_deadline),
            None => deadline,
        };
        let now = Instant::now();
        if now >= effective_deadline {
            warn!(
                "worker-{slot}: killing child, {} exceeded its deadline ({:?})",
                job.file,
                now - started
            );
            kill_child(child.take());
            return Outcome::Failed {
                reason: format!("parse deadline exceeded after {:?}", now - started),
                timed_out: true,
            };
        }

        let slice = (effective_deadline - now).min(Duration::from_millis(100));
        let proc = child.as_ref().expect("await_reply with live child");
        match proc.replies.recv_timeout(slice) {
            Ok(Ok(reply)) if reply.id == job.id => {
                return Outcome::Completed(Box::new(reply.record));
            }
            Ok(Ok(reply)) => {
                // A reply for an older, timed-out job from a child that was
                // not recycled in time; drop it and keep waiting.
                debug!("worker-{slot}: discarding stale reply for job {}", reply.id);
            }
            Ok(Err(e)) => {
                kill_child(child.take());
                return Outcome::Failed {
                    reason: format!("worker protocol error: {e}"),
                    timed_out: false,
                };
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                kill_child(child.take());
                return Outcome::Failed {
                    reason: "worker process exited unexpectedly".to_string(),
                    timed_out: false,
                };
            }
        }
    }
}

fn ensure_child<'a>(
    child: &'a mut Option<ChildProc>,
    command: &WorkerCommand,
) -> std::io::Result<&'a mut ChildProc> {
    if child.is_none() {
        *child = Some(spawn_child(command)?);
    }
    Ok(child.as_mut().expect("child just ensured"))
}

fn spawn_child(command: &WorkerCommand) -> std::io::Result<ChildProc> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    let stdin = child.stdin.take().expect("piped stdin");
    let stdout = child.stdout.take().expect("piped stdout");
    let (tx, rx) = bounded(8);
    std::thread::Builder::new()
        .name("worker-reader".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                match protocol::read_message::<_, WorkerReply>(&mut reader) {
                    Ok(Some(reply)) => {
                        if tx.send(Ok(reply)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        })?;

    Ok(ChildProc {
        child,
        stdin,
        replies: rx,
        tasks_done: 0,
    })
}

/// Graceful stop: close stdin so the child sees EOF, wait out the deadline,
/// then kill.
fn shutdown_child(proc: Option<ChildProc>, deadline: Duration) {
    let Some(mut proc) = proc else { return };
    drop(proc.stdin);
    let end = Instant::now() + deadline;
    loop {
        match proc.child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {
                if Instant::now() >= end {
                    let _ = proc.child.kill();
                    let _ = proc.child.wait();
                    return;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(_) => return,
        }
    }
}

fn kill_child(proc: Option<ChildProc>) {
    if let Some(mut proc) = proc {
        let _ = proc.child.kill();
        let _ = proc.child.wait();
    }
}
