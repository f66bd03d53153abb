//! Process pool for fetch/parse jobs.
//!
//! Feed fetching and XML parsing are slow, network-bound, and exposed
//! to malformed input, so they run in separate OS processes. Workers
//! are spawned on demand, reused across cycle runs, and only destroyed
//! on explicit kill. The cap on live workers is an explicit parameter;
//! `acquire` waits at the cap instead of growing without bound.

pub mod fetch;
pub mod protocol;

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use protocol::{FetchJob, FetchReply};

/// A worker lent out by the pool. Holding one means the underlying
/// process is locked to the caller; it returns to the pool via
/// `WorkerPool::release` or dies via `WorkerPool::kill`. Because the
/// worker moves out of the pool on acquire, releasing an already-free
/// worker is unrepresentable.
pub struct Worker {
    proc: WorkerProc,
    _permit: OwnedSemaphorePermit,
}

impl Worker {
    pub fn id(&self) -> u64 {
        self.proc.id
    }

    /// Send one fetch job and wait for the reply line.
    pub async fn dispatch(&mut self, job: &FetchJob) -> Result<FetchReply> {
        let mut line = serde_json::to_string(job)?;
        line.push('\n');
        self.proc
            .stdin
            .write_all(line.as_bytes())
            .await
            .context("Failed to write job to worker stdin")?;
        self.proc.stdin.flush().await?;
        let reply = self
            .proc
            .stdout
            .next_line()
            .await
            .context("Failed to read worker reply")?
            .context("Worker closed stdout")?;
        serde_json::from_str(&reply).context("Malformed worker reply")
    }
}

struct WorkerProc {
    id: u64,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

pub struct WorkerPool {
    program: String,
    args: Vec<String>,
    /// Free (unlocked) workers available for reuse.
    idle: Mutex<Vec<WorkerProc>>,
    /// Bounds concurrently locked workers.
    slots: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl WorkerPool {
    /// `cap` bounds concurrently locked workers; 0 means unbounded.
    pub fn new(program: impl Into<String>, args: Vec<String>, cap: usize) -> Self {
        let permits = if cap == 0 { Semaphore::MAX_PERMITS } else { cap };
        Self {
            program: program.into(),
            args,
            idle: Mutex::new(Vec::new()),
            slots: Arc::new(Semaphore::new(permits)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Lock a free worker, or spawn a new one when none is free.
    /// Waits when the cap is reached. Spawn failures propagate.
    pub async fn acquire(&self) -> Result<Worker> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .expect("worker semaphore closed");
        let reused = self.idle.lock().await.pop();
        let proc = match reused {
            Some(proc) => {
                debug!(worker = proc.id, "Reusing free worker");
                proc
            }
            None => self.spawn()?,
        };
        Ok(Worker {
            proc,
            _permit: permit,
        })
    }

    /// Mark a locked worker free again.
    pub async fn release(&self, worker: Worker) {
        self.idle.lock().await.push(worker.proc);
    }

    /// Terminate the worker's process and drop it from the pool.
    pub async fn kill(&self, worker: Worker) {
        let mut proc = worker.proc;
        if let Err(e) = proc.child.kill().await {
            warn!(worker = proc.id, error = %e, "Failed to kill worker");
        }
    }

    /// Kill every free worker. Called at service shutdown.
    pub async fn shutdown(&self) {
        let mut idle = self.idle.lock().await;
        for mut proc in idle.drain(..) {
            if let Err(e) = proc.child.kill().await {
                warn!(worker = proc.id, error = %e, "Failed to kill worker");
            }
        }
    }

    fn spawn(&self) -> Result<WorkerProc> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker process `{}`", self.program))?;
        let stdin = child.stdin.take().context("Worker stdin not piped")?;
        let stdout = BufReader::new(child.stdout.take().context("Worker stdout not piped")?).lines();
        debug!(worker = id, program = %self.program, "Spawned worker");
        Ok(WorkerProc {
            id,
            child,
            stdin,
            stdout,
        })
    }
}
