//! Bounded-concurrency execution of cipher tasks.
//!
//! Each task runs the streaming pipeline on the blocking thread pool and
//! reports back over its own channel. A semaphore caps the number of tasks
//! in flight; the permit travels with the worker, so the cap holds even when
//! the awaiting future is dropped.
//!
//! [`TaskPool`] creates a scheduler lazily, shares it across everything a
//! top-level operation does, and tears it down when the last
//! [`PoolSession`] ends. A scheduler left without sessions is also reaped
//! once it has been idle for too long; an open session is never reaped.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinError;
use tracing::{debug, trace, warn};

use akravault_common::{Error, Result};
use akravault_crypto::{DecryptingStream, EncryptingStream, SecretKey};
use akravault_storage::LocalFs;

/// Direction of a cipher task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Encrypt,
    Decrypt,
}

/// One file to push through the streaming pipeline.
pub struct CipherTask {
    pub kind: TaskKind,
    pub source: PathBuf,
    pub dest: PathBuf,
    /// Session key, shared rather than copied.
    pub key: Arc<SecretKey>,
    pub block_size: usize,
}

/// Message from a worker to the task's owner.
#[derive(Debug)]
pub enum TaskEvent {
    /// Cumulative bytes of the source processed.
    Progress(u64),
    /// Finished; plaintext bytes processed.
    Done(u64),
    Failed(Error),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts a task as in flight for as long as it lives.
struct InFlight {
    current: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(current: Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs cipher tasks on at most `max_threads` workers.
pub struct TaskScheduler {
    permits: Arc<Semaphore>,
    max_threads: usize,
    fs: LocalFs,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    last_activity: Mutex<Instant>,
}

impl TaskScheduler {
    /// Create a scheduler with `max_threads` workers (at least one).
    pub fn new(max_threads: usize, fs: LocalFs) -> Self {
        let max_threads = max_threads.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_threads)),
            max_threads,
            fs,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Worker count.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Tasks currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of tasks that ever executed at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks. Running tasks finish normally.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Whether [`TaskScheduler::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    /// How long the scheduler has had nothing to do.
    fn idle_for(&self) -> Duration {
        if self.in_flight() > 0 || self.permits.available_permits() < self.max_threads {
            return Duration::ZERO;
        }
        lock(&self.last_activity).elapsed()
    }

    /// Run one task, forwarding its progress to `on_progress`.
    ///
    /// Resolves on the first terminal signal: the worker's `Done`/`Failed`
    /// message, or the worker itself ending without one.
    ///
    /// If the returned future is dropped early, the worker still runs to
    /// completion and then removes `task.dest`.
    ///
    /// Returns the number of plaintext bytes processed.
    pub async fn run<F>(&self, task: CipherTask, mut on_progress: F) -> Result<u64>
    where
        F: FnMut(u64) + Send,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::InvalidInput("Task pool is closed".to_string()))?;
        self.touch();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let fs = self.fs.clone();
        let current = self.in_flight.clone();
        let peak = self.peak.clone();

        let mut handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _in_flight = InFlight::enter(current, &peak);

            let event = match execute(&fs, &task, &tx) {
                Ok(bytes) => TaskEvent::Done(bytes),
                Err(e) => TaskEvent::Failed(e),
            };
            if tx.send(event).is_err() {
                // Owner is gone, nobody will move or discard the output.
                discard_output(&fs, &task);
            }
        });

        let outcome = loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Some(TaskEvent::Progress(bytes)) => on_progress(bytes),
                    Some(TaskEvent::Done(bytes)) => break Ok(bytes),
                    Some(TaskEvent::Failed(e)) => break Err(e),
                    None => break worker_outcome((&mut handle).await),
                },
                joined = &mut handle => break worker_outcome(joined),
            }
        };

        self.touch();
        outcome
    }
}

fn worker_outcome(joined: std::result::Result<(), JoinError>) -> Result<u64> {
    match joined {
        Ok(()) => Err(Error::ShouldNotOccur(
            "Cipher worker ended without reporting".to_string(),
        )),
        Err(e) => Err(Error::ShouldNotOccur(format!("Cipher worker failed: {}", e))),
    }
}

fn discard_output(fs: &LocalFs, task: &CipherTask) {
    match fs.remove_file_blocking(&task.dest) {
        Ok(()) | Err(Error::NotFound(_)) => {
            debug!(dest = %task.dest.display(), "Abandoned task output removed")
        }
        Err(e) => warn!(dest = %task.dest.display(), error = %e, "Could not remove abandoned task output"),
    }
}

fn execute(fs: &LocalFs, task: &CipherTask, tx: &mpsc::UnboundedSender<TaskEvent>) -> Result<u64> {
    trace!(kind = ?task.kind, source = %task.source.display(), "Cipher task started");

    let reader: File = fs.open_read(&task.source)?;
    let writer = BufWriter::new(fs.create_write(&task.dest)?);
    let progress = |bytes| {
        let _ = tx.send(TaskEvent::Progress(bytes));
    };

    match task.kind {
        TaskKind::Encrypt => EncryptingStream::new(&task.key)
            .with_block_size(task.block_size)
            .encrypt_stream(reader, writer, progress),
        TaskKind::Decrypt => DecryptingStream::new(&task.key).decrypt_stream(reader, writer, progress),
    }
}

struct PoolSlot {
    scheduler: Option<Arc<TaskScheduler>>,
    sessions: usize,
}

/// Lazily created scheduler shared by one vault.
pub struct TaskPool {
    max_threads: usize,
    idle_timeout: Duration,
    fs: LocalFs,
    slot: Arc<Mutex<PoolSlot>>,
}

impl TaskPool {
    /// Create an empty pool. No scheduler exists until one is needed.
    pub fn new(max_threads: usize, idle_timeout: Duration, fs: LocalFs) -> Self {
        Self {
            max_threads,
            idle_timeout,
            fs,
            slot: Arc::new(Mutex::new(PoolSlot {
                scheduler: None,
                sessions: 0,
            })),
        }
    }

    /// Begin a top-level operation.
    pub fn session(&self) -> PoolSession<'_> {
        lock(&self.slot).sessions += 1;
        PoolSession { pool: self }
    }

    /// Whether a scheduler currently exists.
    pub fn is_active(&self) -> bool {
        lock(&self.slot).scheduler.is_some()
    }

    /// Tear down the scheduler regardless of open sessions.
    pub fn shutdown(&self) {
        if let Some(scheduler) = lock(&self.slot).scheduler.take() {
            scheduler.close();
            debug!("Task pool shut down");
        }
    }

    fn scheduler(&self) -> Arc<TaskScheduler> {
        let mut slot = lock(&self.slot);
        if let Some(scheduler) = &slot.scheduler {
            return scheduler.clone();
        }

        let scheduler = Arc::new(TaskScheduler::new(self.max_threads, self.fs.clone()));
        slot.scheduler = Some(scheduler.clone());
        debug!(max_threads = self.max_threads, "Task pool created");

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(reap_when_idle(
                Arc::downgrade(&self.slot),
                Arc::downgrade(&scheduler),
                self.idle_timeout,
            ));
        }
        scheduler
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps the pool alive for one top-level operation.
pub struct PoolSession<'a> {
    pool: &'a TaskPool,
}

impl PoolSession<'_> {
    /// The shared scheduler, created on first use.
    pub fn scheduler(&self) -> Arc<TaskScheduler> {
        self.pool.scheduler()
    }
}

impl Drop for PoolSession<'_> {
    fn drop(&mut self) {
        let mut slot = lock(&self.pool.slot);
        slot.sessions = slot.sessions.saturating_sub(1);
        if slot.sessions == 0 {
            if let Some(scheduler) = slot.scheduler.take() {
                scheduler.close();
                debug!("Task pool torn down after operation");
            }
        }
    }
}

async fn reap_when_idle(slot: Weak<Mutex<PoolSlot>>, scheduler: Weak<TaskScheduler>, timeout: Duration) {
    loop {
        tokio::time::sleep(timeout).await;

        let Some(current) = scheduler.upgrade() else {
            return;
        };
        if current.is_closed() {
            return;
        }
        if current.idle_for() < timeout {
            continue;
        }

        let Some(shared) = slot.upgrade() else {
            current.close();
            return;
        };
        {
            let mut guard = lock(&shared);
            // An open session is pending work, however long it has been quiet.
            if guard.sessions > 0 {
                continue;
            }
            if guard
                .scheduler
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(s, &current))
            {
                guard.scheduler = None;
            }
            current.close();
        }
        debug!("Idle task pool reaped");
        return;
    }
}
