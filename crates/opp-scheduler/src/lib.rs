//! Job scheduling for Open Peer Power
//!
//! Every callback, async function and blocking function in the system is
//! funneled through a [`JobScheduler`]. The scheduler keeps the set of
//! in-flight tasks so that callers can wait until everything has settled
//! ([`JobScheduler::block_till_done`]) and so that shutdown can cancel what
//! is left.

mod job;
mod pending;

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, warn};

pub use job::{Job, JobKind};
pub use pending::PendingTaskInfo;

use job::Target;
use pending::PendingTasks;

/// Result returned by listener and service handler bodies
pub type HandlerResult = anyhow::Result<()>;

/// Interval between "still waiting" diagnostics in `block_till_done`
pub const BLOCK_LOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors surfaced by scheduled work
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler is shutting down, no new callbacks are accepted")]
    ShuttingDown,

    #[error("task was cancelled")]
    Cancelled,

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl From<JoinError> for SchedulerError {
    fn from(err: JoinError) -> Self {
        if err.is_panic() {
            SchedulerError::Panicked(panic_message(err.into_panic()))
        } else {
            SchedulerError::Cancelled
        }
    }
}

/// Render a panic payload as text
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_outcome(name: &str, origin: &str, outcome: std::thread::Result<HandlerResult>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(job = %name, origin = %origin, "Error doing job: {err:#}"),
        Err(payload) => error!(
            job = %name,
            origin = %origin,
            "Job panicked: {}",
            panic_message(payload)
        ),
    }
}

/// Handle to a tracked task
///
/// Awaiting the handle yields the task's output. Dropping it detaches the
/// task, which keeps running and stays tracked.
#[derive(Debug)]
pub struct JobHandle<R> {
    inner: JoinHandle<R>,
}

impl<R> JobHandle<R> {
    /// Request cancellation of the task
    pub fn abort(&self) {
        self.inner.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Turn this handle into one that cancels the task when dropped
    ///
    /// Used when a caller awaits the task and its own cancellation must
    /// reach the task too.
    pub fn cancel_on_drop(self) -> CancelOnDrop<R> {
        CancelOnDrop { inner: self.inner }
    }
}

impl<R> Future for JobHandle<R> {
    type Output = Result<R, SchedulerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|res| res.map_err(SchedulerError::from))
    }
}

/// Task handle that aborts the task when dropped
#[derive(Debug)]
pub struct CancelOnDrop<R> {
    inner: JoinHandle<R>,
}

impl<R> Future for CancelOnDrop<R> {
    type Output = Result<R, SchedulerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|res| res.map_err(SchedulerError::from))
    }
}

impl<R> Drop for CancelOnDrop<R> {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

/// Result of [`JobScheduler::run_job`]
#[derive(Debug)]
pub enum JobOutcome<R> {
    /// The job was a callback and already ran
    Completed(R),
    /// The job was scheduled as a task
    Scheduled(JobHandle<R>),
}

impl<R> JobOutcome<R> {
    /// Wait for the job's result
    pub async fn wait(self) -> Result<R, SchedulerError> {
        match self {
            JobOutcome::Completed(result) => Ok(result),
            JobOutcome::Scheduled(handle) => handle.await,
        }
    }
}

/// The single scheduling authority
pub struct JobScheduler {
    runtime: Handle,
    pending: Arc<PendingTasks>,
    block_log_timeout: Duration,
    threadsafe_closed: AtomicBool,
}

impl JobScheduler {
    /// Create a scheduler spawning onto the given runtime
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            pending: Arc::new(PendingTasks::default()),
            block_log_timeout: BLOCK_LOG_TIMEOUT,
            threadsafe_closed: AtomicBool::new(false),
        }
    }

    /// Create a scheduler bound to the current runtime
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Change how often `block_till_done` reports tasks it is waiting on
    pub fn with_block_log_timeout(mut self, timeout: Duration) -> Self {
        self.block_log_timeout = timeout;
        self
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    fn spawn_tracked<F>(&self, name: &str, fut: F) -> JobHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.pending.register(name);
        let id = guard.id();
        let inner = self.runtime.spawn(async move {
            guard.bind_current_task();
            let _guard = guard;
            fut.await
        });
        self.pending.attach(id, inner.abort_handle());
        JobHandle { inner }
    }

    fn spawn_blocking_tracked<F, R>(&self, name: &str, f: F) -> JobHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let guard = self.pending.register(name);
        let id = guard.id();
        let inner = self.runtime.spawn_blocking(move || {
            let _guard = guard;
            f()
        });
        self.pending.attach(id, inner.abort_handle());
        JobHandle { inner }
    }

    /// Track a future as a task
    pub fn create_task<F>(&self, name: impl AsRef<str>, fut: F) -> JobHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_tracked(name.as_ref(), fut)
    }

    /// Offload a blocking function to the blocking thread pool
    pub fn add_executor_job<F, R>(&self, name: impl AsRef<str>, f: F) -> JobHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.spawn_blocking_tracked(name.as_ref(), f)
    }

    /// Schedule a job; nothing runs before the caller yields
    ///
    /// Callbacks are queued as a task, coroutines become tasks and
    /// executor jobs go to the blocking pool.
    pub fn add_job<A, R>(&self, job: &Job<A, R>, arg: A) -> JobHandle<R>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        match &job.target {
            Target::Callback(f) => {
                let f = f.clone();
                self.spawn_tracked(job.name(), async move { f(arg) })
            }
            Target::Coroutine(f) => self.spawn_tracked(job.name(), f(arg)),
            Target::Executor(f) => {
                let f = f.clone();
                self.spawn_blocking_tracked(job.name(), move || f(arg))
            }
        }
    }

    /// Run a job, executing callbacks immediately
    pub fn run_job<A, R>(&self, job: &Job<A, R>, arg: A) -> JobOutcome<R>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        match &job.target {
            Target::Callback(f) => JobOutcome::Completed(f(arg)),
            _ => JobOutcome::Scheduled(self.add_job(job, arg)),
        }
    }

    /// Run a handler job whose result nobody waits for
    ///
    /// Callbacks run inline, other jobs as in [`spawn_detached`]. Errors and
    /// panics are logged with `origin` (the event type or service that
    /// triggered the job) and never reach the caller.
    ///
    /// [`spawn_detached`]: Self::spawn_detached
    pub fn run_detached<A>(&self, job: &Job<A, HandlerResult>, arg: A, origin: &str)
    where
        A: Send + 'static,
    {
        match &job.target {
            Target::Callback(f) => {
                log_outcome(job.name(), origin, catch_unwind(AssertUnwindSafe(|| f(arg))));
            }
            _ => self.spawn_detached(job, arg, origin),
        }
    }

    /// Run a handler job as its own tracked task, callbacks included
    ///
    /// Returns before the job starts. Failures are logged like in
    /// [`run_detached`](Self::run_detached).
    pub fn spawn_detached<A>(&self, job: &Job<A, HandlerResult>, arg: A, origin: &str)
    where
        A: Send + 'static,
    {
        let name = job.name().to_string();
        let origin = origin.to_string();
        match &job.target {
            Target::Callback(f) => {
                let f = f.clone();
                let _ = self.spawn_tracked(job.name(), async move {
                    log_outcome(&name, &origin, catch_unwind(AssertUnwindSafe(|| f(arg))));
                });
            }
            Target::Coroutine(f) => {
                let fut = AssertUnwindSafe(f(arg)).catch_unwind();
                let _ = self.spawn_tracked(job.name(), async move {
                    log_outcome(&name, &origin, fut.await);
                });
            }
            Target::Executor(f) => {
                let f = f.clone();
                let _ = self.spawn_blocking_tracked(job.name(), move || {
                    log_outcome(&name, &origin, catch_unwind(AssertUnwindSafe(|| f(arg))));
                });
            }
        }
    }

    /// Schedule a job from any thread
    pub fn add_job_threadsafe<A, R>(
        &self,
        job: &Job<A, R>,
        arg: A,
    ) -> Result<JobHandle<R>, SchedulerError>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        if self.threadsafe_closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        Ok(self.add_job(job, arg))
    }

    /// Run a callback on the runtime from any thread
    ///
    /// The returned receiver resolves with the callback's result; from a
    /// plain thread use `blocking_recv`.
    pub fn run_callback_threadsafe<F, R>(
        &self,
        f: F,
    ) -> Result<oneshot::Receiver<R>, SchedulerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.threadsafe_closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        let (tx, rx) = oneshot::channel();
        self.spawn_tracked("run_callback_threadsafe", async move {
            let _ = tx.send(f());
        });
        Ok(rx)
    }

    /// Reject further thread-marshalled callbacks
    ///
    /// Called before the final drain of shutdown: a callback accepted after
    /// that drain would never run and its caller would wait forever.
    pub fn shutdown_run_callback_threadsafe(&self) {
        debug!("Closing thread-safe callback entry points");
        self.threadsafe_closed.store(true, Ordering::SeqCst);
    }

    /// Accept thread-marshalled callbacks again (after a restart)
    pub fn resume_run_callback_threadsafe(&self) {
        self.threadsafe_closed.store(false, Ordering::SeqCst);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Diagnostic snapshot of the tracked tasks, oldest first
    pub fn pending_tasks(&self) -> Vec<PendingTaskInfo> {
        self.pending.snapshot()
    }

    /// Wait until no tracked task is left
    ///
    /// Loops because finishing one batch of tasks may schedule more. When
    /// called from a tracked task, that task is not waited for.
    pub async fn block_till_done(&self) {
        let current = tokio::task::try_id();
        tokio::task::yield_now().await;

        loop {
            let settled = self.pending.settled();

            if self.pending.is_settled_for(current) {
                // Give work queued by the last task a chance to register
                tokio::task::yield_now().await;
                if self.pending.is_settled_for(current) {
                    break;
                }
                continue;
            }

            if tokio::time::timeout(self.block_log_timeout, settled)
                .await
                .is_err()
            {
                for task in self.pending.snapshot() {
                    warn!(
                        task = %task.name,
                        age = ?task.age,
                        "Waited {:?} for task to finish",
                        self.block_log_timeout
                    );
                }
            }
        }
    }

    /// Abort every tracked task but the calling one, returning what was
    /// cancelled
    pub fn cancel_pending(&self) -> Vec<PendingTaskInfo> {
        let cancelled = self.pending.abort_all_except(tokio::task::try_id());
        for task in &cancelled {
            warn!(task = %task.name, age = ?task.age, "Cancelling pending task");
        }
        cancelled
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("pending", &self.pending.len())
            .field("block_log_timeout", &self.block_log_timeout)
            .finish()
    }
}

/// Thread-safe wrapper for JobScheduler
pub type SharedScheduler = Arc<JobScheduler>;
