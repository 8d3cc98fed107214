//! Units of schedulable work
//!
//! A [`Job`] is classified exactly once, when it is built. The scheduler
//! then dispatches on the stored [`JobKind`] without any per-call
//! inspection of the target.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

/// How a job must be run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Non-blocking function, safe to run inline on the runtime
    Callback,
    /// Async function, run as a tracked task
    Coroutine,
    /// Blocking function, offloaded to the blocking thread pool
    Executor,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Callback => f.write_str("callback"),
            JobKind::Coroutine => f.write_str("coroutine"),
            JobKind::Executor => f.write_str("executor"),
        }
    }
}

type SyncFn<A, R> = Arc<dyn Fn(A) -> R + Send + Sync>;
type AsyncFn<A, R> = Arc<dyn Fn(A) -> BoxFuture<'static, R> + Send + Sync>;

pub(crate) enum Target<A, R> {
    Callback(SyncFn<A, R>),
    Coroutine(AsyncFn<A, R>),
    Executor(SyncFn<A, R>),
}

impl<A, R> Clone for Target<A, R> {
    fn clone(&self) -> Self {
        match self {
            Target::Callback(f) => Target::Callback(f.clone()),
            Target::Coroutine(f) => Target::Coroutine(f.clone()),
            Target::Executor(f) => Target::Executor(f.clone()),
        }
    }
}

/// A pre-classified, re-invocable unit of work taking `A` and producing `R`
///
/// Jobs are always built from functions, never from an already created
/// future: a future runs once and could not be invoked again.
pub struct Job<A, R = ()> {
    pub(crate) target: Target<A, R>,
    name: Arc<str>,
}

impl<A, R> Job<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    /// Wrap a non-blocking function
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        Self {
            target: Target::Callback(Arc::new(f)),
            name: std::any::type_name::<F>().into(),
        }
    }

    /// Wrap an async function
    pub fn coroutine<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        Self {
            target: Target::Coroutine(Arc::new(move |arg| f(arg).boxed())),
            name: std::any::type_name::<F>().into(),
        }
    }

    /// Wrap a blocking function
    pub fn executor<F>(f: F) -> Self
    where
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        Self {
            target: Target::Executor(Arc::new(f)),
            name: std::any::type_name::<F>().into(),
        }
    }
}

impl<A, R> Job<A, R> {
    /// Replace the diagnostic name
    pub fn named(mut self, name: impl AsRef<str>) -> Self {
        self.name = name.as_ref().into();
        self
    }

    /// Name used in logs and pending-task diagnostics
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> JobKind {
        match self.target {
            Target::Callback(_) => JobKind::Callback,
            Target::Coroutine(_) => JobKind::Coroutine,
            Target::Executor(_) => JobKind::Executor,
        }
    }
}

impl<A, R> Clone for Job<A, R> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            name: self.name.clone(),
        }
    }
}

impl<A, R> fmt::Debug for Job<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("kind", &self.kind())
            .field("name", &self.name)
            .finish()
    }
}
