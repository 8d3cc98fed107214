//! Bookkeeping of in-flight tasks

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, Id as TaskId};

/// Snapshot of one pending task, for diagnostics
#[derive(Debug, Clone)]
pub struct PendingTaskInfo {
    pub id: u64,
    pub name: String,
    pub age: Duration,
}

struct PendingTask {
    name: String,
    started: Instant,
    abort: Option<AbortHandle>,
    /// Runtime id, known once the task is first polled
    task_id: Option<TaskId>,
}

/// The set of tracked tasks
#[derive(Default)]
pub(crate) struct PendingTasks {
    tasks: DashMap<u64, PendingTask>,
    next_id: AtomicU64,
    settled: Notify,
}

impl PendingTasks {
    /// Register a task before it is spawned
    ///
    /// The returned guard must move into the task; dropping it (completion,
    /// panic or abort) removes the entry.
    pub(crate) fn register(self: &Arc<Self>, name: impl Into<String>) -> PendingGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.insert(
            id,
            PendingTask {
                name: name.into(),
                started: Instant::now(),
                abort: None,
                task_id: None,
            },
        );
        PendingGuard {
            pending: self.clone(),
            id,
        }
    }

    /// Attach the abort handle once the task exists
    pub(crate) fn attach(&self, id: u64, abort: AbortHandle) {
        if let Some(mut task) = self.tasks.get_mut(&id) {
            task.abort = Some(abort);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether every tracked task other than `current` has finished
    ///
    /// A task waiting for the others (such as one running shutdown) must
    /// not wait for itself.
    pub(crate) fn is_settled_for(&self, current: Option<TaskId>) -> bool {
        self.tasks
            .iter()
            .all(|entry| current.is_some() && entry.task_id == current)
    }

    /// Resolves the next time any tracked task finishes
    pub(crate) fn settled(&self) -> tokio::sync::futures::Notified<'_> {
        self.settled.notified()
    }

    pub(crate) fn snapshot(&self) -> Vec<PendingTaskInfo> {
        let mut infos: Vec<_> = self
            .tasks
            .iter()
            .map(|entry| PendingTaskInfo {
                id: *entry.key(),
                name: entry.name.clone(),
                age: entry.started.elapsed(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Abort every tracked task except `current`, returning what was aborted
    pub(crate) fn abort_all_except(&self, current: Option<TaskId>) -> Vec<PendingTaskInfo> {
        let mut aborted = Vec::new();
        let mut handles = Vec::new();
        for entry in self.tasks.iter() {
            if current.is_some() && entry.task_id == current {
                continue;
            }
            handles.extend(entry.abort.clone());
            aborted.push(PendingTaskInfo {
                id: *entry.key(),
                name: entry.name.clone(),
                age: entry.started.elapsed(),
            });
        }
        // Shard locks are released before any task gets to drop its guard
        for handle in handles {
            handle.abort();
        }
        aborted.sort_by_key(|info| info.id);
        aborted
    }

    fn bind(&self, id: u64, task_id: Option<TaskId>) {
        if let Some(mut task) = self.tasks.get_mut(&id) {
            task.task_id = task_id;
        }
    }

    fn finish(&self, id: u64) {
        self.tasks.remove(&id);
        self.settled.notify_waiters();
    }
}

pub(crate) struct PendingGuard {
    pending: Arc<PendingTasks>,
    id: u64,
}

impl PendingGuard {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Record the id of the task now running this guard
    pub(crate) fn bind_current_task(&self) {
        self.pending.bind(self.id, tokio::task::try_id());
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.finish(self.id);
    }
}
