//! Paused tasks waiting for input or authorization
//!
//! A member that answers with `input_required` or `auth_required` is parked
//! here instead of being dropped with its team. Each parked task is watched
//! until it is resumed, its node is cancelled or its pause deadline passes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::DispatchOptions;
use crate::error::{TaskError, TroupeError};
use crate::prompt::ContextualPrompt;
use crate::task::{report_misuse, Task, TaskTracker};
use crate::types::{ContextId, TaskId};

/// Default time a task may stay paused before it fails
pub const DEFAULT_PAUSE_TIMEOUT: Duration = Duration::from_secs(600);

/// Settled tasks remembered for late lookups
const SETTLED_CAPACITY: usize = 1024;

/// Everything needed to dispatch a paused task again
pub struct PausedTask {
    pub tracker: TaskTracker,
    pub prompt: ContextualPrompt,
    pub options: DispatchOptions,
    /// Token of the node the task belongs to
    pub cancel: CancellationToken,
}

impl PausedTask {
    pub fn task_id(&self) -> TaskId {
        self.tracker.task_id()
    }

    pub fn context_id(&self) -> ContextId {
        self.tracker.context_id()
    }
}

struct Parked {
    paused: PausedTask,
    watcher: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    live: HashMap<TaskId, Parked>,
    settled: HashMap<TaskId, Task>,
    settled_order: VecDeque<TaskId>,
}

impl Registry {
    fn remember(&mut self, task: Task) {
        let task_id = task.task_id;
        if self.settled.insert(task_id, task).is_none() {
            self.settled_order.push_back(task_id);
        }
        while self.settled_order.len() > SETTLED_CAPACITY {
            if let Some(oldest) = self.settled_order.pop_front() {
                self.settled.remove(&oldest);
            }
        }
    }
}

/// Shared set of parked tasks, keyed by task id
#[derive(Clone, Default)]
pub struct PausedTasks {
    inner: Arc<Mutex<Registry>>,
}

impl PausedTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `paused` until it is resumed, cancelled or `deadline` passes
    pub fn park(&self, paused: PausedTask, deadline: Duration) {
        let task_id = paused.task_id();
        let cancel = paused.cancel.clone();

        info!(
            task_id = %task_id,
            context_id = %paused.context_id(),
            state = %paused.tracker.state(),
            deadline = ?deadline,
            "Task parked"
        );

        self.inner.lock().live.insert(
            task_id,
            Parked {
                paused,
                watcher: None,
            },
        );

        let registry = self.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    registry.expire(&task_id, Expiry::Cancelled);
                }
                _ = tokio::time::sleep(deadline) => {
                    registry.expire(&task_id, Expiry::TimedOut(deadline));
                }
            }
        });

        let mut inner = self.inner.lock();
        match inner.live.get_mut(&task_id) {
            Some(parked) => parked.watcher = Some(watcher),
            // Settled before the watcher was stored
            None => watcher.abort(),
        }
    }

    /// Remove a live task so it can be dispatched again
    pub fn take(&self, task_id: &TaskId) -> Option<PausedTask> {
        let parked = self.inner.lock().live.remove(task_id)?;
        if let Some(watcher) = parked.watcher {
            watcher.abort();
        }
        debug!(task_id = %task_id, "Task unparked");
        Some(parked.paused)
    }

    /// Cancel a live task now, or report how it already settled
    pub fn settle(&self, task_id: &TaskId, reason: &str) -> Option<Task> {
        let mut inner = self.inner.lock();
        match inner.live.remove(task_id) {
            Some(parked) => {
                if let Some(watcher) = parked.watcher {
                    watcher.abort();
                }
                let mut tracker = parked.paused.tracker;
                report_misuse(tracker.cancel(reason));
                let task = tracker.into_task();
                inner.remember(task.clone());
                Some(task)
            }
            None => inner.settled.get(task_id).cloned(),
        }
    }

    /// Record a task that finished after leaving the registry
    pub fn remember(&self, task: Task) {
        self.inner.lock().remember(task);
    }

    /// Current view of a parked or recently settled task
    pub fn snapshot(&self, task_id: &TaskId) -> Option<Task> {
        let inner = self.inner.lock();
        inner
            .live
            .get(task_id)
            .map(|parked| parked.paused.tracker.snapshot())
            .or_else(|| inner.settled.get(task_id).cloned())
    }

    /// Ids of every task still waiting
    pub fn waiting(&self) -> Vec<TaskId> {
        self.inner.lock().live.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel live tasks and drop settled records for the given contexts
    pub fn forget_contexts(&self, contexts: &[ContextId]) -> usize {
        let mut inner = self.inner.lock();

        let live: Vec<TaskId> = inner
            .live
            .iter()
            .filter(|(_, parked)| contexts.contains(&parked.paused.context_id()))
            .map(|(id, _)| *id)
            .collect();
        for task_id in &live {
            if let Some(parked) = inner.live.remove(task_id) {
                if let Some(watcher) = parked.watcher {
                    watcher.abort();
                }
                let mut tracker = parked.paused.tracker;
                report_misuse(tracker.cancel("execution evicted"));
            }
        }

        let before = inner.settled.len();
        inner.settled.retain(|_, task| !contexts.contains(&task.context_id));
        let Registry {
            settled,
            settled_order,
            ..
        } = &mut *inner;
        settled_order.retain(|id| settled.contains_key(id));

        live.len() + (before - settled.len())
    }

    fn expire(&self, task_id: &TaskId, expiry: Expiry) {
        let mut inner = self.inner.lock();
        let Some(parked) = inner.live.remove(task_id) else {
            return;
        };

        let mut tracker = parked.paused.tracker;
        match expiry {
            Expiry::Cancelled => {
                info!(task_id = %task_id, "Paused task cancelled");
                report_misuse(tracker.cancel("cancelled while paused"));
            }
            Expiry::TimedOut(deadline) => {
                warn!(task_id = %task_id, deadline = ?deadline, "Paused task expired");
                report_misuse(tracker.fail(TaskError::from(&TroupeError::Timeout(deadline))));
            }
        }
        inner.remember(tracker.into_task());
    }
}

enum Expiry {
    Cancelled,
    TimedOut(Duration),
}
