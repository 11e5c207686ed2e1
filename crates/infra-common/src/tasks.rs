//! Task lifecycle management
//!
//! Every long-running task of a session (gathering, connectivity checks,
//! handshake, receive loops) is spawned through a [`TaskManager`] so that
//! closing the session can cancel all of them cooperatively and force-abort
//! the stragglers once the grace period runs out.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to a tracked task
#[derive(Debug)]
struct TaskHandle {
    id: usize,
    name: String,
    handle: JoinHandle<()>,
    started_at: Instant,
}

/// Decrements the active counter when the wrapped future is dropped,
/// whether it completed, was cancelled or was aborted.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Tracks spawned tasks and cancels them together
#[derive(Debug)]
pub struct TaskManager {
    /// Name used in log lines
    name: String,

    /// Unique task ID counter
    next_task_id: AtomicUsize,

    /// All tracked task handles
    tasks: Mutex<Vec<TaskHandle>>,

    /// Cancellation token shared by every task of this manager
    cancel_token: CancellationToken,

    /// Number of tasks whose future has not been dropped yet
    active_count: Arc<AtomicUsize>,
}

impl TaskManager {
    /// Create a new task manager with its own cancellation root
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_token(name, CancellationToken::new())
    }

    /// Create a task manager that is cancelled together with `parent`
    pub fn child_of(name: impl Into<String>, parent: &CancellationToken) -> Self {
        Self::with_token(name, parent.child_token())
    }

    fn with_token(name: impl Into<String>, cancel_token: CancellationToken) -> Self {
        Self {
            name: name.into(),
            next_task_id: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
            cancel_token,
            active_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The cancellation token observed by tasks of this manager
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Whether `cancel_all` or `shutdown` has been called
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Spawn a tracked task.
    ///
    /// The future is raced against the manager's cancellation token; a
    /// cancelled task is dropped at its next await point.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> usize
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task_name = name.into();
        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);

        self.active_count.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(self.active_count.clone());
        let cancel_token = self.cancel_token.clone();
        let manager_name = self.name.clone();
        let log_name = task_name.clone();

        let wrapped = async move {
            let _guard = guard;
            tokio::select! {
                _ = future => {
                    debug!("Task completed: {} [{}] in {}", log_name, task_id, manager_name);
                }
                _ = cancel_token.cancelled() => {
                    debug!("Task cancelled: {} [{}] in {}", log_name, task_id, manager_name);
                }
            }
        };

        let handle = tokio::spawn(wrapped);

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(TaskHandle {
            id: task_id,
            name: task_name,
            handle,
            started_at: Instant::now(),
        });

        task_id
    }

    /// Number of tasks still running
    pub fn active_task_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Signal cancellation to every task without waiting
    pub fn cancel_all(&self) {
        debug!("Cancelling all tasks in {}", self.name);
        self.cancel_token.cancel();
    }

    /// Cancel every task and wait up to `grace` for them to finish.
    ///
    /// Tasks still alive after the grace period are aborted. Returns `true`
    /// when all tasks stopped cooperatively.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let start = Instant::now();
        debug!(
            "Shutting down {} with {} active tasks",
            self.name,
            self.active_task_count()
        );

        self.cancel_all();

        let graceful = tokio::time::timeout(grace, self.wait_for_completion())
            .await
            .is_ok();

        let handles: Vec<TaskHandle> = std::mem::take(&mut *self.tasks.lock());
        if graceful {
            debug!("{} shut down gracefully in {:?}", self.name, start.elapsed());
        } else {
            for task in handles.iter().filter(|t| !t.handle.is_finished()) {
                warn!(
                    "Force aborting task: {} [{}] after {:?}",
                    task.name,
                    task.id,
                    task.started_at.elapsed()
                );
                task.handle.abort();
            }
        }

        for task in handles {
            let _ = task.handle.await;
        }

        graceful
    }

    async fn wait_for_completion(&self) {
        while self.active_count.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Snapshot of the tracked tasks
    pub fn stats(&self) -> TaskStats {
        let tasks = self.tasks.lock();
        TaskStats {
            name: self.name.clone(),
            tracked_tasks: tasks.len(),
            active_tasks: self.active_task_count(),
            finished_tasks: tasks.iter().filter(|t| t.handle.is_finished()).count(),
        }
    }
}

/// Task statistics
#[derive(Debug, Clone)]
pub struct TaskStats {
    pub name: String,
    pub tracked_tasks: usize,
    pub active_tasks: usize,
    pub finished_tasks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_spawning_and_tracking() {
        let manager = TaskManager::new("test");

        let task_id = manager.spawn("short_task", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });

        assert_eq!(task_id, 0);
        assert_eq!(manager.active_task_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.active_task_count(), 0);
    }

    #[tokio::test]
    async fn test_task_cancellation() {
        let manager = TaskManager::new("test");

        manager.spawn("long_task", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        assert_eq!(manager.active_task_count(), 1);

        assert!(manager.shutdown(Duration::from_millis(200)).await);
        assert_eq!(manager.active_task_count(), 0);
    }

    #[tokio::test]
    async fn test_child_manager_follows_parent() {
        let parent = CancellationToken::new();
        let manager = TaskManager::child_of("child", &parent);

        manager.spawn("waiting", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        parent.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.is_cancelled());
        assert_eq!(manager.active_task_count(), 0);
    }

    #[tokio::test]
    async fn test_busy_task_stops_at_yield_point() {
        let manager = TaskManager::new("test");

        manager.spawn("busy", async {
            loop {
                tokio::task::yield_now().await;
            }
        });

        let graceful = manager.shutdown(Duration::from_millis(200)).await;
        assert!(graceful);
        assert_eq!(manager.active_task_count(), 0);
        assert_eq!(manager.stats().tracked_tasks, 0);
    }
}
