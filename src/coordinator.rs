use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use serde::Serialize;

use crate::domain::TaskKind;
use crate::error::{CatalogError, ErrorKind};
use crate::reconcile::{DiskReconciler, ScanResult};
use crate::remote::{CatalogClient, ServerSettings};
use crate::sync::{CatalogSynchronizer, SyncResult};

/// Receives the human-readable summary of a finished task.
pub trait CompletionListener: Send + Sync {
    fn on_complete(&self, summary: &str);
}

impl<F> CompletionListener for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_complete(&self, summary: &str) {
        self(summary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum TaskOutcome {
    Scan(ScanResult),
    Sync(SyncResult),
    Failed { kind: ErrorKind, message: String },
}

impl TaskOutcome {
    fn failed(err: &CatalogError) -> Self {
        TaskOutcome::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn summary(&self) -> String {
        match self {
            TaskOutcome::Scan(result) => result.summary_message.clone(),
            TaskOutcome::Sync(result) => result.summary_message.clone(),
            TaskOutcome::Failed { kind, message } => format!("Task failed ({kind}): {message}"),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Finished,
}

struct TaskSlot {
    status: TaskStatus,
    failure: Option<ErrorKind>,
    buffered: Option<TaskOutcome>,
    listener: Option<Arc<dyn CompletionListener>>,
    // False while a finished outcome is still being handed to a listener.
    settled: bool,
}

struct TaskShared {
    id: u64,
    kind: TaskKind,
    slot: Mutex<TaskSlot>,
    finished: Condvar,
}

/// Observer-side view of one background task.
///
/// The task runs whether or not anyone listens. A result that finds no
/// listener waits in a single slot until the next attach or [`poll`].
///
/// [`poll`]: TaskHandle::poll
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    fn new(id: u64, kind: TaskKind) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                id,
                kind,
                slot: Mutex::new(TaskSlot {
                    status: TaskStatus::Running,
                    failure: None,
                    buffered: None,
                    listener: None,
                    settled: false,
                }),
                finished: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn kind(&self) -> TaskKind {
        self.shared.kind
    }

    pub fn status(&self) -> TaskStatus {
        self.slot().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == TaskStatus::Running
    }

    /// Error class of a task that failed as a whole; `None` while running or
    /// after success.
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        self.slot().failure
    }

    /// Registers `listener`; a result already waiting is handed over at once.
    pub fn attach_listener(&self, listener: Arc<dyn CompletionListener>) {
        let pending = {
            let mut slot = self.slot();
            slot.listener = Some(Arc::clone(&listener));
            slot.buffered.take()
        };
        if let Some(outcome) = pending {
            listener.on_complete(&outcome.summary());
        }
    }

    pub fn detach_listener(&self) {
        self.slot().listener = None;
    }

    /// Takes the buffered result without going through a listener.
    pub fn poll(&self) -> Option<TaskOutcome> {
        self.slot().buffered.take()
    }

    /// Blocks until the task has finished and a listener attached at that
    /// moment has returned.
    pub fn wait(&self) {
        let mut slot = self.slot();
        while !slot.settled {
            slot = self
                .shared
                .finished
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn complete(&self, outcome: TaskOutcome) {
        let deliver_to = {
            let mut slot = self.slot();
            slot.status = TaskStatus::Finished;
            if let TaskOutcome::Failed { kind, .. } = &outcome {
                slot.failure = Some(*kind);
            }
            match slot.listener.clone() {
                Some(listener) => Some(listener),
                None => {
                    slot.buffered = Some(outcome.clone());
                    slot.settled = true;
                    None
                }
            }
        };
        if let Some(listener) = deliver_to {
            listener.on_complete(&outcome.summary());
            self.slot().settled = true;
        }
        self.shared.finished.notify_all();
    }

    fn slot(&self) -> MutexGuard<'_, TaskSlot> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("status", &self.status())
            .finish()
    }
}

/// Runs disk scans and catalog syncs in the background, at most one of each
/// kind at a time.
pub struct TaskCoordinator<C: CatalogClient + 'static> {
    disk: Arc<DiskReconciler>,
    sync: Arc<CatalogSynchronizer<C>>,
    server: ServerSettings,
    active: Mutex<HashMap<TaskKind, TaskHandle>>,
    next_id: AtomicU64,
}

impl<C: CatalogClient + 'static> TaskCoordinator<C> {
    pub fn new(
        disk: Arc<DiskReconciler>,
        sync: Arc<CatalogSynchronizer<C>>,
        server: ServerSettings,
    ) -> Self {
        Self {
            disk,
            sync,
            server,
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Starts a task of `kind`, or returns the handle of the one already
    /// running.
    pub fn start(&self, kind: TaskKind) -> Result<TaskHandle, CatalogError> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = active.get(&kind) {
            if existing.is_running() {
                tracing::debug!(%kind, id = existing.id(), "joining running task");
                return Ok(existing.clone());
            }
        }

        let handle = TaskHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst), kind);
        let job: Box<dyn FnOnce() -> TaskOutcome + Send> = match kind {
            TaskKind::DiskScan => {
                let disk = Arc::clone(&self.disk);
                Box::new(move || match disk.run() {
                    Ok(result) => TaskOutcome::Scan(result),
                    Err(err) => TaskOutcome::failed(&err),
                })
            }
            TaskKind::CatalogSync => {
                let sync = Arc::clone(&self.sync);
                let server = self.server.clone();
                Box::new(move || match sync.synchronize(&server) {
                    Ok(result) => TaskOutcome::Sync(result),
                    Err(err) => TaskOutcome::failed(&err),
                })
            }
        };

        let worker = handle.clone();
        thread::Builder::new()
            .name(format!("formcat-{kind}"))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|_| {
                    TaskOutcome::Failed {
                        kind: ErrorKind::Storage,
                        message: format!("{} task panicked", worker.kind()),
                    }
                });
                if let TaskOutcome::Failed { message, .. } = &outcome {
                    tracing::warn!(kind = %worker.kind(), id = worker.id(), %message, "task failed");
                }
                worker.complete(outcome);
            })
            .map_err(|err| CatalogError::TaskSpawn(err.to_string()))?;

        tracing::info!(%kind, id = handle.id(), "task started");
        active.insert(kind, handle.clone());
        Ok(handle)
    }

    /// Latest handle for `kind`, running or finished, so an observer that went
    /// away can find its task again.
    pub fn handle(&self, kind: TaskKind) -> Option<TaskHandle> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
            .cloned()
    }

    pub fn attach_listener(&self, handle: &TaskHandle, listener: Arc<dyn CompletionListener>) {
        handle.attach_listener(listener);
    }

    pub fn detach_listener(&self, handle: &TaskHandle) {
        handle.detach_listener();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_result_is_delivered_once() {
        let handle = TaskHandle::new(7, TaskKind::DiskScan);
        handle.complete(TaskOutcome::Failed {
            kind: ErrorKind::Storage,
            message: "root unreadable".to_string(),
        });

        let received = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&received);
        handle.attach_listener(Arc::new(move |summary: &str| {
            sink.lock().unwrap().push(summary.to_string());
        }));
        handle.detach_listener();
        let sink = Arc::clone(&received);
        handle.attach_listener(Arc::new(move |summary: &str| {
            sink.lock().unwrap().push(summary.to_string());
        }));

        assert_eq!(
            *received.lock().unwrap(),
            vec!["Task failed (storage): root unreadable".to_string()]
        );
        assert!(handle.poll().is_none());
    }

    #[test]
    fn attached_listener_receives_result_directly() {
        let handle = TaskHandle::new(1, TaskKind::CatalogSync);
        let received = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&received);
        handle.attach_listener(Arc::new(move |summary: &str| {
            *sink.lock().unwrap() = Some(summary.to_string());
        }));
        handle.complete(TaskOutcome::Failed {
            kind: ErrorKind::Auth,
            message: "denied".to_string(),
        });

        assert!(received.lock().unwrap().is_some());
        assert!(handle.poll().is_none());
        assert_eq!(handle.status(), TaskStatus::Finished);
        assert_eq!(handle.failure_kind(), Some(ErrorKind::Auth));
    }

    #[test]
    fn wait_returns_after_the_listener_has_run() {
        let handle = TaskHandle::new(3, TaskKind::DiskScan);
        let (entered, listener_started) = std::sync::mpsc::channel();
        let printed = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&printed);
        handle.attach_listener(Arc::new(move |summary: &str| {
            let _ = entered.send(());
            thread::sleep(std::time::Duration::from_millis(50));
            sink.lock().unwrap().push(summary.to_string());
        }));

        let worker = handle.clone();
        let completer = thread::spawn(move || {
            worker.complete(TaskOutcome::Failed {
                kind: ErrorKind::Network,
                message: "unreachable".to_string(),
            })
        });
        listener_started.recv().unwrap();
        assert_eq!(handle.status(), TaskStatus::Finished);
        handle.wait();

        assert_eq!(
            *printed.lock().unwrap(),
            vec!["Task failed (network): unreachable".to_string()]
        );
        assert_eq!(handle.failure_kind(), Some(ErrorKind::Network));
        completer.join().unwrap();
    }

    #[test]
    fn successful_task_reports_no_failure() {
        let handle = TaskHandle::new(4, TaskKind::DiskScan);
        assert_eq!(handle.failure_kind(), None);
        handle.complete(TaskOutcome::Scan(ScanResult {
            added: 0,
            updated: 0,
            unchanged: 0,
            missing: 0,
            skipped: Vec::new(),
            summary_message: "Disk scan complete: no changes (0 forms)".to_string(),
        }));
        handle.wait();
        assert_eq!(handle.failure_kind(), None);
        assert!(handle.poll().is_some());
    }
}
