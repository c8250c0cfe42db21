use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::debug;

use super::task::{CancellationToken, FileReplaceResult, ReplaceTask, TaskStatus};
use crate::error::{ReplaceError, Result};
use crate::progress::ProgressSnapshot;
use crate::rules::Rule;

/// Live state of one task.
///
/// The record mutex is the only place task fields change; every change is
/// republished on the watch channel before the lock is released, so the
/// order of snapshots matches the order of mutations.
pub struct TaskHandle {
    id: String,
    session_id: String,
    record: Mutex<ReplaceTask>,
    progress: watch::Sender<ProgressSnapshot>,
    cancel: CancellationToken,
    worker_active: AtomicBool,
}

/// Clears the handle's worker flag when the worker exits
pub(crate) struct WorkerGuard {
    handle: Arc<TaskHandle>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.handle.worker_active.store(false, Ordering::SeqCst);
    }
}

impl TaskHandle {
    pub(crate) fn new(task: ReplaceTask) -> Self {
        let (progress, _) = watch::channel(ProgressSnapshot::from(&task));
        Self {
            id: task.id.clone(),
            session_id: task.session_id.clone(),
            record: Mutex::new(task),
            progress,
            cancel: CancellationToken::new(),
            worker_active: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn lock(&self) -> MutexGuard<'_, ReplaceTask> {
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    /// Full copy of the task record, results included
    pub fn task(&self) -> ReplaceTask {
        self.lock().clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.lock().rules.clone()
    }

    /// Terminal and no worker still flushing in-flight files
    pub fn is_settled(&self) -> bool {
        self.status().is_terminal() && !self.worker_active.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Claim the worker slot; fails if another worker already runs this task
    pub(crate) fn begin_work(self: &Arc<Self>) -> Result<WorkerGuard> {
        self.worker_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ReplaceError::Conflict(format!("task {} already has a worker", self.id)))?;
        Ok(WorkerGuard {
            handle: self.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn update<R>(&self, mutate: impl FnOnce(&mut ReplaceTask) -> R) -> R {
        let mut task = self.lock();
        let out = mutate(&mut task);
        self.progress.send_replace(ProgressSnapshot::from(&*task));
        out
    }

    /// Apply `mutate` and publish a fresh snapshot when it reports a change
    fn update_if(&self, mutate: impl FnOnce(&mut ReplaceTask) -> bool) -> bool {
        let mut task = self.lock();
        let changed = mutate(&mut task);
        if changed {
            self.progress.send_replace(ProgressSnapshot::from(&*task));
        }
        changed
    }

    /// Move along the state machine; returns false when the edge is not allowed
    pub(crate) fn transition(&self, next: TaskStatus, message: Option<String>) -> bool {
        self.update_if(|task| apply_transition(task, next, message))
    }

    /// Release the worker slot, then make the final transition, so a task
    /// finished by its own worker is settled as soon as it is terminal
    pub(crate) fn finish(&self, worker: WorkerGuard, next: TaskStatus, message: Option<String>) -> bool {
        drop(worker);
        self.transition(next, message)
    }

    /// Pending → Cancelled, leaving a task that already started to its worker
    pub(crate) fn cancel_if_pending(&self) -> bool {
        self.update_if(|task| {
            task.status == TaskStatus::Pending
                && apply_transition(task, TaskStatus::Cancelled, None)
        })
    }

    pub(crate) fn set_total_files(&self, total: usize) {
        self.update_if(|task| {
            task.total_files = total;
            !task.status.is_terminal()
        });
    }

    /// Fold one file outcome into the task.
    ///
    /// Once the task is terminal its last snapshot has gone out as the final
    /// one, so a late file (a superseded worker flushing) only lands in the
    /// record the report is built from.
    pub(crate) fn record_file(&self, result: FileReplaceResult, elapsed: Duration) {
        let mut task = self.lock();
        task.processed_files += 1;
        task.total_replacements += result.replacements();

        if task.status.is_terminal() {
            debug!(
                "Task {} is {}; {} recorded without progress update",
                task.id, task.status, result.file_path
            );
            task.results.push(result);
            return;
        }

        task.current_file = Some(result.file_path.clone());
        if task.total_files > 0 {
            let done = task.processed_files.min(task.total_files);
            task.percentage = done as f64 / task.total_files as f64 * 100.0;
            let remaining = task.total_files - done;
            task.estimated_remaining_secs =
                Some(elapsed.as_secs_f64() / done as f64 * remaining as f64);
        }
        task.results.push(result);
        self.progress.send_replace(ProgressSnapshot::from(&*task));
    }
}

fn apply_transition(task: &mut ReplaceTask, next: TaskStatus, message: Option<String>) -> bool {
    if !task.status.can_transition_to(next) {
        debug!(
            "Refused transition of task {} from {} to {}",
            task.id, task.status, next
        );
        return false;
    }

    task.status = next;
    match next {
        TaskStatus::Running => task.started_at = Some(Utc::now()),
        TaskStatus::Completed => {
            task.percentage = 100.0;
            task.estimated_remaining_secs = Some(0.0);
            task.completed_at = Some(Utc::now());
        }
        _ if next.is_terminal() => {
            task.estimated_remaining_secs = None;
            task.completed_at = Some(Utc::now());
        }
        _ => {}
    }
    if message.is_some() {
        task.error_message = message;
    }
    true
}

#[derive(Default)]
struct SessionSlot {
    current: Option<String>,
    history: Vec<String>,
    /// Held by whichever worker is writing the session's files
    gate: Arc<AsyncMutex<()>>,
}

#[derive(Default)]
struct StoreInner {
    tasks: HashMap<String, Arc<TaskHandle>>,
    sessions: HashMap<String, SessionSlot>,
}

/// Concurrency-safe registry of tasks and each session's current task.
///
/// The lock is never held across an `.await`.
#[derive(Default)]
pub struct TaskStore {
    inner: Mutex<StoreInner>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        self.lock().tasks.get(task_id).cloned()
    }

    /// Most recently created task of a session
    pub fn current_for_session(&self, session_id: &str) -> Option<Arc<TaskHandle>> {
        let inner = self.lock();
        inner
            .sessions
            .get(session_id)
            .and_then(|slot| slot.current.as_ref())
            .and_then(|id| inner.tasks.get(id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tasks.is_empty()
    }

    /// Store a new task as its session's current one.
    ///
    /// Returns the previous current task when it is still live so the caller
    /// can supersede it.
    pub(crate) fn register(&self, handle: Arc<TaskHandle>) -> Option<Arc<TaskHandle>> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let slot = inner
            .sessions
            .entry(handle.session_id().to_string())
            .or_default();
        let previous = slot.current.replace(handle.id().to_string());
        slot.history.push(handle.id().to_string());
        inner.tasks.insert(handle.id().to_string(), handle);

        previous
            .and_then(|id| inner.tasks.get(&id).cloned())
            .filter(|prev| prev.status().is_live())
    }

    pub(crate) fn session_gate(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        self.lock()
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .gate
            .clone()
    }

    /// Drop every task of a session; refused while one is still live
    pub(crate) fn remove_session(&self, session_id: &str) -> Result<Vec<String>> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let slot = inner
            .sessions
            .get(session_id)
            .ok_or_else(|| ReplaceError::session_not_found(session_id))?;

        let busy = slot
            .history
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .any(|handle| !handle.is_settled());
        if busy {
            return Err(ReplaceError::Conflict(format!(
                "session {} still has a live task",
                session_id
            )));
        }

        let slot = inner.sessions.remove(session_id).unwrap_or_default();
        let removed = slot
            .history
            .into_iter()
            .filter(|id| inner.tasks.remove(id).is_some())
            .collect();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(session: &str) -> Arc<TaskHandle> {
        Arc::new(TaskHandle::new(ReplaceTask::new(session, Vec::new())))
    }

    #[test]
    fn test_register_returns_live_predecessor() {
        let store = TaskStore::new();
        let first = handle("s1");
        assert!(store.register(first.clone()).is_none());

        let second = handle("s1");
        let previous = store.register(second.clone()).unwrap();
        assert_eq!(previous.id(), first.id());
        assert_eq!(store.current_for_session("s1").unwrap().id(), second.id());

        // A terminal predecessor is not handed back
        assert!(second.cancel_if_pending());
        assert!(store.register(handle("s1")).is_none());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let task = handle("s1");
        assert!(task.transition(TaskStatus::Running, None));
        assert!(task.transition(TaskStatus::Failed, Some("gone".into())));
        assert!(!task.transition(TaskStatus::Completed, None));
        assert!(!task.cancel_if_pending());

        let snapshot = task.snapshot();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(snapshot.error_message.as_deref(), Some("gone"));
    }

    #[test]
    fn test_record_file_updates_progress() {
        let task = handle("s1");
        task.transition(TaskStatus::Running, None);
        task.update(|t| t.total_files = 4);

        let mut result = FileReplaceResult::new("a.txt".into(), 1);
        result.per_rule_counts = vec![3];
        task.record_file(result, Duration::from_secs(2));

        let snapshot = task.snapshot();
        assert_eq!(snapshot.processed_files, 1);
        assert_eq!(snapshot.total_replacements, 3);
        assert_eq!(snapshot.percentage, 25.0);
        assert_eq!(snapshot.estimated_remaining_secs, Some(6.0));
        assert_eq!(snapshot.current_file.as_deref(), Some("a.txt"));
    }

    #[test]
    fn test_terminal_task_snapshot_is_frozen() {
        let task = handle("s1");
        task.transition(TaskStatus::Running, None);
        task.update(|t| t.total_files = 3);
        assert!(task.transition(TaskStatus::Cancelled, Some("superseded by task t2".into())));
        let final_snapshot = task.snapshot();
        let rx = task.subscribe();

        let mut result = FileReplaceResult::new("late.txt".into(), 1);
        result.per_rule_counts = vec![2];
        task.set_total_files(5);
        task.record_file(result, Duration::from_millis(10));
        assert!(!task.transition(TaskStatus::Cancelled, None));

        assert!(!rx.has_changed().unwrap());
        assert_eq!(task.snapshot(), final_snapshot);
        assert_eq!(task.snapshot().processed_files, 0);
        assert_eq!(task.snapshot().current_file, None);

        // The report still sees the flushed file
        let record = task.task();
        assert_eq!(record.processed_files, 1);
        assert_eq!(record.total_replacements, 2);
        assert_eq!(record.results.len(), 1);
    }

    #[test]
    fn test_worker_slot_is_exclusive() {
        let task = handle("s1");
        let guard = task.begin_work().unwrap();
        assert!(task.begin_work().is_err());
        drop(guard);
        assert!(task.begin_work().is_ok());
    }

    #[test]
    fn test_remove_session_refuses_live_tasks() {
        let store = TaskStore::new();
        let task = handle("s1");
        store.register(task.clone());

        assert!(matches!(
            store.remove_session("s1"),
            Err(ReplaceError::Conflict(_))
        ));
        task.cancel_if_pending();
        assert_eq!(store.remove_session("s1").unwrap(), vec![task.id().to_string()]);
        assert!(store.get(task.id()).is_none());
        assert!(store.remove_session("s1").unwrap_err().is_not_found());
    }
}
