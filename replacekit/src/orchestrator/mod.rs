//! Lifecycle of batch replace tasks.
//!
//! A task is created Pending, run by one spawned worker, and ends Completed,
//! Failed or Cancelled. The worker dispatches files in sorted order to a
//! small bounded pool; results are folded back in that same order.
//! Cancellation is checked between file dispatches only, and files already
//! written stay written.

mod store;
mod task;

pub use store::{TaskHandle, TaskStore};
pub use task::{CancellationToken, FileIssue, FileReplaceResult, ReplaceTask, TaskStatus};

use futures::future;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::OrchestratorConfig;
use crate::engine::{CompiledRuleSet, ReplacementEngine};
use crate::error::{FileServiceError, ReplaceError, Result};
use crate::rules::Rule;
use crate::session::SessionFiles;

/// Result of [`TaskOrchestrator::create`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTask {
    pub task_id: String,
    /// Live task of the same session that this one replaced
    pub superseded: Option<String>,
}

pub struct TaskOrchestrator {
    store: Arc<TaskStore>,
    files: Arc<dyn SessionFiles>,
    engine: ReplacementEngine,
    config: OrchestratorConfig,
}

impl TaskOrchestrator {
    pub fn new(
        store: Arc<TaskStore>,
        files: Arc<dyn SessionFiles>,
        engine: ReplacementEngine,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            files,
            engine,
            config,
        }
    }

    pub fn files(&self) -> &Arc<dyn SessionFiles> {
        &self.files
    }

    /// Register a Pending task as the session's current one.
    ///
    /// A still-live predecessor is cancelled first so a session never has two
    /// tasks reporting progress at once.
    pub fn create(&self, session_id: &str, rules: Vec<Rule>) -> CreatedTask {
        let task = ReplaceTask::new(session_id, rules);
        self.register(task)
    }

    /// Same as [`create`](Self::create) with a caller-chosen task id
    pub fn create_with_id(
        &self,
        task_id: &str,
        session_id: &str,
        rules: Vec<Rule>,
    ) -> Result<CreatedTask> {
        if task_id.is_empty() {
            return Err(ReplaceError::Conflict("task id is empty".to_string()));
        }
        if self.store.get(task_id).is_some() {
            return Err(ReplaceError::Conflict(format!(
                "task {} already exists",
                task_id
            )));
        }
        let mut task = ReplaceTask::new(session_id, rules);
        task.id = task_id.to_string();
        Ok(self.register(task))
    }

    fn register(&self, task: ReplaceTask) -> CreatedTask {
        let task_id = task.id.clone();
        let session_id = task.session_id.clone();
        let handle = Arc::new(TaskHandle::new(task));

        let superseded = self.store.register(handle).map(|previous| {
            previous.cancel_token().cancel();
            previous.transition(
                TaskStatus::Cancelled,
                Some(format!("superseded by task {}", task_id)),
            );
            warn!(
                "Task {} superseded by {} in session {}",
                previous.id(),
                task_id,
                session_id
            );
            previous.id().to_string()
        });

        debug!("Created task {} for session {}", task_id, session_id);
        CreatedTask {
            task_id,
            superseded,
        }
    }

    /// Snapshot of a task record
    pub fn task(&self, task_id: &str) -> Result<ReplaceTask> {
        self.store
            .get(task_id)
            .map(|handle| handle.task())
            .ok_or_else(|| ReplaceError::task_not_found(task_id))
    }

    /// Run a task on a background tokio task
    pub fn spawn(self: &Arc<Self>, task_id: String) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run(&task_id).await {
                error!("Task {} could not run: {}", task_id, e);
            }
        })
    }

    /// Drive a Pending task to a terminal state and return that state
    pub async fn run(&self, task_id: &str) -> Result<TaskStatus> {
        let handle = self
            .store
            .get(task_id)
            .ok_or_else(|| ReplaceError::task_not_found(task_id))?;
        let span = info_span!("replace_task", task_id = %task_id, session = %handle.session_id());
        self.drive(handle).instrument(span).await
    }

    async fn drive(&self, handle: Arc<TaskHandle>) -> Result<TaskStatus> {
        let worker = handle.begin_work()?;
        match handle.status() {
            TaskStatus::Pending => {}
            TaskStatus::Cancelled => return Ok(TaskStatus::Cancelled),
            other => {
                return Err(ReplaceError::Conflict(format!(
                    "task {} is already {}",
                    handle.id(),
                    other
                )))
            }
        }

        let session_id = handle.session_id().to_string();
        let token = handle.cancel_token().clone();

        // Wait for a superseded worker of this session to flush its in-flight files
        let gate = self.store.session_gate(&session_id);
        let _exclusive = gate.lock_owned().await;

        if token.is_cancelled() {
            handle.cancel_if_pending();
            return Ok(handle.status());
        }
        if !handle.transition(TaskStatus::Running, None) {
            return Ok(handle.status());
        }
        info!("Task started");

        let mut files = match self
            .files
            .list_files(&session_id, &self.config.extensions)
            .await
        {
            Ok(files) => files,
            Err(e) => {
                error!("Listing session files failed: {}", e);
                handle.finish(
                    worker,
                    TaskStatus::Failed,
                    Some(format!("failed to list session files: {}", e)),
                );
                return Ok(handle.status());
            }
        };
        files.sort();
        files.dedup();

        let total = files.len();
        handle.set_total_files(total);
        if total == 0 {
            info!("No files to process");
            handle.finish(worker, TaskStatus::Completed, None);
            return Ok(handle.status());
        }

        let compiled = self.engine.compile(&handle.rules());
        let workers = self.config.effective_workers();
        debug!("Processing {} file(s) with {} worker(s)", total, workers);

        let started = Instant::now();
        let aborted = AtomicBool::new(false);
        let mut fatal: Option<String> = None;

        let mut outcomes = stream::iter(files)
            .take_while(|_| {
                future::ready(!token.is_cancelled() && !aborted.load(Ordering::SeqCst))
            })
            .map(|path| self.process_file(&session_id, path, &compiled))
            .buffered(workers);

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Ok(result) => handle.record_file(result, started.elapsed()),
                Err(e) => {
                    error!("Session storage failed mid-run: {}", e);
                    aborted.store(true, Ordering::SeqCst);
                    fatal.get_or_insert_with(|| e.to_string());
                }
            }
        }
        drop(outcomes);

        let (status, message) = match fatal {
            Some(message) => (TaskStatus::Failed, Some(message)),
            // Covers a cancel that lands after the last dispatch
            None if token.is_cancelled() => (TaskStatus::Cancelled, None),
            None => (TaskStatus::Completed, None),
        };
        handle.finish(worker, status, message);

        let snapshot = handle.snapshot();
        info!(
            "Task finished as {}: {}/{} file(s), {} replacement(s) in {:?}",
            snapshot.status,
            snapshot.processed_files,
            snapshot.total_files,
            snapshot.total_replacements,
            started.elapsed()
        );
        Ok(snapshot.status)
    }

    /// Lock, read, rewrite and write back one file.
    ///
    /// Only workspace-level collaborator failures come back as `Err`; every
    /// other problem is recorded on the returned result.
    async fn process_file(
        &self,
        session_id: &str,
        path: String,
        rules: &CompiledRuleSet,
    ) -> std::result::Result<FileReplaceResult, FileServiceError> {
        let mut result = FileReplaceResult::new(path.clone(), rules.len());

        let _lease = match self.files.lock_file(session_id, &path).await {
            Ok(lease) => lease,
            Err(e) => return file_failure(result, e),
        };
        let content = match self.files.read_file(session_id, &path).await {
            Ok(content) => content,
            Err(e) => return file_failure(result, e),
        };
        result.original_size = content.text.len();
        result.new_size = result.original_size;

        let engine = self.engine.clone();
        let compiled = rules.clone();
        let original = content.text;
        let applied = tokio::task::spawn_blocking(move || {
            let outcome = engine.apply_compiled(&original, &compiled);
            (original, outcome)
        })
        .await;

        let (original, outcome) = match applied {
            Ok(applied) => applied,
            Err(e) => {
                let err = ReplaceError::Internal(format!("engine worker failed: {}", e));
                warn!("{}: {}", path, err);
                result.add_error(None, err.to_string());
                return Ok(result);
            }
        };

        for rule_error in &outcome.errors {
            result.add_error(
                Some(rule_error.rule_index),
                ReplaceError::from(rule_error).to_string(),
            );
        }

        if outcome.content == original {
            result.per_rule_counts = outcome.per_rule_counts;
            return Ok(result);
        }

        if let Err(e) = self
            .files
            .write_file(session_id, &path, &outcome.content, &content.encoding)
            .await
        {
            // Nothing landed on disk, so nothing is counted
            return file_failure(result, e);
        }

        debug!(
            "Rewrote {} ({} replacement(s))",
            path,
            outcome.total_replacements()
        );
        result.new_size = outcome.content.len();
        result.per_rule_counts = outcome.per_rule_counts;
        result.modified = true;
        Ok(result)
    }

    /// Request cancellation; a no-op for terminal tasks
    pub fn cancel(&self, task_id: &str) -> Result<TaskStatus> {
        let handle = self
            .store
            .get(task_id)
            .ok_or_else(|| ReplaceError::task_not_found(task_id))?;

        if handle.status().is_terminal() {
            return Ok(handle.status());
        }

        handle.cancel_token().cancel();
        if handle.cancel_if_pending() {
            info!("Cancelled task {} before it started", task_id);
        } else {
            info!("Cancellation requested for task {}", task_id);
        }
        Ok(handle.status())
    }

    /// Forget every task of a session once none is live; returns the dropped task ids
    pub fn forget_session(&self, session_id: &str) -> Result<Vec<String>> {
        let removed = self.store.remove_session(session_id)?;
        debug!("Forgot {} task(s) of session {}", removed.len(), session_id);
        Ok(removed)
    }
}

fn file_failure(
    mut result: FileReplaceResult,
    err: FileServiceError,
) -> std::result::Result<FileReplaceResult, FileServiceError> {
    if err.is_workspace_level() {
        return Err(err);
    }
    warn!("Skipping {}: {}", result.file_path, err);
    result.add_error(None, ReplaceError::from(&err).to_string());
    Ok(result)
}
