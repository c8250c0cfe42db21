//! Point-in-time progress snapshots and the per-task progress feed.
//!
//! Every task owns a `tokio::sync::watch` channel written only by its
//! worker. Readers clone the latest value, so a snapshot is never torn and
//! a late subscriber starts from the current state instead of waiting for
//! the next change.

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::config::ProgressConfig;
use crate::error::{ReplaceError, Result};
use crate::orchestrator::{ReplaceTask, TaskStatus, TaskStore};

/// Owned copy of a task's live counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: String,
    pub session_id: String,
    pub status: TaskStatus,
    pub percentage: f64,
    pub current_file: Option<String>,
    pub processed_files: usize,
    pub total_files: usize,
    pub total_replacements: usize,
    pub estimated_remaining_secs: Option<f64>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ReplaceTask> for ProgressSnapshot {
    fn from(task: &ReplaceTask) -> Self {
        Self {
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            status: task.status,
            percentage: task.percentage,
            current_file: task.current_file.clone(),
            processed_files: task.processed_files,
            total_files: task.total_files,
            total_replacements: task.total_replacements,
            estimated_remaining_secs: task.estimated_remaining_secs,
            error_message: task.error_message.clone(),
            updated_at: Utc::now(),
        }
    }
}

impl ProgressSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One item of a progress stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The task is not visible yet; `attempt` counts heartbeats from 1
    Waiting { task_id: String, attempt: u32 },
    Update(ProgressSnapshot),
    /// Last item of a stream that reached a terminal task state
    Final(ProgressSnapshot),
    /// Heartbeat budget exhausted without the task appearing
    NotFound { task_id: String },
}

impl ProgressEvent {
    pub fn snapshot(&self) -> Option<&ProgressSnapshot> {
        match self {
            ProgressEvent::Update(snapshot) | ProgressEvent::Final(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

enum FeedState {
    Waiting { attempt: u32 },
    Watching {
        rx: watch::Receiver<ProgressSnapshot>,
        primed: bool,
    },
    Done,
}

struct Feed {
    store: Arc<TaskStore>,
    task_id: String,
    heartbeat: Duration,
    max_heartbeats: u32,
    state: FeedState,
}

impl Feed {
    fn emit(&mut self, snapshot: ProgressSnapshot) -> ProgressEvent {
        if snapshot.is_terminal() {
            self.state = FeedState::Done;
            ProgressEvent::Final(snapshot)
        } else {
            ProgressEvent::Update(snapshot)
        }
    }
}

/// Read side of the task store
#[derive(Clone)]
pub struct ProgressBroadcaster {
    store: Arc<TaskStore>,
    config: ProgressConfig,
}

impl ProgressBroadcaster {
    pub fn new(store: Arc<TaskStore>, config: ProgressConfig) -> Self {
        Self { store, config }
    }

    pub fn get_progress(&self, task_id: &str) -> Result<ProgressSnapshot> {
        self.store
            .get(task_id)
            .map(|handle| handle.snapshot())
            .ok_or_else(|| ReplaceError::task_not_found(task_id))
    }

    /// Lazy feed of progress events for one task.
    ///
    /// Yields the current snapshot, every later change, and exactly one
    /// [`ProgressEvent::Final`] once the task is terminal. Dropping the
    /// stream leaves the task running.
    pub fn stream_progress(&self, task_id: &str) -> BoxStream<'static, ProgressEvent> {
        let feed = Feed {
            store: self.store.clone(),
            task_id: task_id.to_string(),
            heartbeat: self.config.heartbeat(),
            max_heartbeats: self.config.max_heartbeats,
            state: FeedState::Waiting { attempt: 0 },
        };

        stream::unfold(feed, |mut feed| async move {
            loop {
                match std::mem::replace(&mut feed.state, FeedState::Done) {
                    FeedState::Done => return None,
                    FeedState::Waiting { attempt } => {
                        if attempt > 0 {
                            tokio::time::sleep(feed.heartbeat).await;
                        }
                        if let Some(handle) = feed.store.get(&feed.task_id) {
                            feed.state = FeedState::Watching {
                                rx: handle.subscribe(),
                                primed: false,
                            };
                            continue;
                        }
                        if feed.max_heartbeats > 0 && attempt >= feed.max_heartbeats {
                            debug!("Gave up waiting for task {}", feed.task_id);
                            let event = ProgressEvent::NotFound {
                                task_id: feed.task_id.clone(),
                            };
                            return Some((event, feed));
                        }
                        feed.state = FeedState::Waiting {
                            attempt: attempt + 1,
                        };
                        let event = ProgressEvent::Waiting {
                            task_id: feed.task_id.clone(),
                            attempt: attempt + 1,
                        };
                        return Some((event, feed));
                    }
                    FeedState::Watching { mut rx, primed } => {
                        if primed && rx.changed().await.is_err() {
                            // Task was dropped from the store
                            return None;
                        }
                        let snapshot = rx.borrow_and_update().clone();
                        feed.state = FeedState::Watching { rx, primed: true };
                        let event = feed.emit(snapshot);
                        return Some((event, feed));
                    }
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::TaskHandle;
    use tokio_test::{assert_pending, assert_ready};

    fn running_task(store: &TaskStore) -> Arc<TaskHandle> {
        let handle = Arc::new(TaskHandle::new(ReplaceTask::new("s1", Vec::new())));
        store.register(handle.clone());
        handle.transition(TaskStatus::Running, None);
        handle
    }

    #[test]
    fn test_unknown_task_is_not_found() {
        let broadcaster = ProgressBroadcaster::new(Arc::new(TaskStore::new()), ProgressConfig::default());
        assert!(broadcaster.get_progress("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_late_subscriber_sees_current_then_final() {
        let store = Arc::new(TaskStore::new());
        let handle = running_task(&store);
        handle.update(|task| task.total_files = 3);

        let broadcaster = ProgressBroadcaster::new(store, ProgressConfig::default());
        let mut stream = tokio_test::task::spawn(broadcaster.stream_progress(handle.id()));

        match assert_ready!(stream.poll_next()) {
            Some(ProgressEvent::Update(snapshot)) => {
                assert_eq!(snapshot.status, TaskStatus::Running);
                assert_eq!(snapshot.total_files, 3);
            }
            other => panic!("expected current snapshot, got {:?}", other),
        }
        assert_pending!(stream.poll_next());

        handle.transition(TaskStatus::Completed, None);
        assert!(stream.is_woken());
        match assert_ready!(stream.poll_next()) {
            Some(ProgressEvent::Final(snapshot)) => {
                assert_eq!(snapshot.status, TaskStatus::Completed);
                assert_eq!(snapshot.percentage, 100.0);
            }
            other => panic!("expected final snapshot, got {:?}", other),
        }
        assert!(assert_ready!(stream.poll_next()).is_none());
    }

    #[test]
    fn test_dropping_stream_leaves_task_alone() {
        let store = Arc::new(TaskStore::new());
        let handle = running_task(&store);
        let broadcaster = ProgressBroadcaster::new(store, ProgressConfig::default());

        let mut stream = tokio_test::task::spawn(broadcaster.stream_progress(handle.id()));
        let _ = assert_ready!(stream.poll_next());
        drop(stream);

        assert_eq!(handle.status(), TaskStatus::Running);
        assert!(!handle.cancel_token().is_cancelled());
    }

    #[test]
    fn test_snapshot_reads_are_copies() {
        let store = Arc::new(TaskStore::new());
        let handle = running_task(&store);
        let broadcaster = ProgressBroadcaster::new(store, ProgressConfig::default());

        let before = broadcaster.get_progress(handle.id()).unwrap();
        handle.update(|task| task.processed_files = 1);
        let after = broadcaster.get_progress(handle.id()).unwrap();

        assert_eq!(before.processed_files, 0);
        assert_eq!(after.processed_files, 1);
    }
}
