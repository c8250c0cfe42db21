use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::rules::Rule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Allowed edges of the task state machine
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Problem recorded against one file, optionally narrowed to one rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIssue {
    pub rule_index: Option<usize>,
    pub message: String,
}

/// What one task did to one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReplaceResult {
    pub file_path: String,
    pub per_rule_counts: Vec<usize>,
    pub original_size: usize,
    pub new_size: usize,
    pub modified: bool,
    pub errors: Vec<FileIssue>,
}

impl FileReplaceResult {
    pub fn new(file_path: String, rule_count: usize) -> Self {
        Self {
            file_path,
            per_rule_counts: vec![0; rule_count],
            original_size: 0,
            new_size: 0,
            modified: false,
            errors: Vec::new(),
        }
    }

    pub fn replacements(&self) -> usize {
        self.per_rule_counts.iter().sum()
    }

    pub fn size_delta(&self) -> i64 {
        self.new_size as i64 - self.original_size as i64
    }

    pub fn add_error(&mut self, rule_index: Option<usize>, message: String) {
        self.errors.push(FileIssue {
            rule_index,
            message,
        });
    }
}

/// One batch run against a session's file set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceTask {
    pub id: String,
    pub session_id: String,
    pub rules: Vec<Rule>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_files: usize,
    pub processed_files: usize,
    pub total_replacements: usize,
    pub current_file: Option<String>,
    pub percentage: f64,
    pub estimated_remaining_secs: Option<f64>,
    pub error_message: Option<String>,
    /// Per-file outcomes in processing order
    pub results: Vec<FileReplaceResult>,
}

impl ReplaceTask {
    pub fn new(session_id: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            rules,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_files: 0,
            processed_files: 0,
            total_replacements: 0,
            current_file: None,
            percentage: 0.0,
            estimated_remaining_secs: None,
            error_message: None,
            results: Vec::new(),
        }
    }
}

/// Cooperative cancellation flag, polled between files
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
