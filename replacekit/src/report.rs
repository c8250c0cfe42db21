use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::config::ReportConfig;
use crate::error::{ReplaceError, Result};
use crate::orchestrator::{ReplaceTask, TaskStatus, TaskStore};

/// Per-file line of a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub file_path: String,
    pub replacements: usize,
    pub size_delta: i64,
    pub modified: bool,
    pub error_count: usize,
}

/// Per-rule totals across every processed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStat {
    pub rule_index: usize,
    pub source_line: usize,
    pub original: String,
    pub replacement: String,
    pub is_regex: bool,
    pub total_hits: usize,
    pub files_touched: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub task_id: String,
    pub session_id: String,
    pub status: TaskStatus,
    pub total_files: usize,
    pub processed_files: usize,
    pub modified_files: usize,
    pub total_replacements: usize,
    pub file_stats: Vec<FileStat>,
    pub rule_stats: Vec<RuleStat>,
    /// `"<file>: <message>"` for every problem recorded during the run
    pub errors: Vec<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
    pub fingerprint: String,
}

impl BatchReport {
    /// Aggregate a terminal task record
    pub fn from_task(task: &ReplaceTask) -> Self {
        let mut rule_stats: Vec<RuleStat> = task
            .rules
            .iter()
            .enumerate()
            .map(|(rule_index, rule)| RuleStat {
                rule_index,
                source_line: rule.source_line,
                original: rule.original.clone(),
                replacement: rule.replacement.clone(),
                is_regex: rule.is_regex,
                total_hits: 0,
                files_touched: 0,
            })
            .collect();

        let mut file_stats = Vec::with_capacity(task.results.len());
        let mut errors = Vec::new();

        for result in &task.results {
            for (index, count) in result.per_rule_counts.iter().enumerate() {
                if let Some(stat) = rule_stats.get_mut(index) {
                    stat.total_hits += count;
                    if *count > 0 {
                        stat.files_touched += 1;
                    }
                }
            }
            errors.extend(
                result
                    .errors
                    .iter()
                    .map(|issue| format!("{}: {}", result.file_path, issue.message)),
            );
            file_stats.push(FileStat {
                file_path: result.file_path.clone(),
                replacements: result.replacements(),
                size_delta: result.size_delta(),
                modified: result.modified,
                error_count: result.errors.len(),
            });
        }

        Self {
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            status: task.status,
            total_files: task.total_files,
            processed_files: task.processed_files,
            modified_files: file_stats.iter().filter(|stat| stat.modified).count(),
            total_replacements: task.total_replacements,
            file_stats,
            rule_stats,
            errors,
            error_message: task.error_message.clone(),
            started_at: task.started_at,
            completed_at: task.completed_at,
            generated_at: Utc::now(),
            fingerprint: String::new(),
        }
    }

    /// SHA-256 of the report body (fingerprint blanked) and `generated_at`
    pub fn compute_fingerprint(&self) -> Result<String> {
        let mut body = self.clone();
        body.fingerprint.clear();

        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&body)?);
        hasher.update(self.generated_at.to_rfc3339().as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Outcome of a conditional report fetch
#[derive(Debug, Clone, PartialEq)]
pub enum ReportLookup {
    NotModified { fingerprint: String },
    Fresh(Box<BatchReport>),
}

/// Builds reports for terminal tasks and keeps recent ones
pub struct ReportBuilder {
    store: Arc<TaskStore>,
    cache: Mutex<LruCache<String, BatchReport>>,
}

impl ReportBuilder {
    pub fn new(store: Arc<TaskStore>, config: &ReportConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<String, BatchReport>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn build_report(&self, task_id: &str) -> Result<BatchReport> {
        let handle = self
            .store
            .get(task_id)
            .ok_or_else(|| ReplaceError::task_not_found(task_id))?;

        // A superseded task is terminal before its worker has flushed
        if !handle.is_settled() {
            return Err(ReplaceError::NotReady(task_id.to_string()));
        }

        if let Some(report) = self.cache().get(task_id) {
            debug!("Report cache hit for task {}", task_id);
            return Ok(report.clone());
        }

        let mut report = BatchReport::from_task(&handle.task());
        report.fingerprint = report.compute_fingerprint()?;
        debug!(
            "Built report for task {} ({} file(s), fingerprint {})",
            task_id,
            report.file_stats.len(),
            report.fingerprint
        );
        self.cache().put(task_id.to_string(), report.clone());
        Ok(report)
    }

    /// Report of the session's most recent task
    pub fn get_report_for_session(&self, session_id: &str) -> Result<BatchReport> {
        let handle = self
            .store
            .current_for_session(session_id)
            .ok_or_else(|| ReplaceError::session_not_found(session_id))?;
        self.build_report(handle.id())
    }

    pub fn get_report_if_modified(
        &self,
        session_id: &str,
        known_fingerprint: Option<&str>,
    ) -> Result<ReportLookup> {
        let report = self.get_report_for_session(session_id)?;
        match known_fingerprint {
            Some(known) if known == report.fingerprint => Ok(ReportLookup::NotModified {
                fingerprint: report.fingerprint,
            }),
            _ => Ok(ReportLookup::Fresh(Box::new(report))),
        }
    }

    pub fn evict(&self, task_id: &str) {
        self.cache().pop(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{FileIssue, FileReplaceResult};
    use crate::rules::Rule;
    use pretty_assertions::assert_eq;

    fn finished_task() -> ReplaceTask {
        let mut task = ReplaceTask::new(
            "s1",
            vec![Rule::literal("a", "b"), Rule::regex(r"\d+", "#")],
        );
        task.status = TaskStatus::Completed;
        task.total_files = 2;
        task.processed_files = 2;

        let mut first = FileReplaceResult::new("a.txt".into(), 2);
        first.per_rule_counts = vec![2, 1];
        first.original_size = 10;
        first.new_size = 9;
        first.modified = true;

        let mut second = FileReplaceResult::new("b.txt".into(), 2);
        second.per_rule_counts = vec![0, 4];
        second.original_size = 8;
        second.new_size = 5;
        second.modified = true;
        second.errors.push(FileIssue {
            rule_index: Some(0),
            message: "Rule 0 timed out after 2000ms".into(),
        });

        task.total_replacements = 7;
        task.results = vec![first, second];
        task
    }

    #[test]
    fn test_aggregates_file_and_rule_stats() {
        let report = BatchReport::from_task(&finished_task());

        assert_eq!(report.modified_files, 2);
        assert_eq!(report.file_stats[0].replacements, 3);
        assert_eq!(report.file_stats[1].size_delta, -3);
        assert_eq!(report.file_stats[1].error_count, 1);
        assert_eq!(report.rule_stats[0].total_hits, 2);
        assert_eq!(report.rule_stats[0].files_touched, 1);
        assert_eq!(report.rule_stats[1].total_hits, 5);
        assert_eq!(report.rule_stats[1].files_touched, 2);
        assert_eq!(report.errors, vec!["b.txt: Rule 0 timed out after 2000ms"]);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let report = BatchReport::from_task(&finished_task());
        let fingerprint = report.compute_fingerprint().unwrap();
        assert_eq!(fingerprint.len(), 64);
        assert_eq!(fingerprint, report.compute_fingerprint().unwrap());

        let mut changed = report.clone();
        changed.total_replacements += 1;
        assert_ne!(fingerprint, changed.compute_fingerprint().unwrap());

        // The stored fingerprint itself is not part of the hash
        let mut stamped = report.clone();
        stamped.fingerprint = fingerprint.clone();
        assert_eq!(fingerprint, stamped.compute_fingerprint().unwrap());
    }

    #[test]
    fn test_unknown_session_is_not_found() {
        let builder = ReportBuilder::new(Arc::new(TaskStore::new()), &ReportConfig::default());
        assert!(builder.get_report_for_session("nope").unwrap_err().is_not_found());
        assert!(builder.build_report("nope").unwrap_err().is_not_found());
    }
}
