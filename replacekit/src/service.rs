//! Public entry point tying validation, orchestration, progress and reports together.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ReplaceConfig;
use crate::engine::ReplacementEngine;
use crate::error::{ReplaceError, Result};
use crate::orchestrator::{ReplaceTask, TaskOrchestrator, TaskStatus, TaskStore};
use crate::progress::{ProgressBroadcaster, ProgressEvent, ProgressSnapshot};
use crate::report::{BatchReport, ReportBuilder, ReportLookup};
use crate::rules::{validate_with, ValidationResult};
use crate::session::SessionFiles;

/// Returned by [`BatchService::start_replace`] once the task is scheduled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedTask {
    pub task_id: String,
    pub superseded: Option<String>,
    pub rules_applied: usize,
    pub rules_rejected: usize,
}

pub struct BatchService {
    config: ReplaceConfig,
    orchestrator: Arc<TaskOrchestrator>,
    progress: ProgressBroadcaster,
    reports: ReportBuilder,
}

impl BatchService {
    pub fn new(files: Arc<dyn SessionFiles>, config: ReplaceConfig) -> Self {
        let store = Arc::new(TaskStore::new());
        let engine = ReplacementEngine::new(&config.engine, &config.validation);
        let orchestrator = Arc::new(TaskOrchestrator::new(
            store.clone(),
            files,
            engine,
            config.orchestrator.clone(),
        ));

        Self {
            progress: ProgressBroadcaster::new(store.clone(), config.progress.clone()),
            reports: ReportBuilder::new(store, &config.report),
            orchestrator,
            config,
        }
    }

    pub fn config(&self) -> &ReplaceConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    /// Structured breakdown of a rule document; never fails
    pub fn validate_rules(&self, document: &str) -> ValidationResult {
        validate_with(document, &self.config.validation)
    }

    /// Validate, register and spawn a batch run, returning without waiting for it.
    ///
    /// Fails before any file is touched when the session id is empty, the
    /// session does not exist, or the document has no usable rule.
    pub async fn start_replace(&self, session_id: &str, document: &str) -> Result<StartedTask> {
        if session_id.trim().is_empty() {
            return Err(ReplaceError::Conflict("session id is empty".to_string()));
        }
        if !self.orchestrator.files().session_exists(session_id).await {
            return Err(ReplaceError::session_not_found(session_id));
        }

        // Probes run on guard threads and can take a while for large documents
        let owned = document.to_string();
        let limits = self.config.validation.clone();
        let validation = tokio::task::spawn_blocking(move || validate_with(&owned, &limits))
            .await
            .map_err(|e| ReplaceError::Internal(format!("validation worker failed: {}", e)))?;

        if validation.valid_rules.is_empty() {
            let first_error = validation
                .invalid_rules
                .iter()
                .flat_map(|invalid| invalid.issues.iter())
                .find_map(|issue| issue.to_error());
            return Err(match first_error {
                Some(err) if validation.invalid_rules.len() == 1 => err,
                _ => ReplaceError::NoValidRules {
                    invalid: validation.invalid_rules.len(),
                },
            });
        }

        let rules_applied = validation.valid_rules.len();
        let rules_rejected = validation.invalid_rules.len();
        if rules_rejected > 0 {
            warn!(
                "Starting session {} with {} rule(s) rejected by validation",
                session_id, rules_rejected
            );
        }

        let created = self.orchestrator.create(session_id, validation.valid_rules);
        self.orchestrator.spawn(created.task_id.clone());
        info!(
            "Started task {} for session {} with {} rule(s)",
            created.task_id, session_id, rules_applied
        );

        Ok(StartedTask {
            task_id: created.task_id,
            superseded: created.superseded,
            rules_applied,
            rules_rejected,
        })
    }

    pub fn get_progress(&self, task_id: &str) -> Result<ProgressSnapshot> {
        self.progress.get_progress(task_id)
    }

    pub fn stream_progress(&self, task_id: &str) -> BoxStream<'static, ProgressEvent> {
        self.progress.stream_progress(task_id)
    }

    pub fn task(&self, task_id: &str) -> Result<ReplaceTask> {
        self.orchestrator.task(task_id)
    }

    /// Report of the session's most recent task
    pub fn get_report(&self, session_id: &str) -> Result<BatchReport> {
        self.reports.get_report_for_session(session_id)
    }

    pub fn get_task_report(&self, task_id: &str) -> Result<BatchReport> {
        self.reports.build_report(task_id)
    }

    pub fn get_report_if_modified(
        &self,
        session_id: &str,
        known_fingerprint: Option<&str>,
    ) -> Result<ReportLookup> {
        self.reports
            .get_report_if_modified(session_id, known_fingerprint)
    }

    /// Idempotent; terminal tasks are left as they are
    pub fn cancel(&self, task_id: &str) -> Result<TaskStatus> {
        self.orchestrator.cancel(task_id)
    }

    /// Drop a session's tasks and cached reports once nothing is running
    pub fn forget_session(&self, session_id: &str) -> Result<usize> {
        let removed = self.orchestrator.forget_session(session_id)?;
        for task_id in &removed {
            self.reports.evict(task_id);
        }
        Ok(removed.len())
    }
}
