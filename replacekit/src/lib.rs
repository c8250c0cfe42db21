// replacekit/src/lib.rs
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod logging;
pub mod orchestrator;
pub mod progress;
pub mod report;
pub mod rules;
pub mod service;
pub mod session;

// Re-export key types
pub use config::ReplaceConfig;
pub use engine::{ApplyOutcome, PreviewChange, PreviewOutcome, ReplacementEngine, RuleError};
pub use error::{FileServiceError, ReplaceError, Result};
pub use orchestrator::{FileReplaceResult, ReplaceTask, TaskOrchestrator, TaskStatus, TaskStore};
pub use progress::{ProgressBroadcaster, ProgressEvent, ProgressSnapshot};
pub use report::{BatchReport, FileStat, ReportBuilder, ReportLookup, RuleStat};
pub use rules::{parse, validate, Rule, ValidationResult};
pub use service::{BatchService, StartedTask};
pub use session::{DirectorySessionFiles, FileContent, FileLease, SessionFiles};
