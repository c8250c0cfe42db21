use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ReplaceError;

/// Smallest and largest file worker pool the orchestrator accepts
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 4;

/// Main configuration structure for replacekit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplaceConfig {
    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub progress: ProgressConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Limits applied while validating a rule document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Length of the repeated-character run fed to the runtime probe
    #[serde(default = "default_probe_length")]
    pub probe_length: usize,

    /// Wall-clock budget for one probe run, in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Patterns longer than this are rejected outright
    #[serde(default = "default_max_pattern_length")]
    pub max_pattern_length: usize,

    /// Compiled regex size limit in bytes
    #[serde(default = "default_regex_size_limit")]
    pub regex_size_limit: usize,
}

/// Replacement engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Wall-clock budget for applying one rule to one file, in milliseconds
    #[serde(default = "default_rule_timeout_ms")]
    pub rule_timeout_ms: u64,

    /// How many matches per rule a preview records
    #[serde(default = "default_preview_matches_per_rule")]
    pub preview_matches_per_rule: usize,
}

/// Task orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Concurrent file workers per task (clamped to 1..=4)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// File extensions (without the dot) a task touches
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

/// Progress streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Interval between "waiting" heartbeats for tasks that do not exist yet
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Give up waiting after this many heartbeats (0 waits forever)
    #[serde(default)]
    pub max_heartbeats: u32,
}

/// Report cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

// Default value functions
fn default_probe_length() -> usize {
    30
}

fn default_probe_timeout_ms() -> u64 {
    50
}

fn default_max_pattern_length() -> usize {
    500
}

fn default_regex_size_limit() -> usize {
    10_000_000 // 10MB
}

fn default_rule_timeout_ms() -> u64 {
    2_000
}

fn default_preview_matches_per_rule() -> usize {
    20
}

fn default_workers() -> usize {
    2
}

fn default_extensions() -> Vec<String> {
    [
        "txt", "md", "html", "htm", "xhtml", "xml", "css", "json", "csv", "opf", "ncx",
    ]
    .iter()
    .map(|ext| ext.to_string())
    .collect()
}

fn default_heartbeat_ms() -> u64 {
    1_000
}

fn default_cache_capacity() -> usize {
    64
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            probe_length: default_probe_length(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_pattern_length: default_max_pattern_length(),
            regex_size_limit: default_regex_size_limit(),
        }
    }
}

impl ValidationConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rule_timeout_ms: default_rule_timeout_ms(),
            preview_matches_per_rule: default_preview_matches_per_rule(),
        }
    }
}

impl EngineConfig {
    pub fn rule_timeout(&self) -> Duration {
        Duration::from_millis(self.rule_timeout_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            extensions: default_extensions(),
        }
    }
}

impl OrchestratorConfig {
    /// Worker count clamped into the supported range
    pub fn effective_workers(&self) -> usize {
        self.workers.clamp(MIN_WORKERS, MAX_WORKERS)
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            max_heartbeats: 0,
        }
    }
}

impl ProgressConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl ReplaceConfig {
    /// Load configuration with proper hierarchy
    ///
    /// **Config Priority (highest to lowest):**
    /// 1. `./replacekit.toml` (project-level config)
    /// 2. `~/.config/replacekit/config.toml` (global user config)
    /// 3. Hardcoded defaults
    ///
    /// A config file found later replaces the earlier one as a whole.
    pub fn load() -> Result<Self> {
        let mut config = ReplaceConfig::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                tracing::info!("Loading global config from: {}", global_path.display());
                config = Self::load_from_file(&global_path)?;
            }
        }

        let project_path = Self::project_config_path();
        if project_path.exists() {
            tracing::info!("Loading project config from: {}", project_path.display());
            config = Self::load_from_file(&project_path)?;
        }

        config.validate()?;

        tracing::debug!(
            "Final config: workers={}, probe_timeout_ms={}, rule_timeout_ms={}",
            config.orchestrator.workers,
            config.validation.probe_timeout_ms,
            config.engine.rule_timeout_ms
        );

        Ok(config)
    }

    /// Load config from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ReplaceConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the engine hang or do nothing
    pub fn validate(&self) -> std::result::Result<(), ReplaceError> {
        if self.validation.probe_length == 0 {
            return Err(ReplaceError::Config(
                "validation.probe_length must be greater than zero".to_string(),
            ));
        }
        if self.validation.probe_timeout_ms == 0 {
            return Err(ReplaceError::Config(
                "validation.probe_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.engine.rule_timeout_ms == 0 {
            return Err(ReplaceError::Config(
                "engine.rule_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.report.cache_capacity == 0 {
            return Err(ReplaceError::Config(
                "report.cache_capacity must be greater than zero".to_string(),
            ));
        }
        if self.orchestrator.workers != self.orchestrator.effective_workers() {
            tracing::warn!(
                "orchestrator.workers={} is outside {}..={}, using {}",
                self.orchestrator.workers,
                MIN_WORKERS,
                MAX_WORKERS,
                self.orchestrator.effective_workers()
            );
        }
        Ok(())
    }

    /// Global config path (~/.config/replacekit/config.toml)
    fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config").join("replacekit").join("config.toml"))
    }

    /// Project config path (./replacekit.toml in the current directory)
    fn project_config_path() -> PathBuf {
        PathBuf::from("replacekit.toml")
    }

    /// Create a default config file at the specified path
    pub fn create_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = ReplaceConfig::default();
        let toml_string =
            toml::to_string_pretty(&config).context("Failed to serialize default config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        fs::write(path.as_ref(), toml_string)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ReplaceConfig::default();
        assert_eq!(config.validation.probe_length, 30);
        assert_eq!(config.validation.probe_timeout_ms, 50);
        assert_eq!(config.engine.rule_timeout_ms, 2_000);
        assert_eq!(config.orchestrator.workers, 2);
        assert!(config.orchestrator.extensions.contains(&"html".to_string()));
        assert_eq!(config.progress.max_heartbeats, 0);
        assert_eq!(config.report.cache_capacity, 64);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [orchestrator]
            workers = 3
        "#;

        let config: ReplaceConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.orchestrator.workers, 3);
        // Other fields fall back to defaults
        assert_eq!(config.orchestrator.extensions.len(), 11);
        assert_eq!(config.validation.probe_timeout_ms, 50);
    }

    #[test]
    fn test_worker_clamping() {
        let mut config = OrchestratorConfig::default();
        config.workers = 0;
        assert_eq!(config.effective_workers(), 1);
        config.workers = 16;
        assert_eq!(config.effective_workers(), 4);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let toml_str = r#"
            [engine]
            rule_timeout_ms = 0
        "#;

        let config: ReplaceConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml() {
        let toml_str = r#"
            [validation
            probe_length = 10
        "#;

        let result: std::result::Result<ReplaceConfig, _> = toml::from_str(toml_str);
        assert!(result.is_err());
    }

    #[test]
    fn test_create_default_config_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("replacekit.toml");

        ReplaceConfig::create_default_config(&config_path).unwrap();
        assert!(config_path.exists());

        let loaded = ReplaceConfig::load_from_file(&config_path).unwrap();
        assert_eq!(loaded.engine.preview_matches_per_rule, 20);
    }

    #[test]
    #[serial]
    fn test_load_without_files_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let previous_home = env::var_os("HOME");
        env::set_var("HOME", temp_dir.path());

        let config = ReplaceConfig::load().unwrap();
        assert_eq!(config.orchestrator.workers, 2);

        if let Some(home) = previous_home {
            env::set_var("HOME", home);
        }
    }
}
