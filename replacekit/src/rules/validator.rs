use serde::{Deserialize, Serialize};
use regex::Regex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

use super::parser::{parse, DocumentStatistics, ParseIssue};
use super::redos::scan_pattern;
use super::Rule;
use crate::config::ValidationConfig;
use crate::error::{GuardError, ReplaceError};
use crate::guard::{run_with_timeout, Guarded};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Danger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueCategory {
    Syntax,
    Redos,
    DangerousOp,
}

/// One finding against one rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Index into the parsed rule list
    pub rule_index: usize,
    pub severity: Severity,
    pub category: IssueCategory,
    pub message: String,
}

impl ValidationIssue {
    /// Whether this issue keeps the rule out of a run
    pub fn is_blocking(&self) -> bool {
        matches!(self.severity, Severity::Error | Severity::Danger)
    }

    /// Error-taxonomy view of a blocking issue
    pub fn to_error(&self) -> Option<ReplaceError> {
        match (self.severity, self.category) {
            (Severity::Danger, IssueCategory::Redos) => Some(ReplaceError::UnsafeRegex {
                rule: self.rule_index,
                message: self.message.clone(),
            }),
            (Severity::Error, _) => Some(ReplaceError::Syntax {
                rule: self.rule_index,
                message: self.message.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidRule {
    pub rule_index: usize,
    pub rule: Rule,
    pub issues: Vec<ValidationIssue>,
}

/// Structured breakdown of a rule document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub total_rules: usize,
    pub valid_rules: Vec<Rule>,
    pub invalid_rules: Vec<InvalidRule>,
    pub warnings: Vec<ValidationIssue>,
    pub dangerous_operations: Vec<ValidationIssue>,
    pub parse_errors: Vec<ParseIssue>,
    pub statistics: DocumentStatistics,
}

impl ValidationResult {
    pub fn is_clean(&self) -> bool {
        self.invalid_rules.is_empty() && self.parse_errors.is_empty()
    }

    /// Indices of rules flagged as backtracking hazards
    pub fn redos_rule_indices(&self) -> Vec<usize> {
        self.invalid_rules
            .iter()
            .filter(|invalid| {
                invalid.issues.iter().any(|issue| {
                    issue.category == IssueCategory::Redos && issue.severity == Severity::Danger
                })
            })
            .map(|invalid| invalid.rule_index)
            .collect()
    }
}

/// Replacement markers that look like shell, SQL or script payloads
const DANGEROUS_MARKERS: &[(&str, &str)] = &[
    ("rm -rf", "shell file deletion"),
    ("$(", "shell command substitution"),
    ("`", "shell backtick execution"),
    ("; rm ", "chained shell deletion"),
    ("| sh", "pipe into shell"),
    ("| bash", "pipe into shell"),
    ("drop table", "SQL table drop"),
    ("delete from", "SQL delete"),
    ("; --", "SQL comment injection"),
    ("<script", "inline script tag"),
    ("javascript:", "javascript URL"),
    ("eval(", "dynamic evaluation"),
    ("exec(", "dynamic execution"),
    ("__import__", "python dynamic import"),
];

/// Validate a rule document with default limits
pub fn validate(document: &str) -> ValidationResult {
    validate_with(document, &ValidationConfig::default())
}

/// Validate a rule document; pure apart from the probe worker threads
pub fn validate_with(document: &str, config: &ValidationConfig) -> ValidationResult {
    let parsed = parse(document);

    let mut result = ValidationResult {
        total_rules: parsed.rules.len(),
        parse_errors: parsed.issues,
        statistics: parsed.statistics,
        ..Default::default()
    };

    let mut seen: HashSet<(String, bool, bool)> = HashSet::new();

    for (index, rule) in parsed.rules.into_iter().enumerate() {
        let mut issues = check_rule(index, &rule, config);

        let key = (rule.original.clone(), rule.is_regex, rule.case_sensitive);
        if !rule.original.is_empty() && !seen.insert(key) {
            issues.push(issue(
                index,
                Severity::Warning,
                IssueCategory::Syntax,
                format!("duplicate of an earlier rule for '{}'", rule.original),
            ));
        }

        for found in scan_replacement(index, &rule.replacement) {
            result.dangerous_operations.push(found.clone());
            result.warnings.push(found);
        }

        let (blocking, advisory): (Vec<_>, Vec<_>) =
            issues.into_iter().partition(ValidationIssue::is_blocking);
        result.warnings.extend(advisory);

        if blocking.is_empty() {
            result.valid_rules.push(rule);
        } else {
            debug!(
                "Rule {} (line {}) rejected: {}",
                index,
                rule.source_line,
                blocking[0].message
            );
            result.invalid_rules.push(InvalidRule {
                rule_index: index,
                rule,
                issues: blocking,
            });
        }
    }

    result
}

fn issue(
    rule_index: usize,
    severity: Severity,
    category: IssueCategory,
    message: String,
) -> ValidationIssue {
    ValidationIssue {
        rule_index,
        severity,
        category,
        message,
    }
}

fn check_rule(index: usize, rule: &Rule, config: &ValidationConfig) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if rule.original.is_empty() {
        issues.push(issue(
            index,
            Severity::Error,
            IssueCategory::Syntax,
            "original text is empty".to_string(),
        ));
    }
    if rule.replacement.is_empty() {
        issues.push(issue(
            index,
            Severity::Error,
            IssueCategory::Syntax,
            "replacement text is empty".to_string(),
        ));
    }
    if !issues.is_empty() {
        return issues;
    }

    if rule.original.chars().count() > config.max_pattern_length {
        issues.push(issue(
            index,
            Severity::Error,
            IssueCategory::Syntax,
            format!(
                "pattern is longer than {} characters",
                config.max_pattern_length
            ),
        ));
        return issues;
    }

    if rule.original == rule.replacement {
        issues.push(issue(
            index,
            Severity::Warning,
            IssueCategory::Syntax,
            "replacement equals original; rule is a no-op".to_string(),
        ));
    }

    if rule.is_regex {
        issues.extend(check_regex(index, rule, config));
    }

    issues
}

type ProbeOutcome = Result<Guarded<bool>, GuardError>;

/// Match the probe input on a guard thread within the configured budget
fn run_probe(regex: Regex, probe: String, limit: Duration) -> ProbeOutcome {
    run_with_timeout(limit, move || regex.is_match(&probe))
}

fn check_regex(index: usize, rule: &Rule, config: &ValidationConfig) -> Vec<ValidationIssue> {
    check_regex_with(index, rule, config, run_probe)
}

/// Compilability, structural scan and runtime probe
fn check_regex_with<P>(
    index: usize,
    rule: &Rule,
    config: &ValidationConfig,
    probe_runner: P,
) -> Vec<ValidationIssue>
where
    P: FnOnce(Regex, String, Duration) -> ProbeOutcome,
{
    let mut issues = Vec::new();

    let regex = match rule.compile(config.regex_size_limit) {
        Ok(regex) => regex,
        Err(e) => {
            issues.push(issue(
                index,
                Severity::Error,
                IssueCategory::Syntax,
                format!("regex does not compile: {}", e),
            ));
            return issues;
        }
    };

    for finding in scan_pattern(&rule.original) {
        issues.push(issue(
            index,
            Severity::Danger,
            IssueCategory::Redos,
            format!(
                "{} in '{}' can cause catastrophic backtracking",
                finding.shape.describe(),
                finding.fragment
            ),
        ));
    }

    let probe = probe_input(&rule.original, config.probe_length);
    match probe_runner(regex, probe, config.probe_timeout()) {
        Ok(guarded) => {
            debug!("Probe for rule {} finished in {:?}", index, guarded.elapsed);
        }
        Err(GuardError::TimedOut(limit)) => {
            warn!("Probe for rule {} exceeded {:?}", index, limit);
            issues.push(issue(
                index,
                Severity::Danger,
                IssueCategory::Redos,
                format!("matching an adversarial probe exceeded {}ms", limit.as_millis()),
            ));
        }
        Err(e) => {
            warn!("Probe for rule {} could not run: {}", index, e);
            issues.push(issue(
                index,
                Severity::Warning,
                IssueCategory::Redos,
                format!(
                    "runtime probe unavailable ({}); classified by structural scan only, degraded confidence",
                    e
                ),
            ));
        }
    }

    issues
}

/// Repeating run of the pattern's first literal character plus a terminator it
/// is unlikely to accept
fn probe_input(pattern: &str, length: usize) -> String {
    let seed = first_literal_char(pattern).unwrap_or('a');
    let mut probe: String = std::iter::repeat(seed).take(length).collect();
    probe.push('!');
    probe
}

fn first_literal_char(pattern: &str) -> Option<char> {
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            c if c.is_alphanumeric() => return Some(c),
            _ => {}
        }
    }
    None
}

fn scan_replacement(index: usize, replacement: &str) -> Vec<ValidationIssue> {
    let lowered = replacement.to_lowercase();
    DANGEROUS_MARKERS
        .iter()
        .filter(|(marker, _)| lowered.contains(marker))
        .map(|(marker, label)| {
            issue(
                index,
                Severity::Warning,
                IssueCategory::DangerousOp,
                format!(
                    "replacement contains '{}' ({}); inserted as plain text, never executed",
                    marker, label
                ),
            )
        })
        .collect()
}
