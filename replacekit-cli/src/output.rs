use serde::Serialize;

use replacekit::rules::{IssueCategory, Severity, ValidationIssue};
use replacekit::{BatchReport, PreviewChange, Rule, TaskStatus, ValidationResult};

/// Preview of all changes in a single file
#[derive(Debug, Clone, Serialize)]
pub struct FilePreview {
    pub file_path: String,
    pub num_changes: usize,
    pub changes: Vec<PreviewChange>,
}

impl FilePreview {
    pub fn new(file_path: String, changes: Vec<PreviewChange>, num_changes: usize) -> Self {
        Self {
            file_path,
            num_changes,
            changes,
        }
    }

    pub fn format_diff(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("📝 {}\n", self.file_path));
        output.push_str(&format!(
            "   {} change{}\n\n",
            self.num_changes,
            plural(self.num_changes)
        ));

        for (i, change) in self.changes.iter().enumerate() {
            output.push_str(&format!(
                "  {}:{} (rule #{})\n",
                change.line,
                change.column,
                change.rule_index + 1
            ));
            output.push_str(&format!("  - {}\n", change.original));
            output.push_str(&format!("  + {}\n", change.replacement));
            if i < self.changes.len() - 1 {
                output.push('\n');
            }
        }

        if self.changes.len() < self.num_changes {
            output.push_str(&format!(
                "\n  … {} more not shown\n",
                self.num_changes - self.changes.len()
            ));
        }

        output
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

/// Generate preview for all files
pub fn generate_preview(previews: &[FilePreview]) -> String {
    let mut output = String::new();

    let total_files = previews.len();
    let total_changes: usize = previews.iter().map(|p| p.num_changes).sum();

    output.push_str("========================================\n");
    output.push_str("           PREVIEW CHANGES\n");
    output.push_str("========================================\n\n");
    output.push_str(&format!(
        "📊 {} file{}, {} change{}\n\n",
        total_files,
        plural(total_files),
        total_changes,
        plural(total_changes)
    ));

    for (i, preview) in previews.iter().enumerate() {
        output.push_str(&preview.format_diff());
        if i < previews.len() - 1 {
            output.push_str("\n----------------------------------------\n\n");
        }
    }

    output.push_str("\n========================================\n");
    output
}

pub fn format_rule(index: usize, rule: &Rule) -> String {
    let mut flags = Vec::new();
    if rule.case_sensitive {
        flags.push("case");
    }
    if rule.is_regex {
        flags.push("regex");
    }
    if rule.whole_word {
        flags.push("word");
    }
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join(","))
    };

    format!(
        "#{} (line {}) {} -> {}{}",
        index + 1,
        rule.source_line,
        rule.original,
        rule.replacement,
        flags
    )
}

fn issue_marker(issue: &ValidationIssue) -> &'static str {
    match (issue.severity, issue.category) {
        (Severity::Danger, IssueCategory::Redos) => "☠️ ",
        (Severity::Danger, _) => "🚫",
        (Severity::Error, _) => "✗",
        (Severity::Warning, IssueCategory::DangerousOp) => "⚠️ ",
        (Severity::Warning, _) => "•",
    }
}

pub fn format_validation(result: &ValidationResult) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "Rules: {} total, {} valid, {} invalid\n",
        result.total_rules,
        result.valid_rules.len(),
        result.invalid_rules.len()
    ));

    if !result.invalid_rules.is_empty() {
        output.push_str("\nInvalid rules:\n");
        for invalid in &result.invalid_rules {
            output.push_str(&format!("  {}\n", format_rule(invalid.rule_index, &invalid.rule)));
            for issue in &invalid.issues {
                output.push_str(&format!("    {} {}\n", issue_marker(issue), issue.message));
            }
        }
    }

    if !result.warnings.is_empty() {
        output.push_str("\nWarnings:\n");
        for issue in &result.warnings {
            output.push_str(&format!(
                "  {} rule #{}: {}\n",
                issue_marker(issue),
                issue.rule_index + 1,
                issue.message
            ));
        }
    }

    if !result.parse_errors.is_empty() {
        output.push_str("\nParse errors:\n");
        for issue in &result.parse_errors {
            output.push_str(&format!("  line {}: {}\n", issue.line, issue.message));
        }
    }

    if result.is_clean() && result.warnings.is_empty() {
        output.push_str("\n✓ All rules are valid\n");
    }
    output
}

pub fn format_report(report: &BatchReport) -> String {
    let mut output = String::new();

    match report.status {
        TaskStatus::Completed => output.push_str("✓ Batch replacement complete!\n"),
        TaskStatus::Cancelled => output.push_str("⚠️  Batch replacement cancelled\n"),
        TaskStatus::Failed => output.push_str(&format!(
            "✗ Batch replacement failed: {}\n",
            report.error_message.as_deref().unwrap_or("unknown error")
        )),
        other => output.push_str(&format!("Batch replacement {}\n", other)),
    }
    output.push_str(&format!(
        "  Files processed: {}/{}\n",
        report.processed_files, report.total_files
    ));
    output.push_str(&format!("  Files modified: {}\n", report.modified_files));
    output.push_str(&format!("  Replacements made: {}\n", report.total_replacements));

    if !report.rule_stats.is_empty() {
        output.push_str("\nRules:\n");
        for stat in &report.rule_stats {
            output.push_str(&format!(
                "  #{} {} -> {}: {} hit{} in {} file{}\n",
                stat.rule_index + 1,
                stat.original,
                stat.replacement,
                stat.total_hits,
                plural(stat.total_hits),
                stat.files_touched,
                plural(stat.files_touched)
            ));
        }
    }

    let modified: Vec<_> = report.file_stats.iter().filter(|s| s.modified).collect();
    if !modified.is_empty() {
        output.push_str("\nModified files:\n");
        for stat in modified {
            output.push_str(&format!(
                "  • {} ({} replacement{}, {:+} bytes)\n",
                stat.file_path,
                stat.replacements,
                plural(stat.replacements),
                stat.size_delta
            ));
        }
    }

    if !report.errors.is_empty() {
        output.push_str("\nErrors:\n");
        for error in &report.errors {
            output.push_str(&format!("  ⚠️  {}\n", error));
        }
    }

    output
}
