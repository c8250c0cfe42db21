use regex::{Captures, NoExpand, Regex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{EngineConfig, ValidationConfig};
use crate::error::{GuardError, ReplaceError};
use crate::guard::run_with_timeout;
use crate::rules::Rule;

/// Why one rule could not be applied to one piece of content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RuleErrorKind {
    Timeout { elapsed_ms: u64 },
    Compile,
    Worker,
}

/// Recoverable per-rule failure; the rule was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleError {
    pub rule_index: usize,
    pub source_line: usize,
    #[serde(flatten)]
    pub kind: RuleErrorKind,
    pub message: String,
}

impl From<&RuleError> for ReplaceError {
    fn from(err: &RuleError) -> Self {
        match err.kind {
            RuleErrorKind::Timeout { elapsed_ms } => ReplaceError::Timeout {
                rule: err.rule_index,
                elapsed_ms,
            },
            RuleErrorKind::Compile => ReplaceError::Syntax {
                rule: err.rule_index,
                message: err.message.clone(),
            },
            RuleErrorKind::Worker => ReplaceError::Internal(err.message.clone()),
        }
    }
}

/// Content after all rules plus what each rule did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub content: String,
    pub per_rule_counts: Vec<usize>,
    pub errors: Vec<RuleError>,
}

impl ApplyOutcome {
    pub fn total_replacements(&self) -> usize {
        self.per_rule_counts.iter().sum()
    }
}

/// A single match a preview would replace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewChange {
    pub rule_index: usize,
    /// 1-indexed line in the content as the rule saw it
    pub line: usize,
    /// 1-indexed character column
    pub column: usize,
    pub original: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreviewOutcome {
    pub outcome: ApplyOutcome,
    pub changes: Vec<PreviewChange>,
}

#[derive(Debug, Clone)]
enum Matcher {
    /// Case-sensitive literal without word boundaries
    Exact { needle: String, replacement: String },
    Pattern {
        regex: Regex,
        replacement: String,
        expand: bool,
    },
}

#[derive(Debug, Clone)]
struct CompiledRule {
    index: usize,
    source_line: usize,
    matcher: Result<Matcher, String>,
}

/// Rules compiled once and shared by every file of a task
#[derive(Debug, Clone)]
pub struct CompiledRuleSet {
    rules: Arc<Vec<CompiledRule>>,
}

impl CompiledRuleSet {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

struct Application {
    content: String,
    count: usize,
    changes: Vec<PreviewChange>,
}

/// Applies an ordered rule set to text, one rule at a time
#[derive(Debug, Clone)]
pub struct ReplacementEngine {
    rule_timeout: Duration,
    preview_limit: usize,
    size_limit: usize,
}

impl Default for ReplacementEngine {
    fn default() -> Self {
        Self::new(&EngineConfig::default(), &ValidationConfig::default())
    }
}

impl ReplacementEngine {
    pub fn new(engine: &EngineConfig, validation: &ValidationConfig) -> Self {
        Self {
            rule_timeout: engine.rule_timeout(),
            preview_limit: engine.preview_matches_per_rule,
            size_limit: validation.regex_size_limit,
        }
    }

    pub fn with_rule_timeout(mut self, timeout: Duration) -> Self {
        self.rule_timeout = timeout;
        self
    }

    pub fn compile(&self, rules: &[Rule]) -> CompiledRuleSet {
        let compiled = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| CompiledRule {
                index,
                source_line: rule.source_line,
                matcher: self.compile_rule(rule),
            })
            .collect();

        CompiledRuleSet {
            rules: Arc::new(compiled),
        }
    }

    fn compile_rule(&self, rule: &Rule) -> Result<Matcher, String> {
        if rule.original.is_empty() {
            return Err("original text is empty".to_string());
        }
        if rule.is_exact_literal() {
            return Ok(Matcher::Exact {
                needle: rule.original.clone(),
                replacement: rule.replacement.clone(),
            });
        }

        let regex = rule.compile(self.size_limit).map_err(|e| e.to_string())?;
        let (replacement, expand) = if rule.is_regex {
            (normalize_replacement(&rule.replacement), true)
        } else {
            (rule.replacement.clone(), false)
        };

        Ok(Matcher::Pattern {
            regex,
            replacement,
            expand,
        })
    }

    /// Compile and apply in one go
    pub fn apply(&self, content: &str, rules: &[Rule]) -> ApplyOutcome {
        self.apply_compiled(content, &self.compile(rules))
    }

    pub fn apply_compiled(&self, content: &str, rules: &CompiledRuleSet) -> ApplyOutcome {
        self.run(content, rules, 0).outcome
    }

    /// Same as [`apply`](Self::apply) but also records the first matches of each rule
    pub fn preview(&self, content: &str, rules: &[Rule]) -> PreviewOutcome {
        self.run(content, &self.compile(rules), self.preview_limit)
    }

    fn run(&self, content: &str, rules: &CompiledRuleSet, preview_limit: usize) -> PreviewOutcome {
        let mut current = content.to_string();
        let mut per_rule_counts = Vec::with_capacity(rules.len());
        let mut errors = Vec::new();
        let mut changes = Vec::new();

        for rule in rules.rules.iter() {
            let matcher = match &rule.matcher {
                Ok(matcher) => matcher.clone(),
                Err(message) => {
                    per_rule_counts.push(0);
                    errors.push(RuleError {
                        rule_index: rule.index,
                        source_line: rule.source_line,
                        kind: RuleErrorKind::Compile,
                        message: message.clone(),
                    });
                    continue;
                }
            };

            let input = current.clone();
            let index = rule.index;
            let guarded = run_with_timeout(self.rule_timeout, move || {
                substitute(&matcher, input, index, preview_limit)
            });

            match guarded {
                Ok(guarded) => {
                    let application = guarded.value;
                    debug!(
                        "Rule {} replaced {} occurrence(s) in {:?}",
                        rule.index, application.count, guarded.elapsed
                    );
                    per_rule_counts.push(application.count);
                    changes.extend(application.changes);
                    current = application.content;
                }
                Err(e) => {
                    // Content stays as it was before this rule
                    per_rule_counts.push(0);
                    let kind = match e {
                        GuardError::TimedOut(limit) => RuleErrorKind::Timeout {
                            elapsed_ms: limit.as_millis() as u64,
                        },
                        _ => RuleErrorKind::Worker,
                    };
                    warn!("Rule {} (line {}) aborted: {}", rule.index, rule.source_line, e);
                    errors.push(RuleError {
                        rule_index: rule.index,
                        source_line: rule.source_line,
                        kind,
                        message: format!("rule application aborted: {}", e),
                    });
                }
            }
        }

        PreviewOutcome {
            outcome: ApplyOutcome {
                content: current,
                per_rule_counts,
                errors,
            },
            changes,
        }
    }
}

fn substitute(
    matcher: &Matcher,
    content: String,
    rule_index: usize,
    preview_limit: usize,
) -> Application {
    let mut changes = Vec::new();

    match matcher {
        Matcher::Exact {
            needle,
            replacement,
        } => {
            let count = content.matches(needle.as_str()).count();
            if count == 0 {
                return Application {
                    content,
                    count,
                    changes,
                };
            }
            for (start, found) in content.match_indices(needle.as_str()).take(preview_limit) {
                changes.push(change_at(&content, rule_index, start, found, replacement));
            }
            Application {
                content: content.replace(needle.as_str(), replacement),
                count,
                changes,
            }
        }
        Matcher::Pattern {
            regex,
            replacement,
            expand,
        } => {
            let count = regex.find_iter(&content).count();
            if count == 0 {
                return Application {
                    content,
                    count,
                    changes,
                };
            }
            for caps in regex.captures_iter(&content).take(preview_limit) {
                let whole = match caps.get(0) {
                    Some(m) => m,
                    None => continue,
                };
                let replaced = if *expand {
                    expand_captures(&caps, replacement)
                } else {
                    replacement.clone()
                };
                changes.push(change_at(&content, rule_index, whole.start(), whole.as_str(), &replaced));
            }

            let replaced = if *expand {
                regex.replace_all(&content, replacement.as_str())
            } else {
                regex.replace_all(&content, NoExpand(replacement.as_str()))
            };
            Application {
                content: replaced.into_owned(),
                count,
                changes,
            }
        }
    }
}

fn expand_captures(caps: &Captures<'_>, replacement: &str) -> String {
    let mut out = String::new();
    caps.expand(replacement, &mut out);
    out
}

fn change_at(
    content: &str,
    rule_index: usize,
    start: usize,
    original: &str,
    replacement: &str,
) -> PreviewChange {
    let before = &content[..start];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|pos| pos + 1).unwrap_or(0);
    let column = content[line_start..start].chars().count() + 1;

    PreviewChange {
        rule_index,
        line,
        column,
        original: original.to_string(),
        replacement: replacement.to_string(),
    }
}

/// Rewrite back-references into the `${n}` form the regex crate expands.
///
/// `\1`, `$1` and `${1}` all become `${1}`, `$name` becomes `${name}`,
/// `\\` and `\$` become literal characters and a `$` that does not start a
/// reference is escaped as `$$`.
pub fn normalize_replacement(replacement: &str) -> String {
    let chars: Vec<char> = replacement.chars().collect();
    let mut out = String::with_capacity(replacement.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                let next = chars[i + 1];
                if next.is_ascii_digit() {
                    let end = digits_end(&chars, i + 1);
                    out.push_str("${");
                    out.extend(&chars[i + 1..end]);
                    out.push('}');
                    i = end;
                } else if next == '\\' {
                    out.push('\\');
                    i += 2;
                } else if next == '$' {
                    out.push_str("$$");
                    i += 2;
                } else {
                    out.push('\\');
                    i += 1;
                }
            }
            '$' => {
                let next = chars.get(i + 1).copied();
                match next {
                    Some('$') => {
                        out.push_str("$$");
                        i += 2;
                    }
                    Some('{') => match chars[i + 2..].iter().position(|c| *c == '}') {
                        Some(offset) if offset > 0 => {
                            let end = i + 2 + offset;
                            out.extend(&chars[i..=end]);
                            i = end + 1;
                        }
                        _ => {
                            out.push_str("$$");
                            i += 1;
                        }
                    },
                    Some(c) if c.is_ascii_digit() => {
                        let end = digits_end(&chars, i + 1);
                        out.push_str("${");
                        out.extend(&chars[i + 1..end]);
                        out.push('}');
                        i = end;
                    }
                    Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                        let mut end = i + 1;
                        while end < chars.len()
                            && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                        {
                            end += 1;
                        }
                        out.push_str("${");
                        out.extend(&chars[i + 1..end]);
                        out.push('}');
                        i = end;
                    }
                    _ => {
                        out.push_str("$$");
                        i += 1;
                    }
                }
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

fn digits_end(chars: &[char], start: usize) -> usize {
    let mut end = start;
    while end < chars.len() && chars[end].is_ascii_digit() {
        end += 1;
    }
    end
}
