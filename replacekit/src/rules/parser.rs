//! Line-oriented rule document parser.
//!
//! ```text
//! # comment
//! 旧文本 -> 新文本
//! CASE: HTML -> html
//! REGEX: \d{4}-\d{2}-\d{2} -> [DATE]
//! CASE:REGEX: Chapter\s+(\d+) -> 第$1章
//! 旧文本|新文本
//! ```

use serde::{Deserialize, Serialize};

use super::Rule;

const ARROW: &str = "->";
const SPACED_ARROW: &str = " -> ";
const PIPE: char = '|';

/// A line that looked like a rule but had no recognised separator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseIssue {
    /// 1-indexed line number
    pub line: usize,
    pub content: String,
    pub message: String,
}

/// Line counts for a rule document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStatistics {
    pub total_lines: usize,
    pub comment_lines: usize,
    pub empty_lines: usize,
    pub non_empty_lines: usize,
    pub rule_lines: usize,
    pub malformed_lines: usize,
}

/// Output of [`parse`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub rules: Vec<Rule>,
    pub issues: Vec<ParseIssue>,
    pub statistics: DocumentStatistics,
}

#[derive(Debug, Default, Clone, Copy)]
struct Modifiers {
    case_sensitive: bool,
    regex: bool,
    whole_word: bool,
}

/// Parse a rule document into ordered rules plus malformed-line issues
pub fn parse(document: &str) -> ParsedDocument {
    let mut parsed = ParsedDocument::default();

    if document.is_empty() {
        return parsed;
    }

    for (idx, raw_line) in document.split('\n').enumerate() {
        let line_number = idx + 1;
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        let trimmed = line.trim();

        parsed.statistics.total_lines += 1;

        if trimmed.is_empty() {
            parsed.statistics.empty_lines += 1;
            continue;
        }
        parsed.statistics.non_empty_lines += 1;

        if trimmed.starts_with('#') {
            parsed.statistics.comment_lines += 1;
            continue;
        }

        match parse_line(trimmed, line_number) {
            Some(rule) => {
                parsed.statistics.rule_lines += 1;
                parsed.rules.push(rule);
            }
            None => {
                parsed.statistics.malformed_lines += 1;
                parsed.issues.push(ParseIssue {
                    line: line_number,
                    content: trimmed.to_string(),
                    message: "expected '<original> -> <replacement>' or '<original>|<replacement>'"
                        .to_string(),
                });
            }
        }
    }

    parsed
}

fn parse_line(line: &str, line_number: usize) -> Option<Rule> {
    let (modifiers, body) = strip_modifiers(line);

    if let Some((original, replacement)) = split_arrow(body) {
        return Some(build_rule(original, replacement, modifiers, line_number));
    }

    // Legacy pipe form only applies to unprefixed lines
    if !modifiers.case_sensitive && !modifiers.regex && !modifiers.whole_word {
        if let Some((original, replacement)) = body.split_once(PIPE) {
            return Some(Rule {
                original: original.trim().to_string(),
                replacement: replacement.trim().to_string(),
                is_regex: false,
                case_sensitive: false,
                whole_word: false,
                source_line: line_number,
            });
        }
    }

    None
}

/// Peel `CASE:`, `REGEX:` and `WORD:` prefixes in any order
fn strip_modifiers(line: &str) -> (Modifiers, &str) {
    let mut modifiers = Modifiers::default();
    let mut rest = line;

    loop {
        if let Some(after) = rest.strip_prefix("CASE:") {
            modifiers.case_sensitive = true;
            rest = after.trim_start();
        } else if let Some(after) = rest.strip_prefix("REGEX:") {
            modifiers.regex = true;
            rest = after.trim_start();
        } else if let Some(after) = rest.strip_prefix("WORD:") {
            modifiers.whole_word = true;
            rest = after.trim_start();
        } else {
            break;
        }
    }

    (modifiers, rest)
}

fn split_arrow(body: &str) -> Option<(&str, &str)> {
    if let Some(pos) = body.find(SPACED_ARROW) {
        return Some((&body[..pos], &body[pos + SPACED_ARROW.len()..]));
    }
    body.split_once(ARROW)
}

fn build_rule(original: &str, replacement: &str, modifiers: Modifiers, line: usize) -> Rule {
    let original = original.trim();
    let replacement = replacement.trim();

    // `/pattern/` marks a regex even without the REGEX: prefix
    let (original, slash_regex) = match original
        .strip_prefix('/')
        .and_then(|rest| rest.strip_suffix('/'))
    {
        Some(inner) if !inner.is_empty() => (inner, true),
        _ => (original, false),
    };

    Rule {
        original: original.to_string(),
        replacement: replacement.to_string(),
        is_regex: modifiers.regex || slash_regex,
        case_sensitive: modifiers.case_sensitive,
        whole_word: modifiers.whole_word,
        source_line: line,
    }
}
