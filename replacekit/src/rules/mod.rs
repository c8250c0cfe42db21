pub mod parser;
pub mod redos;
pub mod validator;

pub use parser::{parse, DocumentStatistics, ParseIssue, ParsedDocument};
pub use redos::{scan_pattern, RedosFinding, RedosShape};
pub use validator::{
    validate, validate_with, InvalidRule, IssueCategory, Severity, ValidationIssue,
    ValidationResult,
};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// One normalized find/replace instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Text or pattern to look for
    pub original: String,

    /// Replacement text (regex rules may reference capture groups)
    pub replacement: String,

    pub is_regex: bool,
    pub case_sensitive: bool,
    pub whole_word: bool,

    /// 1-indexed line in the rule document
    pub source_line: usize,
}

impl Rule {
    /// Literal, case-insensitive rule (the document default)
    pub fn literal(original: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            original: original.into(),
            replacement: replacement.into(),
            is_regex: false,
            case_sensitive: false,
            whole_word: false,
            source_line: 0,
        }
    }

    /// Regex rule, case-insensitive unless changed with `case_sensitive`
    pub fn regex(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            is_regex: true,
            ..Self::literal(pattern, replacement)
        }
    }

    pub fn case_sensitive(mut self, yes: bool) -> Self {
        self.case_sensitive = yes;
        self
    }

    pub fn whole_word(mut self, yes: bool) -> Self {
        self.whole_word = yes;
        self
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.source_line = line;
        self
    }

    /// True when the rule can be served by a plain substring replace
    pub fn is_exact_literal(&self) -> bool {
        !self.is_regex && self.case_sensitive && !self.whole_word
    }

    /// Regex source the engine matches with, before case flags
    pub fn pattern_source(&self) -> String {
        let core = if self.is_regex {
            self.original.clone()
        } else {
            regex::escape(&self.original)
        };

        if self.whole_word {
            format!(r"\b(?:{})\b", core)
        } else {
            core
        }
    }

    /// Compile the rule's pattern with its case flag and a size limit
    pub fn compile(&self, size_limit: usize) -> Result<Regex, regex::Error> {
        RegexBuilder::new(&self.pattern_source())
            .case_insensitive(!self.case_sensitive)
            .size_limit(size_limit)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_pattern_is_escaped() {
        let rule = Rule::literal("a.b(c)", "x");
        assert_eq!(rule.pattern_source(), r"a\.b\(c\)");
        let re = rule.compile(1 << 20).unwrap();
        assert!(re.is_match("A.B(C)"));
        assert!(!re.is_match("axb(c)"));
    }

    #[test]
    fn test_whole_word_wraps_with_boundaries() {
        let rule = Rule::regex("cat|dog", "pet").whole_word(true);
        assert_eq!(rule.pattern_source(), r"\b(?:cat|dog)\b");
        let re = rule.compile(1 << 20).unwrap();
        assert!(re.is_match("a dog here"));
        assert!(!re.is_match("hotdogs"));
    }

    #[test]
    fn test_exact_literal_detection() {
        assert!(Rule::literal("a", "b").case_sensitive(true).is_exact_literal());
        assert!(!Rule::literal("a", "b").is_exact_literal());
        assert!(!Rule::regex("a", "b").case_sensitive(true).is_exact_literal());
    }
}
