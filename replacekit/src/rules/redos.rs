//! Structural scan for catastrophic-backtracking shapes.
//!
//! This is a best-effort catalogue over the pattern's own source text, not a
//! proof of safety. The validator pairs it with a runtime probe under a
//! timeout, which is the authoritative check. Patterns the scanner cannot
//! parse yield no findings; the compiler reports those.

use serde::{Deserialize, Serialize};

/// Catalogue of known-dangerous pattern shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedosShape {
    /// An unbounded quantifier applied to a group that itself contains one: `(a+)+`, `(.*)+`
    NestedQuantifier,
    /// An unbounded quantifier over alternatives that can match the same text: `(a|ab)*`
    OverlappingAlternation,
    /// Two unbounded wildcards in a row: `.*.*`
    AdjacentWildcards,
}

impl RedosShape {
    pub fn describe(&self) -> &'static str {
        match self {
            RedosShape::NestedQuantifier => "nested unbounded quantifiers",
            RedosShape::OverlappingAlternation => "quantified alternation with overlapping branches",
            RedosShape::AdjacentWildcards => "adjacent unbounded wildcards",
        }
    }
}

/// One catalogue hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedosFinding {
    pub shape: RedosShape,
    /// Source fragment the detector matched
    pub fragment: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(char),
    Dot,
    /// Escapes and character classes, kept as source text
    Set(String),
    Anchor,
    Group {
        branches: Vec<Vec<Node>>,
        source: String,
    },
    Repeat {
        inner: Box<Node>,
        unbounded: bool,
    },
}

impl Node {
    fn is_unbounded_repeat(&self) -> bool {
        matches!(self, Node::Repeat { unbounded: true, .. })
    }

    fn contains_unbounded_repeat(&self) -> bool {
        match self {
            Node::Repeat { inner, unbounded } => *unbounded || inner.contains_unbounded_repeat(),
            Node::Group { branches, .. } => branches
                .iter()
                .flatten()
                .any(|node| node.contains_unbounded_repeat()),
            _ => false,
        }
    }

    fn source(&self) -> String {
        match self {
            Node::Literal(c) => c.to_string(),
            Node::Dot => ".".to_string(),
            Node::Set(text) => text.clone(),
            Node::Anchor => String::new(),
            Node::Group { source, .. } => source.clone(),
            Node::Repeat { inner, unbounded } => {
                format!("{}{}", inner.source(), if *unbounded { "+" } else { "?" })
            }
        }
    }
}

/// Scan a regex pattern's source for dangerous shapes
pub fn scan_pattern(pattern: &str) -> Vec<RedosFinding> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut parser = PatternParser { chars: &chars, pos: 0 };

    let branches = match parser.parse_alternation() {
        Some(branches) if parser.pos == chars.len() => branches,
        _ => return Vec::new(),
    };

    let mut findings = Vec::new();
    for branch in &branches {
        inspect_sequence(branch, &mut findings);
    }
    findings.dedup();
    findings
}

fn inspect_sequence(sequence: &[Node], findings: &mut Vec<RedosFinding>) {
    for window in sequence.windows(2) {
        if let [Node::Repeat { inner: a, unbounded: true }, Node::Repeat { inner: b, unbounded: true }] =
            window
        {
            if **a == Node::Dot && **b == Node::Dot {
                findings.push(RedosFinding {
                    shape: RedosShape::AdjacentWildcards,
                    fragment: format!("{}{}", window[0].source(), window[1].source()),
                });
            }
        }
    }

    for node in sequence {
        inspect_node(node, findings);
    }
}

fn inspect_node(node: &Node, findings: &mut Vec<RedosFinding>) {
    match node {
        Node::Repeat {
            inner,
            unbounded: true,
        } => {
            if let Node::Group { branches, source } = inner.as_ref() {
                if branches.iter().flatten().any(Node::contains_unbounded_repeat) {
                    findings.push(RedosFinding {
                        shape: RedosShape::NestedQuantifier,
                        fragment: source.clone(),
                    });
                }
                if has_overlapping_branches(branches) {
                    findings.push(RedosFinding {
                        shape: RedosShape::OverlappingAlternation,
                        fragment: source.clone(),
                    });
                }
            } else if inner.is_unbounded_repeat() {
                // `a**` style stacking without a group
                findings.push(RedosFinding {
                    shape: RedosShape::NestedQuantifier,
                    fragment: inner.source(),
                });
            }
            inspect_node(inner, findings);
        }
        Node::Repeat { inner, .. } => inspect_node(inner, findings),
        Node::Group { branches, .. } => {
            for branch in branches {
                inspect_sequence(branch, findings);
            }
        }
        _ => {}
    }
}

/// Two branches overlap when one's source is a prefix of the other's
fn has_overlapping_branches(branches: &[Vec<Node>]) -> bool {
    if branches.len() < 2 {
        return false;
    }

    let rendered: Vec<String> = branches
        .iter()
        .map(|branch| branch.iter().map(Node::source).collect())
        .collect();

    for (i, a) in rendered.iter().enumerate() {
        for b in rendered.iter().skip(i + 1) {
            if a.is_empty() || b.is_empty() {
                return true;
            }
            if a.starts_with(b.as_str()) || b.starts_with(a.as_str()) {
                return true;
            }
        }
    }
    false
}

struct PatternParser<'a> {
    chars: &'a [char],
    pos: usize,
}

impl<'a> PatternParser<'a> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn slice(&self, start: usize, end: usize) -> String {
        self.chars[start..end].iter().collect()
    }

    fn parse_alternation(&mut self) -> Option<Vec<Vec<Node>>> {
        let mut branches = vec![self.parse_sequence()?];
        while self.peek() == Some('|') {
            self.pos += 1;
            branches.push(self.parse_sequence()?);
        }
        Some(branches)
    }

    fn parse_sequence(&mut self) -> Option<Vec<Node>> {
        let mut nodes = Vec::new();

        while let Some(c) = self.peek() {
            if c == '|' || c == ')' {
                break;
            }
            let atom = self.parse_atom()?;
            let node = self.parse_quantifier(atom);
            nodes.push(node);
        }

        Some(nodes)
    }

    fn parse_atom(&mut self) -> Option<Node> {
        let start = self.pos;
        let c = self.peek()?;
        self.pos += 1;

        match c {
            '.' => Some(Node::Dot),
            '^' | '$' => Some(Node::Anchor),
            '\\' => {
                let escaped = self.peek()?;
                self.pos += 1;
                match escaped {
                    'b' | 'B' | 'A' | 'z' => Some(Node::Anchor),
                    'p' | 'P' if self.peek() == Some('{') => {
                        while self.peek()? != '}' {
                            self.pos += 1;
                        }
                        self.pos += 1;
                        Some(Node::Set(self.slice(start, self.pos)))
                    }
                    _ => Some(Node::Set(self.slice(start, self.pos))),
                }
            }
            '[' => {
                self.skip_class()?;
                Some(Node::Set(self.slice(start, self.pos)))
            }
            '(' => {
                self.skip_group_prefix()?;
                let branches = self.parse_alternation()?;
                if self.peek() != Some(')') {
                    return None;
                }
                self.pos += 1;
                Some(Node::Group {
                    branches,
                    source: self.slice(start, self.pos),
                })
            }
            '*' | '+' | '?' => None,
            other => Some(Node::Literal(other)),
        }
    }

    /// Skip `?:`, `?P<name>`, `?<name>` and inline flag groups after `(`
    fn skip_group_prefix(&mut self) -> Option<()> {
        if self.peek() != Some('?') {
            return Some(());
        }
        self.pos += 1;

        match self.peek()? {
            'P' | '<' => {
                while self.peek()? != '>' {
                    self.pos += 1;
                }
                self.pos += 1;
            }
            _ => {
                // flags such as `?i:` or `?x-s:`; a bare `(?i)` leaves an empty group
                while let Some(c) = self.peek() {
                    if c == ':' {
                        self.pos += 1;
                        break;
                    }
                    if c == ')' {
                        break;
                    }
                    self.pos += 1;
                }
            }
        }
        Some(())
    }

    /// Consume a (possibly nested) bracket class; the opening `[` is already eaten
    fn skip_class(&mut self) -> Option<()> {
        let mut depth = 1;
        if self.peek() == Some('^') {
            self.pos += 1;
        }
        // A leading `]` is literal
        if self.peek() == Some(']') {
            self.pos += 1;
        }

        while depth > 0 {
            match self.peek()? {
                '\\' => self.pos += 2,
                '[' => {
                    depth += 1;
                    self.pos += 1;
                }
                ']' => {
                    depth -= 1;
                    self.pos += 1;
                }
                _ => self.pos += 1,
            }
        }
        Some(())
    }

    fn parse_quantifier(&mut self, atom: Node) -> Node {
        let unbounded = match self.peek() {
            Some('*') | Some('+') => {
                self.pos += 1;
                true
            }
            Some('?') => {
                self.pos += 1;
                false
            }
            Some('{') => match self.parse_braces() {
                Some(unbounded) => unbounded,
                None => return atom,
            },
            _ => return atom,
        };

        // Lazy suffix
        if self.peek() == Some('?') {
            self.pos += 1;
        }

        let node = Node::Repeat {
            inner: Box::new(atom),
            unbounded,
        };
        // Stacked quantifiers like `a+*` nest
        match self.peek() {
            Some('*') | Some('+') | Some('{') => self.parse_quantifier(node),
            _ => node,
        }
    }

    /// `{n}`, `{n,}`, `{n,m}`; returns whether the upper bound is open
    fn parse_braces(&mut self) -> Option<bool> {
        let start = self.pos;
        let mut end = start + 1;
        while end < self.chars.len() && self.chars[end] != '}' {
            end += 1;
        }
        if end >= self.chars.len() {
            return None;
        }

        let body = self.slice(start + 1, end);
        let (min, max) = match body.split_once(',') {
            Some((min, max)) => (min.trim(), Some(max.trim())),
            None => (body.trim(), None),
        };
        if min.is_empty() || !min.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let unbounded = match max {
            Some("") => true,
            Some(max) if max.chars().all(|c| c.is_ascii_digit()) => false,
            Some(_) => return None,
            None => false,
        };

        self.pos = end + 1;
        Some(unbounded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shapes(pattern: &str) -> Vec<RedosShape> {
        scan_pattern(pattern).into_iter().map(|f| f.shape).collect()
    }

    #[test]
    fn test_catalogue_examples_are_flagged() {
        assert!(shapes("(a+)+b").contains(&RedosShape::NestedQuantifier));
        assert!(shapes("(.*)+").contains(&RedosShape::NestedQuantifier));
        assert!(shapes("([a-zA-Z]+)*$").contains(&RedosShape::NestedQuantifier));
        assert!(shapes("(x+x+)+y").contains(&RedosShape::NestedQuantifier));
    }

    #[test]
    fn test_overlapping_alternation() {
        assert!(shapes("(a|ab)*c").contains(&RedosShape::OverlappingAlternation));
        assert!(shapes("(?:foo|foo)+").contains(&RedosShape::OverlappingAlternation));
        assert!(shapes("(cat|dog)+").is_empty());
    }

    #[test]
    fn test_adjacent_wildcards() {
        assert_eq!(shapes("a.*.*b"), vec![RedosShape::AdjacentWildcards]);
    }

    #[test]
    fn test_safe_patterns_pass() {
        assert!(shapes(r"\d{4}-\d{2}-\d{2}").is_empty());
        assert!(shapes(r"Chapter\s+(\d+)").is_empty());
        assert!(shapes(r"第(\d+)章").is_empty());
        assert!(shapes(r"(ab){2,5}").is_empty());
        assert!(shapes(r"[+*]+").is_empty());
        assert!(shapes(r"(?i)colou?r").is_empty());
    }

    #[test]
    fn test_bounded_outer_quantifier_is_not_flagged() {
        assert!(shapes("(a+){3}").is_empty());
    }

    #[test]
    fn test_named_group_and_braces_unbounded() {
        assert!(shapes(r"(?P<word>\w+){2,}").contains(&RedosShape::NestedQuantifier));
    }

    #[test]
    fn test_unparseable_pattern_yields_nothing() {
        assert!(scan_pattern("(a+").is_empty());
        assert!(scan_pattern("a)").is_empty());
    }
}
