//! Regex safety analysis
//!
//! Caller-supplied field patterns are compiled at runtime, so every pattern
//! passes a structural check before it reaches [`regex::RegexBuilder`]. The
//! check rejects the constructs that make backtracking engines explode, so a
//! pattern accepted here stays safe if it is ever shipped to a JavaScript or
//! PCRE consumer through the JSON Schema export:
//!
//! - nested repeating quantifiers (`(a+)+`, `(\w+\s?)*`, `(.*a){12}`)
//! - repeated groups that can match the empty string (`(a?)+`)
//! - repeated alternations whose branches can start with the same character
//!   (`(a|ab)*`, `(\w|\d)+`, `([a-z]|a)+`)
//! - patterns longer than the configured limit
//!
//! A rejected pattern always surfaces as [`SchemaError::UnsafeRegexPattern`],
//! whose message is exactly `"Unsafe regex pattern"`.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SchemaError};
use crate::validator::CompiledPattern;

/// Bounds applied to user-supplied patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternLimits {
    /// Longest accepted pattern, in characters
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Compiled program size limit handed to the regex engine, in bytes
    #[serde(default = "default_size_limit")]
    pub size_limit: usize,
}

fn default_max_length() -> usize {
    256
}

fn default_size_limit() -> usize {
    1 << 20
}

impl Default for PatternLimits {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            size_limit: default_size_limit(),
        }
    }
}

/// Reject patterns at risk of catastrophic backtracking
pub fn check_pattern_safety(pattern: &str, limits: &PatternLimits) -> Result<()> {
    let reason = if pattern.chars().count() > limits.max_length {
        Some("pattern exceeds maximum length")
    } else {
        find_hazard(pattern)
    };

    match reason {
        Some(reason) => {
            warn!(pattern, reason, "rejected unsafe regex pattern");
            Err(SchemaError::UnsafeRegexPattern {
                pattern: pattern.to_string(),
            })
        }
        None => Ok(()),
    }
}

/// Safety-check then compile a pattern
pub fn compile_pattern(pattern: &str, limits: &PatternLimits) -> Result<CompiledPattern> {
    check_pattern_safety(pattern, limits)?;
    let regex = RegexBuilder::new(pattern)
        .size_limit(limits.size_limit)
        .build()
        .map_err(|e| SchemaError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
    Ok(CompiledPattern::new(pattern, regex))
}

/// Characters an atom can start with, as a union of inclusive ranges
#[derive(Debug, Clone, PartialEq)]
enum CharSet {
    Any,
    Ranges(Vec<(char, char)>),
}

const WORD: &[(char, char)] = &[('0', '9'), ('A', 'Z'), ('_', '_'), ('a', 'z'), ('\u{80}', char::MAX)];
const DIGIT: &[(char, char)] = &[('0', '9'), ('\u{80}', char::MAX)];
const SPACE: &[(char, char)] = &[('\t', '\r'), (' ', ' ')];
const LETTERS: &[(char, char)] = &[('A', 'Z'), ('a', 'z')];

impl CharSet {
    fn empty() -> Self {
        CharSet::Ranges(Vec::new())
    }

    fn literal(c: char, fold: bool) -> Self {
        let mut ranges = vec![(c, c)];
        if fold {
            ranges.extend(c.to_lowercase().chain(c.to_uppercase()).map(|u| (u, u)));
        }
        CharSet::Ranges(ranges)
    }

    fn from_ranges(ranges: &[(char, char)]) -> Self {
        CharSet::Ranges(ranges.to_vec())
    }

    fn union(&mut self, other: &CharSet) {
        match other {
            CharSet::Any => *self = CharSet::Any,
            CharSet::Ranges(more) => {
                if let CharSet::Ranges(ranges) = self {
                    ranges.extend_from_slice(more);
                }
            }
        }
    }

    fn overlaps(&self, other: &CharSet) -> bool {
        match (self, other) {
            (CharSet::Any, _) | (_, CharSet::Any) => true,
            (CharSet::Ranges(a), CharSet::Ranges(b)) => a
                .iter()
                .any(|&(lo, hi)| b.iter().any(|&(lo2, hi2)| lo <= hi2 && lo2 <= hi)),
        }
    }

    /// Widen letter ranges to both cases
    fn fold_case(mut self) -> Self {
        if let CharSet::Ranges(ranges) = &mut self {
            if CharSet::Ranges(ranges.clone()).overlaps(&CharSet::from_ranges(LETTERS)) {
                ranges.extend_from_slice(LETTERS);
            }
        }
        self
    }
}

/// A parsed atom: literal, class, escape, or closed group
struct Atom {
    /// Characters the atom can start with
    head: CharSet,
    /// Depth of repeating quantifiers inside this atom
    star_height: u32,
    /// Heads of each branch when the atom is a group with alternation
    branch_heads: Vec<CharSet>,
    /// Whether the atom can match the empty string
    nullable: bool,
}

impl Atom {
    fn leaf(head: CharSet, nullable: bool) -> Self {
        Atom {
            head,
            star_height: 0,
            branch_heads: Vec::new(),
            nullable,
        }
    }
}

struct Frame {
    star_height: u32,
    branch_heads: Vec<CharSet>,
    branch_nullable: Vec<bool>,
    current_head: CharSet,
    /// Every atom so far in the current branch can match empty
    current_nullable: bool,
}

impl Frame {
    fn new() -> Self {
        Frame {
            star_height: 0,
            branch_heads: Vec::new(),
            branch_nullable: Vec::new(),
            current_head: CharSet::empty(),
            current_nullable: true,
        }
    }

    fn push(&mut self, atom: Atom) {
        self.star_height = self.star_height.max(atom.star_height);
        if self.current_nullable {
            self.current_head.union(&atom.head);
        }
        self.current_nullable &= atom.nullable;
    }

    fn end_branch(&mut self) {
        let head = std::mem::replace(&mut self.current_head, CharSet::empty());
        self.branch_heads.push(head);
        self.branch_nullable.push(self.current_nullable);
        self.current_nullable = true;
    }

    fn into_atom(mut self) -> Atom {
        self.end_branch();
        let mut head = CharSet::empty();
        for branch in &self.branch_heads {
            head.union(branch);
        }
        Atom {
            head,
            star_height: self.star_height,
            nullable: self.branch_nullable.iter().any(|n| *n),
            branch_heads: if self.branch_heads.len() > 1 {
                self.branch_heads
            } else {
                Vec::new()
            },
        }
    }
}

/// Walk the pattern and return the first hazard found.
///
/// Malformed patterns are not reported here; the compiler rejects them.
fn find_hazard(pattern: &str) -> Option<&'static str> {
    let chars: Vec<char> = pattern.chars().collect();
    let fold = has_case_insensitive_flag(&chars);
    let mut stack = vec![Frame::new()];
    // Latest atom, held back until we know whether a quantifier follows
    let mut pending: Option<Atom> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if !matches!(c, '*' | '+' | '?' | '{') {
            if let Some(atom) = pending.take() {
                stack.last_mut()?.push(atom);
            }
        }
        match c {
            '\\' => {
                let end = escape_end(&chars, i);
                pending = Some(escape_atom(&chars[i + 1..end], fold));
                i = end;
            }
            '[' => {
                let end = class_end(&chars, i)?;
                pending = Some(Atom::leaf(class_set(&chars[i..end], fold), false));
                i = end;
            }
            '(' => match group_prefix_end(&chars, i) {
                GroupOpen::Flags(end) => i = end,
                GroupOpen::Group(end) => {
                    stack.push(Frame::new());
                    i = end;
                }
            },
            ')' => {
                if stack.len() < 2 {
                    return None;
                }
                pending = Some(stack.pop()?.into_atom());
                i += 1;
            }
            '|' => {
                stack.last_mut()?.end_branch();
                i += 1;
            }
            '*' | '+' | '?' | '{' => {
                let Some((repeating, optional, end)) = quantifier(&chars, i) else {
                    // `{` that is not a counted repetition is a literal
                    if let Some(atom) = pending.take() {
                        stack.last_mut()?.push(atom);
                    }
                    pending = Some(Atom::leaf(CharSet::literal(c, fold), false));
                    i += 1;
                    continue;
                };
                i = end;
                if chars.get(i) == Some(&'?') {
                    i += 1;
                }
                let Some(mut atom) = pending.take() else {
                    continue;
                };
                if repeating {
                    if atom.star_height > 0 {
                        return Some("nested quantifier");
                    }
                    if atom.nullable {
                        return Some("repeated group can match empty");
                    }
                    if overlapping_branches(&atom.branch_heads) {
                        return Some("repeated alternation with overlapping branches");
                    }
                    atom.star_height += 1;
                }
                if optional {
                    atom.nullable = true;
                }
                stack.last_mut()?.push(atom);
            }
            '^' | '$' => i += 1,
            '.' => {
                pending = Some(Atom::leaf(CharSet::Any, false));
                i += 1;
            }
            _ => {
                pending = Some(Atom::leaf(CharSet::literal(c, fold), false));
                i += 1;
            }
        }
    }
    None
}

fn overlapping_branches(heads: &[CharSet]) -> bool {
    heads
        .iter()
        .enumerate()
        .any(|(idx, head)| heads[idx + 1..].iter().any(|other| head.overlaps(other)))
}

/// Atom for an escape; `body` is everything after the backslash
fn escape_atom(body: &[char], fold: bool) -> Atom {
    let Some(&c) = body.first() else {
        return Atom::leaf(CharSet::Any, false);
    };
    match c {
        'd' => Atom::leaf(CharSet::from_ranges(DIGIT), false),
        'w' => Atom::leaf(CharSet::from_ranges(WORD), false),
        's' => Atom::leaf(CharSet::from_ranges(SPACE), false),
        // zero-width assertions
        'b' | 'B' | 'A' | 'z' | '<' | '>' => Atom::leaf(CharSet::empty(), true),
        c if c.is_ascii_alphanumeric() => match control_char(c) {
            Some(control) => Atom::leaf(CharSet::literal(control, false), false),
            None => Atom::leaf(CharSet::Any, false),
        },
        c => Atom::leaf(CharSet::literal(c, fold), false),
    }
}

fn control_char(c: char) -> Option<char> {
    match c {
        'n' => Some('\n'),
        't' => Some('\t'),
        'r' => Some('\r'),
        'f' => Some('\u{c}'),
        'v' => Some('\u{b}'),
        'a' => Some('\u{7}'),
        _ => None,
    }
}

/// Set for a bracketed class, `chars` including both brackets.
///
/// Negated, nested and set-operation classes are treated as matching anything.
fn class_set(chars: &[char], fold: bool) -> CharSet {
    let inner = &chars[1..chars.len().saturating_sub(1).max(1)];
    let text: String = inner.iter().collect();
    if inner.first() == Some(&'^')
        || inner.contains(&'[')
        || ["&&", "--", "~~"].iter().any(|op| text.contains(op))
    {
        return CharSet::Any;
    }

    let mut set = CharSet::empty();
    let mut i = 0;
    while i < inner.len() {
        let c = inner[i];
        if c == '\\' {
            if i + 1 >= inner.len() {
                break;
            }
            let escaped = escape_atom(&inner[i + 1..], false);
            if escaped.head == CharSet::Any {
                return CharSet::Any;
            }
            set.union(&escaped.head);
            i += 2;
            continue;
        }
        if inner.get(i + 1) == Some(&'-') && i + 2 < inner.len() && inner[i + 2] != '\\' {
            let (lo, hi) = (c, inner[i + 2]);
            set.union(&CharSet::Ranges(vec![(lo.min(hi), lo.max(hi))]));
            i += 3;
        } else {
            set.union(&CharSet::literal(c, false));
            i += 1;
        }
    }
    if fold {
        set.fold_case()
    } else {
        set
    }
}

/// Whether any inline flag group turns on case-insensitive matching
fn has_case_insensitive_flag(chars: &[char]) -> bool {
    chars.windows(2).enumerate().any(|(idx, pair)| {
        pair == ['(', '?']
            && chars[idx + 2..]
                .iter()
                .take_while(|c| !matches!(**c, ':' | ')' | '<'))
                .any(|c| *c == 'i')
    })
}

/// Index just past an escape sequence starting at `start`
fn escape_end(chars: &[char], start: usize) -> usize {
    let next = start + 1;
    match chars.get(next) {
        None => chars.len(),
        Some('p' | 'P' | 'x' | 'u') if chars.get(next + 1) == Some(&'{') => chars[next..]
            .iter()
            .position(|c| *c == '}')
            .map(|p| next + p + 1)
            .unwrap_or(chars.len()),
        Some(_) => next + 1,
    }
}

/// Index just past a bracketed class starting at `start`
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    let mut depth = 1;
    if chars.get(i) == Some(&'^') {
        i += 1;
    }
    if chars.get(i) == Some(&']') {
        i += 1;
    }
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '[' => {
                depth += 1;
                i += 1;
            }
            ']' => {
                depth -= 1;
                i += 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => i += 1,
        }
    }
    None
}

enum GroupOpen {
    /// Inline flags like `(?i)`; no group is opened
    Flags(usize),
    /// Capturing or non-capturing group; body starts at the index
    Group(usize),
}

fn group_prefix_end(chars: &[char], start: usize) -> GroupOpen {
    let mut i = start + 1;
    if chars.get(i) != Some(&'?') {
        return GroupOpen::Group(i);
    }
    i += 1;
    match chars.get(i) {
        Some('P') if chars.get(i + 1) == Some(&'<') => skip_name(chars, i + 2),
        Some('<') => skip_name(chars, i + 1),
        _ => {
            while i < chars.len() {
                match chars[i] {
                    ':' => return GroupOpen::Group(i + 1),
                    ')' => return GroupOpen::Flags(i + 1),
                    _ => i += 1,
                }
            }
            GroupOpen::Group(i)
        }
    }
}

fn skip_name(chars: &[char], from: usize) -> GroupOpen {
    let end = chars[from.min(chars.len())..]
        .iter()
        .position(|c| *c == '>')
        .map(|p| from + p + 1)
        .unwrap_or(chars.len());
    GroupOpen::Group(end)
}

/// Parse a quantifier at `start`: (repeats more than once, allows zero, index past it)
fn quantifier(chars: &[char], start: usize) -> Option<(bool, bool, usize)> {
    match chars[start] {
        '*' => Some((true, true, start + 1)),
        '+' => Some((true, false, start + 1)),
        '?' => Some((false, true, start + 1)),
        '{' => {
            let close = chars[start..].iter().position(|c| *c == '}')? + start;
            let body: String = chars[start + 1..close].iter().collect();
            let (min, max) = match body.split_once(',') {
                Some((min, max)) => (min.trim(), Some(max.trim())),
                None => (body.trim(), None),
            };
            let min: u32 = min.parse().ok()?;
            let repeating = match max {
                None => min > 1,
                Some("") => true,
                Some(max) => max.parse::<u32>().ok()? > 1,
            };
            Some((repeating, min == 0, close + 1))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_safe(pattern: &str) -> bool {
        check_pattern_safety(pattern, &PatternLimits::default()).is_ok()
    }

    #[test]
    fn test_nested_quantifiers_rejected() {
        assert!(!is_safe("(a+)+$"));
        assert!(!is_safe("(a*)*"));
        assert!(!is_safe(r"^(\w+\s?)*$"));
        assert!(!is_safe("(.*a){12}"));
        assert!(!is_safe("((ab)+)+"));
    }

    #[test]
    fn test_overlapping_alternation_rejected() {
        assert!(!is_safe("(a|ab)*"));
        assert!(!is_safe("(.|x)+c"));
        assert!(is_safe("(ab|cd)+"));
    }

    #[test]
    fn test_overlapping_character_classes_rejected() {
        assert!(!is_safe(r"^(\w|\d)+$"));
        assert!(!is_safe("^([a-z]|a)+$"));
        assert!(!is_safe(r"^(\d|[0-9])*x$"));
        assert!(!is_safe(r"(\s|[ \t])+"));
        assert!(!is_safe("(?i)(a|A)+"));
        assert!(!is_safe("([^x]|y)+"));
    }

    #[test]
    fn test_disjoint_classes_accepted() {
        assert!(is_safe(r"^(\w|\s)+$"));
        assert!(is_safe(r"^(\d|[a-z])+$"));
        assert!(is_safe("([a-c]|[x-z])+"));
        assert!(is_safe("(a|b)+"));
    }

    #[test]
    fn test_repeated_empty_matching_group_rejected() {
        assert!(!is_safe("^(a?)+$"));
        assert!(!is_safe("(a|)+"));
        assert!(!is_safe("(a?b?)*"));
        assert!(is_safe("(a?b)+"));
    }

    #[test]
    fn test_common_patterns_accepted() {
        assert!(is_safe(r"linkedin\.com"));
        assert!(is_safe("^[a-z]+$"));
        assert!(is_safe(r"^\+?[0-9]{7,15}$"));
        assert!(is_safe("(a+)?b"));
        assert!(is_safe(r"^(?i)[a-z0-9_]{3,32}$"));
        assert!(is_safe(r"^\p{L}+ \p{L}+$"));
        assert!(is_safe("[(+]x{2}"));
    }

    #[test]
    fn test_length_limit() {
        let limits = PatternLimits {
            max_length: 8,
            ..PatternLimits::default()
        };
        assert!(check_pattern_safety("abcdefghij", &limits).is_err());
        assert!(check_pattern_safety("abc", &limits).is_ok());
    }

    #[test]
    fn test_unsafe_error_message() {
        let err = compile_pattern("(a+)+$", &PatternLimits::default()).unwrap_err();
        assert!(err.to_string().contains("Unsafe regex pattern"));
    }

    #[test]
    fn test_malformed_pattern_is_invalid_not_unsafe() {
        let err = compile_pattern("(abc", &PatternLimits::default()).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidPattern { .. }));
    }

    #[test]
    fn test_compiled_pattern_is_unanchored() {
        let pattern = compile_pattern(r"linkedin\.com", &PatternLimits::default()).unwrap();
        assert!(pattern.is_match("https://linkedin.com/in/x"));
        assert!(!pattern.is_match("https://example.com"));
    }
}
