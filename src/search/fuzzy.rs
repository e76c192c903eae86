//! Fuzzy field matching
//!
//! Scores a field value against a query pattern with a three-tier ladder:
//! exact match, substring containment, then an in-order subsequence scan
//! with a bonus for consecutive characters. All offsets are character
//! offsets into the field's string representation.

use serde::Serialize;
use serde_json::Value;

/// Score for a case-insensitive exact match
pub const EXACT_SCORE: f64 = 100.0;
/// Base score for a substring match, reduced by its start index
pub const SUBSTRING_SCORE: f64 = 80.0;
/// Penalty per character of offset for substring matches
pub const SUBSTRING_INDEX_PENALTY: f64 = 0.5;
/// Score per character consumed by the subsequence scan
pub const SUBSEQUENCE_CHAR_SCORE: f64 = 10.0;
/// Extra score per preceding consecutive matched character
pub const CONSECUTIVE_BONUS: f64 = 5.0;

/// Half-open `[start, end)` character range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct MatchSpan {
    pub start: usize,
    pub end: usize,
}

impl MatchSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl From<(usize, usize)> for MatchSpan {
    fn from((start, end): (usize, usize)) -> Self {
        Self { start, end }
    }
}

/// Result of matching a single pattern against a single field value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldMatch {
    pub matched: bool,
    pub score: f64,
    /// Merged, ascending, non-overlapping
    pub spans: Vec<MatchSpan>,
}

impl FieldMatch {
    fn miss() -> Self {
        Self {
            matched: false,
            score: 0.0,
            spans: Vec::new(),
        }
    }
}

/// A field that satisfied every query token
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldHit {
    pub field: String,
    pub score: f64,
    pub spans: Vec<MatchSpan>,
}

/// Result of matching a whole query against a record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordMatch {
    pub matched: bool,
    pub score: f64,
    /// Fully matched fields, in the order they were requested
    pub field_matches: Vec<FieldHit>,
}

/// Case-fold one character without changing the character count.
///
/// Characters whose lowercase form expands to several code points fold to
/// the first of them so offsets stay aligned with the original text.
fn fold(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

fn fold_chars(text: &str) -> Vec<char> {
    text.chars().map(fold).collect()
}

fn find_chars(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Match `pattern` against `text`, case-insensitively.
pub fn match_field(text: &str, pattern: &str) -> FieldMatch {
    if pattern.is_empty() {
        return FieldMatch {
            matched: true,
            score: 0.0,
            spans: Vec::new(),
        };
    }

    let text_chars = fold_chars(text);
    let pattern_chars = fold_chars(pattern);

    if text_chars == pattern_chars {
        return FieldMatch {
            matched: true,
            score: EXACT_SCORE,
            spans: vec![MatchSpan::new(0, text_chars.len())],
        };
    }

    if let Some(index) = find_chars(&text_chars, &pattern_chars) {
        return FieldMatch {
            matched: true,
            score: SUBSTRING_SCORE - SUBSTRING_INDEX_PENALTY * index as f64,
            spans: vec![MatchSpan::new(index, index + pattern_chars.len())],
        };
    }

    subsequence_match(&text_chars, &pattern_chars)
}

fn subsequence_match(text: &[char], pattern: &[char]) -> FieldMatch {
    let mut score = 0.0;
    let mut run = 0usize;
    let mut consumed = 0usize;
    let mut spans = Vec::new();

    for (i, &c) in text.iter().enumerate() {
        if consumed == pattern.len() {
            break;
        }
        if c == pattern[consumed] {
            score += SUBSEQUENCE_CHAR_SCORE + CONSECUTIVE_BONUS * run as f64;
            run += 1;
            consumed += 1;
            spans.push(MatchSpan::new(i, i + 1));
        } else {
            run = 0;
        }
    }

    if consumed < pattern.len() {
        return FieldMatch::miss();
    }

    FieldMatch {
        matched: true,
        score,
        spans: merge_spans(spans),
    }
}

/// Sort by start and merge ranges where `next.start <= current.end`.
pub fn merge_spans(mut spans: Vec<MatchSpan>) -> Vec<MatchSpan> {
    spans.retain(|s| !s.is_empty());
    if spans.len() <= 1 {
        return spans;
    }

    spans.sort_by_key(|s| s.start);
    let mut merged: Vec<MatchSpan> = Vec::with_capacity(spans.len());
    for span in spans {
        if let Some(last) = merged.last_mut() {
            if span.start <= last.end {
                if span.end > last.end {
                    last.end = span.end;
                }
                continue;
            }
        }
        merged.push(span);
    }

    merged
}

/// String representation of a record field.
///
/// A field name is first looked up verbatim; if absent and it contains dots,
/// it is resolved as a path into nested objects (`owner.name`).
pub fn field_text(record: &Value, field: &str) -> Option<String> {
    let value = record.get(field).or_else(|| {
        if !field.contains('.') {
            return None;
        }
        field
            .split('.')
            .try_fold(record, |current, segment| current.get(segment))
    })?;

    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).ok(),
    }
}

/// Match a whitespace-tokenized query against the given fields of a record.
///
/// Tokens have AND semantics within a field: a field counts only when every
/// token matches it. The record matches when at least one field does.
pub fn match_record<S: AsRef<str>>(record: &Value, query: &str, fields: &[S]) -> RecordMatch {
    let tokens: Vec<&str> = query.split_whitespace().collect();
    if tokens.is_empty() {
        return RecordMatch {
            matched: true,
            score: 0.0,
            field_matches: Vec::new(),
        };
    }

    let mut field_matches = Vec::new();
    let mut total = 0.0;

    'fields: for field in fields {
        let field = field.as_ref();
        let Some(text) = field_text(record, field) else {
            continue;
        };

        let mut field_score = 0.0;
        let mut spans = Vec::new();
        for token in &tokens {
            let m = match_field(&text, token);
            if !m.matched {
                continue 'fields;
            }
            field_score += m.score;
            spans.extend(m.spans);
        }

        total += field_score;
        field_matches.push(FieldHit {
            field: field.to_string(),
            score: field_score,
            spans: merge_spans(spans),
        });
    }

    RecordMatch {
        matched: !field_matches.is_empty(),
        score: total,
        field_matches,
    }
}
