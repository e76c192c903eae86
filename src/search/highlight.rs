//! Markdown highlighting of match spans
//!
//! Wraps each merged span in `**bold**`. Spans are character offsets, so
//! they are mapped to byte offsets before slicing.

use super::fuzzy::{merge_spans, MatchSpan};

/// Render `text` with every span wrapped in `**`.
///
/// Spans are merged first, and spans that run past the end of the text are
/// clipped rather than rejected.
pub fn highlight(text: &str, spans: &[MatchSpan]) -> String {
    if spans.is_empty() {
        return text.to_string();
    }

    // char index -> byte index, with one extra slot for the end of the text
    let mut boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    boundaries.push(text.len());
    let char_len = boundaries.len() - 1;

    let mut res = String::with_capacity(text.len() + spans.len() * 4);
    let mut last_idx = 0usize;
    for span in merge_spans(spans.to_vec()) {
        let start = span.start.min(char_len);
        let end = span.end.min(char_len);
        if start >= end {
            continue;
        }
        let (s, e) = (boundaries[start], boundaries[end]);
        if last_idx < s {
            res.push_str(&text[last_idx..s]);
        }
        res.push_str("**");
        res.push_str(&text[s..e]);
        res.push_str("**");
        last_idx = e;
    }
    if last_idx < text.len() {
        res.push_str(&text[last_idx..]);
    }

    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::fuzzy::match_field;

    #[test]
    fn test_highlight_no_spans() {
        assert_eq!(highlight("plain", &[]), "plain");
    }

    #[test]
    fn test_highlight_substring() {
        let m = match_field("Hello World", "world");
        assert_eq!(highlight("Hello World", &m.spans), "Hello **World**");
    }

    #[test]
    fn test_highlight_subsequence() {
        let m = match_field("Kubernetes", "ks");
        assert_eq!(highlight("Kubernetes", &m.spans), "**K**ubernete**s**");
    }

    #[test]
    fn test_highlight_merges_adjacent() {
        let spans = vec![MatchSpan::new(0, 1), MatchSpan::new(1, 2)];
        assert_eq!(highlight("abc", &spans), "**ab**c");
    }

    #[test]
    fn test_highlight_multibyte() {
        let m = match_field("naïve café", "café");
        assert_eq!(highlight("naïve café", &m.spans), "naïve **café**");
    }

    #[test]
    fn test_highlight_clips_out_of_range() {
        let spans = vec![MatchSpan::new(2, 40)];
        assert_eq!(highlight("abcd", &spans), "ab**cd**");
    }
}
