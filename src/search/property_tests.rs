use proptest::prelude::*;
use proptest::char::range as char_range;
use serde_json::json;

use super::fuzzy::{match_field, match_record, merge_spans, MatchSpan};

fn assert_canonical(spans: &[MatchSpan], text_len: usize) -> Result<(), TestCaseError> {
    for span in spans {
        prop_assert!(span.start < span.end);
        prop_assert!(span.end <= text_len);
    }
    for pair in spans.windows(2) {
        prop_assert!(pair[0].end < pair[1].start, "spans overlap or touch: {:?}", pair);
    }
    Ok(())
}

// Property test: merged spans are sorted, disjoint and cover every input position
proptest! {
    #[test]
    fn merged_spans_are_canonical(raw in proptest::collection::vec((0usize..50, 1usize..10), 0..20)) {
        let spans: Vec<MatchSpan> = raw.iter().map(|&(s, l)| MatchSpan::new(s, s + l)).collect();
        let merged = merge_spans(spans.clone());
        assert_canonical(&merged, 60)?;

        for span in &spans {
            for pos in span.start..span.end {
                prop_assert!(merged.iter().any(|m| m.start <= pos && pos < m.end));
            }
        }
    }
}

// Property test: field matches stay within the text and never overlap
proptest! {
    #[test]
    fn field_match_spans_within_text(
        text in proptest::collection::vec(char_range('a', 'f'), 0..30).prop_map(|v| v.into_iter().collect::<String>()),
        pattern in proptest::collection::vec(char_range('a', 'f'), 1..5).prop_map(|v| v.into_iter().collect::<String>()),
    ) {
        let m = match_field(&text, &pattern);
        if m.matched {
            prop_assert!(m.score > 0.0);
            assert_canonical(&m.spans, text.chars().count())?;
            let covered: usize = m.spans.iter().map(|s| s.len()).sum();
            prop_assert!(covered >= pattern.chars().count());
        } else {
            prop_assert_eq!(m.score, 0.0);
            prop_assert!(m.spans.is_empty());
        }
    }
}

// Property test: matching ignores ASCII case
proptest! {
    #[test]
    fn field_match_is_case_insensitive(
        text in "[a-zA-Z ]{0,24}",
        pattern in "[a-zA-Z]{1,4}",
    ) {
        let lower = match_field(&text.to_lowercase(), &pattern.to_lowercase());
        let mixed = match_field(&text, &pattern);
        prop_assert_eq!(lower, mixed);
    }
}

// Property test: an extra token can only narrow a record match
proptest! {
    #[test]
    fn extra_token_never_widens(
        name in "[a-z]{1,12}",
        first in "[a-z]{1,3}",
        second in "[a-z]{1,3}",
    ) {
        let record = json!({ "name": name });
        let single = match_record(&record, &first, &["name"]);
        let both = match_record(&record, &format!("{} {}", first, second), &["name"]);
        if both.matched {
            prop_assert!(single.matched);
        }
    }
}
