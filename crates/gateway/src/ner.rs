//! Lightweight named-entity extraction for the `ner` frame.
//!
//! The frontend highlights entity spans in the user's prompt while the run
//! is still working. A heuristic is enough for that: runs of capitalised
//! words (outside sentence starts) and numbers. Span offsets are byte
//! positions into the original text.

use serde_json::Value;

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '\'' || c == '-'
}

fn looks_like_entity(word: &str, sentence_start: bool) -> bool {
    let mut chars = word.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if first.is_ascii_digit() {
        return true;
    }
    if !first.is_uppercase() {
        return false;
    }
    if !sentence_start {
        return true;
    }
    // Sentence-initial words only count when they are all-caps acronyms.
    word.chars().count() > 1 && chars.all(|c| c.is_uppercase())
}

/// Entity spans over `text`, merged across adjacent entity words.
pub fn entity_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut sentence_start = true;
    let mut idx = 0;

    let bytes_len = text.len();
    while idx < bytes_len {
        // Skip to the next word.
        let rest = &text[idx..];
        let Some(offset) = rest.find(|c: char| is_word_char(c)) else {
            break;
        };
        let start = idx + offset;
        let skipped = &rest[..offset];
        if skipped.contains(['.', '!', '?']) {
            sentence_start = true;
        }

        let end = text[start..]
            .find(|c: char| !is_word_char(c))
            .map(|o| start + o)
            .unwrap_or(bytes_len);
        let word = &text[start..end];

        if looks_like_entity(word, sentence_start) {
            match spans.last_mut() {
                // Merge with the previous span when only whitespace separates them.
                Some((_, prev_end))
                    if text[*prev_end..start].chars().all(char::is_whitespace)
                        && !text[*prev_end..start].is_empty() =>
                {
                    *prev_end = end;
                }
                _ => spans.push((start, end)),
            }
        }

        sentence_start = false;
        idx = end;
    }

    spans
}

/// The payload of the `ner` envelope.
pub fn named_entity_recognition(text: &str) -> Value {
    let spans: Vec<Vec<usize>> = entity_spans(text)
        .into_iter()
        .map(|(s, e)| vec![s, e])
        .collect();
    serde_json::json!({
        "text": text,
        "entity_spans": spans,
        "noun_spans": [],
    })
}
