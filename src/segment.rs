//! Text segmentation for the ingestion pipeline.
//!
//! A document is packed greedily into [`Segment`]s: whole paragraphs are
//! accumulated until the `max_tokens` budget would overflow, and a
//! paragraph that alone exceeds the budget is broken at the nearest
//! newline or space below the limit. Every document yields at least one
//! segment so that even trivial content is searchable.

use uuid::Uuid;

/// Approximate chars-per-token ratio used for sizing and token counts.
const CHARS_PER_TOKEN: usize = 4;

/// A segment of a knowledge entry's text, ready for embedding.
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: String,
    pub knowledge_id: String,
    pub index: i64,
    pub text: String,
}

impl Segment {
    /// Display excerpt of the segment text, truncated on a char boundary.
    pub fn snippet(&self, max_chars: usize) -> String {
        self.text.chars().take(max_chars).collect()
    }
}

/// Estimate the token count of a text under the fixed chars/token ratio.
pub fn estimate_tokens(text: &str) -> i64 {
    (text.len() / CHARS_PER_TOKEN) as i64
}

/// Split `text` into segments of at most `max_tokens`, indexed from 0.
pub fn split_text(knowledge_id: &str, text: &str, max_tokens: usize) -> Vec<Segment> {
    let budget = max_tokens.saturating_mul(CHARS_PER_TOKEN).max(1);

    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();
    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if paragraph.len() > budget {
            flush(&mut pieces, &mut buf);
            pieces.extend(break_oversized(paragraph, budget));
            continue;
        }
        let joined_len = buf.len() + if buf.is_empty() { 0 } else { 2 } + paragraph.len();
        if joined_len > budget {
            flush(&mut pieces, &mut buf);
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(paragraph);
    }
    flush(&mut pieces, &mut buf);

    if pieces.is_empty() {
        pieces.push(text.trim().to_string());
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| Segment {
            id: Uuid::new_v4().to_string(),
            knowledge_id: knowledge_id.to_string(),
            index: index as i64,
            text: piece,
        })
        .collect()
}

fn flush(pieces: &mut Vec<String>, buf: &mut String) {
    if !buf.is_empty() {
        pieces.push(std::mem::take(buf));
    }
}

/// Break a paragraph longer than `budget` into budget-sized pieces,
/// preferring newline then space breakpoints, hard-cutting only when a
/// single word overflows the budget on its own.
fn break_oversized(paragraph: &str, budget: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = paragraph;
    while rest.len() > budget {
        let window = &rest[..floor_char_boundary(rest, budget)];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or_else(|| window.len().max(first_char_len(rest)));
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

/// Largest index `<= limit` that falls on a char boundary of `s`.
fn floor_char_boundary(s: &str, limit: usize) -> usize {
    let mut boundary = limit.min(s.len());
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }
    boundary
}

fn first_char_len(s: &str) -> usize {
    s.chars().next().map(char::len_utf8).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(segments: &[Segment]) -> Vec<&str> {
        segments.iter().map(|s| s.text.as_str()).collect()
    }

    #[test]
    fn test_short_document_is_one_segment() {
        let segments = split_text("k1", "a quick note", 700);
        assert_eq!(texts(&segments), vec!["a quick note"]);
        assert_eq!(segments[0].index, 0);
        assert_eq!(segments[0].knowledge_id, "k1");
    }

    #[test]
    fn test_empty_document_still_yields_a_segment() {
        let segments = split_text("k1", "", 700);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "");
    }

    #[test]
    fn test_paragraphs_pack_greedily_within_budget() {
        // budget = 5 tokens * 4 chars: the first two paragraphs fit
        // together, the third starts a new segment.
        let text = "aaaa aaaa\n\nbbbb bbbb\n\ncccc cccc";
        let segments = split_text("k1", text, 5);
        assert_eq!(
            texts(&segments),
            vec!["aaaa aaaa\n\nbbbb bbbb", "cccc cccc"]
        );
    }

    #[test]
    fn test_oversized_paragraph_breaks_at_spaces() {
        let words: Vec<String> = (0..40).map(|i| format!("word{:02}", i)).collect();
        let text = words.join(" ");
        let budget_tokens = 6;
        let segments = split_text("k1", &text, budget_tokens);

        assert!(segments.len() > 1);
        for s in &segments {
            assert!(s.text.len() <= budget_tokens * 4);
            assert!(!s.text.ends_with(' '));
        }
        let rejoined = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(rejoined, text);
    }

    #[test]
    fn test_unbreakable_run_is_hard_cut() {
        let text = "x".repeat(100);
        let segments = split_text("k1", &text, 5);
        assert_eq!(segments.len(), 5);
        assert!(segments.iter().all(|s| s.text.len() <= 20));
    }

    #[test]
    fn test_multibyte_text_splits_on_char_boundaries() {
        let text = "日本語のテキスト".repeat(30);
        let segments = split_text("k1", &text, 4);
        assert!(segments.len() > 1);
        for s in &segments {
            // Would panic inside split_text on a mid-char cut; also check
            // the pieces survive a round trip.
            assert!(!s.text.is_empty());
        }
        let rejoined: String = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(rejoined, text);
    }

    #[test]
    fn test_indices_are_contiguous() {
        let text = (0..30)
            .map(|i| format!("paragraph number {} with some padding", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let segments = split_text("k1", &text, 12);
        assert!(segments.len() > 1);
        for (i, s) in segments.iter().enumerate() {
            assert_eq!(s.index, i as i64);
        }
    }

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        let segment = Segment {
            id: "s1".to_string(),
            knowledge_id: "k1".to_string(),
            index: 0,
            text: "héllo wörld".to_string(),
        };
        assert_eq!(segment.snippet(5), "héllo");
        assert_eq!(segment.snippet(100), "héllo wörld");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }
}
