//! Structure-aware text chunking for retrieval indexing.
//!
//! Chunks are bounded by a character budget with a configurable overlap, so
//! retrieval granularity does not depend on how the source document was
//! paginated.
//!
//! # Algorithm
//!
//! 1. **Paragraph splitting**: split on blank lines (`\n\s*\n+`)
//! 2. **Sentence splitting**: paragraphs over `chunk_size` split after `.`, `!`, `?`
//! 3. **Character windowing**: sentences still over `chunk_size` become
//!    overlapping character windows
//! 4. **Greedy packing**: pack units into chunks up to `chunk_size`
//! 5. **Overlap**: the next chunk restarts at the trailing units covering
//!    `chunk_overlap` characters
//! 6. **Tail merge**: a tiny final chunk is merged into the previous one when it fits

use fancy_regex::Regex as FancyRegex;
use once_cell::sync::Lazy;
use regex::Regex;
use tiktoken_rs::cl100k_base;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Separator inserted between packed units.
const UNIT_SEPARATOR: &str = " ";

static PARAGRAPH_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\n+").expect("Invalid paragraph split regex"));

// fancy-regex for lookbehind support
static SENTENCE_SPLIT: Lazy<FancyRegex> =
    Lazy::new(|| FancyRegex::new(r"(?<=[.!?])\s+").expect("Invalid sentence split regex"));

/// Chunk size and overlap, both in characters. Only [`ChunkingParams::new`]
/// and `Default` construct it, so `chunk_overlap < chunk_size` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl ChunkingParams {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, ChunkingError> {
        if chunk_size == 0 {
            return Err(ChunkingError::InvalidParams(
                "chunk_size must be positive".into(),
            ));
        }
        if chunk_overlap >= chunk_size {
            return Err(ChunkingError::InvalidParams(
                "chunk_overlap must be smaller than chunk_size".into(),
            ));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkingError {
    #[error("Invalid chunking parameters: {0}")]
    InvalidParams(String),
}

/// Minimal unit of text with its character length and byte offsets.
#[derive(Debug, Clone)]
struct TextUnit {
    text: String,
    chars: usize,
    byte_start: usize,
    byte_end: usize,
}

/// A chunk of text with its character length and source byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub chars: usize,
    pub byte_start: usize,
    pub byte_end: usize,
}

/// Count tokens using the cl100k_base tokenizer, falling back to a
/// four-characters-per-token estimate if the tokenizer cannot load.
pub fn count_tokens(text: &str) -> usize {
    match cl100k_base() {
        Ok(bpe) => bpe.encode_with_special_tokens(text).len(),
        Err(_) => text.chars().count().div_ceil(4),
    }
}

/// Truncate `text` to at most `max_tokens`, appending `marker` when cut.
pub fn truncate_to_tokens(text: &str, max_tokens: usize, marker: &str) -> String {
    if count_tokens(text) <= max_tokens {
        return text.to_string();
    }
    match cl100k_base() {
        Ok(bpe) => {
            let tokens = bpe.encode_with_special_tokens(text);
            let kept = &tokens[..max_tokens.min(tokens.len())];
            let mut out = bpe.decode(kept.to_vec()).unwrap_or_default();
            out.push_str(marker);
            out
        }
        Err(_) => {
            let mut out: String = text.chars().take(max_tokens * 4).collect();
            out.push_str(marker);
            out
        }
    }
}

fn split_into_paragraphs(text: &str) -> Vec<&str> {
    PARAGRAPH_SPLIT
        .split(text)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Split text into sentences using fancy-regex lookbehind.
fn split_into_sentences(text: &str) -> Vec<String> {
    // fancy-regex has no split, so walk the matches
    let mut result = Vec::new();
    let mut last_end = 0;

    let mut finder = SENTENCE_SPLIT.find_iter(text);
    while let Some(Ok(m)) = finder.next() {
        if m.start() > last_end {
            result.push(text[last_end..m.start()].to_string());
        }
        last_end = m.end();
    }

    if last_end < text.len() {
        result.push(text[last_end..].to_string());
    }

    result
}

/// Fallback: break a long span into overlapping character windows.
fn window_text(text: &str, params: &ChunkingParams, base_offset: usize) -> Vec<TextUnit> {
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total_chars = boundaries.len() - 1;
    let step = params.chunk_size.saturating_sub(params.chunk_overlap).max(1);

    let mut units = Vec::new();
    let mut start = 0;
    while start < total_chars {
        let end = (start + params.chunk_size).min(total_chars);
        let (byte_start, byte_end) = (boundaries[start], boundaries[end]);
        units.push(TextUnit {
            text: text[byte_start..byte_end].to_string(),
            chars: end - start,
            byte_start: base_offset + byte_start,
            byte_end: base_offset + byte_end,
        });
        if end == total_chars {
            break;
        }
        start += step;
    }
    units
}

/// Convert text into units (paragraphs, sentences or windows), each no longer
/// than `chunk_size` characters.
fn to_units(text: &str, params: &ChunkingParams) -> Vec<TextUnit> {
    let mut units = Vec::new();
    let mut search_start = 0;

    for para in split_into_paragraphs(text) {
        let para_start = text[search_start..]
            .find(para)
            .map(|pos| search_start + pos)
            .unwrap_or(search_start);
        let para_end = para_start + para.len();
        search_start = para_end;

        let para_chars = para.chars().count();
        if para_chars <= params.chunk_size {
            units.push(TextUnit {
                text: para.to_string(),
                chars: para_chars,
                byte_start: para_start,
                byte_end: para_end,
            });
            continue;
        }

        let mut sent_search_start = 0;
        for sent in split_into_sentences(para) {
            let sent_rel_start = para[sent_search_start..]
                .find(&sent)
                .map(|pos| sent_search_start + pos)
                .unwrap_or(sent_search_start);
            let sent_rel_end = sent_rel_start + sent.len();
            sent_search_start = sent_rel_end;

            let sent_chars = sent.chars().count();
            if sent_chars <= params.chunk_size {
                units.push(TextUnit {
                    text: sent,
                    chars: sent_chars,
                    byte_start: para_start + sent_rel_start,
                    byte_end: para_start + sent_rel_end,
                });
            } else {
                units.extend(window_text(&sent, params, para_start + sent_rel_start));
            }
        }
    }

    units
}

fn packed_len(units: &[TextUnit]) -> usize {
    let sep = UNIT_SEPARATOR.len() * units.len().saturating_sub(1);
    units.iter().map(|u| u.chars).sum::<usize>() + sep
}

/// Split text into overlapping chunks, biased toward paragraph and sentence
/// boundaries.
pub fn chunk_text(text: &str, params: &ChunkingParams) -> Vec<TextChunk> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let total_chars = text.chars().count();
    if total_chars <= params.chunk_size {
        let byte_start = text.find(trimmed).unwrap_or(0);
        return vec![TextChunk {
            text: trimmed.to_string(),
            chars: trimmed.chars().count(),
            byte_start,
            byte_end: byte_start + trimmed.len(),
        }];
    }

    let units = to_units(text, params);
    if units.is_empty() {
        return Vec::new();
    }

    let n = units.len();
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut start = 0;

    while start < n {
        let mut end = start;
        let mut len = 0;

        while end < n {
            let added = units[end].chars + if end > start { UNIT_SEPARATOR.len() } else { 0 };
            if len + added > params.chunk_size {
                break;
            }
            len += added;
            end += 1;
        }

        // Always make progress
        if end == start {
            end += 1;
        }

        spans.push((start, end));
        if end >= n {
            break;
        }

        if params.chunk_overlap == 0 {
            start = end;
            continue;
        }

        let mut overlap_acc = 0;
        let mut idx = end - 1;
        while idx > start && overlap_acc < params.chunk_overlap {
            overlap_acc += units[idx].chars;
            idx -= 1;
        }
        start = idx + 1;
    }

    // Tail merge: avoid a tiny trailing chunk when the merged chunk still fits
    if spans.len() >= 2 {
        let (last_start, last_end) = spans[spans.len() - 1];
        let (prev_start, _) = spans[spans.len() - 2];
        let last_len = packed_len(&units[last_start..last_end]);
        if last_len < params.chunk_overlap && packed_len(&units[prev_start..last_end]) <= params.chunk_size
        {
            spans.pop();
            spans.pop();
            spans.push((prev_start, last_end));
        }
    }

    spans
        .into_iter()
        .map(|(s, e)| {
            let cu = &units[s..e];
            let text = cu
                .iter()
                .map(|u| u.text.as_str())
                .collect::<Vec<_>>()
                .join(UNIT_SEPARATOR);
            TextChunk {
                chars: text.chars().count(),
                text,
                byte_start: cu.first().map(|u| u.byte_start).unwrap_or(0),
                byte_end: cu.last().map(|u| u.byte_end).unwrap_or(0),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = ChunkingParams::default();
        assert_eq!(params.chunk_size, 1000);
        assert_eq!(params.chunk_overlap, 200);
    }

    #[test]
    fn test_invalid_params() {
        assert!(ChunkingParams::new(0, 0).is_err());
        assert!(ChunkingParams::new(100, 100).is_err());
        assert!(ChunkingParams::new(100, 99).is_ok());
    }

    #[test]
    fn test_count_tokens() {
        let count = count_tokens("Hello, world!");
        assert!(count > 0);
        assert!(count < 10);
    }

    #[test]
    fn test_short_text_single_chunk() {
        let text = "This is a short text that should be a single chunk.";
        let chunks = chunk_text(text, &ChunkingParams::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].byte_start, 0);
        assert_eq!(chunks[0].byte_end, text.len());
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("", &ChunkingParams::default()).is_empty());
        assert!(chunk_text(" \n\n ", &ChunkingParams::default()).is_empty());
    }

    #[test]
    fn test_paragraph_splitting() {
        let text = "First paragraph here.\n\nSecond paragraph here.\n\nThird paragraph.";
        let paragraphs = split_into_paragraphs(text);
        assert_eq!(
            paragraphs,
            vec!["First paragraph here.", "Second paragraph here.", "Third paragraph."]
        );
    }

    #[test]
    fn test_sentence_splitting() {
        let text = "First sentence. Second sentence! Third sentence? Fourth.";
        assert_eq!(split_into_sentences(text).len(), 4);
    }

    #[test]
    fn test_chunks_respect_size_and_overlap() {
        let params = ChunkingParams::new(120, 40).unwrap();
        let text = "Inflation cooled in the third quarter. ".repeat(30);
        let chunks = chunk_text(&text, &params);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars <= params.chunk_size, "chunk too large: {}", chunk.chars);
            assert!(chunk.byte_end >= chunk.byte_start);
        }
        // consecutive chunks share trailing content
        for pair in chunks.windows(2) {
            assert!(pair[1].byte_start < pair[0].byte_end);
        }
    }

    #[test]
    fn test_windowing_always_advances() {
        let degenerate = ChunkingParams {
            chunk_size: 10,
            chunk_overlap: 10,
        };
        let units = window_text(&"x".repeat(50), &degenerate, 0);
        assert_eq!(units.len(), 41);
        assert!(units.iter().all(|u| u.chars == 10));

        let inverted = ChunkingParams {
            chunk_size: 10,
            chunk_overlap: 20,
        };
        assert_eq!(window_text(&"x".repeat(50), &inverted, 0).len(), 41);
    }

    #[test]
    fn test_unbroken_text_uses_overlapping_windows() {
        let params = ChunkingParams::new(100, 20).unwrap();
        let text = "x".repeat(250);
        let chunks = chunk_text(&text, &params);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].byte_start, 0);
        assert_eq!(chunks[1].byte_start, 80);
        assert_eq!(chunks[2].byte_start, 160);
        assert_eq!(chunks[2].byte_end, 250);
    }

    #[test]
    fn test_multibyte_text_does_not_split_codepoints() {
        let params = ChunkingParams::new(50, 10).unwrap();
        let text = "é".repeat(130);
        let chunks = chunk_text(&text, &params);
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.chars <= 50));
    }

    #[test]
    fn test_truncate_to_tokens_marks_cut() {
        let text = "word ".repeat(500);
        let out = truncate_to_tokens(&text, 10, " [truncated]");
        assert!(out.ends_with(" [truncated]"));
        assert!(out.len() < text.len());
        assert_eq!(truncate_to_tokens("short", 10, "!"), "short");
    }
}
