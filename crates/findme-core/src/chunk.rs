//! Paragraph-boundary text chunker with overlap.
//!
//! Splits extracted text into chunks of at most `chunk_size` characters.
//! Consecutive chunks share up to `chunk_overlap` characters of trailing
//! paragraphs so that a phrase straddling a boundary stays findable.
//!
//! Lengths are measured in characters, not bytes, so CJK text is cut
//! at the same logical size as Latin text.
//!
//! # Algorithm
//!
//! 1. Split text on `\n\n` paragraph boundaries and trim each paragraph.
//! 2. Hard-split any paragraph longer than `chunk_size` at the nearest
//!    newline or space boundary.
//! 3. Merge pieces into a window until adding the next piece would exceed
//!    `chunk_size`; emit the window, then drop pieces from its front until
//!    what is left fits inside `chunk_overlap` and leaves room for the next
//!    piece.
//!
//! A second pass, [`truncate_to_budget`], cuts any chunk that still exceeds
//! the embedding model's input budget.
//!
//! # Example
//!
//! ```rust
//! use findme_core::chunk::{split_text, ChunkSpec};
//!
//! let spec = ChunkSpec { chunk_size: 800, chunk_overlap: 150 };
//! let chunks = split_text("Hello world.\n\nSecond paragraph.", &spec);
//! assert_eq!(chunks.len(), 1);
//! ```

use std::collections::VecDeque;

/// Length of the `\n\n` joiner between merged paragraphs.
const SEPARATOR: &str = "\n\n";
const SEPARATOR_LEN: usize = 2;

/// Marker appended by [`truncate_to_budget`].
const BUDGET_SUFFIX: &str = "...";
/// Room kept free below the budget when truncating.
const BUDGET_MARGIN: usize = 8;

/// Chunk sizing parameters, decoupled from application config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    /// Upper bound on characters per chunk.
    pub chunk_size: usize,
    /// Characters of trailing context repeated at the start of the next chunk.
    pub chunk_overlap: usize,
}

impl Default for ChunkSpec {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            chunk_overlap: 150,
        }
    }
}

/// Split `text` into overlapping chunks bounded by `spec.chunk_size`.
///
/// Returns an empty vector when the text holds nothing but whitespace.
pub fn split_text(text: &str, spec: &ChunkSpec) -> Vec<String> {
    let max_chars = spec.chunk_size.max(1);

    let mut pieces: Vec<&str> = Vec::new();
    for para in text.split(SEPARATOR) {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        if char_len(trimmed) > max_chars {
            hard_split(trimmed, max_chars, &mut pieces);
        } else {
            pieces.push(trimmed);
        }
    }

    merge_pieces(&pieces, max_chars, spec.chunk_overlap)
}

/// Cut `chunk` to fit an embedding input budget of `max_chars` characters.
///
/// Chunks within budget are returned unchanged. Longer chunks keep their
/// first `max_chars - 8` characters followed by `...`.
pub fn truncate_to_budget(chunk: &str, max_chars: usize) -> String {
    if char_len(chunk) <= max_chars {
        return chunk.to_string();
    }
    let keep = max_chars.saturating_sub(BUDGET_MARGIN);
    let mut out: String = chunk.chars().take(keep).collect();
    out.push_str(BUDGET_SUFFIX);
    out
}

/// Number of characters (not bytes) in `s`.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn merge_pieces(pieces: &[&str], max_chars: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for &piece in pieces {
        let len = char_len(piece);
        let sep = if window.is_empty() { 0 } else { SEPARATOR_LEN };

        if !window.is_empty() && total + sep + len > max_chars {
            chunks.push(join(&window));
            while !window.is_empty() && (total > overlap || total + SEPARATOR_LEN + len > max_chars)
            {
                if let Some(front) = window.pop_front() {
                    total -= char_len(front);
                    if !window.is_empty() {
                        total -= SEPARATOR_LEN;
                    }
                }
            }
        }

        if !window.is_empty() {
            total += SEPARATOR_LEN;
        }
        window.push_back(piece);
        total += len;
    }

    if !window.is_empty() {
        chunks.push(join(&window));
    }

    chunks
}

fn join(window: &VecDeque<&str>) -> String {
    window.iter().copied().collect::<Vec<_>>().join(SEPARATOR)
}

/// Hard-split an oversized paragraph, preferring newline then space boundaries.
fn hard_split<'a>(text: &'a str, max_chars: usize, out: &mut Vec<&'a str>) {
    let mut remaining = text;
    while !remaining.is_empty() {
        if char_len(remaining) <= max_chars {
            out.push(remaining);
            break;
        }
        let limit = byte_offset(remaining, max_chars);
        let split_at = remaining[..limit]
            .rfind('\n')
            .or_else(|| remaining[..limit].rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(limit);

        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece);
        }
        remaining = remaining[split_at..].trim_start();
    }
}

/// Byte offset of the `n`-th character, or the string length.
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}
