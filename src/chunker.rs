//! Fixed-window text chunker.
//!
//! Splits extracted document text into overlapping character windows. Each
//! chunk records a zero-based `chunk_index` and its `[start_char, end_char)`
//! span in character offsets, so callers can map answers back into the
//! source text. The final chunk may be shorter than the window; empty input
//! yields zero chunks.

use uuid::Uuid;

use crate::models::Chunk;

/// Split `text` into windows of `window` characters overlapping by
/// `overlap` characters. `overlap` must be smaller than `window`
/// (enforced by config validation).
pub fn chunk_text(doc_id: &str, text: &str, window: usize, overlap: usize) -> Vec<Chunk> {
    debug_assert!(overlap < window);

    if text.is_empty() {
        return Vec::new();
    }

    // Byte offset of every char boundary, plus the end sentinel, so windows
    // never split a multi-byte character.
    let mut boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    boundaries.push(text.len());
    let char_count = boundaries.len() - 1;

    let step = window - overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index: i64 = 0;

    while start < char_count {
        let end = (start + window).min(char_count);
        let content = &text[boundaries[start]..boundaries[end]];

        chunks.push(Chunk {
            id: Uuid::new_v4().to_string(),
            doc_id: doc_id.to_string(),
            chunk_index: index,
            content: content.to_string(),
            start_char: start as i64,
            end_char: end as i64,
            page_number: None,
        });

        if end == char_count {
            break;
        }
        start += step;
        index += 1;
    }

    chunks
}
