//! Splitting extracted text into bounded passages for embedding.

use serde::{Deserialize, Serialize};

pub mod handoff;

pub use handoff::{ChunkHandoff, HandoffReport};

/// Default chunk bound in characters.
pub const DEFAULT_MAX_CHARS: usize = 500;

/// A bounded passage of extracted text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position within the material.
    pub index: usize,
    pub content: String,
    pub material_id: String,
    pub user_id: String,
    /// Which extraction produced the text, e.g. `ocr` or `asr`.
    pub source: String,
}

/// Splits `text` into chunks of at most `max_chars` characters.
///
/// Lines are trimmed, blank lines dropped, and consecutive lines joined
/// with `\n` while the result stays within the bound. A line is never
/// split; a single line longer than the bound becomes its own chunk.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let line_len = line.chars().count();

        if current_len > 0 && current_len + 1 + line_len > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if current_len > 0 {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Splits `text` and tags every chunk with its provenance.
pub fn chunk_text(
    text: &str,
    max_chars: usize,
    material_id: &str,
    user_id: &str,
    source: &str,
) -> Vec<Chunk> {
    split_text(text, max_chars)
        .into_iter()
        .enumerate()
        .map(|(index, content)| Chunk {
            index,
            content,
            material_id: material_id.to_string(),
            user_id: user_id.to_string(),
            source: source.to_string(),
        })
        .collect()
}
