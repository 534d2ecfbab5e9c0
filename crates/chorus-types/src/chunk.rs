//! Chunk and synthesis result types.

use serde::{Deserialize, Serialize};

/// One speakable piece of an utterance.
///
/// Indices are contiguous from 0. `is_first` is set only on index 0 and
/// `is_last` only on the final index. `overlap_chars` counts the leading
/// characters duplicated from the previous chunk; it is always 0 on the
/// first chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub index: usize,
    pub is_first: bool,
    pub is_last: bool,
    pub overlap_chars: usize,
}

impl Chunk {
    /// Text of the chunk without the prefix shared with its predecessor.
    pub fn fresh_text(&self) -> &str {
        match self.text.char_indices().nth(self.overlap_chars) {
            Some((offset, _)) => &self.text[offset..],
            None if self.overlap_chars == 0 => &self.text,
            None => "",
        }
    }
}

/// Encoded audio for one chunk, as returned by the synthesis backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisResult {
    pub chunk_index: usize,
    pub audio: Vec<u8>,
    pub latency_ms: u64,
}
