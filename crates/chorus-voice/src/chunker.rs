//! Text chunking for streaming synthesis.
//!
//! Two strategies are offered. Punctuation splitting (the default) follows
//! sentence boundaries and never overlaps. Fixed-window splitting slides a
//! window of `size` characters forward by `size - overlap`, so every chunk
//! after the first repeats the tail of its predecessor; the playback side
//! uses that overlap for crossfading.
//!
//! All sizes are measured in characters, not bytes.

use crate::error::VoiceError;
use chorus_types::Chunk;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sentence terminators that always end a sentence.
const CJK_TERMINATORS: [char; 3] = ['。', '！', '？'];

/// Sentence terminators that end a sentence only before whitespace or the end.
const ASCII_TERMINATORS: [char; 3] = ['.', '!', '?'];

/// Closing marks that stay attached to the sentence they close.
const CLOSERS: [char; 7] = ['」', '』', '）', ')', '"', '\'', '”'];

/// Comma-like marks a long sentence may be broken at.
const COMMAS: [char; 3] = ['、', ',', '，'];

/// How text is cut into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    /// The whole text as one chunk.
    None,
    /// Fixed window of `small_size` characters.
    Small,
    /// Fixed window of `medium_size` characters.
    Medium,
    /// Fixed window of `large_size` characters.
    Large,
    /// Sentence boundaries.
    #[default]
    Punctuation,
}

impl FromStr for SplitMode {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "small" => Ok(Self::Small),
            "medium" | "auto" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            "punctuation" => Ok(Self::Punctuation),
            other => Err(VoiceError::InvalidOptions(format!("unknown split mode: {other}"))),
        }
    }
}

impl fmt::Display for SplitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Punctuation => "punctuation",
        })
    }
}

fn default_small_size() -> usize {
    30
}

fn default_medium_size() -> usize {
    50
}

fn default_large_size() -> usize {
    100
}

fn default_overlap_ratio() -> f64 {
    0.1
}

fn default_max_chunk_chars() -> usize {
    150
}

fn default_min_chunk_chars() -> usize {
    10
}

fn default_true() -> bool {
    true
}

/// Sentence splitting limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PunctuationSettings {
    /// Sentences longer than this are split further.
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    /// Sentences shorter than this are merged with a neighbour.
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
    /// Whether long sentences may be broken at commas before falling back
    /// to a hard split by length.
    #[serde(default = "default_true")]
    pub allow_comma_split: bool,
}

impl Default for PunctuationSettings {
    fn default() -> Self {
        Self {
            max_chunk_chars: default_max_chunk_chars(),
            min_chunk_chars: default_min_chunk_chars(),
            allow_comma_split: true,
        }
    }
}

/// Window sizes for the fixed-window modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSettings {
    #[serde(default = "default_small_size")]
    pub small_size: usize,
    #[serde(default = "default_medium_size")]
    pub medium_size: usize,
    #[serde(default = "default_large_size")]
    pub large_size: usize,
    /// Overlap as a fraction of the window size.
    #[serde(default = "default_overlap_ratio")]
    pub overlap_ratio: f64,
    #[serde(default)]
    pub punctuation: PunctuationSettings,
}

impl Default for SplitSettings {
    fn default() -> Self {
        Self {
            small_size: default_small_size(),
            medium_size: default_medium_size(),
            large_size: default_large_size(),
            overlap_ratio: default_overlap_ratio(),
            punctuation: PunctuationSettings::default(),
        }
    }
}

impl SplitSettings {
    /// Window size and overlap for a fixed-window mode.
    pub fn window(&self, mode: SplitMode) -> Option<(usize, usize)> {
        let size = match mode {
            SplitMode::Small => self.small_size,
            SplitMode::Medium => self.medium_size,
            SplitMode::Large => self.large_size,
            SplitMode::None | SplitMode::Punctuation => return None,
        };
        let overlap = (size as f64 * self.overlap_ratio).round() as usize;
        Some((size, overlap))
    }
}

/// Splits utterance text into chunks.
#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    settings: SplitSettings,
}

impl ChunkSplitter {
    /// Creates a splitter after validating `settings`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidChunkConfiguration` if a window size is zero, the
    /// overlap ratio is outside `[0, 1)`, a window's rounded overlap is zero
    /// or fills the whole window, or the punctuation limits cannot guarantee
    /// that two short sentences fit into one chunk.
    pub fn new(settings: SplitSettings) -> Result<Self, VoiceError> {
        if !(0.0..1.0).contains(&settings.overlap_ratio) {
            return Err(VoiceError::InvalidChunkConfiguration(format!(
                "overlap ratio must be in [0, 1), got {}",
                settings.overlap_ratio
            )));
        }
        for mode in [SplitMode::Small, SplitMode::Medium, SplitMode::Large] {
            if let Some((size, overlap)) = settings.window(mode) {
                validate_window(size, overlap)?;
            }
        }
        let p = &settings.punctuation;
        if p.max_chunk_chars == 0 || p.min_chunk_chars.saturating_mul(2) > p.max_chunk_chars {
            return Err(VoiceError::InvalidChunkConfiguration(format!(
                "punctuation limits need 0 < 2 * min <= max, got min {} max {}",
                p.min_chunk_chars, p.max_chunk_chars
            )));
        }
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &SplitSettings {
        &self.settings
    }

    /// Splits `text` according to `mode`.
    ///
    /// Empty or whitespace-only text yields no chunks in every mode.
    pub fn split(&self, text: &str, mode: SplitMode) -> Result<Vec<Chunk>, VoiceError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        match mode {
            SplitMode::None => Ok(finish(vec![text.to_string()], 0)),
            SplitMode::Punctuation => Ok(self.split_punctuation(text)),
            fixed => {
                let (size, overlap) = self.settings.window(fixed).ok_or_else(|| {
                    VoiceError::InvalidChunkConfiguration(format!("{fixed} has no window"))
                })?;
                fixed_window(text, size, overlap)
            }
        }
    }

    fn split_punctuation(&self, text: &str) -> Vec<Chunk> {
        let limits = &self.settings.punctuation;
        let sentences = sentence_spans(text);
        if sentences.is_empty() {
            return finish(
                hard_split(text, (0, text.len()), limits.max_chunk_chars)
                    .into_iter()
                    .map(|(s, e)| text[s..e].to_string())
                    .collect(),
                0,
            );
        }

        let mut pieces = Vec::new();
        for span in sentences {
            if char_len(text, span) <= limits.max_chunk_chars {
                pieces.push(span);
            } else if limits.allow_comma_split {
                pieces.extend(comma_split(text, span, limits.max_chunk_chars));
            } else {
                pieces.extend(hard_split(text, span, limits.max_chunk_chars));
            }
        }

        let merged = merge_short(text, pieces, limits.min_chunk_chars, limits.max_chunk_chars);
        finish(merged.into_iter().map(|(s, e)| text[s..e].to_string()).collect(), 0)
    }
}

fn validate_window(size: usize, overlap: usize) -> Result<(), VoiceError> {
    if size == 0 {
        return Err(VoiceError::InvalidChunkConfiguration(
            "chunk size must be positive".to_string(),
        ));
    }
    if overlap == 0 || overlap >= size {
        return Err(VoiceError::InvalidChunkConfiguration(format!(
            "overlap must be between 1 and {} for chunk size {size}, got {overlap}",
            size.saturating_sub(1)
        )));
    }
    Ok(())
}

/// Fixed-window split of `text` with `size` characters per chunk, each chunk
/// after the first repeating `overlap` characters of its predecessor.
///
/// # Errors
///
/// Returns `InvalidChunkConfiguration` unless `0 < overlap < size`.
pub fn fixed_window(text: &str, size: usize, overlap: usize) -> Result<Vec<Chunk>, VoiceError> {
    validate_window(size, overlap)?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let chars: Vec<char> = text.chars().collect();
    let step = size - overlap;
    let mut texts = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(chars.len());
        texts.push(chars[start..end].iter().collect::<String>());
        if end >= chars.len() {
            break;
        }
        start += step;
    }
    Ok(finish(texts, overlap))
}

/// Numbers chunk texts and sets the first/last flags.
fn finish(texts: Vec<String>, overlap: usize) -> Vec<Chunk> {
    let last = texts.len().saturating_sub(1);
    texts
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            text,
            index,
            is_first: index == 0,
            is_last: index == last,
            overlap_chars: if index == 0 { 0 } else { overlap },
        })
        .collect()
}

type Span = (usize, usize);

fn char_len(text: &str, (start, end): Span) -> usize {
    text[start..end].chars().count()
}

/// Shrinks a byte span to exclude surrounding whitespace.
fn trim_span(text: &str, (start, end): Span) -> Option<Span> {
    let slice = &text[start..end];
    let leading = slice.len() - slice.trim_start().len();
    let trailing = slice.len() - slice.trim_end().len();
    let span = (start + leading, end - trailing);
    (span.0 < span.1).then_some(span)
}

/// Byte spans of sentences, or nothing if the text has no terminator at all.
fn sentence_spans(text: &str) -> Vec<Span> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut spans = Vec::new();
    let mut found_terminator = false;
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        let (_, c) = chars[i];
        let is_boundary = if CJK_TERMINATORS.contains(&c) {
            true
        } else if ASCII_TERMINATORS.contains(&c) {
            // "3.14" stays together.
            chars
                .get(i + 1)
                .map_or(true, |&(_, next)| {
                    next.is_whitespace()
                        || CJK_TERMINATORS.contains(&next)
                        || ASCII_TERMINATORS.contains(&next)
                        || CLOSERS.contains(&next)
                })
        } else {
            false
        };

        if is_boundary {
            found_terminator = true;
            let mut j = i + 1;
            while j < chars.len()
                && (CJK_TERMINATORS.contains(&chars[j].1)
                    || ASCII_TERMINATORS.contains(&chars[j].1)
                    || CLOSERS.contains(&chars[j].1))
            {
                j += 1;
            }
            let end = chars.get(j).map_or(text.len(), |&(offset, _)| offset);
            spans.extend(trim_span(text, (start, end)));
            start = end;
            i = j;
        } else {
            i += 1;
        }
    }

    if !found_terminator {
        return Vec::new();
    }
    spans.extend(trim_span(text, (start, text.len())));
    spans
}

/// Splits an over-long sentence at commas, packing parts greedily up to
/// `max` characters. Parts still longer than `max` are split by length.
fn comma_split(text: &str, span: Span, max: usize) -> Vec<Span> {
    let mut parts = Vec::new();
    let mut part_start = span.0;
    for (offset, c) in text[span.0..span.1].char_indices() {
        if COMMAS.contains(&c) {
            let end = span.0 + offset + c.len_utf8();
            parts.push((part_start, end));
            part_start = end;
        }
    }
    if part_start < span.1 {
        parts.push((part_start, span.1));
    }

    let mut packed: Vec<Span> = Vec::new();
    let mut current: Option<Span> = None;
    for part in parts {
        current = match current {
            Some(cur) if char_len(text, (cur.0, part.1)) <= max => Some((cur.0, part.1)),
            Some(cur) => {
                packed.push(cur);
                Some(part)
            }
            None => Some(part),
        };
    }
    packed.extend(current);

    packed
        .into_iter()
        .flat_map(|p| {
            if char_len(text, p) > max {
                hard_split(text, p, max)
            } else {
                trim_span(text, p).into_iter().collect()
            }
        })
        .collect()
}

/// Splits a span into pieces of at most `max` characters.
fn hard_split(text: &str, span: Span, max: usize) -> Vec<Span> {
    let mut pieces = Vec::new();
    let mut piece_start = span.0;
    let mut count = 0;
    for (offset, _) in text[span.0..span.1].char_indices() {
        if count == max {
            pieces.extend(trim_span(text, (piece_start, span.0 + offset)));
            piece_start = span.0 + offset;
            count = 0;
        }
        count += 1;
    }
    pieces.extend(trim_span(text, (piece_start, span.1)));
    pieces
}

/// Merges neighbouring pieces so that no two adjacent results are both
/// shorter than `min`.
///
/// A short piece is merged with its neighbour when the result stays within
/// `max`; two short pieces are always merged.
fn merge_short(text: &str, pieces: Vec<Span>, min: usize, max: usize) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for piece in pieces {
        if let Some(last) = merged.last_mut() {
            let last_short = char_len(text, *last) < min;
            let piece_short = char_len(text, piece) < min;
            let fits = char_len(text, (last.0, piece.1)) <= max;
            if (last_short && piece_short) || ((last_short || piece_short) && fits) {
                last.1 = piece.1;
                continue;
            }
        }
        merged.push(piece);
    }
    merged
}
