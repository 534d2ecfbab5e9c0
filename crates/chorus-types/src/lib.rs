//! Shared types for the Chorus speech workspace.
//!
//! Identifiers, task states and audio constants used by both the persona
//! reservation service and the synthesis pipeline. This crate has no I/O.

pub mod chunk;
pub mod persona;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use chunk::{Chunk, SynthesisResult};
pub use persona::{PersonaProfile, StyleProfile, VoiceSelection};

/// Sample rate requested from the synthesis backend.
pub const SYNTHESIS_SAMPLE_RATE: u32 = 24_000;

/// Sample rate the output device is opened at when it supports it.
pub const PLAYBACK_SAMPLE_RATE: u32 = 48_000;

/// Bits per sample on every PCM path.
pub const BITS_PER_SAMPLE: u16 = 16;

/// Identifier of a calling session.
///
/// Derived once per process and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a speakable persona (a voice character).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonaId(String);

impl PersonaId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PersonaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PersonaId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of an utterance task. Allocated from a per-queue counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an utterance task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Active,
    Done,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Returns `true` once the task can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Kind of work an utterance task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Speech,
    Warmup,
}

/// PCM layout of decoded audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: SYNTHESIS_SAMPLE_RATE,
            channels: 1,
        }
    }
}

impl AudioFormat {
    /// Number of frames covering `ms` milliseconds.
    pub fn frames_for_ms(&self, ms: u64) -> usize {
        (u64::from(self.sample_rate) * ms / 1000) as usize
    }
}
