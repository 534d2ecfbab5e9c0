//! Streaming text-to-speech pipeline.
//!
//! Text goes through four stages:
//!
//! 1. [`ChunkSplitter`] cuts it into chunks, on sentence punctuation or in
//!    fixed windows with overlap.
//! 2. [`SynthesisScheduler`] synthesizes chunks concurrently against a
//!    [`SynthesisBackend`] and hands results over in chunk order.
//! 3. [`PlaybackSequencer`] decodes, crossfades and pads the audio and
//!    writes it to an [`AudioSink`].
//! 4. [`UtteranceQueue`] keeps whole utterances strictly one after another.
//!
//! [`SpeechService`] combines the stages with persona resolution and is what
//! callers normally use.

pub mod backend;
pub mod chunker;
pub mod config;
pub mod error;
pub mod playback;
pub mod queue;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod sink;

pub use backend::{HttpSynthesisBackend, Speaker, SpeakerStyle, SynthesisBackend};
pub use chunker::{fixed_window, ChunkSplitter, PunctuationSettings, SplitMode, SplitSettings};
pub use config::{
    CrossfadeSettings, LatencyMode, PaddingSettings, PlaybackSettings, SchedulerPolicy,
    SynthesisSettings, VoiceConfig,
};
pub use error::VoiceError;
pub use playback::{PlaybackReport, PlaybackSequencer};
pub use queue::{Enqueued, QueueStatus, TaskRecord, UtteranceProcessor, UtteranceQueue, UtteranceTask};
pub use resolver::{resolve_speed, VoiceRequest, VoiceResolver};
pub use scheduler::{ChunkOutcome, ResultStream, SynthesisScheduler};
pub use service::{Job, SayOptions, SpeechService, Utterance, WARMUP_MS};
#[cfg(feature = "device")]
pub use sink::CpalSink;
pub use sink::{AudioSink, MemorySink, WavFileSink};
