//! Pipeline settings.
//!
//! Every section deserializes with defaults so a partial TOML table is
//! enough. A [`LatencyMode`], when set, replaces split sizes, backend
//! padding and crossfade settings with its preset.

use crate::chunker::{SplitMode, SplitSettings};
use chorus_types::SYNTHESIS_SAMPLE_RATE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    50032
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_sample_rate() -> u32 {
    SYNTHESIS_SAMPLE_RATE
}

fn default_volume_scale() -> f64 {
    1.0
}

fn default_intonation_scale() -> f64 {
    1.0
}

fn default_phoneme_secs() -> f64 {
    0.01
}

fn default_max_concurrency() -> usize {
    2
}

fn default_delay_ms() -> u64 {
    50
}

fn default_buffer_ahead() -> usize {
    1
}

fn default_silence_padding_ms() -> u64 {
    50
}

fn default_overlap_samples() -> usize {
    24
}

fn default_true() -> bool {
    true
}

/// Silence the backend adds around each synthesized chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaddingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Leading silence in seconds. Inner chunks get half.
    #[serde(default = "default_phoneme_secs")]
    pub pre_phoneme_secs: f64,
    /// Trailing silence in seconds. Inner chunks get half.
    #[serde(default = "default_phoneme_secs")]
    pub post_phoneme_secs: f64,
    /// Pad only the first chunk of an utterance.
    #[serde(default = "default_true")]
    pub first_chunk_only: bool,
}

impl Default for PaddingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            pre_phoneme_secs: default_phoneme_secs(),
            post_phoneme_secs: default_phoneme_secs(),
            first_chunk_only: true,
        }
    }
}

impl PaddingSettings {
    /// Pre and post padding in seconds for a chunk with the given position.
    pub fn for_chunk(&self, is_first: bool, is_last: bool) -> (f64, f64) {
        if !self.enabled || (self.first_chunk_only && !is_first) {
            return (0.0, 0.0);
        }
        let pre = if is_first { self.pre_phoneme_secs } else { self.pre_phoneme_secs / 2.0 };
        let post = if is_last { self.post_phoneme_secs } else { self.post_phoneme_secs / 2.0 };
        (pre, post)
    }
}

/// Connection and voice parameters for the synthesis backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Sample rate requested from the backend.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_volume_scale")]
    pub volume_scale: f64,
    #[serde(default)]
    pub pitch_scale: f64,
    #[serde(default = "default_intonation_scale")]
    pub intonation_scale: f64,
    #[serde(default)]
    pub padding: PaddingSettings,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_ms: default_request_timeout_ms(),
            sample_rate: default_sample_rate(),
            volume_scale: default_volume_scale(),
            pitch_scale: 0.0,
            intonation_scale: default_intonation_scale(),
            padding: PaddingSettings::default(),
        }
    }
}

impl SynthesisSettings {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Dispatch policy of the synthesis scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerPolicy {
    /// Upper bound on synthesis requests in flight.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Minimum gap between two dispatch starts, in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_between_requests_ms: u64,
    /// How many chunks past the next undelivered one may be dispatched.
    #[serde(default = "default_buffer_ahead")]
    pub buffer_ahead_count: usize,
    /// Dispatch one request at a time until chunk 0 has come back.
    #[serde(default = "default_true")]
    pub pause_until_first_complete: bool,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            delay_between_requests_ms: default_delay_ms(),
            buffer_ahead_count: default_buffer_ahead(),
            pause_until_first_complete: true,
        }
    }
}

impl SchedulerPolicy {
    pub fn delay_between_requests(&self) -> Duration {
        Duration::from_millis(self.delay_between_requests_ms)
    }
}

/// Boundary blending between overlapping chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossfadeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Never fade into the first chunk.
    #[serde(default = "default_true")]
    pub skip_first_chunk: bool,
    /// Length of the blended region in samples.
    #[serde(default = "default_overlap_samples")]
    pub overlap_samples: usize,
}

impl Default for CrossfadeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            skip_first_chunk: true,
            overlap_samples: default_overlap_samples(),
        }
    }
}

/// Output-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSettings {
    /// Silence written before the first and after the last chunk.
    #[serde(default = "default_silence_padding_ms")]
    pub silence_padding_ms: u64,
    #[serde(default)]
    pub crossfade: CrossfadeSettings,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            silence_padding_ms: default_silence_padding_ms(),
            crossfade: CrossfadeSettings::default(),
        }
    }
}

/// Presets trading latency against smoothness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LatencyMode {
    UltraLow,
    Balanced,
    Quality,
}

/// Everything the pipeline needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub synthesis: SynthesisSettings,
    #[serde(default)]
    pub chunking: SplitSettings,
    /// Split mode used when a request does not name one.
    #[serde(default)]
    pub split_mode: SplitMode,
    #[serde(default)]
    pub scheduler: SchedulerPolicy,
    #[serde(default)]
    pub playback: PlaybackSettings,
    #[serde(default)]
    pub latency_mode: Option<LatencyMode>,
}

impl VoiceConfig {
    /// Returns the configuration with the latency preset, if any, applied.
    pub fn effective(&self) -> Self {
        let mut config = self.clone();
        let Some(mode) = self.latency_mode else {
            return config;
        };

        let (sizes, ratio) = match mode {
            LatencyMode::UltraLow => ((20, 30, 50), 0.05),
            LatencyMode::Balanced => ((30, 50, 100), 0.1),
            LatencyMode::Quality => ((40, 70, 150), 0.15),
        };
        config.chunking.small_size = sizes.0;
        config.chunking.medium_size = sizes.1;
        config.chunking.large_size = sizes.2;
        config.chunking.overlap_ratio = ratio;

        config.synthesis.padding = match mode {
            LatencyMode::UltraLow => PaddingSettings {
                enabled: false,
                pre_phoneme_secs: 0.0,
                post_phoneme_secs: 0.0,
                first_chunk_only: true,
            },
            LatencyMode::Balanced => PaddingSettings::default(),
            LatencyMode::Quality => PaddingSettings {
                enabled: true,
                pre_phoneme_secs: 0.02,
                post_phoneme_secs: 0.02,
                first_chunk_only: false,
            },
        };

        config.playback.crossfade = match mode {
            LatencyMode::UltraLow => CrossfadeSettings {
                enabled: false,
                skip_first_chunk: true,
                overlap_samples: 0,
            },
            LatencyMode::Balanced => CrossfadeSettings::default(),
            LatencyMode::Quality => CrossfadeSettings {
                enabled: true,
                skip_first_chunk: false,
                overlap_samples: 48,
            },
        };
        config
    }
}
