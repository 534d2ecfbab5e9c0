//! Synthesis backend capability.
//!
//! The pipeline talks to the neural TTS engine only through
//! [`SynthesisBackend`]. [`HttpSynthesisBackend`] speaks the engine's HTTP
//! API: `POST /v1/synthesis` returns WAV bytes for one chunk and
//! `GET /v1/speakers` lists the available speakers and styles.

use crate::config::SynthesisSettings;
use crate::error::VoiceError;
use async_trait::async_trait;
use chorus_types::{Chunk, PersonaId, PersonaProfile, StyleProfile, SynthesisResult, VoiceSelection};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Timeout for the connectivity probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// A style as listed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerStyle {
    pub style_name: String,
    pub style_id: i64,
}

/// A speaker as listed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Speaker {
    pub speaker_name: String,
    pub speaker_uuid: String,
    #[serde(default)]
    pub styles: Vec<SpeakerStyle>,
}

impl From<Speaker> for PersonaProfile {
    fn from(speaker: Speaker) -> Self {
        PersonaProfile {
            id: PersonaId::new(speaker.speaker_name.clone()),
            name: speaker.speaker_name,
            speaker_id: speaker.speaker_uuid,
            default_style: None,
            styles: speaker
                .styles
                .into_iter()
                .map(|s| StyleProfile {
                    name: s.style_name,
                    style_id: s.style_id,
                    morae_per_second: None,
                })
                .collect(),
        }
    }
}

/// Anything that can turn one chunk into encoded audio.
#[async_trait]
pub trait SynthesisBackend: Send + Sync + std::fmt::Debug {
    /// Synthesizes `chunk` with `voice`. Failures carry the chunk index.
    async fn synthesize(&self, chunk: &Chunk, voice: &VoiceSelection) -> Result<SynthesisResult, VoiceError>;

    /// Lists the backend's speakers.
    async fn speakers(&self) -> Result<Vec<Speaker>, VoiceError>;

    /// Returns `true` if the backend answers at all.
    async fn check_connection(&self) -> bool;
}

/// Request body of `POST /v1/synthesis`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesisParams<'a> {
    text: &'a str,
    speaker_uuid: &'a str,
    style_id: i64,
    speed_scale: f64,
    volume_scale: f64,
    pitch_scale: f64,
    intonation_scale: f64,
    pre_phoneme_length: f64,
    post_phoneme_length: f64,
    output_sampling_rate: u32,
}

/// Backend reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSynthesisBackend {
    client: reqwest::Client,
    base_url: String,
    settings: SynthesisSettings,
}

impl HttpSynthesisBackend {
    /// Builds a client for the backend described by `settings`.
    pub fn new(settings: SynthesisSettings) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| VoiceError::Catalog(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: settings.base_url(),
            settings,
        })
    }

    fn request_error(chunk_index: usize, e: reqwest::Error) -> VoiceError {
        let message = e.to_string();
        if e.is_connect() || e.is_timeout() {
            VoiceError::BackendUnreachable { chunk_index, message }
        } else {
            VoiceError::SynthesisFailed { chunk_index, message }
        }
    }
}

#[async_trait]
impl SynthesisBackend for HttpSynthesisBackend {
    async fn synthesize(&self, chunk: &Chunk, voice: &VoiceSelection) -> Result<SynthesisResult, VoiceError> {
        let (pre, post) = self.settings.padding.for_chunk(chunk.is_first, chunk.is_last);
        let params = SynthesisParams {
            text: &chunk.text,
            speaker_uuid: &voice.speaker_id,
            style_id: voice.style_id,
            speed_scale: voice.speed_scale,
            volume_scale: self.settings.volume_scale,
            pitch_scale: self.settings.pitch_scale,
            intonation_scale: self.settings.intonation_scale,
            pre_phoneme_length: pre,
            post_phoneme_length: post,
            output_sampling_rate: self.settings.sample_rate,
        };

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/v1/synthesis", self.base_url))
            .json(&params)
            .send()
            .await
            .map_err(|e| Self::request_error(chunk.index, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::SynthesisFailed {
                chunk_index: chunk.index,
                message: format!("HTTP {status}: {}", body.trim()),
            });
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Self::request_error(chunk.index, e))?;
        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(chunk_index = chunk.index, latency_ms, bytes = audio.len(), "chunk synthesized");

        Ok(SynthesisResult {
            chunk_index: chunk.index,
            audio: audio.to_vec(),
            latency_ms,
        })
    }

    async fn speakers(&self) -> Result<Vec<Speaker>, VoiceError> {
        let response = self
            .client
            .get(format!("{}/v1/speakers", self.base_url))
            .send()
            .await
            .map_err(|e| VoiceError::Catalog(e.to_string()))?;
        if !response.status().is_success() {
            return Err(VoiceError::Catalog(format!("HTTP {}", response.status())));
        }
        response
            .json::<Vec<Speaker>>()
            .await
            .map_err(|e| VoiceError::Catalog(format!("invalid speaker list: {e}")))
    }

    async fn check_connection(&self) -> bool {
        match self
            .client
            .get(format!("{}/v1/speakers", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::warn!(url = %self.base_url, error = %e, "synthesis backend not reachable");
                false
            }
        }
    }
}
