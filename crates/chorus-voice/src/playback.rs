//! Ordered playback of synthesized chunks.
//!
//! [`PlaybackSequencer::play`] pulls results from a [`ResultStream`],
//! decodes them and writes them to an [`AudioSink`]:
//!
//! - silence is written before the first chunk and after the last one;
//! - when the next chunk declares text overlap, the last `overlap_samples`
//!   of the current chunk are held back and blended into the head of the
//!   next chunk with a smoothstep curve;
//! - [`PlaybackSequencer::stop`] lets the chunk being written finish and
//!   discards the rest of the utterance.

use crate::config::PlaybackSettings;
use crate::error::VoiceError;
use crate::scheduler::ResultStream;
use crate::sink::AudioSink;
use chorus_types::{AudioFormat, Chunk};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// What happened to an utterance on the way to the sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackReport {
    /// Indices of chunks written to the sink, in order.
    pub chunks_played: Vec<usize>,
    /// Total samples written, padding included.
    pub samples_written: usize,
    /// Whether playback ended because of [`PlaybackSequencer::stop`].
    pub stopped: bool,
}

/// Smoothstep easing, `t` in `[0, 1]`.
pub fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Blends `tail` (fading out) with the head of `head` (fading in), in place
/// on `head`. Returns the number of blended samples.
pub fn crossfade(tail: &[i16], head: &mut [i16]) -> usize {
    let n = tail.len().min(head.len());
    for i in 0..n {
        let w = smoothstep((i + 1) as f32 / (n + 1) as f32);
        let mixed = f32::from(tail[i]) * (1.0 - w) + f32::from(head[i]) * w;
        head[i] = mixed.round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
    }
    n
}

/// Decodes backend audio into samples in `format`.
///
/// WAV payloads are parsed and must match `format`; anything else is taken
/// as raw little-endian 16-bit PCM.
pub fn decode_audio(bytes: &[u8], format: AudioFormat) -> Result<Vec<i16>, VoiceError> {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        let reader = hound::WavReader::new(Cursor::new(bytes))?;
        let spec = reader.spec();
        if spec.sample_rate != format.sample_rate || spec.channels != format.channels {
            return Err(VoiceError::Audio(format!(
                "backend returned {} Hz / {} ch, sink expects {} Hz / {} ch",
                spec.sample_rate, spec.channels, format.sample_rate, format.channels
            )));
        }
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            return Err(VoiceError::Audio(format!(
                "unsupported WAV sample format: {} bit {:?}",
                spec.bits_per_sample, spec.sample_format
            )));
        }
        return reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(VoiceError::from);
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Writes utterances to a sink in chunk order.
#[derive(Debug, Clone)]
pub struct PlaybackSequencer {
    sink: Arc<dyn AudioSink>,
    settings: PlaybackSettings,
    current: Arc<Mutex<Option<watch::Sender<bool>>>>,
}

impl PlaybackSequencer {
    pub fn new(sink: Arc<dyn AudioSink>, settings: PlaybackSettings) -> Self {
        Self {
            sink,
            settings,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn sink(&self) -> &Arc<dyn AudioSink> {
        &self.sink
    }

    /// Stops the utterance currently playing after its current chunk.
    /// Returns `false` if nothing was playing.
    pub fn stop(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        match current.as_ref() {
            Some(tx) => {
                tx.send_replace(true);
                tracing::info!("playback stop requested");
                true
            }
            None => false,
        }
    }

    /// Whether an utterance is being played.
    pub fn is_playing(&self) -> bool {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Writes `duration_ms` of silence and waits for it to drain.
    pub async fn play_silence(&self, duration_ms: u64) -> Result<(), VoiceError> {
        let format = self.sink.format();
        let silence = vec![0_i16; format.frames_for_ms(duration_ms) * usize::from(format.channels)];
        self.sink.play(&silence).await?;
        self.sink.drain().await
    }

    /// Plays `stream`, whose results belong to `chunks`.
    ///
    /// # Errors
    ///
    /// Returns the first synthesis or decode error. Audio already written
    /// stays written; the remaining chunks are discarded.
    pub async fn play(&self, chunks: &[Chunk], mut stream: ResultStream) -> Result<PlaybackReport, VoiceError> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(stop_tx);

        let result = self.play_inner(chunks, &mut stream, &mut stop_rx).await;

        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
        if result.is_err() || result.as_ref().is_ok_and(|r| r.stopped) {
            stream.cancel();
        }
        result
    }

    async fn play_inner(
        &self,
        chunks: &[Chunk],
        stream: &mut ResultStream,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<PlaybackReport, VoiceError> {
        let mut report = PlaybackReport::default();
        if chunks.is_empty() {
            return Ok(report);
        }

        let format = self.sink.format();
        let crossfade_cfg = &self.settings.crossfade;
        let padding = vec![0_i16; format.frames_for_ms(self.settings.silence_padding_ms) * usize::from(format.channels)];
        let mut tail: Vec<i16> = Vec::new();

        self.write(&padding, &mut report).await?;

        loop {
            if *stop_rx.borrow() {
                report.stopped = true;
                break;
            }

            let next = tokio::select! {
                biased;
                _ = stop_rx.wait_for(|stopped| *stopped) => {
                    report.stopped = true;
                    break;
                }
                next = stream.next() => next,
            };

            let result = match next {
                Some(Ok(result)) => result,
                Some(Err(e)) => {
                    tracing::warn!(chunk_index = ?e.chunk_index(), error = %e, "aborting utterance");
                    self.write(&tail, &mut report).await?;
                    return Err(e);
                }
                None => break,
            };

            let index = result.chunk_index;
            let chunk = chunks.get(index).ok_or_else(|| {
                VoiceError::Audio(format!("result for unknown chunk {index}"))
            })?;
            let mut samples = decode_audio(&result.audio, format)?;

            let fade_in = crossfade_cfg.enabled
                && chunk.overlap_chars > 0
                && !(chunk.is_first && crossfade_cfg.skip_first_chunk);
            if fade_in && !tail.is_empty() {
                let blended = crossfade(&tail, &mut samples);
                // A chunk shorter than the tail leaves part of the tail unblended.
                if blended < tail.len() {
                    let rest = tail.split_off(blended);
                    samples.extend(rest);
                }
                tail.clear();
            } else {
                self.write(&tail, &mut report).await?;
                tail.clear();
            }

            let next_overlaps = chunks.get(index + 1).is_some_and(|next| next.overlap_chars > 0);
            if crossfade_cfg.enabled && next_overlaps && crossfade_cfg.overlap_samples > 0 {
                let keep = crossfade_cfg.overlap_samples.min(samples.len());
                tail = samples.split_off(samples.len() - keep);
            }

            tracing::debug!(chunk_index = index, samples = samples.len(), latency_ms = result.latency_ms, "playing chunk");
            self.write(&samples, &mut report).await?;
            report.chunks_played.push(index);
        }

        self.write(&tail, &mut report).await?;
        self.write(&padding, &mut report).await?;
        self.sink.drain().await?;

        if report.stopped {
            tracing::info!(played = report.chunks_played.len(), total = chunks.len(), "playback stopped");
        } else {
            tracing::debug!(played = report.chunks_played.len(), "playback finished");
        }
        Ok(report)
    }

    async fn write(&self, samples: &[i16], report: &mut PlaybackReport) -> Result<(), VoiceError> {
        if samples.is_empty() {
            return Ok(());
        }
        self.sink.play(samples).await?;
        report.samples_written += samples.len();
        Ok(())
    }
}
