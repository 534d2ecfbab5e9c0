//! Audio output capabilities.
//!
//! An [`AudioSink`] accepts mono 16-bit PCM at a fixed format. `play`
//! returns once the samples have been accepted; `drain` waits until
//! everything accepted so far has been rendered.

use crate::error::VoiceError;
use async_trait::async_trait;
use chorus_types::{AudioFormat, BITS_PER_SAMPLE};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[async_trait]
pub trait AudioSink: Send + Sync + std::fmt::Debug {
    /// Format the sink expects.
    fn format(&self) -> AudioFormat;

    /// Queues `samples` for output.
    async fn play(&self, samples: &[i16]) -> Result<(), VoiceError>;

    /// Waits until queued audio has been rendered.
    async fn drain(&self) -> Result<(), VoiceError>;
}

// ── Memory sink ──────────────────────────────────────────────────────

/// Sink that records everything it is given.
///
/// With `realtime` set, `play` sleeps for the duration of the samples so
/// timing behaves like a device.
#[derive(Debug)]
pub struct MemorySink {
    format: AudioFormat,
    realtime: bool,
    samples: Mutex<Vec<i16>>,
    writes: Mutex<usize>,
}

impl MemorySink {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            realtime: false,
            samples: Mutex::new(Vec::new()),
            writes: Mutex::new(0),
        }
    }

    pub fn realtime(format: AudioFormat) -> Self {
        Self {
            realtime: true,
            ..Self::new(format)
        }
    }

    /// Everything played so far.
    pub fn samples(&self) -> Vec<i16> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of non-empty `play` calls.
    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AudioSink for MemorySink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    async fn play(&self, samples: &[i16]) -> Result<(), VoiceError> {
        if samples.is_empty() {
            return Ok(());
        }
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(samples);
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        if self.realtime {
            tokio::time::sleep(duration_of(samples.len(), self.format)).await;
        }
        Ok(())
    }

    async fn drain(&self) -> Result<(), VoiceError> {
        Ok(())
    }
}

pub(crate) fn duration_of(samples: usize, format: AudioFormat) -> Duration {
    let frames = samples as u64 / u64::from(format.channels.max(1));
    Duration::from_micros(frames * 1_000_000 / u64::from(format.sample_rate.max(1)))
}

// ── WAV file sink ────────────────────────────────────────────────────

/// Sink that writes a 16-bit PCM WAV file.
///
/// The header is finalized by [`WavFileSink::finish`] or when the sink is
/// dropped.
pub struct WavFileSink {
    format: AudioFormat,
    path: PathBuf,
    writer: Mutex<Option<hound::WavWriter<BufWriter<File>>>>,
}

impl std::fmt::Debug for WavFileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavFileSink")
            .field("format", &self.format)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl WavFileSink {
    pub fn create(path: impl AsRef<Path>, format: AudioFormat) -> Result<Self, VoiceError> {
        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: BITS_PER_SAMPLE,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path.as_ref(), spec)?;
        Ok(Self {
            format,
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the final header. Later writes fail.
    pub fn finish(&self) -> Result<(), VoiceError> {
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(writer) = writer {
            writer.finalize()?;
            tracing::info!(path = %self.path.display(), "wrote WAV file");
        }
        Ok(())
    }
}

#[async_trait]
impl AudioSink for WavFileSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    async fn play(&self, samples: &[i16]) -> Result<(), VoiceError> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = guard
            .as_mut()
            .ok_or_else(|| VoiceError::Audio(format!("{} already finalized", self.path.display())))?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        Ok(())
    }

    async fn drain(&self) -> Result<(), VoiceError> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(writer) = guard.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

// ── Device sink ──────────────────────────────────────────────────────

#[cfg(feature = "device")]
pub use device::CpalSink;

#[cfg(feature = "device")]
mod device {
    use super::{duration_of, AudioSink};
    use crate::error::VoiceError;
    use async_trait::async_trait;
    use chorus_types::{AudioFormat, PLAYBACK_SAMPLE_RATE};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::collections::VecDeque;
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread::JoinHandle;
    use std::time::Duration;

    /// How far ahead of the device `play` may queue audio.
    const HIGH_WATER: Duration = Duration::from_millis(200);

    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    type Queue = Arc<Mutex<VecDeque<i16>>>;

    /// Sink playing through the default output device.
    ///
    /// The cpal stream lives on its own thread since it is not `Send` on
    /// every platform. Samples are handed over through a shared queue.
    #[derive(Debug)]
    pub struct CpalSink {
        format: AudioFormat,
        queue: Queue,
        shutdown: Mutex<Option<mpsc::Sender<()>>>,
        thread: Mutex<Option<JoinHandle<()>>>,
    }

    impl CpalSink {
        /// Opens the default output device at the playback rate, else at
        /// `format.sample_rate`, else at the device default. Rates other than
        /// `format.sample_rate` go through sample-and-hold conversion.
        pub fn open(format: AudioFormat) -> Result<Self, VoiceError> {
            let queue: Queue = Arc::new(Mutex::new(VecDeque::new()));
            let (ready_tx, ready_rx) = mpsc::channel::<Result<(), VoiceError>>();
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

            let thread_queue = queue.clone();
            let thread = std::thread::Builder::new()
                .name("chorus-audio".to_string())
                .spawn(move || {
                    let stream = match build_stream(format, thread_queue) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    let _ = shutdown_rx.recv();
                    drop(stream);
                })
                .map_err(|e| VoiceError::Audio(format!("failed to spawn audio thread: {e}")))?;

            ready_rx
                .recv()
                .map_err(|_| VoiceError::Audio("audio thread exited during startup".to_string()))??;

            Ok(Self {
                format,
                queue,
                shutdown: Mutex::new(Some(shutdown_tx)),
                thread: Mutex::new(Some(thread)),
            })
        }

        fn queued(&self) -> usize {
            self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            if let Some(tx) = self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send(());
            }
            if let Some(handle) = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = handle.join();
            }
        }
    }

    fn build_stream(format: AudioFormat, queue: Queue) -> Result<cpal::Stream, VoiceError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| VoiceError::Audio("no audio output device available".to_string()))?;

        let configs: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| VoiceError::Audio(format!("failed to query output configs: {e}")))?
            .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
            .collect();
        let supported = [PLAYBACK_SAMPLE_RATE, format.sample_rate]
            .into_iter()
            .map(cpal::SampleRate)
            .find_map(|rate| {
                configs
                    .iter()
                    .find(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
                    .map(|c| c.clone().with_sample_rate(rate))
            });
        let config = match supported {
            Some(config) => config,
            None => device
                .default_output_config()
                .map_err(|e| VoiceError::Audio(format!("no usable output config: {e}")))?,
        };
        if config.sample_format() != cpal::SampleFormat::F32 {
            return Err(VoiceError::Audio(format!(
                "unsupported device sample format {:?}",
                config.sample_format()
            )));
        }

        let channels = usize::from(config.channels());
        let device_rate = config.sample_rate().0;
        // Source samples per device frame.
        let step = f64::from(format.sample_rate) / f64::from(device_rate);
        let mut phase = 0.0_f64;
        let mut current = 0.0_f32;

        tracing::info!(device_rate, channels, source_rate = format.sample_rate, "opened audio output");

        let stream = device
            .build_output_stream(
                &config.into(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
                    for frame in data.chunks_mut(channels) {
                        phase += step;
                        while phase >= 1.0 {
                            phase -= 1.0;
                            current = queue
                                .pop_front()
                                .map_or(0.0, |s| f32::from(s) / f32::from(i16::MAX));
                        }
                        frame.fill(current);
                    }
                    if queue.is_empty() {
                        current = 0.0;
                    }
                },
                |err| tracing::error!(error = %err, "audio output stream error"),
                None,
            )
            .map_err(|e| VoiceError::Audio(format!("failed to build output stream: {e}")))?;
        stream
            .play()
            .map_err(|e| VoiceError::Audio(format!("failed to start output stream: {e}")))?;
        Ok(stream)
    }

    #[async_trait]
    impl AudioSink for CpalSink {
        fn format(&self) -> AudioFormat {
            self.format
        }

        async fn play(&self, samples: &[i16]) -> Result<(), VoiceError> {
            self.queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend(samples.iter().copied());
            while duration_of(self.queued(), self.format) > HIGH_WATER {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Ok(())
        }

        async fn drain(&self) -> Result<(), VoiceError> {
            while self.queued() > 0 {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            // Let the device flush its own buffer.
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }
    }
}
