//! Caller-facing speech operations.
//!
//! [`SpeechService`] wires a splitter, a voice resolver, the synthesis
//! scheduler, a playback sequencer and an utterance queue together. Text and
//! voice options are validated synchronously in [`SpeechService::say`];
//! everything after the task is queued is reported through the queue.

use crate::backend::{Speaker, SynthesisBackend};
use crate::chunker::{ChunkSplitter, SplitMode};
use crate::config::{PlaybackSettings, VoiceConfig};
use crate::error::VoiceError;
use crate::playback::PlaybackSequencer;
use crate::queue::{Enqueued, QueueStatus, TaskRecord, UtteranceProcessor, UtteranceQueue, UtteranceTask};
use crate::resolver::{VoiceRequest, VoiceResolver};
use crate::scheduler::SynthesisScheduler;
use crate::sink::{AudioSink, WavFileSink};
use async_trait::async_trait;
use chorus_persona::{Availability, PersonaError, PersonaRegistry, Reservation, SessionLease};
use chorus_types::{AudioFormat, Chunk, PersonaId, PersonaProfile, SessionId, TaskId, TaskKind, VoiceSelection};
use std::path::PathBuf;
use std::sync::Arc;

/// Length of the silence played by a warmup task.
pub const WARMUP_MS: u64 = 100;

/// Per-request options of [`SpeechService::say`].
#[derive(Debug, Clone, Default)]
pub struct SayOptions {
    pub voice: VoiceRequest,
    /// Overrides the configured split mode.
    pub split_mode: Option<SplitMode>,
    /// Render to this WAV file instead of the sink.
    pub output: Option<PathBuf>,
}

/// A validated utterance waiting in the queue.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub chunks: Vec<Chunk>,
    pub voice: VoiceSelection,
    pub output: Option<PathBuf>,
}

/// Payload of a queue task.
#[derive(Debug, Clone)]
pub enum Job {
    Speech(Utterance),
    Warmup,
}

/// Runs queued jobs: synthesis then playback.
#[derive(Debug)]
struct Pipeline {
    backend: Arc<dyn SynthesisBackend>,
    scheduler: SynthesisScheduler,
    sequencer: PlaybackSequencer,
    playback: PlaybackSettings,
    file_format: AudioFormat,
}

impl Pipeline {
    async fn speak(&self, id: TaskId, utterance: &Utterance) -> Result<(), VoiceError> {
        if utterance.chunks.is_empty() {
            tracing::debug!(task_id = %id, "empty utterance, nothing to play");
            return Ok(());
        }
        if !self.backend.check_connection().await {
            return Err(VoiceError::BackendUnreachable {
                chunk_index: 0,
                message: "synthesis backend did not answer the connection check".to_string(),
            });
        }

        tracing::info!(
            task_id = %id,
            persona = %utterance.voice.persona,
            style = %utterance.voice.style_name,
            chunks = utterance.chunks.len(),
            "speaking"
        );
        let stream = self
            .scheduler
            .run(utterance.chunks.clone(), utterance.voice.clone());

        match &utterance.output {
            None => {
                let report = self.sequencer.play(&utterance.chunks, stream).await?;
                if report.stopped {
                    return Err(VoiceError::Cancelled);
                }
            }
            Some(path) => {
                let sink = Arc::new(WavFileSink::create(path, self.file_format)?);
                let sequencer = PlaybackSequencer::new(sink.clone(), self.playback.clone());
                sequencer.play(&utterance.chunks, stream).await?;
                sink.finish()?;
                tracing::info!(task_id = %id, path = %path.display(), "utterance written");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UtteranceProcessor<Job> for Pipeline {
    async fn process(&self, task: &UtteranceTask<Job>) -> Result<(), VoiceError> {
        match &task.payload {
            Job::Speech(utterance) => self.speak(task.id, utterance).await,
            Job::Warmup => {
                if let Err(e) = self.sequencer.play_silence(WARMUP_MS).await {
                    tracing::warn!(task_id = %task.id, error = %e, "audio warmup failed");
                }
                Ok(())
            }
        }
    }
}

/// Speech and persona operations for one session.
#[derive(Debug)]
pub struct SpeechService {
    config: VoiceConfig,
    splitter: ChunkSplitter,
    resolver: VoiceResolver,
    backend: Arc<dyn SynthesisBackend>,
    sequencer: PlaybackSequencer,
    queue: UtteranceQueue<Job>,
}

impl SpeechService {
    /// Builds the service and starts its queue worker. Must be called inside
    /// a tokio runtime.
    ///
    /// # Errors
    ///
    /// `InvalidChunkConfiguration` or `InvalidOptions` when `config` does
    /// not describe a usable pipeline.
    pub fn new(
        config: &VoiceConfig,
        resolver: VoiceResolver,
        backend: Arc<dyn SynthesisBackend>,
        sink: Arc<dyn AudioSink>,
    ) -> Result<Self, VoiceError> {
        let config = config.effective();
        let splitter = ChunkSplitter::new(config.chunking.clone())?;
        let scheduler = SynthesisScheduler::new(backend.clone(), config.scheduler.clone())?;
        let sequencer = PlaybackSequencer::new(sink, config.playback.clone());
        let pipeline = Pipeline {
            backend: backend.clone(),
            scheduler,
            sequencer: sequencer.clone(),
            playback: config.playback.clone(),
            file_format: AudioFormat {
                sample_rate: config.synthesis.sample_rate,
                channels: 1,
            },
        };
        Ok(Self {
            config,
            splitter,
            resolver,
            backend,
            sequencer,
            queue: UtteranceQueue::new(Arc::new(pipeline)),
        })
    }

    /// Effective configuration, latency preset applied.
    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionId {
        self.resolver.session()
    }

    pub fn catalog(&self) -> &[PersonaProfile] {
        self.resolver.registry().catalog()
    }

    async fn with_registry<R, F>(&self, f: F) -> Result<R, VoiceError>
    where
        R: Send + 'static,
        F: FnOnce(&PersonaRegistry, &SessionId) -> Result<R, PersonaError> + Send + 'static,
    {
        let registry = self.resolver.registry().clone();
        let session = self.resolver.session().clone();
        let result = tokio::task::spawn_blocking(move || f(&registry, &session)).await??;
        Ok(result)
    }

    // ── persona operations ──────────────────────────────────────────

    /// Reserves `persona` for this session, or a random available persona.
    pub async fn assign(&self, persona: Option<PersonaId>) -> Result<Reservation, VoiceError> {
        self.with_registry(move |registry, session| match persona {
            Some(persona) => registry.reserve(&persona, session),
            None => registry.reserve_random(session),
        })
        .await
    }

    /// Releases this session's persona and returns it.
    pub async fn release(&self) -> Result<PersonaId, VoiceError> {
        self.with_registry(|registry, session| registry.release(session))
            .await
    }

    pub async fn renew(&self) -> Result<SessionLease, VoiceError> {
        self.with_registry(|registry, session| registry.renew(session))
            .await
    }

    /// This session's live lease, if any.
    pub async fn status(&self) -> Result<Option<SessionLease>, VoiceError> {
        self.with_registry(|registry, session| registry.status(session))
            .await
    }

    pub async fn availability(&self) -> Result<Availability, VoiceError> {
        self.with_registry(|registry, _| registry.availability())
            .await
    }

    /// Drops every reservation of every session.
    pub async fn clear_all(&self) -> Result<(), VoiceError> {
        self.with_registry(|registry, _| registry.clear_all())
            .await
    }

    // ── speech operations ───────────────────────────────────────────

    async fn prepare(&self, text: &str, options: &SayOptions) -> Result<Utterance, VoiceError> {
        let mode = options.split_mode.unwrap_or(self.config.split_mode);
        let chunks = self.splitter.split(text, mode)?;
        let resolver = self.resolver.clone();
        let request = options.voice.clone();
        let voice = tokio::task::spawn_blocking(move || resolver.resolve(&request)).await??;
        Ok(Utterance {
            chunks,
            voice,
            output: options.output.clone(),
        })
    }

    /// Validates and queues an utterance without waiting for it.
    ///
    /// # Errors
    ///
    /// Chunking, voice resolution and persona errors are returned here;
    /// synthesis and playback errors only reach [`Self::task_state`].
    pub async fn say(&self, text: &str, options: &SayOptions) -> Result<Enqueued, VoiceError> {
        let utterance = self.prepare(text, options).await?;
        self.queue.enqueue(TaskKind::Speech, Job::Speech(utterance))
    }

    /// Like [`Self::say`] but resolves once playback has finished.
    pub async fn say_and_wait(&self, text: &str, options: &SayOptions) -> Result<TaskId, VoiceError> {
        let utterance = self.prepare(text, options).await?;
        self.queue
            .enqueue_and_wait(TaskKind::Speech, Job::Speech(utterance))
            .await
    }

    /// Queues a short silence to wake the output device.
    pub fn warmup(&self) -> Result<Enqueued, VoiceError> {
        self.queue.enqueue(TaskKind::Warmup, Job::Warmup)
    }

    pub async fn warmup_and_wait(&self) -> Result<TaskId, VoiceError> {
        self.queue
            .enqueue_and_wait(TaskKind::Warmup, Job::Warmup)
            .await
    }

    /// Removes queued utterances. See [`UtteranceQueue::clear`].
    pub fn clear(&self, ids: Option<&[TaskId]>) -> usize {
        self.queue.clear(ids)
    }

    /// Stops the utterance playing now after its current chunk. The task
    /// ends as `Cancelled`. Returns `false` when nothing was playing.
    pub fn stop(&self) -> bool {
        self.sequencer.stop()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskRecord> {
        self.queue.task_state(id)
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    // ── backend ─────────────────────────────────────────────────────

    /// Speakers and styles offered by the backend.
    pub async fn voices(&self) -> Result<Vec<Speaker>, VoiceError> {
        self.backend.speakers().await
    }

    pub async fn check_connection(&self) -> bool {
        self.backend.check_connection().await
    }
}
