mod common;

use chorus_persona::{MemoryRegistryStore, PersonaError, PersonaRegistry};
use chorus_types::{AudioFormat, PersonaId, PersonaProfile, SessionId, StyleProfile, TaskState};
use async_trait::async_trait;
use chorus_voice::{
    AudioSink, MemorySink, PlaybackSettings, SayOptions, SchedulerPolicy, SpeechService, SplitMode,
    VoiceConfig, VoiceError, VoiceRequest, VoiceResolver,
};
use common::{level, MockBackend};
use std::sync::Arc;
use std::time::Duration;

fn persona(id: &str) -> PersonaProfile {
    PersonaProfile {
        id: PersonaId::new(id),
        name: id.to_string(),
        speaker_id: format!("spk-{id}"),
        default_style: None,
        styles: vec![StyleProfile {
            name: "normal".to_string(),
            style_id: 0,
            morae_per_second: None,
        }],
    }
}

fn config() -> VoiceConfig {
    VoiceConfig {
        scheduler: SchedulerPolicy {
            delay_between_requests_ms: 0,
            ..SchedulerPolicy::default()
        },
        playback: PlaybackSettings {
            silence_padding_ms: 0,
            ..PlaybackSettings::default()
        },
        ..VoiceConfig::default()
    }
}

struct Harness {
    service: SpeechService,
    backend: Arc<MockBackend>,
    sink: Arc<MemorySink>,
}

fn service_on(backend: Arc<MockBackend>, sink: Arc<dyn AudioSink>, session: &str) -> SpeechService {
    let registry = PersonaRegistry::new(
        Arc::new(MemoryRegistryStore::new()),
        vec![persona("alma"), persona("bea")],
    );
    let resolver = VoiceResolver::new(registry, SessionId::new(session));
    SpeechService::new(&config(), resolver, backend, sink).expect("service should build")
}

fn harness_on(backend: MockBackend, sink: MemorySink) -> Harness {
    let backend = Arc::new(backend);
    let sink = Arc::new(sink);
    let service = service_on(backend.clone(), sink.clone(), "s1");
    Harness {
        service,
        backend,
        sink,
    }
}

fn harness_with(backend: MockBackend, session: &str) -> Harness {
    let backend = Arc::new(backend);
    let sink = Arc::new(MemorySink::new(AudioFormat::default()));
    let service = service_on(backend.clone(), sink.clone(), session);
    Harness {
        service,
        backend,
        sink,
    }
}

fn harness() -> Harness {
    harness_with(MockBackend::new(10), "s1")
}

fn as_persona(id: &str) -> SayOptions {
    SayOptions {
        voice: VoiceRequest {
            persona: Some(PersonaId::new(id)),
            ..VoiceRequest::default()
        },
        ..SayOptions::default()
    }
}

// ── persona operations ───────────────────────────────────────────────

#[tokio::test]
async fn assign_release_and_status() {
    let h = harness();
    assert!(h.service.status().await.unwrap().is_none());

    let reservation = h.service.assign(Some(PersonaId::new("bea"))).await.unwrap();
    assert_eq!(reservation.lease.persona_id, PersonaId::new("bea"));

    let lease = h.service.status().await.unwrap().expect("should hold a lease");
    assert_eq!(lease.persona_id, PersonaId::new("bea"));
    h.service.renew().await.expect("renew should succeed");

    let availability = h.service.availability().await.unwrap();
    assert_eq!(availability.available, vec![PersonaId::new("alma")]);

    assert_eq!(h.service.release().await.unwrap(), PersonaId::new("bea"));
    let err = h.service.release().await.expect_err("second release should fail");
    assert!(matches!(err, VoiceError::Persona(PersonaError::NotHeld(_))));
}

#[tokio::test]
async fn random_assignment_picks_a_catalog_persona() {
    let h = harness();
    let reservation = h.service.assign(None).await.unwrap();
    assert!(["alma", "bea"].contains(&reservation.lease.persona_id.as_str()));

    h.service.clear_all().await.unwrap();
    assert_eq!(h.service.availability().await.unwrap().available.len(), 2);
}

// ── speech ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn say_and_wait_plays_every_chunk() {
    // Long enough that crossfading leaves each chunk's own level audible.
    let h = harness_with(MockBackend::new(100), "s1");
    let options = SayOptions {
        split_mode: Some(SplitMode::Small),
        ..as_persona("alma")
    };
    let text = "a".repeat(80);

    let id = h.service.say_and_wait(&text, &options).await.expect("should play");
    assert_eq!(h.service.task_state(id).unwrap().state, TaskState::Done);

    let chunks = h.backend.calls().len();
    assert_eq!(chunks, 3);
    let samples = h.sink.samples();
    for index in 0..chunks {
        assert!(samples.contains(&level(index)), "chunk {index} missing");
    }
}

#[tokio::test(start_paused = true)]
async fn leased_persona_is_used_by_default() {
    let h = harness();
    h.service.assign(Some(PersonaId::new("alma"))).await.unwrap();
    h.service
        .say_and_wait("Hello there, friend.", &SayOptions::default())
        .await
        .expect("should play with the leased persona");
    assert!(!h.sink.samples().is_empty());
}

#[tokio::test]
async fn say_without_persona_or_lease_fails_synchronously() {
    let h = harness();
    let err = h
        .service
        .say("Hello there.", &SayOptions::default())
        .await
        .expect_err("should fail");
    assert!(matches!(err, VoiceError::Persona(PersonaError::NotHeld(_))));
    assert_eq!(h.service.queue_status().queue_length, 0);
}

#[tokio::test]
async fn conflicting_speed_options_fail_synchronously() {
    let h = harness();
    let mut options = as_persona("alma");
    options.voice.rate = Some(250);
    options.voice.factor = Some(1.2);
    let err = h.service.say("Hi.", &options).await.expect_err("should fail");
    assert!(matches!(err, VoiceError::InvalidOptions(_)));
}

#[tokio::test(start_paused = true)]
async fn empty_text_completes_without_audio() {
    let h = harness();
    let id = h.service.say_and_wait("   ", &as_persona("alma")).await.unwrap();
    assert_eq!(h.service.task_state(id).unwrap().state, TaskState::Done);
    assert!(h.backend.calls().is_empty());
    assert_eq!(h.sink.writes(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_task_is_isolated() {
    let h = harness_with(MockBackend::new(10).failing_at(0), "s1");
    let failing = h.service.say("Broken.", &as_persona("alma")).await.unwrap();
    h.service.wait_idle().await;

    let record = h.service.task_state(failing.task_id).unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert!(record.error.unwrap().contains("chunk 0"));
    assert!(!h.service.queue_status().is_processing);
}

#[tokio::test(start_paused = true)]
async fn unreachable_backend_fails_the_task() {
    let h = harness_with(MockBackend::new(10).disconnected(), "s1");
    let err = h
        .service
        .say_and_wait("Hello.", &as_persona("alma"))
        .await
        .expect_err("should fail");
    assert!(matches!(err, VoiceError::BackendUnreachable { .. }));
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn clear_leaves_active_utterance_alone() {
    let h = harness_with(
        MockBackend::new(10).with_default_delay(Duration::from_millis(300)),
        "s1",
    );
    let active = h.service.say("First one.", &as_persona("alma")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.service.say("Second one.", &as_persona("alma")).await.unwrap();
    let third = h.service.say("Third one.", &as_persona("alma")).await.unwrap();
    assert_eq!(third.queue_length, 2);

    let status = h.service.queue_status();
    assert!(status.is_processing);
    assert_eq!(status.active_task_id, Some(active.task_id));

    assert_eq!(h.service.clear(None), 2);
    h.service.wait_idle().await;
    assert_eq!(h.service.task_state(active.task_id).unwrap().state, TaskState::Done);
    assert_eq!(h.service.task_state(third.task_id).unwrap().state, TaskState::Cancelled);
    assert_eq!(h.backend.texts(), vec!["First one.".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn stop_cuts_the_playing_utterance_short() {
    // 2400 samples = 100 ms per chunk on a sink that plays in real time.
    let h = harness_on(MockBackend::new(2400), MemorySink::realtime(AudioFormat::default()));
    let text = "First sentence here. Second sentence here. Third sentence here. \
                Fourth sentence here. Fifth sentence here.";
    let task = h.service.say(text, &as_persona("alma")).await.unwrap();

    while !h.sink.samples().contains(&level(0)) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.service.stop());
    h.service.wait_idle().await;

    let samples = h.sink.samples();
    assert_eq!(samples.iter().filter(|&&s| s == level(0)).count(), 2400);
    for index in 1..5 {
        assert!(!samples.contains(&level(index)), "chunk {index} reached the sink");
    }

    let record = h.service.task_state(task.task_id).unwrap();
    assert_eq!(record.state, TaskState::Cancelled);
    let status = h.service.queue_status();
    assert!(!status.is_processing);
    assert_eq!(status.queue_length, 0);
    assert!(!h.service.stop(), "nothing left to stop");
}

/// Sink whose device never opens.
#[derive(Debug)]
struct BrokenSink;

#[async_trait]
impl AudioSink for BrokenSink {
    fn format(&self) -> AudioFormat {
        AudioFormat::default()
    }

    async fn play(&self, _samples: &[i16]) -> Result<(), VoiceError> {
        Err(VoiceError::Audio("device unavailable".to_string()))
    }

    async fn drain(&self) -> Result<(), VoiceError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn failed_warmup_still_completes() {
    let service = service_on(Arc::new(MockBackend::new(10)), Arc::new(BrokenSink), "s1");
    let id = service.warmup_and_wait().await.expect("warmup errors are not reported");
    assert_eq!(service.task_state(id).unwrap().state, TaskState::Done);
}

#[tokio::test(start_paused = true)]
async fn warmup_plays_silence_and_is_not_counted() {
    let h = harness();
    let warmup = h.service.warmup().unwrap();
    assert_eq!(warmup.queue_length, 0);
    h.service.wait_idle().await;

    let samples = h.sink.samples();
    assert_eq!(samples.len(), AudioFormat::default().frames_for_ms(100));
    assert!(samples.iter().all(|&s| s == 0));
}

#[tokio::test(start_paused = true)]
async fn output_option_renders_to_wav() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.wav");
    let options = SayOptions {
        output: Some(path.clone()),
        ..as_persona("alma")
    };

    h.service.say_and_wait("Hello there.", &options).await.unwrap();
    assert_eq!(h.sink.writes(), 0, "device sink should stay silent");

    let reader = hound::WavReader::open(&path).expect("should be a WAV file");
    assert_eq!(reader.spec().sample_rate, 24_000);
    let samples: Vec<i16> = reader.into_samples::<i16>().map(Result::unwrap).collect();
    assert!(samples.contains(&level(0)));
}

#[tokio::test]
async fn voices_come_from_the_backend() {
    let h = harness();
    let voices = h.service.voices().await.unwrap();
    assert_eq!(voices[0].speaker_uuid, "spk-alma");
    assert!(h.service.check_connection().await);
}
