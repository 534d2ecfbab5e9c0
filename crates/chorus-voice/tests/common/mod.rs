//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chorus_types::{AudioFormat, Chunk, PersonaId, SynthesisResult, VoiceSelection};
use chorus_voice::{Speaker, SpeakerStyle, SynthesisBackend, VoiceError};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Encodes `samples` as a mono 16-bit WAV at the default synthesis rate.
pub fn wav_bytes(samples: &[i16]) -> Vec<u8> {
    let format = AudioFormat::default();
    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("should create writer");
    for &sample in samples {
        writer.write_sample(sample).expect("should write sample");
    }
    writer.finalize().expect("should finalize");
    cursor.into_inner()
}

/// Sample value the mock backend uses for chunk `index`.
pub fn level(index: usize) -> i16 {
    ((index + 1) * 100) as i16
}

/// Backend that returns constant-level audio per chunk after a configurable
/// delay and records what it was asked for.
#[derive(Debug)]
pub struct MockBackend {
    samples_per_chunk: usize,
    default_delay: Duration,
    delays: HashMap<usize, Duration>,
    failures: HashSet<usize>,
    panics: HashSet<usize>,
    connected: AtomicBool,
    calls: Mutex<Vec<(usize, Instant)>>,
    texts: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockBackend {
    pub fn new(samples_per_chunk: usize) -> Self {
        Self {
            samples_per_chunk,
            default_delay: Duration::from_millis(10),
            delays: HashMap::new(),
            failures: HashSet::new(),
            panics: HashSet::new(),
            connected: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            texts: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, index: usize, delay: Duration) -> Self {
        self.delays.insert(index, delay);
        self
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn failing_at(mut self, index: usize) -> Self {
        self.failures.insert(index);
        self
    }

    /// Panics inside `synthesize` for chunk `index`, after its delay.
    pub fn panicking_at(mut self, index: usize) -> Self {
        self.panics.insert(index);
        self
    }

    pub fn disconnected(self) -> Self {
        self.connected.store(false, Ordering::SeqCst);
        self
    }

    /// Chunk indices in dispatch order.
    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().iter().map(|(i, _)| *i).collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisBackend for MockBackend {
    async fn synthesize(&self, chunk: &Chunk, _voice: &VoiceSelection) -> Result<SynthesisResult, VoiceError> {
        self.calls.lock().unwrap().push((chunk.index, Instant::now()));
        self.texts.lock().unwrap().push(chunk.text.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(&chunk.index).copied().unwrap_or(self.default_delay);
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panics.contains(&chunk.index) {
            panic!("mock backend panicked on chunk {}", chunk.index);
        }
        if self.failures.contains(&chunk.index) {
            return Err(VoiceError::SynthesisFailed {
                chunk_index: chunk.index,
                message: "mock failure".to_string(),
            });
        }
        Ok(SynthesisResult {
            chunk_index: chunk.index,
            audio: wav_bytes(&vec![level(chunk.index); self.samples_per_chunk]),
            latency_ms: delay.as_millis() as u64,
        })
    }

    async fn speakers(&self) -> Result<Vec<Speaker>, VoiceError> {
        Ok(vec![Speaker {
            speaker_name: "alma".to_string(),
            speaker_uuid: "spk-alma".to_string(),
            styles: vec![SpeakerStyle {
                style_name: "normal".to_string(),
                style_id: 0,
            }],
        }])
    }

    async fn check_connection(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub fn voice() -> VoiceSelection {
    VoiceSelection {
        persona: PersonaId::new("alma"),
        speaker_id: "spk-alma".to_string(),
        style_id: 0,
        style_name: "normal".to_string(),
        speed_scale: 1.0,
    }
}

/// `n` chunks without overlap.
pub fn plain_chunks(n: usize) -> Vec<Chunk> {
    (0..n)
        .map(|index| Chunk {
            text: format!("chunk {index}."),
            index,
            is_first: index == 0,
            is_last: index + 1 == n,
            overlap_chars: 0,
        })
        .collect()
}
