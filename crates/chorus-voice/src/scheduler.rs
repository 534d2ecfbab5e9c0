//! Concurrency-bounded chunk synthesis with in-order delivery.
//!
//! [`SynthesisScheduler::run`] spawns a producer task that dispatches chunk
//! requests against a [`SynthesisBackend`] and pushes results into a bounded
//! channel strictly in chunk order. Results that arrive early wait in a
//! reorder buffer until every lower index has been delivered.
//!
//! Dispatch is limited three ways:
//! - at most `max_concurrency` requests in flight (1 until chunk 0 returns
//!   when `pause_until_first_complete` is set),
//! - at least `delay_between_requests` between two dispatch starts,
//! - no chunk more than `buffer_ahead_count` past the next undelivered one.
//!
//! A failed chunk, including one whose request task panicked, is delivered
//! in its slot as an `Err` tagged with the chunk index; nothing is retried. Dropping or cancelling the [`ResultStream`]
//! stops dispatch and aborts requests still in flight.

use crate::backend::SynthesisBackend;
use crate::config::SchedulerPolicy;
use crate::error::VoiceError;
use chorus_types::{Chunk, SynthesisResult, VoiceSelection};
use futures_util::Stream;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};
use tokio::time::{self, Instant};

pub type ChunkOutcome = Result<SynthesisResult, VoiceError>;

/// Ordered results of one utterance.
#[derive(Debug)]
pub struct ResultStream {
    rx: mpsc::Receiver<ChunkOutcome>,
    total: usize,
}

impl ResultStream {
    /// Next result in chunk order, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<ChunkOutcome> {
        self.rx.recv().await
    }

    /// Stops further dispatch. Results already delivered can still be read.
    pub fn cancel(&mut self) {
        self.rx.close();
    }

    /// Number of chunks the stream was started with.
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Stream for ResultStream {
    type Item = ChunkOutcome;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Runs chunk synthesis under a [`SchedulerPolicy`].
#[derive(Debug, Clone)]
pub struct SynthesisScheduler {
    backend: Arc<dyn SynthesisBackend>,
    policy: SchedulerPolicy,
}

impl SynthesisScheduler {
    /// # Errors
    ///
    /// Returns `InvalidOptions` if `max_concurrency` is zero.
    pub fn new(backend: Arc<dyn SynthesisBackend>, policy: SchedulerPolicy) -> Result<Self, VoiceError> {
        if policy.max_concurrency == 0 {
            return Err(VoiceError::InvalidOptions(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Self { backend, policy })
    }

    pub fn policy(&self) -> &SchedulerPolicy {
        &self.policy
    }

    /// Starts synthesizing `chunks` with `voice` and returns the ordered
    /// result stream. Must be called inside a tokio runtime.
    pub fn run(&self, chunks: Vec<Chunk>, voice: VoiceSelection) -> ResultStream {
        let total = chunks.len();
        let (tx, rx) = mpsc::channel(self.policy.buffer_ahead_count.max(1));
        let producer = Producer {
            backend: self.backend.clone(),
            policy: self.policy.clone(),
            voice: Arc::new(voice),
            chunks,
            tx,
        };
        tokio::spawn(producer.run());
        ResultStream { rx, total }
    }
}

struct Producer {
    backend: Arc<dyn SynthesisBackend>,
    policy: SchedulerPolicy,
    voice: Arc<VoiceSelection>,
    chunks: Vec<Chunk>,
    tx: mpsc::Sender<ChunkOutcome>,
}

impl Producer {
    async fn run(self) {
        let total = self.chunks.len();
        let delay = self.policy.delay_between_requests();
        let mut in_flight: JoinSet<ChunkOutcome> = JoinSet::new();
        // Request task id to chunk position.
        let mut positions: HashMap<task::Id, usize> = HashMap::new();
        let mut ready: BTreeMap<usize, ChunkOutcome> = BTreeMap::new();
        let mut dispatched = 0;
        let mut delivered = 0;
        let mut first_done = false;
        let mut next_dispatch_at = Instant::now();

        while delivered < total {
            while let Some(outcome) = ready.remove(&delivered) {
                if self.tx.send(outcome).await.is_err() {
                    tracing::debug!(delivered, "result stream dropped, abandoning synthesis");
                    return;
                }
                delivered += 1;
            }
            if delivered == total {
                break;
            }

            let limit = if self.policy.pause_until_first_complete && !first_done {
                1
            } else {
                self.policy.max_concurrency
            };
            let can_dispatch = dispatched < total
                && in_flight.len() < limit
                && dispatched <= delivered + self.policy.buffer_ahead_count;

            tokio::select! {
                biased;

                _ = self.tx.closed() => {
                    tracing::debug!(delivered, in_flight = in_flight.len(), "synthesis cancelled");
                    return;
                }

                Some(joined) = in_flight.join_next_with_id(), if !in_flight.is_empty() => {
                    let (id, outcome) = match joined {
                        Ok((id, outcome)) => (id, outcome),
                        Err(e) => {
                            let id = e.id();
                            let chunk_index = positions.get(&id).copied().unwrap_or(delivered);
                            tracing::error!(chunk_index, error = %e, "synthesis task panicked");
                            let outcome = Err(VoiceError::SynthesisFailed {
                                chunk_index,
                                message: format!("synthesis task failed: {e}"),
                            });
                            (id, outcome)
                        }
                    };
                    let Some(position) = positions.remove(&id) else {
                        continue;
                    };
                    if position == 0 {
                        first_done = true;
                    }
                    if let Err(e) = &outcome {
                        tracing::warn!(chunk_index = position, error = %e, "chunk synthesis failed");
                    }
                    ready.insert(position, outcome);
                }

                _ = time::sleep_until(next_dispatch_at), if can_dispatch => {
                    let position = dispatched;
                    let chunk = self.chunks[position].clone();
                    let backend = self.backend.clone();
                    let voice = self.voice.clone();
                    tracing::debug!(chunk_index = chunk.index, in_flight = in_flight.len() + 1, "dispatching chunk");
                    let handle = in_flight.spawn(async move { backend.synthesize(&chunk, &voice).await });
                    positions.insert(handle.id(), position);
                    dispatched += 1;
                    next_dispatch_at = Instant::now() + delay;
                }
            }
        }
        tracing::debug!(total, "all chunks delivered");
    }
}
