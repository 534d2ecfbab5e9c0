//! FIFO of utterance tasks with exactly one task active at a time.
//!
//! A single worker task pops tasks in enqueue order and hands them to an
//! [`UtteranceProcessor`]. A failing task is recorded as `Failed` and the
//! queue moves on; the error only reaches an explicit waiter or a
//! [`UtteranceQueue::task_state`] query. A processor that gives up with
//! `VoiceError::Cancelled` leaves its task `Cancelled` instead.

use crate::error::VoiceError;
use async_trait::async_trait;
use chorus_types::{TaskId, TaskKind, TaskState};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

/// Finished task records kept for status queries.
const HISTORY_LIMIT: usize = 256;

/// A unit of work in the queue.
#[derive(Debug)]
pub struct UtteranceTask<T> {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: T,
}

/// Runs one task to completion.
#[async_trait]
pub trait UtteranceProcessor<T: Send + Sync>: Send + Sync {
    async fn process(&self, task: &UtteranceTask<T>) -> Result<(), VoiceError>;
}

/// Returned by [`UtteranceQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enqueued {
    pub task_id: TaskId,
    /// Speech tasks waiting, this one included. Warmups are not counted.
    pub queue_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_length: usize,
    pub is_processing: bool,
    pub active_task_id: Option<TaskId>,
    pub next_task_id: Option<TaskId>,
}

/// Last known state of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub kind: TaskKind,
    pub state: TaskState,
    pub error: Option<String>,
}

type Waiter = oneshot::Sender<Result<(), VoiceError>>;

struct Pending<T> {
    task: UtteranceTask<T>,
    waiter: Option<Waiter>,
}

struct QueueState<T> {
    pending: VecDeque<Pending<T>>,
    active: Option<TaskId>,
    next_id: u64,
    records: BTreeMap<TaskId, TaskRecord>,
    closed: bool,
}

impl<T> QueueState<T> {
    fn speech_pending(&self) -> usize {
        self.pending
            .iter()
            .filter(|p| p.task.kind == TaskKind::Speech)
            .count()
    }

    fn set_state(&mut self, id: TaskId, state: TaskState, error: Option<String>) {
        if let Some(record) = self.records.get_mut(&id) {
            record.state = state;
            record.error = error;
        }
        if state.is_terminal() {
            self.trim_history();
        }
    }

    fn trim_history(&mut self) {
        while self.records.len() > HISTORY_LIMIT {
            let oldest_done = self
                .records
                .iter()
                .find(|(_, r)| r.state.is_terminal())
                .map(|(id, _)| *id);
            match oldest_done {
                Some(id) => {
                    self.records.remove(&id);
                }
                None => break,
            }
        }
    }
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    wake: Notify,
    idle: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Serializes utterances. Dropping the queue cancels everything still
/// waiting and lets the active task finish.
pub struct UtteranceQueue<T> {
    shared: Arc<Shared<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + Sync + 'static> std::fmt::Debug for UtteranceQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtteranceQueue")
            .field("status", &self.status())
            .finish()
    }
}

impl<T: Send + Sync + 'static> UtteranceQueue<T> {
    /// Starts the worker. Must be called inside a tokio runtime.
    pub fn new(processor: Arc<dyn UtteranceProcessor<T>>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                active: None,
                next_id: 1,
                records: BTreeMap::new(),
                closed: false,
            }),
            wake: Notify::new(),
            idle: Notify::new(),
        });
        let worker = tokio::spawn(run_worker(shared.clone(), processor));
        Self {
            shared,
            worker: Some(worker),
        }
    }

    fn push(&self, kind: TaskKind, payload: T, waiter: Option<Waiter>) -> Result<Enqueued, VoiceError> {
        let enqueued = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(VoiceError::QueueClosed);
            }
            let id = TaskId(state.next_id);
            state.next_id += 1;
            state.records.insert(
                id,
                TaskRecord {
                    kind,
                    state: TaskState::Queued,
                    error: None,
                },
            );
            state.pending.push_back(Pending {
                task: UtteranceTask { id, kind, payload },
                waiter,
            });
            Enqueued {
                task_id: id,
                queue_length: state.speech_pending(),
            }
        };
        tracing::debug!(task_id = %enqueued.task_id, ?kind, queue_length = enqueued.queue_length, "task enqueued");
        self.shared.wake.notify_one();
        Ok(enqueued)
    }

    /// Queues a task and returns immediately.
    pub fn enqueue(&self, kind: TaskKind, payload: T) -> Result<Enqueued, VoiceError> {
        self.push(kind, payload, None)
    }

    /// Queues a task and resolves once it has finished.
    ///
    /// # Errors
    ///
    /// The task's own error, `Cancelled` if it was cleared before starting,
    /// or `QueueClosed`.
    pub async fn enqueue_and_wait(&self, kind: TaskKind, payload: T) -> Result<TaskId, VoiceError> {
        let (tx, rx) = oneshot::channel();
        let enqueued = self.push(kind, payload, Some(tx))?;
        rx.await.map_err(|_| VoiceError::QueueClosed)??;
        Ok(enqueued.task_id)
    }

    /// Removes queued tasks, all of them or only those in `ids`. The active
    /// task is never touched. Returns how many tasks were removed.
    pub fn clear(&self, ids: Option<&[TaskId]>) -> usize {
        let removed: Vec<Pending<T>> = {
            let mut state = self.shared.lock();
            let (removed, kept): (Vec<_>, Vec<_>) = state
                .pending
                .drain(..)
                .partition(|p| ids.map_or(true, |ids| ids.contains(&p.task.id)));
            state.pending = kept.into();
            for p in &removed {
                state.set_state(p.task.id, TaskState::Cancelled, None);
            }
            removed
        };
        let count = removed.len();
        for p in removed {
            if let Some(waiter) = p.waiter {
                let _ = waiter.send(Err(VoiceError::Cancelled));
            }
        }
        if count > 0 {
            tracing::info!(removed = count, "queue cleared");
        }
        self.shared.idle.notify_waiters();
        count
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.shared.lock();
        QueueStatus {
            queue_length: state.speech_pending(),
            is_processing: state.active.is_some(),
            active_task_id: state.active,
            next_task_id: state.pending.front().map(|p| p.task.id),
        }
    }

    /// State of a task, while its record is retained.
    pub fn task_state(&self, id: TaskId) -> Option<TaskRecord> {
        self.shared.lock().records.get(&id).cloned()
    }

    /// Resolves once nothing is active or queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.shared.lock();
                if state.active.is_none() && state.pending.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Refuses new tasks and cancels everything still queued.
    pub fn close(&self) {
        let removed: Vec<Pending<T>> = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let removed: Vec<_> = state.pending.drain(..).collect();
            for p in &removed {
                state.set_state(p.task.id, TaskState::Cancelled, None);
            }
            removed
        };
        for p in removed {
            if let Some(waiter) = p.waiter {
                let _ = waiter.send(Err(VoiceError::Cancelled));
            }
        }
        self.shared.wake.notify_one();
        self.shared.idle.notify_waiters();
    }
}

impl<T> Drop for UtteranceQueue<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.closed = true;
            for p in state.pending.drain(..) {
                if let Some(waiter) = p.waiter {
                    let _ = waiter.send(Err(VoiceError::Cancelled));
                }
            }
        }
        self.shared.wake.notify_one();
        // The worker exits on its own once the active task is done.
        drop(self.worker.take());
    }
}

async fn run_worker<T: Send + Sync + 'static>(shared: Arc<Shared<T>>, processor: Arc<dyn UtteranceProcessor<T>>) {
    loop {
        let next = {
            let mut state = shared.lock();
            match state.pending.pop_front() {
                Some(pending) => {
                    state.active = Some(pending.task.id);
                    state.set_state(pending.task.id, TaskState::Active, None);
                    Some(pending)
                }
                None if state.closed => return,
                None => None,
            }
        };

        let Some(Pending { task, waiter }) = next else {
            shared.idle.notify_waiters();
            shared.wake.notified().await;
            continue;
        };

        let id = task.id;
        let kind = task.kind;
        tracing::debug!(task_id = %id, ?kind, "task started");
        let worker_processor = processor.clone();
        // Run on its own task so a panicking processor fails only this task.
        let outcome = match tokio::spawn(async move { worker_processor.process(&task).await }).await {
            Ok(outcome) => outcome,
            Err(e) => Err(VoiceError::Task(e)),
        };

        {
            let mut state = shared.lock();
            state.active = None;
            match &outcome {
                Ok(()) => state.set_state(id, TaskState::Done, None),
                Err(VoiceError::Cancelled) => state.set_state(id, TaskState::Cancelled, None),
                Err(e) => state.set_state(id, TaskState::Failed, Some(e.to_string())),
            }
        }
        match &outcome {
            Ok(()) => tracing::debug!(task_id = %id, "task done"),
            Err(VoiceError::Cancelled) => tracing::debug!(task_id = %id, "task cancelled"),
            Err(e) => tracing::warn!(task_id = %id, error = %e, "task failed"),
        }
        if let Some(waiter) = waiter {
            let _ = waiter.send(outcome);
        }
        shared.idle.notify_waiters();
    }
}
