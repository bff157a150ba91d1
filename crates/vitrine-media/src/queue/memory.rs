//! In-memory job queue.
//!
//! Process-local implementation of [`JobQueue`] for tests and single-node
//! deployments.
//!
//! ## Limitations
//!
//! - **No persistence**: jobs do not survive a process restart
//! - **Single-process only**: not visible across process boundaries
//! - **Deduplication is queue-scoped**: keys are released when envelopes
//!   are taken by a worker

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use ulid::Ulid;

use vitrine_core::Error as CoreError;

use super::{DeadLetter, EnqueueResult, JobEnvelope, JobQueue, OptimizationJob};
use crate::error::{MediaError, Result};

/// Internal queue state protected by a single lock.
#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<JobEnvelope>,
    seen_keys: HashMap<String, String>,
    dead_letters: Vec<DeadLetter>,
}

/// In-memory implementation of [`JobQueue`].
///
/// Thread-safe via a `Mutex`; waiting consumers are woken through a
/// [`Notify`].
#[derive(Debug)]
pub struct InMemoryJobQueue {
    name: String,
    state: Mutex<QueueState>,
    available: Notify,
}

/// Converts a lock poison error to a core internal error.
fn poison_err<T>(_: PoisonError<T>) -> MediaError {
    MediaError::Core(CoreError::internal("job queue lock poisoned"))
}

impl InMemoryJobQueue {
    /// Creates a new in-memory queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    fn push(&self, envelope: JobEnvelope) -> Result<EnqueueResult> {
        let key = envelope.idempotency_key();
        let mut state = self.state.lock().map_err(poison_err)?;

        if let Some(existing) = state.seen_keys.get(&key) {
            return Ok(EnqueueResult::Deduplicated {
                existing_message_id: existing.clone(),
            });
        }

        let message_id = Ulid::new().to_string();
        state.seen_keys.insert(key, message_id.clone());
        state.queue.push_back(envelope);
        drop(state);

        self.available.notify_one();
        Ok(EnqueueResult::Enqueued { message_id })
    }

    /// Takes the next envelope without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn try_take(&self) -> Result<Option<JobEnvelope>> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let envelope = state.queue.pop_front();
        if let Some(ref envelope) = envelope {
            state.seen_keys.remove(&envelope.idempotency_key());
        }
        drop(state);
        Ok(envelope)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: OptimizationJob) -> Result<EnqueueResult> {
        self.push(JobEnvelope::new(job))
    }

    async fn recv(&self) -> Result<JobEnvelope> {
        loop {
            if let Some(envelope) = self.try_take()? {
                return Ok(envelope);
            }
            // Re-check after every notification; multiple consumers may
            // race for the same envelope.
            self.available.notified().await;
        }
    }

    async fn retry(&self, envelope: JobEnvelope) -> Result<()> {
        self.push(envelope)?;
        Ok(())
    }

    async fn bury(&self, envelope: JobEnvelope, reason: String) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.dead_letters.push(DeadLetter {
            envelope,
            reason,
            failed_at: Utc::now(),
        });
        drop(state);
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.state.lock().map_err(poison_err)?.dead_letters.clone())
    }

    async fn depth(&self) -> Result<usize> {
        Ok(self.state.lock().map_err(poison_err)?.queue.len())
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}
