//! Durable job queue abstraction for optimization work.
//!
//! This module provides:
//!
//! - [`OptimizationJob`]: the payload carried from upload to worker
//! - [`JobEnvelope`]: serializable queue transport wrapper with attempt
//!   tracking
//! - [`JobQueue`]: trait for queue backends (at-least-once delivery)
//! - [`RetryPolicy`]: exponential backoff with a bounded attempt budget
//! - [`run_worker`]: the consumption loop tying handler, policy, and
//!   dead-lettering together
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: the same interface fits AMQP, Redis-backed
//!   queues, or the in-memory queue used in tests
//! - **At-least-once**: handlers must be safe under redelivery; the
//!   rendition insert is idempotent for exactly this reason
//! - **Never silently dropped**: a job that exhausts its attempts moves to
//!   the dead-letter set for operator inspection

pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use vitrine_core::ImageId;

use crate::error::Result;
use crate::metrics;
use crate::types::ModelRef;

pub use memory::InMemoryJobQueue;

/// Payload of one optimization job.
///
/// Carries the raw original bytes base64-encoded for transport, so the
/// worker needs no read access to the object store to begin work and the
/// payload survives any JSON-only broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationJob {
    /// The model the image is attached to.
    pub model: ModelRef,
    /// The image to derive renditions for.
    pub image_id: ImageId,
    /// Base64-encoded original bytes.
    pub buffer: String,
}

/// Queue transport wrapper for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    /// Unique job identifier.
    pub job_id: String,
    /// Attempt number (1-indexed).
    pub attempt: u32,
    /// When the job was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// The job payload.
    pub job: OptimizationJob,
}

impl JobEnvelope {
    /// Wraps a job in a fresh first-attempt envelope.
    #[must_use]
    pub fn new(job: OptimizationJob) -> Self {
        Self {
            job_id: Ulid::new().to_string(),
            attempt: 1,
            enqueued_at: Utc::now(),
            job,
        }
    }

    /// Returns the idempotency key for this delivery.
    ///
    /// Uses `job_id` + attempt so retries are distinguishable from
    /// duplicate enqueues.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.job_id, self.attempt)
    }

    /// Returns a copy advanced to the next attempt.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.attempt += 1;
        next
    }
}

/// Result of enqueuing a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Job was enqueued successfully.
    Enqueued {
        /// Queue-specific message ID.
        message_id: String,
    },
    /// Job was deduplicated (same delivery already enqueued).
    Deduplicated {
        /// The existing message ID.
        existing_message_id: String,
    },
}

impl EnqueueResult {
    /// Returns true if the job was newly enqueued.
    #[must_use]
    pub const fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }
}

/// A job that exhausted its retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The final envelope, including its last attempt number.
    pub envelope: JobEnvelope,
    /// The final failure, rendered for operator inspection.
    pub reason: String,
    /// When the job was buried.
    pub failed_at: DateTime<Utc>,
}

/// Retry policy: bounded attempts with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum delivery attempts (including the first).
    pub max_attempts: u32,
    /// Base backoff before the second attempt.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Returns the backoff before redelivering the given failed attempt.
    ///
    /// Doubles per attempt, capped at `backoff_max`.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1 << shift);
        delay.min(self.backoff_max)
    }

    /// Returns whether a failure on `attempt` leaves budget for another try.
    #[must_use]
    pub const fn has_budget(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Job queue abstraction with at-least-once delivery.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync`; any number of workers may consume from
/// the same queue concurrently.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues a new job (first attempt).
    async fn enqueue(&self, job: OptimizationJob) -> Result<EnqueueResult>;

    /// Awaits the next available envelope.
    ///
    /// Resolves when an envelope is available; workers race fairly.
    async fn recv(&self) -> Result<JobEnvelope>;

    /// Re-enqueues a failed envelope for its next attempt.
    async fn retry(&self, envelope: JobEnvelope) -> Result<()>;

    /// Moves an envelope to the dead-letter set.
    async fn bury(&self, envelope: JobEnvelope, reason: String) -> Result<()>;

    /// Returns the dead-letter set for operator inspection.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

    /// Returns the approximate number of pending jobs.
    async fn depth(&self) -> Result<usize>;

    /// Returns the queue's name or identifier.
    fn queue_name(&self) -> &str;
}

/// Drives consumption of a queue with retry and dead-lettering.
///
/// Runs until `shutdown` is cancelled. Each envelope is processed to
/// completion or failure; on failure the loop sleeps the policy backoff and
/// redelivers, or buries the job once the attempt budget is spent.
///
/// # Errors
///
/// Returns an error only if the queue itself fails; handler failures are
/// absorbed by the retry policy.
pub async fn run_worker<Q, H, Fut>(
    queue: Arc<Q>,
    handler: H,
    policy: RetryPolicy,
    shutdown: CancellationToken,
) -> Result<()>
where
    Q: JobQueue + ?Sized,
    H: Fn(JobEnvelope) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        let envelope = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            envelope = queue.recv() => envelope?,
        };

        let job_id = envelope.job_id.clone();
        let attempt = envelope.attempt;

        match handler(envelope.clone()).await {
            Ok(()) => {
                tracing::debug!(%job_id, attempt, "job completed");
            }
            Err(e) if policy.has_budget(attempt) => {
                let backoff = policy.backoff_for(attempt);
                tracing::warn!(
                    %job_id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "job failed, will retry"
                );
                metrics::record_job_retry(queue.queue_name());

                tokio::select! {
                    () = shutdown.cancelled() => {
                        // Re-enqueue without waiting so the job survives
                        // shutdown, then stop.
                        queue.retry(envelope.next_attempt()).await?;
                        return Ok(());
                    }
                    () = tokio::time::sleep(backoff) => {}
                }
                queue.retry(envelope.next_attempt()).await?;
            }
            Err(e) => {
                tracing::error!(
                    %job_id,
                    attempt,
                    error = %e,
                    "job exhausted retry budget, moving to dead letters"
                );
                metrics::record_job_dead_letter(queue.queue_name());
                queue.bury(envelope, e.to_string()).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitrine_core::ModelId;

    fn test_job() -> OptimizationJob {
        OptimizationJob {
            model: ModelRef {
                id: ModelId::new("mdl_1").unwrap(),
                slug: "brick-facade".into(),
            },
            image_id: ImageId::generate(),
            buffer: "aGVsbG8=".into(),
        }
    }

    #[test]
    fn envelope_starts_at_attempt_one() {
        let envelope = JobEnvelope::new(test_job());
        assert_eq!(envelope.attempt, 1);
        assert!(envelope.idempotency_key().ends_with("-1"));
    }

    #[test]
    fn next_attempt_increments_but_keeps_identity() {
        let envelope = JobEnvelope::new(test_job());
        let next = envelope.next_attempt();
        assert_eq!(next.job_id, envelope.job_id);
        assert_eq!(next.attempt, 2);
        assert_ne!(next.idempotency_key(), envelope.idempotency_key());
    }

    #[test]
    fn envelope_serializes_camel_case() {
        let envelope = JobEnvelope::new(test_job());
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"jobId\""));
        assert!(json.contains("\"imageId\""));
        assert!(json.contains("\"enqueuedAt\""));

        let parsed: JobEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.job_id, envelope.job_id);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(500));
    }

    #[test]
    fn budget_counts_the_first_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(policy.has_budget(1));
        assert!(policy.has_budget(2));
        assert!(!policy.has_budget(3));
    }
}
