//! Rendition generation: the asynchronous half of ingestion.
//!
//! The worker consumes [`OptimizationJob`]s from the queue. For each job it
//! derives the full format × width grid, persists the rendition rows in one
//! idempotent transaction, uploads the blobs, and publishes a completion
//! event. Any failure propagates to the queue's retry policy; after the
//! attempt budget the job lands in the dead-letter set and the image simply
//! stays without renditions (readers fall back to the original).
//!
//! Safety under redelivery comes from two properties:
//! - rendition rows are keyed by `(image_id, mime, width)` and inserted
//!   if-absent
//! - blob uploads are idempotent overwrites at deterministic paths
//!
//! Encoding is CPU-bound, so the whole grid is produced on a blocking
//! thread; the async runtime only sees the I/O.

use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use tokio_util::sync::CancellationToken;

use vitrine_core::{media_span, Error as CoreError, MediaPaths, RenditionId, StorageBackend, WritePrecondition};

use crate::codec::{Encoded, ImageCodec};
use crate::error::{MediaError, Result};
use crate::events::{EventBus, ImageOptimized};
use crate::ledger::LedgerStore;
use crate::metrics;
use crate::queue::{run_worker, JobQueue, OptimizationJob, RetryPolicy};
use crate::types::{RenditionRecord, RenditionSpec};

/// Derives and persists optimized renditions.
///
/// Stateless apart from its injected collaborators; any number of workers
/// may consume the same queue, in this process or others.
pub struct OptimizationWorker<S: StorageBackend + ?Sized> {
    ledger: Arc<dyn LedgerStore>,
    storage: Arc<S>,
    codec: Arc<dyn ImageCodec>,
    bus: EventBus,
}

impl<S: StorageBackend + ?Sized> OptimizationWorker<S> {
    /// Creates a worker.
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        storage: Arc<S>,
        codec: Arc<dyn ImageCodec>,
        bus: EventBus,
    ) -> Self {
        Self {
            ledger,
            storage,
            codec,
            bus,
        }
    }

    /// Processes one job to completion.
    ///
    /// # Errors
    ///
    /// Every error is retryable from the queue's perspective; the worker
    /// makes no attempt to distinguish transient from permanent failures
    /// beyond logging (a deleted parent image, for example, will fail every
    /// attempt and exhaust into the dead-letter set).
    pub async fn process(&self, job: OptimizationJob) -> Result<()> {
        use tracing::Instrument as _;

        let span = media_span(
            "optimize_image",
            job.model.id.as_str(),
            Some(&job.image_id.to_string()),
        );
        let result = self.process_inner(job).instrument(span).await;
        if result.is_err() {
            metrics::record_optimization("error");
        }
        result
    }

    async fn process_inner(&self, job: OptimizationJob) -> Result<()> {
        let started = Instant::now();
        let image_id = job.image_id;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&job.buffer)
            .map_err(|e| MediaError::transport(format!("job buffer decode failed: {e}")))?;

        // Refuse to resurrect rows for an image deleted mid-flight.
        if self.ledger.image(image_id).await?.is_none() {
            return Err(MediaError::ImageNotFound { image_id });
        }

        let encoded = self.encode_grid(bytes).await?;

        let records: Vec<RenditionRecord> = encoded
            .iter()
            .map(|(spec, e)| RenditionRecord {
                id: RenditionId::generate(),
                image_id,
                mime: spec.format,
                size: e.bytes.len() as u64,
                width: e.width,
                height: e.height,
                created_at: chrono::Utc::now(),
            })
            .collect();

        // One transaction for all six rows; insert-if-absent makes a
        // redelivered job a no-op here.
        let inserted = self.ledger.insert_renditions(image_id, records).await?;
        if inserted == 0 {
            tracing::debug!(image_id = %image_id, "renditions already present, redelivered job");
        }

        for (spec, e) in &encoded {
            let path = MediaPaths::rendition(image_id, spec.width, spec.format.extension());
            self.storage
                .put(
                    &path,
                    e.bytes.clone(),
                    spec.format.as_str(),
                    WritePrecondition::None,
                )
                .await?;
        }

        // Publish only on full success: rows committed and every blob up.
        self.bus.publish(ImageOptimized {
            model: job.model.clone(),
            image_id,
        });

        metrics::record_optimization("ok");
        metrics::record_optimize_duration(started.elapsed().as_secs_f64());
        tracing::info!(
            image_id = %image_id,
            renditions = encoded.len(),
            inserted,
            "image optimized"
        );
        Ok(())
    }

    /// Encodes the full rendition grid on a blocking thread.
    async fn encode_grid(&self, bytes: Vec<u8>) -> Result<Vec<(RenditionSpec, Encoded)>> {
        let codec = Arc::clone(&self.codec);
        tokio::task::spawn_blocking(move || {
            RenditionSpec::grid()
                .into_iter()
                .map(|spec| {
                    codec
                        .resize_and_encode(&bytes, spec.width, spec.format)
                        .map(|encoded| (spec, encoded))
                })
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(|e| MediaError::Core(CoreError::internal(format!("encode task panicked: {e}"))))?
    }

    /// Spawns a consumption loop feeding this worker from `queue`.
    ///
    /// The loop runs until `shutdown` is cancelled; failed jobs are
    /// redelivered per `policy` and buried after the attempt budget.
    pub fn spawn(
        self: Arc<Self>,
        queue: Arc<dyn JobQueue>,
        policy: RetryPolicy,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let worker = Arc::clone(&self);
            run_worker(
                queue,
                move |envelope| {
                    let worker = Arc::clone(&worker);
                    async move { worker.process(envelope.job).await }
                },
                policy,
                shutdown,
            )
            .await
        })
    }
}
