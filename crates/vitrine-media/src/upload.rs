//! Upload coordination: persist an original and assign its order slot.
//!
//! The coordinator owns the synchronous half of ingestion. For one upload it:
//!
//! 1. probes the payload (reject undecodable uploads before any persistence)
//! 2. generates the image ID
//! 3. takes the model's distributed ordering lock with a bounded wait
//! 4. appends the image at `max(sort_order) + 1` in one ledger transaction
//! 5. uploads the original blob
//! 6. releases the lock on every exit path
//! 7. enqueues the optimization job and returns without awaiting it
//!
//! The lock exists because "read max, insert max + 1" is a check-then-act
//! race under concurrent uploads to the same model; two transactions can
//! both read the same max before either commits. Uploads to different
//! models never contend.
//!
//! A blob upload that fails after the ledger commit leaves a row without
//! its object. This window is accepted: it is logged at ERROR for operator
//! remediation (see the reconciler) rather than patched over with a
//! two-phase commit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use vitrine_core::{
    media_span, DistributedLock, Error as CoreError, ImageId, MediaPaths, StorageBackend,
    WritePrecondition,
};

use crate::codec::ImageCodec;
use crate::error::{MediaError, Result};
use crate::ledger::LedgerStore;
use crate::metrics;
use crate::queue::{JobQueue, OptimizationJob};
use crate::types::{ImageMime, ImageRecord, ModelRef};

/// Tunables for the upload path.
#[derive(Debug, Clone, Copy)]
pub struct UploadConfig {
    /// TTL written into the ordering lock. Must comfortably exceed one
    /// ledger transaction plus one blob upload.
    pub lock_ttl: Duration,
    /// How long an upload waits for a contended lock before failing with
    /// [`MediaError::LockTimeout`].
    pub lock_wait: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            lock_wait: Duration::from_secs(10),
        }
    }
}

/// One raw upload payload as received from the client.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Filename as uploaded.
    pub filename: String,
    /// Declared mime type (must be one of the accepted formats).
    pub mime: ImageMime,
    /// Raw image bytes.
    pub bytes: Bytes,
}

/// Coordinates original-image ingestion for one deployment.
///
/// All collaborators are injected; the coordinator holds no mutable state
/// of its own and is cheap to share behind an `Arc`.
pub struct UploadCoordinator<S: StorageBackend + ?Sized> {
    ledger: Arc<dyn LedgerStore>,
    storage: Arc<S>,
    codec: Arc<dyn ImageCodec>,
    queue: Arc<dyn JobQueue>,
    config: UploadConfig,
}

impl<S: StorageBackend + ?Sized> UploadCoordinator<S> {
    /// Creates a coordinator with default configuration.
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        storage: Arc<S>,
        codec: Arc<dyn ImageCodec>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self::with_config(ledger, storage, codec, queue, UploadConfig::default())
    }

    /// Creates a coordinator with explicit configuration.
    pub fn with_config(
        ledger: Arc<dyn LedgerStore>,
        storage: Arc<S>,
        codec: Arc<dyn ImageCodec>,
        queue: Arc<dyn JobQueue>,
        config: UploadConfig,
    ) -> Self {
        Self {
            ledger,
            storage,
            codec,
            queue,
            config,
        }
    }

    /// Ingests one image for the given model.
    ///
    /// Returns as soon as the original is persisted and the optimization
    /// job is enqueued; rendition generation is asynchronous and its
    /// failures are never surfaced here.
    ///
    /// # Errors
    ///
    /// - [`MediaError::UnsupportedFormat`] if the payload does not decode
    ///   (nothing is persisted)
    /// - [`MediaError::LockTimeout`] if the model's ordering lock stayed
    ///   contended past the configured wait (nothing is persisted)
    /// - storage/ledger errors from the persistence steps
    pub async fn upload(&self, model: &ModelRef, request: UploadRequest) -> Result<ImageId> {
        use tracing::Instrument as _;

        let span = media_span("upload_image", model.id.as_str(), None);
        self.upload_inner(model, request).instrument(span).await
    }

    async fn upload_inner(&self, model: &ModelRef, request: UploadRequest) -> Result<ImageId> {
        // Probe before touching any state.
        let probe = match self.codec.probe(&request.bytes) {
            Ok(probe) => probe,
            Err(e) => {
                metrics::record_upload("unsupported");
                return Err(e);
            }
        };

        let image_id = ImageId::generate();
        let record = ImageRecord {
            id: image_id,
            original_filename: request.filename.clone(),
            mime: request.mime,
            size: request.bytes.len() as u64,
            width: probe.width,
            height: probe.height,
            created_at: chrono::Utc::now(),
        };

        let lock = DistributedLock::new(
            Arc::clone(&self.storage),
            MediaPaths::model_lock(&model.id),
        );
        let lock_started = Instant::now();
        let guard = match lock
            .acquire_with_operation(
                self.config.lock_ttl,
                self.config.lock_wait,
                Some("uploadImage".into()),
            )
            .await
        {
            Ok(guard) => guard,
            Err(CoreError::LockTimeout { .. }) => {
                metrics::record_upload("lock_timeout");
                return Err(MediaError::LockTimeout {
                    model_id: model.id.clone(),
                });
            }
            Err(e) => {
                metrics::record_upload("error");
                return Err(e.into());
            }
        };
        metrics::record_lock_wait(lock_started.elapsed().as_secs_f64());

        // Ledger transaction + blob upload under the lock; the lock is
        // released on both the success and the error path.
        let persisted = self.persist_original(model, record, &request.bytes).await;
        if let Err(e) = guard.release().await {
            tracing::warn!(image_id = %image_id, error = %e, "ordering lock release failed");
        }
        let sort_order = match persisted {
            Ok(sort_order) => sort_order,
            Err(e) => {
                metrics::record_upload("error");
                return Err(e);
            }
        };

        // Fire-and-forget: the job carries the bytes, so the worker needs
        // no further coordination with this call.
        use base64::Engine as _;
        let job = OptimizationJob {
            model: model.clone(),
            image_id,
            buffer: base64::engine::general_purpose::STANDARD.encode(&request.bytes),
        };
        self.queue.enqueue(job).await?;

        metrics::record_upload("ok");
        tracing::info!(
            image_id = %image_id,
            sort_order,
            size = request.bytes.len(),
            "image uploaded and optimization enqueued"
        );
        Ok(image_id)
    }

    /// Appends the ledger rows, then uploads the original blob.
    async fn persist_original(
        &self,
        model: &ModelRef,
        record: ImageRecord,
        bytes: &Bytes,
    ) -> Result<u32> {
        let image_id = record.id;
        let mime = record.mime;
        let sort_order = self.ledger.insert_original(&model.id, record).await?;

        let path = MediaPaths::original(image_id, mime.extension());
        if let Err(e) = self
            .storage
            .put(&path, bytes.clone(), mime.as_str(), WritePrecondition::None)
            .await
        {
            // The ledger row is already committed. Accepted inconsistency
            // window: surface loudly and leave remediation to operators.
            tracing::error!(
                image_id = %image_id,
                path = %path,
                error = %e,
                "original blob upload failed after ledger commit"
            );
            return Err(e.into());
        }

        Ok(sort_order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitrine_core::{MemoryBackend, ModelId};

    use crate::codec::RasterCodec;
    use crate::queue::InMemoryJobQueue;
    use crate::store::memory::InMemoryLedger;

    fn png_bytes() -> Bytes {
        use image::{DynamicImage, ImageFormat, RgbaImage};
        let img = RgbaImage::from_pixel(64, 48, image::Rgba([10, 20, 30, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        Bytes::from(out.into_inner())
    }

    fn test_model() -> ModelRef {
        ModelRef {
            id: ModelId::new("mdl_1").unwrap(),
            slug: "brick-facade".into(),
        }
    }

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        storage: Arc<MemoryBackend>,
        queue: Arc<InMemoryJobQueue>,
        coordinator: UploadCoordinator<MemoryBackend>,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let storage = Arc::new(MemoryBackend::new());
        let queue = Arc::new(InMemoryJobQueue::new("image-optimization"));
        let coordinator = UploadCoordinator::new(
            ledger.clone() as Arc<dyn LedgerStore>,
            storage.clone(),
            Arc::new(RasterCodec::new()),
            queue.clone() as Arc<dyn JobQueue>,
        );
        Fixture {
            ledger,
            storage,
            queue,
            coordinator,
        }
    }

    #[tokio::test]
    async fn upload_persists_row_blob_and_job() {
        let f = fixture();
        let model = test_model();

        let image_id = f
            .coordinator
            .upload(
                &model,
                UploadRequest {
                    filename: "facade.png".into(),
                    mime: ImageMime::Png,
                    bytes: png_bytes(),
                },
            )
            .await
            .unwrap();

        // Ledger row with probed dimensions.
        let record = f.ledger.image(image_id).await.unwrap().unwrap();
        assert_eq!(record.width, 64);
        assert_eq!(record.height, 48);
        assert_eq!(record.mime, ImageMime::Png);

        // Attachment at slot 1.
        let attachments = f.ledger.attachments(&model.id).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].sort_order, 1);
        assert_eq!(attachments[0].image_id, image_id);

        // Original blob at the canonical path.
        let blob = f
            .storage
            .get(&MediaPaths::original(image_id, "png"))
            .await
            .unwrap();
        assert_eq!(blob, png_bytes());

        // One job enqueued, carrying the bytes.
        assert_eq!(f.queue.depth().await.unwrap(), 1);
        let envelope = f.queue.try_take().unwrap().unwrap();
        assert_eq!(envelope.job.image_id, image_id);
        use base64::Engine as _;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&envelope.job.buffer)
            .unwrap();
        assert_eq!(Bytes::from(decoded), png_bytes());
    }

    #[tokio::test]
    async fn sequential_uploads_get_consecutive_slots() {
        let f = fixture();
        let model = test_model();

        for expected in 1..=3u32 {
            f.coordinator
                .upload(
                    &model,
                    UploadRequest {
                        filename: format!("{expected}.png"),
                        mime: ImageMime::Png,
                        bytes: png_bytes(),
                    },
                )
                .await
                .unwrap();
            let attachments = f.ledger.attachments(&model.id).await.unwrap();
            assert_eq!(attachments.last().unwrap().sort_order, expected);
        }
    }

    #[tokio::test]
    async fn undecodable_payload_persists_nothing() {
        let f = fixture();
        let model = test_model();

        let err = f
            .coordinator
            .upload(
                &model,
                UploadRequest {
                    filename: "junk.png".into(),
                    mime: ImageMime::Png,
                    bytes: Bytes::from_static(b"definitely not a png"),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MediaError::UnsupportedFormat { .. }));
        assert!(f.ledger.attachments(&model.id).await.unwrap().is_empty());
        assert!(f.storage.is_empty().unwrap());
        assert_eq!(f.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lock_is_released_after_upload() {
        let f = fixture();
        let model = test_model();

        f.coordinator
            .upload(
                &model,
                UploadRequest {
                    filename: "a.png".into(),
                    mime: ImageMime::Png,
                    bytes: png_bytes(),
                },
            )
            .await
            .unwrap();

        let lock = DistributedLock::new(f.storage.clone(), MediaPaths::model_lock(&model.id));
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn contended_lock_times_out() {
        let f = fixture();
        let model = test_model();

        // Hold the model's lock externally.
        let lock = DistributedLock::new(f.storage.clone(), MediaPaths::model_lock(&model.id));
        let _held = lock
            .acquire(Duration::from_secs(30), Duration::from_secs(1))
            .await
            .unwrap();

        let coordinator = UploadCoordinator::with_config(
            f.ledger.clone() as Arc<dyn LedgerStore>,
            f.storage.clone(),
            Arc::new(RasterCodec::new()),
            f.queue.clone() as Arc<dyn JobQueue>,
            UploadConfig {
                lock_ttl: Duration::from_secs(30),
                lock_wait: Duration::from_millis(100),
            },
        );

        let err = coordinator
            .upload(
                &model,
                UploadRequest {
                    filename: "a.png".into(),
                    mime: ImageMime::Png,
                    bytes: png_bytes(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MediaError::LockTimeout { .. }));
        // Lock acquire precedes all writes: nothing was persisted.
        assert!(f.ledger.attachments(&model.id).await.unwrap().is_empty());
        assert_eq!(f.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_uploads_to_one_model_get_distinct_slots() {
        let f = fixture();
        let model = test_model();
        let coordinator = Arc::new(f.coordinator);

        let mut handles = Vec::new();
        for i in 0..8 {
            let coordinator = coordinator.clone();
            let model = model.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .upload(
                        &model,
                        UploadRequest {
                            filename: format!("{i}.png"),
                            mime: ImageMime::Png,
                            bytes: png_bytes(),
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let orders: Vec<u32> = f
            .ledger
            .attachments(&model.id)
            .await
            .unwrap()
            .iter()
            .map(|a| a.sort_order)
            .collect();
        assert_eq!(orders, (1..=8).collect::<Vec<u32>>());
    }
}
