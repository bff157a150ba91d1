//! The framework-agnostic operation surface of the pipeline.
//!
//! [`MediaService`] is what a transport layer (RPC handler, HTTP route)
//! calls into:
//!
//! - `upload_image` - synchronous half of ingestion, delegates to the
//!   [`UploadCoordinator`]
//! - `update_image_order` / `delete_image` - the reorder/delete engine,
//!   delegating invariant enforcement to the ledger transaction
//! - `subscribe_image_optimized` / `forward_events` - the completion
//!   notifier surface
//! - `model_images` - the ordered read-side projection
//!
//! Validation and format errors surface synchronously from these methods;
//! asynchronous optimization failures never do (the upload call has long
//! returned) - they are visible only in logs, metrics, and the queue's
//! dead-letter set.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vitrine_core::{media_span, ImageId, MediaPaths, ModelId, StorageBackend};

use crate::codec::ImageCodec;
use crate::error::Result;
use crate::events::{EventBus, ImageOptimized, Subscription};
use crate::ledger::LedgerStore;
use crate::queue::JobQueue;
use crate::types::{ImageWithRenditions, ModelRef};
use crate::upload::{UploadConfig, UploadCoordinator, UploadRequest};

/// The pipeline's operation surface.
///
/// Owns an [`UploadCoordinator`] and shares the ledger, storage, and event
/// bus with the worker fleet. Cheap to share behind an `Arc`.
pub struct MediaService<S: StorageBackend + ?Sized> {
    ledger: Arc<dyn LedgerStore>,
    storage: Arc<S>,
    coordinator: UploadCoordinator<S>,
    bus: EventBus,
}

impl<S: StorageBackend + ?Sized> MediaService<S> {
    /// Creates a service with default upload configuration.
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        storage: Arc<S>,
        codec: Arc<dyn ImageCodec>,
        queue: Arc<dyn JobQueue>,
        bus: EventBus,
    ) -> Self {
        Self::with_config(ledger, storage, codec, queue, bus, UploadConfig::default())
    }

    /// Creates a service with explicit upload configuration.
    pub fn with_config(
        ledger: Arc<dyn LedgerStore>,
        storage: Arc<S>,
        codec: Arc<dyn ImageCodec>,
        queue: Arc<dyn JobQueue>,
        bus: EventBus,
        config: UploadConfig,
    ) -> Self {
        let coordinator = UploadCoordinator::with_config(
            Arc::clone(&ledger),
            Arc::clone(&storage),
            codec,
            queue,
            config,
        );
        Self {
            ledger,
            storage,
            coordinator,
            bus,
        }
    }

    /// Uploads one image to a model.
    ///
    /// Fire-and-forget with respect to optimization: returns once the
    /// original is persisted and the job is enqueued.
    ///
    /// # Errors
    ///
    /// See [`UploadCoordinator::upload`].
    pub async fn upload_image(&self, model: &ModelRef, request: UploadRequest) -> Result<ImageId> {
        self.coordinator.upload(model, request).await
    }

    /// Moves an image to a new position in its model's sequence.
    ///
    /// # Errors
    ///
    /// See [`LedgerStore::reorder`]; on
    /// [`MediaError::TransactionConflict`] the caller should retry.
    ///
    /// [`MediaError::TransactionConflict`]: crate::error::MediaError::TransactionConflict
    pub async fn update_image_order(
        &self,
        model_id: &ModelId,
        image_id: ImageId,
        new_sort_order: u32,
    ) -> Result<()> {
        self.ledger.reorder(model_id, image_id, new_sort_order).await?;
        tracing::info!(
            model_id = %model_id,
            image_id = %image_id,
            new_sort_order,
            "image reordered"
        );
        Ok(())
    }

    /// Deletes an image: ledger rows (attachment, image, renditions) in one
    /// transaction, then best-effort blob cleanup.
    ///
    /// Blob deletion failures are logged, not surfaced: the ledger is the
    /// source of record and the reconciler sweeps orphaned objects.
    ///
    /// # Errors
    ///
    /// See [`LedgerStore::delete_image`].
    pub async fn delete_image(&self, model_id: &ModelId, image_id: ImageId) -> Result<()> {
        use tracing::Instrument as _;

        let span = media_span("delete_image", model_id.as_str(), None);
        async {
            let record = self.ledger.delete_image(model_id, image_id).await?;

            let original = MediaPaths::original(image_id, record.mime.extension());
            if let Err(e) = self.storage.delete(&original).await {
                tracing::warn!(path = %original, error = %e, "original blob cleanup failed");
            }

            match self.storage.list(&MediaPaths::optimized_dir(image_id)).await {
                Ok(objects) => {
                    for object in objects {
                        if let Err(e) = self.storage.delete(&object.path).await {
                            tracing::warn!(path = %object.path, error = %e, "rendition blob cleanup failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(image_id = %image_id, error = %e, "rendition listing failed during delete");
                }
            }

            tracing::info!(model_id = %model_id, image_id = %image_id, "image deleted");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Returns the model's ordered images with their renditions.
    ///
    /// Images whose optimization has not completed (or failed for good)
    /// carry an empty rendition list; display falls back to the original.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub async fn model_images(&self, model_id: &ModelId) -> Result<Vec<ImageWithRenditions>> {
        self.ledger.model_images(model_id).await
    }

    /// Opens a subscription to optimization-completion events.
    ///
    /// Best-effort: only events published while the subscription is open
    /// are observed. Drop the subscription (or cancel the forwarding loop)
    /// to release the registration.
    #[must_use]
    pub fn subscribe_image_optimized(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Forwards completion events into `sink` until `cancel` fires, the
    /// sink's receiver is dropped, or the bus closes.
    ///
    /// This is the push half of a server-push transport: spawn one call per
    /// connected client and cancel its token on disconnect. Cancellation
    /// stops the underlying listener registration immediately.
    pub async fn forward_events(
        &self,
        sink: mpsc::Sender<ImageOptimized>,
        cancel: CancellationToken,
    ) {
        let mut subscription = self.subscribe_image_optimized();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = subscription.recv() => {
                    let Some(event) = event else { break };
                    if sink.send(event).await.is_err() {
                        // Client side went away without cancelling.
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use vitrine_core::MemoryBackend;

    use crate::codec::RasterCodec;
    use crate::queue::InMemoryJobQueue;
    use crate::store::memory::InMemoryLedger;
    use crate::types::ImageMime;

    fn png_bytes() -> Bytes {
        use image::{DynamicImage, ImageFormat, RgbaImage};
        let img = RgbaImage::from_pixel(64, 64, image::Rgba([1, 2, 3, 255]));
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

    fn upload_request(name: &str) -> UploadRequest {
        UploadRequest {
            filename: name.into(),
            mime: ImageMime::Png,
            bytes: png_bytes(),
        }
    }

    struct Fixture {
        storage: Arc<MemoryBackend>,
        bus: EventBus,
        service: MediaService<MemoryBackend>,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let storage = Arc::new(MemoryBackend::new());
        let queue = Arc::new(InMemoryJobQueue::new("image-optimization"));
        let bus = EventBus::default();
        let service = MediaService::new(
            ledger as Arc<dyn LedgerStore>,
            storage.clone(),
            Arc::new(RasterCodec::new()),
            queue as Arc<dyn JobQueue>,
            bus.clone(),
        );
        Fixture {
            storage,
            bus,
            service,
        }
    }

    #[tokio::test]
    async fn upload_then_reorder_then_delete_keeps_sequence_dense() {
        let f = fixture();
        let model = test_model();

        let a = f.service.upload_image(&model, upload_request("a.png")).await.unwrap();
        let b = f.service.upload_image(&model, upload_request("b.png")).await.unwrap();
        let c = f.service.upload_image(&model, upload_request("c.png")).await.unwrap();

        f.service.update_image_order(&model.id, a, 3).await.unwrap();
        let images = f.service.model_images(&model.id).await.unwrap();
        let ids: Vec<ImageId> = images.iter().map(|i| i.image.id).collect();
        assert_eq!(ids, vec![b, c, a]);

        f.service.delete_image(&model.id, c).await.unwrap();
        let images = f.service.model_images(&model.id).await.unwrap();
        let orders: Vec<u32> = images.iter().map(|i| i.sort_order).collect();
        assert_eq!(orders, vec![1, 2]);
        let ids: Vec<ImageId> = images.iter().map(|i| i.image.id).collect();
        assert_eq!(ids, vec![b, a]);
    }

    #[tokio::test]
    async fn delete_cleans_up_blobs() {
        let f = fixture();
        let model = test_model();

        let id = f.service.upload_image(&model, upload_request("a.png")).await.unwrap();
        assert!(!f.storage.list("images/original/").await.unwrap().is_empty());

        f.service.delete_image(&model.id, id).await.unwrap();
        assert!(f.storage.list("images/original/").await.unwrap().is_empty());
        assert!(f.storage.list("images/optimized/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn forward_events_stops_on_cancel() {
        let f = fixture();

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let forwarder = {
            let cancel = cancel.clone();
            let service = f.service;
            tokio::spawn(async move { service.forward_events(tx, cancel).await })
        };

        let event = ImageOptimized {
            model: test_model(),
            image_id: ImageId::generate(),
        };
        // The forwarder may not have subscribed yet; retry until it sees one.
        let received = loop {
            f.bus.publish(event.clone());
            match tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await {
                Ok(Some(received)) => break received,
                Ok(None) => panic!("forwarder closed unexpectedly"),
                Err(_) => continue,
            }
        };
        assert_eq!(received, event);

        cancel.cancel();
        forwarder.await.unwrap();

        // Registration released: nobody is subscribed anymore.
        assert_eq!(f.bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn forward_events_stops_when_sink_closes() {
        let f = fixture();

        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let service = Arc::new(f.service);

        let forwarder = {
            let service = service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { service.forward_events(tx, cancel).await })
        };

        // Give the forwarder time to subscribe, then drop the receiver.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(rx);
        f.bus.publish(ImageOptimized {
            model: test_model(),
            image_id: ImageId::generate(),
        });

        forwarder.await.unwrap();
        assert_eq!(f.bus.subscriber_count(), 0);
    }
}
