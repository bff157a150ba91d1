//! Single-process pipeline demo over the in-memory backends.
//!
//! Run with: `cargo run --example pipeline_demo`

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use vitrine_core::{init_logging, LogFormat, MemoryBackend, ModelId};
use vitrine_media::codec::RasterCodec;
use vitrine_media::events::EventBus;
use vitrine_media::ledger::LedgerStore;
use vitrine_media::optimizer::OptimizationWorker;
use vitrine_media::queue::{InMemoryJobQueue, JobQueue, RetryPolicy};
use vitrine_media::reconcile::Reconciler;
use vitrine_media::service::MediaService;
use vitrine_media::store::memory::InMemoryLedger;
use vitrine_media::types::{ImageMime, ModelRef};
use vitrine_media::upload::UploadRequest;

fn sample_png() -> Bytes {
    use image::{DynamicImage, ImageFormat, RgbaImage};
    let img = RgbaImage::from_fn(1600, 900, |x, y| {
        image::Rgba([(x % 256) as u8, (y % 256) as u8, 96, 255])
    });
    let mut out = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode sample");
    Bytes::from(out.into_inner())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::Pretty);

    let ledger = Arc::new(InMemoryLedger::new());
    let storage = Arc::new(MemoryBackend::new());
    let queue = Arc::new(InMemoryJobQueue::new("image-optimization"));
    let bus = EventBus::default();

    let service = MediaService::new(
        ledger.clone() as Arc<dyn LedgerStore>,
        storage.clone(),
        Arc::new(RasterCodec::new()),
        queue.clone() as Arc<dyn JobQueue>,
        bus.clone(),
    );

    let worker = Arc::new(OptimizationWorker::new(
        ledger.clone() as Arc<dyn LedgerStore>,
        storage.clone(),
        Arc::new(RasterCodec::new()),
        bus.clone(),
    ));
    let shutdown = CancellationToken::new();
    let worker_handle = worker.spawn(
        queue.clone() as Arc<dyn JobQueue>,
        RetryPolicy::default(),
        shutdown.clone(),
    );

    let model = ModelRef {
        id: ModelId::new("mdl_demo")?,
        slug: "demo-facade".into(),
    };

    let mut subscription = service.subscribe_image_optimized();

    let image_id = service
        .upload_image(
            &model,
            UploadRequest {
                filename: "facade.png".into(),
                mime: ImageMime::Png,
                bytes: sample_png(),
            },
        )
        .await?;
    println!("uploaded image {image_id}");

    let event = tokio::time::timeout(Duration::from_secs(60), subscription.recv())
        .await?
        .expect("bus closed unexpectedly");
    println!("optimized: model={} image={}", event.model.slug, event.image_id);

    for entry in service.model_images(&model.id).await? {
        println!(
            "#{} {} ({}x{}, {} renditions)",
            entry.sort_order,
            entry.image.original_filename,
            entry.image.width,
            entry.image.height,
            entry.renditions.len()
        );
        for rendition in &entry.renditions {
            println!(
                "    {} {}x{} {} bytes",
                rendition.mime, rendition.width, rendition.height, rendition.size
            );
        }
    }

    let report = Reconciler::new(ledger as Arc<dyn LedgerStore>, storage)
        .check()
        .await?;
    println!(
        "reconciler: {} images, {} renditions, {} objects, {} issues",
        report.image_count,
        report.rendition_count,
        report.object_count,
        report.issues.len()
    );

    shutdown.cancel();
    worker_handle.await??;
    Ok(())
}
