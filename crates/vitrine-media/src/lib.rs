//! # vitrine-media
//!
//! The product-image ingestion and ordering pipeline of the Vitrine
//! storefront.
//!
//! This crate implements the one subsystem of the storefront with real
//! concurrency and consistency requirements:
//!
//! - **Upload coordination**: persist an original image, assign the next
//!   sort-order slot under a per-model distributed lock, enqueue
//!   optimization work ([`upload::UploadCoordinator`])
//! - **Rendition generation**: derive the optimized format × width grid
//!   asynchronously, persist it idempotently, publish completion events
//!   ([`optimizer::OptimizationWorker`])
//! - **Ordering**: keep each model's attachment sequence dense (`1..=N`)
//!   under concurrent inserts, reorders, and deletes ([`ledger`])
//! - **Notification**: best-effort fanout of completion events to
//!   subscribed clients ([`events`])
//!
//! External collaborators (object store, relational store, job queue,
//! distributed lock) are consumed through trait seams with in-memory
//! implementations, so the whole pipeline is testable in-process.
//!
//! ## Example
//!
//! ```rust,ignore
//! use vitrine_media::prelude::*;
//!
//! let storage = Arc::new(MemoryBackend::new());
//! let ledger = Arc::new(InMemoryLedger::new());
//! let queue = Arc::new(InMemoryJobQueue::new("image-optimization"));
//! let service = MediaService::new(ledger, storage, Arc::new(RasterCodec::new()), queue);
//!
//! let image_id = service.upload_image(&model, upload).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod codec;
pub mod error;
pub mod events;
pub mod ledger;
pub mod metrics;
pub mod optimizer;
pub mod queue;
pub mod reconcile;
pub mod service;
pub mod store;
pub mod types;
pub mod upload;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::codec::{ImageCodec, RasterCodec};
    pub use crate::error::{MediaError, Result};
    pub use crate::events::{EventBus, ImageOptimized, Subscription};
    pub use crate::ledger::LedgerStore;
    pub use crate::optimizer::OptimizationWorker;
    pub use crate::queue::{InMemoryJobQueue, JobQueue, OptimizationJob, RetryPolicy};
    pub use crate::service::MediaService;
    pub use crate::store::memory::InMemoryLedger;
    pub use crate::types::{
        Attachment, ImageMime, ImageRecord, ImageWithRenditions, ModelRef, RenditionMime,
        RenditionRecord, RenditionSpec,
    };
    pub use crate::upload::{UploadCoordinator, UploadRequest};
}

pub use error::{MediaError, Result};
