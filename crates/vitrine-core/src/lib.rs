//! # vitrine-core
//!
//! Core abstractions for the Vitrine storefront media pipeline.
//!
//! This crate provides the foundational types and traits used across the
//! pipeline components:
//!
//! - **Identifiers**: Strongly-typed IDs for images, renditions, and models
//! - **Storage**: Abstract object-storage interface with conditional writes
//! - **Locking**: A distributed lock built on storage CAS operations
//! - **Paths**: Canonical object-store layout for originals and renditions
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `vitrine-core` is the only crate allowed to define shared primitives.
//! The pipeline crate (`vitrine-media`) consumes these through explicit
//! constructor injection — there are no process-wide singletons.
//!
//! ## Example
//!
//! ```rust
//! use vitrine_core::prelude::*;
//!
//! let image_id = ImageId::generate();
//! let path = MediaPaths::original(image_id, "jpeg");
//! assert!(path.starts_with("images/original/"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod lock;
pub mod media_paths;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use vitrine_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ImageId, ModelId, RenditionId};
    pub use crate::lock::{DistributedLock, LockGuard, LockInfo};
    pub use crate::media_paths::MediaPaths;
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{ImageId, ModelId, RenditionId};
pub use lock::{DistributedLock, LockGuard, LockInfo};
pub use media_paths::MediaPaths;
pub use observability::{init_logging, media_span, LogFormat};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
