//! Canonical object-store paths for the media pipeline.
//!
//! This module is the single source of truth for the storage layout. All
//! writers must use these functions to construct paths; no hardcoded path
//! strings should exist outside this module.
//!
//! # Path Layout
//!
//! ```text
//! images/
//! ├── original/
//! │   └── {image_id}.{ext}             # uploaded original, one per image
//! └── optimized/
//!     └── {image_id}/
//!         └── {width}.{format}         # one per (format, width) rendition
//! locks/
//! └── models/
//!     └── {model_id}.lock.json         # per-model ordering lock
//! ```
//!
//! The original's extension is derived from its mime type; rendition
//! filenames are `{width}.{format}` so a browser can negotiate the best
//! (format, width) pair from a predictable URL.

use crate::id::{ImageId, ModelId};

/// Canonical path generator for media storage.
///
/// # Example
///
/// ```
/// use vitrine_core::media_paths::MediaPaths;
/// use vitrine_core::id::ImageId;
///
/// let id = ImageId::generate();
/// assert_eq!(
///     MediaPaths::rendition(id, 800, "webp"),
///     format!("images/optimized/{id}/800.webp")
/// );
/// ```
pub struct MediaPaths;

impl MediaPaths {
    /// Prefix for all image objects.
    pub const IMAGES_PREFIX: &'static str = "images/";

    /// Prefix for uploaded originals.
    pub const ORIGINAL_PREFIX: &'static str = "images/original/";

    /// Prefix for optimized renditions.
    pub const OPTIMIZED_PREFIX: &'static str = "images/optimized/";

    /// Prefix for per-model ordering locks.
    pub const MODEL_LOCK_PREFIX: &'static str = "locks/models/";

    /// Returns the path of an uploaded original.
    #[must_use]
    pub fn original(image_id: ImageId, ext: &str) -> String {
        format!("{}{image_id}.{ext}", Self::ORIGINAL_PREFIX)
    }

    /// Returns the directory prefix holding all renditions of an image.
    ///
    /// Ends with `/` so it can be used directly as a list prefix.
    #[must_use]
    pub fn optimized_dir(image_id: ImageId) -> String {
        format!("{}{image_id}/", Self::OPTIMIZED_PREFIX)
    }

    /// Returns the path of one optimized rendition.
    #[must_use]
    pub fn rendition(image_id: ImageId, width: u32, format: &str) -> String {
        format!("{}{image_id}/{width}.{format}", Self::OPTIMIZED_PREFIX)
    }

    /// Returns the lock path guarding a model's attachment ordering.
    #[must_use]
    pub fn model_lock(model_id: &ModelId) -> String {
        format!("{}{model_id}.lock.json", Self::MODEL_LOCK_PREFIX)
    }
}
