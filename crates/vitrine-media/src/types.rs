//! Domain types for images, attachments, and renditions.
//!
//! These are the typed projections the pipeline exposes; storage-layer row
//! shapes never cross a component boundary. Mime sets mirror the storefront
//! schema: originals may be any browser image format, renditions are
//! restricted to the modern compressed pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use vitrine_core::{ImageId, ModelId, RenditionId};

use crate::error::MediaError;

/// The widths (in pixels) renditions are generated at.
///
/// Three responsive breakpoints; together with the two [`RenditionMime`]
/// formats this yields the 6-rendition grid per image.
pub const OPTIMIZED_WIDTHS: [u32; 3] = [400, 800, 1200];

/// Mime types accepted for uploaded originals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageMime {
    /// `image/jpeg`
    #[serde(rename = "image/jpeg")]
    Jpeg,
    /// `image/png`
    #[serde(rename = "image/png")]
    Png,
    /// `image/webp`
    #[serde(rename = "image/webp")]
    Webp,
    /// `image/avif`
    #[serde(rename = "image/avif")]
    Avif,
    /// `image/gif`
    #[serde(rename = "image/gif")]
    Gif,
}

impl ImageMime {
    /// Returns the full mime string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
            Self::Avif => "image/avif",
            Self::Gif => "image/gif",
        }
    }

    /// Returns the file extension used in original blob paths.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Avif => "avif",
            Self::Gif => "gif",
        }
    }

    /// All accepted original mime types.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Jpeg, Self::Png, Self::Webp, Self::Avif, Self::Gif]
    }
}

impl fmt::Display for ImageMime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ImageMime {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image/jpeg" => Ok(Self::Jpeg),
            "image/png" => Ok(Self::Png),
            "image/webp" => Ok(Self::Webp),
            "image/avif" => Ok(Self::Avif),
            "image/gif" => Ok(Self::Gif),
            other => Err(MediaError::unsupported_format(format!(
                "mime type '{other}' is not an accepted image format"
            ))),
        }
    }
}

/// Mime types renditions are encoded to.
///
/// A strict subset of [`ImageMime`]: only the modern compressed formats.
/// The declaration order (avif before webp) is the deterministic grid and
/// read-side ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RenditionMime {
    /// `image/avif`
    #[serde(rename = "image/avif")]
    Avif,
    /// `image/webp`
    #[serde(rename = "image/webp")]
    Webp,
}

impl RenditionMime {
    /// Returns the full mime string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Avif => "image/avif",
            Self::Webp => "image/webp",
        }
    }

    /// Returns the file extension used in rendition blob paths.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Avif => "avif",
            Self::Webp => "webp",
        }
    }

    /// All rendition formats, in grid order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Avif, Self::Webp]
    }
}

impl fmt::Display for RenditionMime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RenditionMime {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image/avif" => Ok(Self::Avif),
            "image/webp" => Ok(Self::Webp),
            other => Err(MediaError::unsupported_format(format!(
                "mime type '{other}' is not an optimized format"
            ))),
        }
    }
}

/// One cell of the rendition grid: a target format and width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenditionSpec {
    /// Target encoding format.
    pub format: RenditionMime,
    /// Target width in pixels.
    pub width: u32,
}

impl RenditionSpec {
    /// Returns the full format × width grid, in deterministic order.
    #[must_use]
    pub fn grid() -> Vec<Self> {
        RenditionMime::all()
            .iter()
            .flat_map(|&format| {
                OPTIMIZED_WIDTHS
                    .iter()
                    .map(move |&width| Self { format, width })
            })
            .collect()
    }

    /// Returns the blob filename for this cell (`{width}.{format}`).
    #[must_use]
    pub fn filename(&self) -> String {
        format!("{}.{}", self.width, self.format.extension())
    }
}

/// Identity of the model an image belongs to, as carried through job
/// payloads and completion events.
///
/// The slug travels alongside the id because subscribers key their cache
/// invalidation by slug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    /// The model's identifier.
    pub id: ModelId,
    /// The model's URL slug.
    pub slug: String,
}

/// One uploaded original image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    /// Unique image identifier.
    pub id: ImageId,
    /// Filename as uploaded by the client.
    pub original_filename: String,
    /// Original mime type.
    pub mime: ImageMime,
    /// Byte size of the original.
    pub size: u64,
    /// Pixel width of the original.
    pub width: u32,
    /// Pixel height of the original.
    pub height: u32,
    /// When the image row was created.
    pub created_at: DateTime<Utc>,
}

/// The join record binding an image to a model with its position.
///
/// For a fixed model the `sort_order` values of its attachments form a
/// dense sequence `1..=N` (no gaps, no duplicates). Each image has exactly
/// one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// The attached image.
    pub image_id: ImageId,
    /// 1-based position within the model's sequence.
    pub sort_order: u32,
}

/// One derived rendition artifact.
///
/// Created only by the optimization worker, never mutated, deleted only by
/// cascade with the parent image. Uniquely identified within its parent by
/// the `(mime, width)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenditionRecord {
    /// Unique rendition identifier.
    pub id: RenditionId,
    /// Parent image.
    pub image_id: ImageId,
    /// Encoded format.
    pub mime: RenditionMime,
    /// Byte size of the encoded blob.
    pub size: u64,
    /// Actual pixel width (≤ the requested grid width).
    pub width: u32,
    /// Actual pixel height.
    pub height: u32,
    /// When the rendition row was created.
    pub created_at: DateTime<Utc>,
}

/// Read-side projection: an image with its position and renditions.
///
/// `renditions` is empty until the optimization job completes (or if it
/// exhausted its retries); readers must tolerate that and fall back to the
/// original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageWithRenditions {
    /// The original image.
    pub image: ImageRecord,
    /// Position within the model's sequence.
    pub sort_order: u32,
    /// Renditions, ordered by (mime, width) ascending. May be empty.
    pub renditions: Vec<RenditionRecord>,
}
