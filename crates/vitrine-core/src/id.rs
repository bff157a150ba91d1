//! Strongly-typed identifiers for Vitrine entities.
//!
//! All generated identifiers are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! Model identifiers are an exception: models are owned by the catalog, which
//! is outside this pipeline, so [`ModelId`] is an opaque validated string
//! rather than a ULID minted here.
//!
//! # Example
//!
//! ```rust
//! use vitrine_core::id::{ImageId, RenditionId};
//!
//! let image = ImageId::generate();
//! let rendition = RenditionId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: ImageId = rendition;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for an uploaded original image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(Ulid);

impl ImageId {
    /// Generates a new unique image ID.
    ///
    /// Uses ULID generation which is:
    /// - Lexicographically sortable by creation time
    /// - Globally unique without coordination
    /// - URL-safe and case-insensitive
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates an image ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = self.0.timestamp_ms();
        chrono::DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ImageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid image ID '{s}': {e}"),
            })
    }
}

/// A unique identifier for an optimized rendition of an image.
///
/// Renditions are derived artifacts; each one belongs to exactly one
/// parent image and is additionally identified by its (format, width) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenditionId(Ulid);

impl RenditionId {
    /// Generates a new unique rendition ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a rendition ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for RenditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RenditionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid rendition ID '{s}': {e}"),
            })
    }
}

/// An opaque identifier for a storefront model.
///
/// Model rows are created by the catalog, not by this pipeline, so the only
/// guarantee enforced here is that the identifier is a non-empty token
/// without whitespace (it is embedded in storage paths and lock keys).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    /// Creates a model ID after validating the raw string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the string is empty or contains
    /// whitespace or path separators.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(Error::InvalidId {
                message: "model ID must not be empty".into(),
            });
        }
        if raw.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(Error::InvalidId {
                message: format!("model ID '{raw}' contains whitespace or '/'"),
            });
        }
        Ok(Self(raw))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ModelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
