//! Error types for the media pipeline domain.

use vitrine_core::{ImageId, ModelId};

/// The result type used throughout vitrine-media.
pub type Result<T> = std::result::Result<T, MediaError>;

/// Errors that can occur in pipeline operations.
///
/// Validation and format errors are surfaced synchronously to the caller of
/// upload/reorder/delete. Asynchronous optimization failures never reach the
/// original caller; they are observable via logs, metrics, and the queue's
/// dead-letter set.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The codec could not decode or encode the supplied image payload.
    #[error("unsupported image format: {message}")]
    UnsupportedFormat {
        /// Description of the decode/encode failure.
        message: String,
    },

    /// The per-model ordering lock was not acquired within the wait budget.
    #[error("ordering lock timeout for model {model_id}")]
    LockTimeout {
        /// The model whose lock was contended.
        model_id: ModelId,
    },

    /// A serializable transaction aborted due to a concurrent reorder/delete.
    ///
    /// The whole operation should be retried by the caller.
    #[error("transaction conflict: {message}")]
    TransactionConflict {
        /// Description of the conflicting operation.
        message: String,
    },

    /// A requested sort order fell outside the model's dense sequence.
    #[error("sort order {requested} out of range 1..={len}")]
    OrderOutOfRange {
        /// The requested target position.
        requested: u32,
        /// The number of attachments currently in the sequence.
        len: u32,
    },

    /// The image does not exist or is not attached to the addressed model.
    #[error("image {image_id} not found")]
    ImageNotFound {
        /// The image that was not found.
        image_id: ImageId,
    },

    /// A queue transport payload could not be decoded.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the decode failure.
        message: String,
    },

    /// An error from vitrine-core (storage, lock, serialization).
    #[error("core error: {0}")]
    Core(#[from] vitrine_core::Error),
}

impl MediaError {
    /// Creates a new unsupported-format error.
    #[must_use]
    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            message: message.into(),
        }
    }

    /// Creates a new transaction-conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::TransactionConflict {
            message: message.into(),
        }
    }

    /// Creates a new transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}
