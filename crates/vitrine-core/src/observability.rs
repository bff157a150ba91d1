//! Observability infrastructure for the media pipeline.
//!
//! Structured logging with consistent spans. This module provides the
//! initialization helper and span constructors used across components, so
//! upload, optimization, and reorder operations log under uniform fields.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `vitrine_media=debug`)
///
/// # Example
///
/// ```rust
/// use vitrine_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for media operations with standard fields.
///
/// # Example
///
/// ```rust
/// use vitrine_core::observability::media_span;
///
/// let span = media_span("upload_image", "mdl_42", Some("01HX4QJ2"));
/// let _guard = span.enter();
/// // ... do the operation
/// ```
#[must_use]
pub fn media_span(operation: &str, model_id: &str, image_id: Option<&str>) -> Span {
    tracing::info_span!(
        "media",
        op = operation,
        model_id = model_id,
        image_id = image_id,
    )
}
