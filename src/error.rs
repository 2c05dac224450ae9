//! Error taxonomy for descriptor extraction, mask construction and gated attention.

use thiserror::Error;

/// Errors raised by the covisibility pipeline.
///
/// Shape and dimension errors are hard failures: recovering from them would
/// silently corrupt the attention computation. Backbone failures are only
/// fatal in [`ExtractionMode::Strict`](crate::config::ExtractionMode).
#[derive(Debug, Error)]
pub enum CovisError {
    /// Zero views were submitted.
    #[error("Empty batch: at least one view is required")]
    EmptyBatch,

    /// An embedding in the batch does not share the batch dimension.
    #[error("Dimension mismatch at view {index}: expected {expected}, got {actual}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    /// The frozen descriptor backbone could not be loaded or run.
    #[error("Backbone unavailable: {0}")]
    BackboneUnavailable(String),

    /// An input image has the wrong layout or size.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Tensor shapes handed to the attention path do not line up.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A configuration file could not be read or parsed.
    #[error("Failed to load configuration: {0:#}")]
    Config(anyhow::Error),

    /// The compute device rejected a request.
    #[error("Compute backend error: {0}")]
    Backend(String),
}

/// Crate result alias.
pub type Result<T> = std::result::Result<T, CovisError>;
