// THEORY:
// Every stage of the screening engine fails in its own vocabulary. The normalizer
// only knows about bad images, the severity mapper only about bad scores, and the
// saliency generator only about failed attribution. Each stage owns a small error
// enum, and the crate-level `Error` wraps them without rewriting or downgrading the
// original failure, so a caller can always match on the stage that gave up.
//
// None of these failures are retried internally: every stage is a deterministic
// computation, so the same input would fail the same way.

use thiserror::Error;

/// Failures raised by the fundus normalizer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    /// The input image (or a parameter describing it) cannot be normalized.
    #[error("invalid image: {reason}")]
    InvalidImage { reason: String },
}

/// Failures raised by the severity mapper.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SeverityError {
    /// The regression score is not a finite number.
    #[error("invalid regression score: {score}")]
    InvalidScore { score: f64 },
}

/// Failures reported by a model backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// The output was produced without a gradient tape and cannot be backpropagated.
    #[error("model output is detached from the computation graph")]
    Detached,

    /// The input tensor does not have the shape the model expects.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Any other backend-specific failure.
    #[error("model backend failure: {0}")]
    Backend(String),
}

/// Failures raised by the Grad-CAM saliency generator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SaliencyError {
    /// The designated layer does not exist or never fired during the forward pass.
    #[error("layer '{layer}' produced no capture during the forward pass")]
    LayerNotCaptured { layer: String },

    /// The backward pass could not reach the designated layer.
    #[error("model output is not differentiable with respect to layer '{layer}'")]
    NonDifferentiableOutput { layer: String },

    /// The model backend failed for a reason unrelated to attribution.
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Crate-level error covering every stage of a screening run.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Severity(#[from] SeverityError),

    #[error(transparent)]
    Saliency(#[from] SaliencyError),

    #[error(transparent)]
    Model(#[from] ModelError),

    /// Invalid configuration value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Failed to encode or write an image.
    #[error("image I/O failed: {0}")]
    Image(#[from] image::ImageError),

    /// A blocking analysis task was cancelled or panicked.
    #[error("analysis task failed: {0}")]
    Task(String),
}

/// Result type alias for retina_screen operations.
pub type Result<T> = std::result::Result<T, Error>;
