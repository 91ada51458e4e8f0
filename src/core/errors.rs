//! Error types for the sliding-window engine.
//!
//! This module defines the errors that can occur while planning a tile grid,
//! scoring tiles, accumulating their contributions and finalizing the output.
//! It also provides helper constructors so call sites can attach the stage and
//! the tile coordinates that caused a failure.

use crate::processors::planner::TileOrigin;
use thiserror::Error;

/// Boxed error type returned by external scorers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Convenient result alias for engine operations.
pub type InferResult<T> = Result<T, InferError>;

/// Stage of a sliding-window pass in which an internal error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    /// Tile extraction, scorer invocation and thread-pool setup.
    Scoring,
    /// Weighted add into the accumulation buffers.
    Accumulation,
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStage::Scoring => write!(f, "scoring"),
            ProcessingStage::Accumulation => write!(f, "accumulation"),
        }
    }
}

/// Errors that can occur during a sliding-window pass.
///
/// None of these are retried by the engine. A failing pass never yields a
/// partial output.
#[derive(Error, Debug)]
pub enum InferError {
    /// The tile/step configuration cannot cover the volume.
    #[error("invalid grid configuration on axis {axis} (tile {tile}, step {step}): {reason}")]
    InvalidGridConfiguration {
        /// Spatial axis that failed validation.
        axis: usize,
        /// Tile length on that axis.
        tile: usize,
        /// Step length on that axis.
        step: usize,
        /// Why the combination was rejected.
        reason: String,
    },

    /// The external scorer failed for a tile.
    #[error("scorer failed for tile at {origin}")]
    ScorerFailure {
        /// Origin of the (first) tile in the failing scorer call.
        origin: TileOrigin,
        /// The scorer's error.
        #[source]
        source: BoxError,
    },

    /// The scorer returned an array whose shape disagrees with the request.
    #[error("scorer output shape mismatch at tile {origin}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Origin of the (first) tile in the offending scorer call.
        origin: TileOrigin,
        /// Expected output shape.
        expected: Vec<usize>,
        /// Shape actually returned.
        actual: Vec<usize>,
    },

    /// A voxel inside the original bounds received (almost) no weight.
    #[error("incomplete coverage: voxel {voxel:?} accumulated weight {weight}")]
    IncompleteCoverage {
        /// Voxel coordinate in the original (unpadded) volume.
        voxel: Vec<usize>,
        /// Accumulated weight at that voxel.
        weight: f32,
    },

    /// The pass was aborted through its cancellation token.
    #[error("pass cancelled after {completed} of {total} tiles")]
    Cancelled {
        /// Tiles accumulated before the abort.
        completed: usize,
        /// Tiles in the grid.
        total: usize,
    },

    /// Error during internal processing.
    #[error("{kind} failed: {context}")]
    Processing {
        /// The stage of processing where the error occurred.
        kind: ProcessingStage,
        /// Additional context about the error.
        context: String,
        /// The underlying error that caused this error.
        #[source]
        source: BoxError,
    },

    /// Error indicating invalid input.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// A message describing the invalid input.
        message: String,
    },

    /// Error indicating a configuration problem.
    #[error("configuration: {message}")]
    ConfigError {
        /// A message describing the configuration error.
        message: String,
    },

    /// Error from tensor operations.
    #[error("tensor operation")]
    Tensor(#[from] ndarray::ShapeError),

    /// Error from the ONNX Runtime session.
    #[cfg(feature = "onnx")]
    #[error(transparent)]
    Session(#[from] ort::Error),
}

/// Simple string-backed error used as a `source` when no richer error exists.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SimpleError {
    message: String,
}

impl SimpleError {
    /// Creates a new simple error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl InferError {
    /// Creates an `InvalidGridConfiguration` error.
    pub fn invalid_grid(axis: usize, tile: usize, step: usize, reason: impl Into<String>) -> Self {
        Self::InvalidGridConfiguration {
            axis,
            tile,
            step,
            reason: reason.into(),
        }
    }

    /// Creates a `ScorerFailure` error for the tile at `origin`.
    pub fn scorer_failure(origin: TileOrigin, source: BoxError) -> Self {
        Self::ScorerFailure { origin, source }
    }

    /// Creates a `ShapeMismatch` error for the tile at `origin`.
    pub fn shape_mismatch(origin: TileOrigin, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            origin,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Creates an error for a processing stage.
    ///
    /// # Arguments
    ///
    /// * `kind` - The stage of processing where the error occurred.
    /// * `context` - Additional context about the error.
    /// * `error` - The underlying error that caused this error.
    pub fn processing_error(
        kind: ProcessingStage,
        context: &str,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            kind,
            context: context.to_string(),
            source: Box::new(error),
        }
    }

    /// Creates an error for the accumulation stage.
    pub fn accumulation(context: &str) -> Self {
        Self::processing_error(
            ProcessingStage::Accumulation,
            context,
            SimpleError::new(context),
        )
    }

    /// Creates an `InvalidInput` error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates a `ConfigError` error.
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Creates a configuration error naming the offending field and value.
    pub fn config_error_with_context(field: &str, value: &str, reason: &str) -> Self {
        Self::ConfigError {
            message: format!(
                "Configuration error in field '{}' with value '{}': {}",
                field, value, reason
            ),
        }
    }

    /// Creates an `InvalidInput` error for a failed validation.
    pub fn validation_error(component: &str, field: &str, expected: &str, actual: &str) -> Self {
        Self::InvalidInput {
            message: format!(
                "Validation failed in {}: field '{}' expected {}, but got '{}'",
                component, field, expected, actual
            ),
        }
    }

    /// Returns the tile origin attached to this error, if any.
    pub fn tile_origin(&self) -> Option<&TileOrigin> {
        match self {
            Self::ScorerFailure { origin, .. } | Self::ShapeMismatch { origin, .. } => {
                Some(origin)
            }
            _ => None,
        }
    }
}

impl From<crate::core::config::ConfigError> for InferError {
    fn from(error: crate::core::config::ConfigError) -> Self {
        Self::ConfigError {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scorer_failure_reports_origin() {
        let err = InferError::scorer_failure(
            TileOrigin::new(vec![2, 4, 6]),
            Box::new(SimpleError::new("device lost")),
        );
        assert_eq!(err.to_string(), "scorer failed for tile at (2, 4, 6)");
        assert_eq!(err.tile_origin().map(|o| o.coords()), Some(&[2, 4, 6][..]));

        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("device lost"));
    }

    #[test]
    fn grid_error_message_names_axis() {
        let err = InferError::invalid_grid(1, 4, 5, "step exceeds tile");
        assert_eq!(
            err.to_string(),
            "invalid grid configuration on axis 1 (tile 4, step 5): step exceeds tile"
        );
        assert!(err.tile_origin().is_none());
    }

    #[test]
    fn stage_display() {
        assert_eq!(ProcessingStage::Accumulation.to_string(), "accumulation");
        assert_eq!(ProcessingStage::Scoring.to_string(), "scoring");
        let err = InferError::accumulation("writer thread panicked");
        assert_eq!(
            err.to_string(),
            "accumulation failed: writer thread panicked"
        );
    }
}
