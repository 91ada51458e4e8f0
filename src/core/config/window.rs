//! Configuration for one sliding-window inference pass.
//!
//! Every knob is a plain value; nothing is read from global state. The
//! configuration can be loaded from and saved to JSON.

use super::errors::{ConfigError, ConfigValidator};
use super::parallel::ParallelPolicy;
use crate::core::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_MIN_WEIGHT, DEFAULT_OVERLAP, DEFAULT_QUEUE_DEPTH,
    DEFAULT_SIGMA_SCALE,
};
use crate::core::errors::{InferError, InferResult};
use crate::processors::planner::steps_from_overlap;
use serde::{Deserialize, Serialize};

/// How consecutive tile origins are spaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepSpec {
    /// Fraction of the tile shared with the neighbouring tile, in `[0, 1)`.
    Overlap(f64),
    /// Explicit step per spatial axis.
    Explicit(Vec<usize>),
}

impl Default for StepSpec {
    fn default() -> Self {
        StepSpec::Overlap(DEFAULT_OVERLAP)
    }
}

/// Shape of the per-tile importance weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightMode {
    /// Separable Gaussian centred on the tile.
    Gaussian {
        /// Sigma as a fraction of the tile length on each axis.
        sigma_scale: f32,
    },
    /// Uniform weight 1 everywhere.
    Flat,
}

impl Default for WeightMode {
    fn default() -> Self {
        WeightMode::Gaussian {
            sigma_scale: DEFAULT_SIGMA_SCALE,
        }
    }
}

/// How a volume smaller than the tile is padded before tiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// Fill with a constant value.
    Constant {
        /// Fill value.
        value: f32,
    },
    /// Repeat the nearest edge voxel.
    Replicate,
}

impl Default for PaddingMode {
    fn default() -> Self {
        PaddingMode::Constant { value: 0.0 }
    }
}

/// Where the accumulation buffers live and who writes into them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulationStrategy {
    /// One pair of whole-volume buffers, scored and written on the calling thread.
    #[default]
    Sequential,
    /// One pair of whole-volume buffers owned by a dedicated writer thread;
    /// tiles are scored in parallel and queued to it.
    SerializedWriter,
    /// Buffers split into slabs along the first spatial axis, each slab
    /// behind its own lock; tiles are scored and written in parallel.
    Partitioned {
        /// Number of slabs.
        partitions: usize,
    },
}

/// Configuration for [`SlidingWindowInferer`](crate::pipeline::SlidingWindowInferer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    /// Tile shape, one entry per spatial axis.
    pub tile_shape: Vec<usize>,
    /// Tile spacing.
    #[serde(default)]
    pub step: StepSpec,
    /// Importance weighting.
    #[serde(default)]
    pub weight_mode: WeightMode,
    /// Tiles per scorer invocation.
    #[serde(default = "SlidingWindowConfig::default_batch_size")]
    pub batch_size: usize,
    /// Padding applied to axes shorter than the tile.
    #[serde(default)]
    pub padding: PaddingMode,
    /// Lower bound for accumulated weights at normalization time.
    #[serde(default = "SlidingWindowConfig::default_min_weight")]
    pub min_weight: f32,
    /// Fail with `IncompleteCoverage` instead of clamping uncovered voxels.
    #[serde(default = "SlidingWindowConfig::default_verify_coverage")]
    pub verify_coverage: bool,
    /// Also produce an argmax label volume.
    #[serde(default)]
    pub emit_labels: bool,
    /// Accumulation strategy.
    #[serde(default)]
    pub accumulation: AccumulationStrategy,
    /// Scored batches allowed in flight for the serialized writer.
    #[serde(default = "SlidingWindowConfig::default_queue_depth")]
    pub queue_depth: usize,
    /// Thread limits for parallel strategies.
    #[serde(default)]
    pub parallel: ParallelPolicy,
}

impl SlidingWindowConfig {
    /// Creates a configuration for the given tile shape with default settings.
    pub fn new(tile_shape: impl Into<Vec<usize>>) -> Self {
        Self {
            tile_shape: tile_shape.into(),
            step: StepSpec::default(),
            weight_mode: WeightMode::default(),
            batch_size: Self::default_batch_size(),
            padding: PaddingMode::default(),
            min_weight: Self::default_min_weight(),
            verify_coverage: Self::default_verify_coverage(),
            emit_labels: false,
            accumulation: AccumulationStrategy::default(),
            queue_depth: Self::default_queue_depth(),
            parallel: ParallelPolicy::default(),
        }
    }

    /// Space tiles by an overlap fraction.
    pub fn with_overlap(mut self, overlap: f64) -> Self {
        self.step = StepSpec::Overlap(overlap);
        self
    }

    /// Space tiles by an explicit step per axis.
    pub fn with_step(mut self, step: impl Into<Vec<usize>>) -> Self {
        self.step = StepSpec::Explicit(step.into());
        self
    }

    /// Set the weight mode.
    pub fn with_weight_mode(mut self, mode: WeightMode) -> Self {
        self.weight_mode = mode;
        self
    }

    /// Set the scorer batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the padding mode.
    pub fn with_padding(mut self, padding: PaddingMode) -> Self {
        self.padding = padding;
        self
    }

    /// Set the minimum weight used at normalization.
    pub fn with_min_weight(mut self, min_weight: f32) -> Self {
        self.min_weight = min_weight;
        self
    }

    /// Enable or disable the post-pass coverage check.
    pub fn with_verify_coverage(mut self, verify: bool) -> Self {
        self.verify_coverage = verify;
        self
    }

    /// Enable or disable argmax label output.
    pub fn with_labels(mut self, emit_labels: bool) -> Self {
        self.emit_labels = emit_labels;
        self
    }

    /// Set the accumulation strategy.
    pub fn with_accumulation(mut self, strategy: AccumulationStrategy) -> Self {
        self.accumulation = strategy;
        self
    }

    /// Set the writer queue depth.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the parallel policy.
    pub fn with_parallel_policy(mut self, policy: ParallelPolicy) -> Self {
        self.parallel = policy;
        self
    }

    /// Number of spatial axes.
    pub fn spatial_dims(&self) -> usize {
        self.tile_shape.len()
    }

    /// Resolves the step shape for the configured tile shape.
    ///
    /// Explicit steps are returned as given; the planner rejects steps that
    /// cannot cover the volume.
    pub fn resolve_steps(&self) -> InferResult<Vec<usize>> {
        match &self.step {
            StepSpec::Overlap(overlap) => steps_from_overlap(&self.tile_shape, *overlap),
            StepSpec::Explicit(steps) => {
                if steps.len() != self.tile_shape.len() {
                    return Err(InferError::config_error_with_context(
                        "step",
                        &format!("{:?}", steps),
                        &format!("expected {} axes", self.tile_shape.len()),
                    ));
                }
                Ok(steps.clone())
            }
        }
    }

    /// Parses a configuration from JSON and validates it.
    pub fn from_json(json: &str) -> InferResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| InferError::config_error(format!("invalid JSON config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration to pretty-printed JSON.
    pub fn to_json(&self) -> InferResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| InferError::config_error(format!("failed to serialize config: {e}")))
    }

    fn default_batch_size() -> usize {
        DEFAULT_BATCH_SIZE
    }

    fn default_min_weight() -> f32 {
        DEFAULT_MIN_WEIGHT
    }

    fn default_verify_coverage() -> bool {
        true
    }

    fn default_queue_depth() -> usize {
        DEFAULT_QUEUE_DEPTH
    }
}

impl ConfigValidator for SlidingWindowConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.validate_shape(&self.tile_shape, "tile_shape")?;
        if let StepSpec::Overlap(overlap) = self.step {
            self.validate_f64_half_open(overlap, 0.0, 1.0, "overlap")?;
        }
        if let WeightMode::Gaussian { sigma_scale } = self.weight_mode {
            if !sigma_scale.is_finite() || sigma_scale < 0.0 {
                return Err(ConfigError::InvalidConfig {
                    message: format!("sigma_scale must be finite and >= 0, got {}", sigma_scale),
                });
            }
        }
        if let PaddingMode::Constant { value } = self.padding {
            if !value.is_finite() {
                return Err(ConfigError::InvalidConfig {
                    message: format!("padding value must be finite, got {}", value),
                });
            }
        }
        self.validate_batch_size(self.batch_size)?;
        self.validate_positive_f32(self.min_weight, "min_weight")?;
        if self.queue_depth == 0 {
            return Err(ConfigError::InvalidConfig {
                message: "queue_depth must be greater than 0".to_string(),
            });
        }
        if self.accumulation == (AccumulationStrategy::Partitioned { partitions: 0 }) {
            return Err(ConfigError::InvalidConfig {
                message: "partitions must be greater than 0".to_string(),
            });
        }
        if let Some(threads) = self.parallel.max_threads {
            self.validate_thread_count(threads)?;
        }
        Ok(())
    }

    fn get_defaults() -> Self {
        Self::new(vec![96, 96, 96])
    }
}
