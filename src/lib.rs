//! # voxtile
//!
//! Sliding-window inference and weighted aggregation for N-dimensional
//! volumes.
//!
//! A model that only accepts fixed-size inputs can still segment an
//! arbitrarily large volume: the volume is cut into overlapping tiles, every
//! tile is scored, and the overlapping scores are blended back together with a
//! Gaussian importance weight so that no seams appear where tiles meet.
//!
//! ## Features
//!
//! - Tile planning for any number of spatial axes, with overlap or explicit steps
//! - Gaussian or flat importance weighting
//! - Symmetric padding of volumes smaller than the tile, cropped back afterwards
//! - Sequential, serialized-writer and spatially partitioned accumulation
//! - Cooperative cancellation and deadlines
//! - Argmax labels and Dice evaluation of label volumes
//! - ONNX Runtime scorer behind the `onnx` feature
//!
//! ## Modules
//!
//! * [`core`] - Scorer trait, configuration, error handling and cancellation
//! * [`processors`] - Planning, padding, weighting, accumulation and finalization
//! * [`pipeline`] - The [`SlidingWindowInferer`](pipeline::SlidingWindowInferer) entry point
//!
//! ## Quick Start
//!
//! ```rust
//! use voxtile::prelude::*;
//! use ndarray::{ArrayD, IxDyn};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SlidingWindowConfig::new(vec![4, 4, 4]).with_step(vec![2, 2, 2]);
//! let inferer = SlidingWindowInferer::new(config)?;
//!
//! // [in_channels, depth, height, width]
//! let volume = ArrayD::<f32>::zeros(IxDyn(&[1, 10, 10, 10]));
//! let output = inferer.infer(volume.view(), &ConstantScorer::new(2, 1.0))?;
//!
//! assert_eq!(output.scores.shape(), &[2, 10, 10, 10]);
//! assert_eq!(output.stats.tiles, 64);
//! # Ok(())
//! # }
//! ```
//!
//! ### JSON Configuration
//!
//! ```rust
//! use voxtile::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SlidingWindowConfig::from_json(r#"
//! {
//!   "tile_shape": [96, 96, 96],
//!   "step": { "overlap": 0.5 },
//!   "weight_mode": { "gaussian": { "sigma_scale": 0.125 } },
//!   "batch_size": 4,
//!   "accumulation": { "partitioned": { "partitions": 4 } }
//! }
//! "#)?;
//!
//! let inferer = SlidingWindowInferer::new(config)?;
//! assert_eq!(inferer.planner().step_shape(), &[48, 48, 48]);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod pipeline;
pub mod processors;

/// Prelude module for convenient imports.
///
/// ```rust
/// use voxtile::prelude::*;
/// ```
///
/// Included items cover a complete pass: the inferer and its configuration,
/// the scorer trait with its closure adapter, cancellation, and the error
/// types. Stage-level types live in [`processors`](crate::processors).
pub mod prelude {
    pub use crate::core::cancel::CancellationToken;
    pub use crate::core::config::{
        AccumulationStrategy, ConfigValidator, PaddingMode, ParallelPolicy, SlidingWindowConfig,
        StepSpec, WeightMode,
    };
    pub use crate::core::errors::{BoxError, InferError, InferResult};
    pub use crate::core::traits::{ConstantScorer, Scorer, scorer_fn};
    pub use crate::pipeline::{InferenceOutput, PassStats, SlidingWindowInferer};

    #[cfg(feature = "onnx")]
    pub use crate::core::inference::OrtScorer;
}
