//! Processing stages of a sliding-window pass.
//!
//! # Modules
//!
//! * `planner` - Tile grid planning and overlap-to-step conversion
//! * `padding` - Padding volumes up to the tile shape and cropping back
//! * `importance` - Gaussian and flat importance weights
//! * `aggregator` - Batched scoring and weighted accumulation
//! * `finalizer` - Normalization, cropping and argmax labels
//! * `metrics` - One-hot encoding and Dice overlap for label volumes

pub mod aggregator;
pub mod finalizer;
pub mod importance;
pub mod metrics;
pub mod padding;
pub mod planner;

pub use aggregator::{AccumulationBuffers, Accumulated, Aggregator, score_batch};
pub use finalizer::{Finalized, Finalizer, argmax_labels};
pub use importance::WeightMask;
pub use metrics::{DiceReport, dice, one_hot};
pub use padding::{PadRegion, pad_volume};
pub use planner::{TileGrid, TileOrigin, TilePlanner, axis_origins, steps_from_overlap};
