//! The sliding-window inference pipeline.
//!
//! This module provides [`SlidingWindowInferer`], which combines tile planning,
//! padding, weighted accumulation and normalization into a single pass over a
//! volume, along with the statistics it reports.

pub mod sliding_window;
pub mod stats;

pub use sliding_window::{InferenceOutput, SlidingWindowInferer};
pub use stats::{InferenceStats, PassStats, StatsManager};
