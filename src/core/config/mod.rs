//! Configuration management for sliding-window inference.
//!
//! This module provides configuration types, validation traits, and utilities
//! for describing one inference pass.

pub mod errors;
pub mod parallel;
pub mod window;

// Re-export commonly used types
pub use errors::{ConfigError, ConfigValidator, ConfigValidatorExt};
pub use parallel::ParallelPolicy;
pub use window::{AccumulationStrategy, PaddingMode, SlidingWindowConfig, StepSpec, WeightMode};
