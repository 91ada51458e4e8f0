//! The core module of the sliding-window engine.
//!
//! This module contains the fundamental components shared by every stage:
//! - Configuration management
//! - Constants used throughout the engine
//! - Error handling
//! - Cooperative cancellation
//! - The scorer trait and its adapters
//! - Validation helpers
//! - ONNX Runtime integration (with the `onnx` feature)
//!
//! It also provides re-exports of commonly used types for convenience.

pub mod cancel;
pub mod config;
pub mod constants;
pub mod errors;
#[cfg(feature = "onnx")]
pub mod inference;
pub mod traits;
pub mod validation;

pub use cancel::CancellationToken;
pub use config::{
    AccumulationStrategy, ConfigError, ConfigValidator, PaddingMode, ParallelPolicy,
    SlidingWindowConfig, StepSpec, WeightMode,
};
pub use constants::*;
pub use errors::{BoxError, InferError, InferResult, ProcessingStage};
#[cfg(feature = "onnx")]
pub use inference::{OrtScorer, load_session};
pub use traits::{ConstantScorer, FnScorer, Scorer, scorer_fn};

/// Initializes the tracing subscriber for logging.
///
/// This function sets up the tracing subscriber with environment filter and formatting layer.
/// It's typically called at the start of an application to enable logging.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
