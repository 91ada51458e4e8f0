//! Trait definitions for the sliding-window engine.
//!
//! The engine depends on the model only through [`Scorer`]: anything that can
//! turn a batch of tiles into per-class scores can drive a pass, from an ONNX
//! session to a closure in a unit test.

pub mod scorer;

pub use scorer::{ConstantScorer, FnScorer, Scorer, expected_output_shape, scorer_fn};
