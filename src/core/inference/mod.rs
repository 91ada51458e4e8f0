//! ONNX Runtime backed scoring.
//!
//! Available with the `onnx` feature. [`OrtScorer`] wraps a pool of sessions
//! loaded from one model file and exposes them through the
//! [`Scorer`](crate::core::traits::Scorer) trait, so a pass can be driven by a
//! real segmentation network.

pub mod ort_scorer;
pub mod session;

pub use ort_scorer::OrtScorer;
pub use session::load_session;
