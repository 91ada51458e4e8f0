//! The scoring capability invoked once per batch of tiles.

use crate::core::errors::BoxError;
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use std::sync::Arc;

/// A deterministic function from a batch of tiles to per-class scores.
///
/// The input has shape `[batch, in_channels, t0, t1, …]` and the output must
/// have shape `[batch, classes, t0, t1, …]` with the same spatial extent. The
/// number of classes must not change between calls within one pass.
///
/// Implementations are shared across worker threads, so they must be
/// `Send + Sync`; a scorer may block for as long as it needs, no engine lock
/// is held while it runs.
pub trait Scorer: Send + Sync {
    /// Scores a batch of tiles.
    fn score(&self, tiles: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError>;

    /// Human-readable name used in logs.
    fn name(&self) -> &str {
        "scorer"
    }
}

impl<S: Scorer + ?Sized> Scorer for &S {
    fn score(&self, tiles: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError> {
        (**self).score(tiles)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<S: Scorer + ?Sized> Scorer for Box<S> {
    fn score(&self, tiles: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError> {
        (**self).score(tiles)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<S: Scorer + ?Sized> Scorer for Arc<S> {
    fn score(&self, tiles: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError> {
        (**self).score(tiles)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Adapts a closure into a [`Scorer`].
pub struct FnScorer<F> {
    name: String,
    func: F,
}

impl<F> std::fmt::Debug for FnScorer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnScorer").field("name", &self.name).finish()
    }
}

/// Wraps `func` as a scorer named `name`.
///
/// ```rust
/// use ndarray::{ArrayD, ArrayViewD, Axis};
/// use voxtile::core::traits::{Scorer, scorer_fn};
///
/// // Two classes: the input channel and its negation.
/// let scorer = scorer_fn("sign", |tiles: ArrayViewD<'_, f32>| {
///     let positive = tiles.to_owned();
///     let negative = tiles.mapv(|v| -v);
///     Ok(ndarray::concatenate(Axis(1), &[positive.view(), negative.view()])?)
/// });
/// let out = scorer.score(ArrayD::zeros(vec![1, 1, 2, 2]).view()).unwrap();
/// assert_eq!(out.shape(), &[1, 2, 2, 2]);
/// ```
pub fn scorer_fn<F>(name: impl Into<String>, func: F) -> FnScorer<F>
where
    F: Fn(ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError> + Send + Sync,
{
    FnScorer {
        name: name.into(),
        func,
    }
}

impl<F> Scorer for FnScorer<F>
where
    F: Fn(ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError> + Send + Sync,
{
    fn score(&self, tiles: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError> {
        (self.func)(tiles)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A scorer that returns the same value for every class and voxel.
///
/// The weighted average of a constant is the constant, which makes this the
/// reference double for checking accumulation and normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantScorer {
    classes: usize,
    value: f32,
}

impl ConstantScorer {
    /// Creates a scorer emitting `value` for `classes` classes.
    pub fn new(classes: usize, value: f32) -> Self {
        Self { classes, value }
    }
}

impl Scorer for ConstantScorer {
    fn score(&self, tiles: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError> {
        let mut shape = tiles.shape().to_vec();
        if shape.len() < 2 {
            return Err(format!("expected [batch, channels, ...] input, got {:?}", shape).into());
        }
        shape[1] = self.classes;
        Ok(ArrayD::from_elem(IxDyn(&shape), self.value))
    }

    fn name(&self) -> &str {
        "constant"
    }
}

/// Expected scorer output shape for a batch of `batch` tiles.
pub fn expected_output_shape(batch: usize, classes: usize, tile_shape: &[usize]) -> Vec<usize> {
    let mut shape = Vec::with_capacity(tile_shape.len() + 2);
    shape.push(batch);
    shape.push(classes);
    shape.extend_from_slice(tile_shape);
    shape
}
