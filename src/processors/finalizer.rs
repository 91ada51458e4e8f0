//! Normalization of accumulated sums into the final output.

use crate::core::constants::DEFAULT_MIN_WEIGHT;
use crate::core::errors::{InferError, InferResult};
use crate::processors::aggregator::AccumulationBuffers;
use crate::processors::padding::PadRegion;
use ndarray::{ArrayD, ArrayViewD, Axis, Dimension, Zip};

/// Scores and labels over the original, unpadded volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalized {
    /// Per-class scores, `[classes, spatial…]`.
    pub scores: ArrayD<f32>,
    /// Per-voxel argmax class, `[spatial…]`, when requested.
    pub labels: Option<ArrayD<usize>>,
}

/// Turns accumulation buffers into averaged scores.
///
/// `output[c, v] = score_sum[c, v] / max(weight_sum[v], min_weight)`, cropped
/// back to the original shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Finalizer {
    min_weight: f32,
    verify_coverage: bool,
    emit_labels: bool,
}

impl Default for Finalizer {
    fn default() -> Self {
        Self {
            min_weight: DEFAULT_MIN_WEIGHT,
            verify_coverage: true,
            emit_labels: false,
        }
    }
}

impl Finalizer {
    /// Creates a finalizer that verifies coverage and emits no labels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lower bound applied to weights before division.
    pub fn with_min_weight(mut self, min_weight: f32) -> Self {
        self.min_weight = min_weight;
        self
    }

    /// Enables or disables the coverage check.
    pub fn with_verify_coverage(mut self, verify: bool) -> Self {
        self.verify_coverage = verify;
        self
    }

    /// Enables or disables argmax labels.
    pub fn with_labels(mut self, emit_labels: bool) -> Self {
        self.emit_labels = emit_labels;
        self
    }

    /// Normalizes, crops and optionally labels the accumulated sums.
    ///
    /// # Errors
    ///
    /// `IncompleteCoverage` naming the first voxel (row-major, original
    /// coordinates) whose weight is below `min_weight`, when verification is on.
    pub fn finalize(
        &self,
        buffers: AccumulationBuffers,
        region: &PadRegion,
    ) -> InferResult<Finalized> {
        if buffers.base().iter().any(|&b| b != 0) || buffers.extent() != region.padded_shape() {
            return Err(InferError::invalid_input(format!(
                "buffers at {:?} with extent {:?} do not cover padded shape {:?}",
                buffers.base(),
                buffers.extent(),
                region.padded_shape()
            )));
        }

        let (score_sum, weight_sum) = buffers.into_parts();
        let weights = region.crop(weight_sum.view(), 0)?;

        if self.verify_coverage {
            check_coverage(&weights, self.min_weight)?;
        }

        let mut scores = region.crop(score_sum.view(), 1)?.to_owned();
        let min_weight = self.min_weight;
        for mut plane in scores.axis_iter_mut(Axis(0)) {
            Zip::from(&mut plane)
                .and(&weights)
                .for_each(|s, &w| *s /= w.max(min_weight));
        }

        let labels = if self.emit_labels {
            Some(argmax_labels(scores.view())?)
        } else {
            None
        };

        tracing::debug!(
            "Finalized scores {:?} (labels: {})",
            scores.shape(),
            labels.is_some()
        );
        Ok(Finalized { scores, labels })
    }
}

fn check_coverage(weights: &ArrayViewD<'_, f32>, min_weight: f32) -> InferResult<()> {
    let uncovered = weights
        .indexed_iter()
        .find(|(_, w)| !(**w >= min_weight));
    match uncovered {
        Some((voxel, &weight)) => Err(InferError::IncompleteCoverage {
            voxel: voxel.slice().to_vec(),
            weight,
        }),
        None => Ok(()),
    }
}

/// Per-voxel index of the highest-scoring class.
///
/// `scores` is `[classes, spatial…]`. Ties go to the lowest class index and
/// NaN never wins; a voxel whose scores are all NaN gets class 0.
pub fn argmax_labels(scores: ArrayViewD<'_, f32>) -> InferResult<ArrayD<usize>> {
    if scores.ndim() < 2 || scores.shape()[0] == 0 {
        return Err(InferError::invalid_input(format!(
            "expected [classes, spatial...] scores with at least one class, got {:?}",
            scores.shape()
        )));
    }
    Ok(scores.map_axis(Axis(0), |lane| {
        let mut best: Option<(usize, f32)> = None;
        for (class, &value) in lane.iter().enumerate() {
            if value.is_nan() {
                continue;
            }
            match best {
                Some((_, top)) if value <= top => {}
                _ => best = Some((class, value)),
            }
        }
        best.map_or(0, |(class, _)| class)
    }))
}
