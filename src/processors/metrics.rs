//! Label-volume evaluation helpers.
//!
//! Used after a pass to compare predicted labels with a reference
//! segmentation: one-hot expansion and per-class Dice overlap.

use crate::core::errors::{InferError, InferResult};
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Zip};

/// Expands a label volume `[spatial…]` to `[classes, spatial…]` with 1.0 at
/// each voxel's class.
pub fn one_hot(labels: ArrayViewD<'_, usize>, classes: usize) -> InferResult<ArrayD<f32>> {
    if let Some(&label) = labels.iter().find(|&&label| label >= classes) {
        return Err(InferError::invalid_input(format!(
            "label {} out of range for {} classes",
            label, classes
        )));
    }
    let mut shape = Vec::with_capacity(labels.ndim() + 1);
    shape.push(classes);
    shape.extend_from_slice(labels.shape());
    let mut encoded = ArrayD::zeros(IxDyn(&shape));
    for (class, mut plane) in encoded.axis_iter_mut(Axis(0)).enumerate() {
        Zip::from(&mut plane)
            .and(&labels)
            .for_each(|v, &label| *v = if label == class { 1.0 } else { 0.0 });
    }
    Ok(encoded)
}

/// Per-class Dice scores for one prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct DiceReport {
    /// Dice per class; `None` when the class is absent from the reference.
    pub per_class: Vec<Option<f64>>,
}

impl DiceReport {
    /// Mean over the classes that have a score.
    pub fn mean(&self) -> Option<f64> {
        let scored: Vec<f64> = self.per_class.iter().flatten().copied().collect();
        if scored.is_empty() {
            None
        } else {
            Some(scored.iter().sum::<f64>() / scored.len() as f64)
        }
    }
}

/// Computes `2·|P ∩ T| / (|P| + |T|)` per class.
///
/// Classes missing from `target` are reported as `None` rather than scored,
/// whatever the prediction says. With `include_background == false` class 0 is
/// skipped and reported as `None`.
pub fn dice(
    predicted: ArrayViewD<'_, usize>,
    target: ArrayViewD<'_, usize>,
    classes: usize,
    include_background: bool,
) -> InferResult<DiceReport> {
    if predicted.shape() != target.shape() {
        return Err(InferError::validation_error(
            "dice",
            "predicted",
            &format!("shape {:?}", target.shape()),
            &format!("{:?}", predicted.shape()),
        ));
    }

    let mut intersection = vec![0u64; classes];
    let mut predicted_count = vec![0u64; classes];
    let mut target_count = vec![0u64; classes];
    for (&p, &t) in predicted.iter().zip(target.iter()) {
        if p >= classes || t >= classes {
            return Err(InferError::invalid_input(format!(
                "label pair ({}, {}) out of range for {} classes",
                p, t, classes
            )));
        }
        predicted_count[p] += 1;
        target_count[t] += 1;
        if p == t {
            intersection[p] += 1;
        }
    }

    let per_class = (0..classes)
        .map(|class| {
            if (class == 0 && !include_background) || target_count[class] == 0 {
                return None;
            }
            let denom = (predicted_count[class] + target_count[class]) as f64;
            Some(2.0 * intersection[class] as f64 / denom)
        })
        .collect();
    Ok(DiceReport { per_class })
}
