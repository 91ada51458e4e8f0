//! Importance weights applied to every tile before accumulation.
//!
//! Tile predictions are least reliable near tile faces, where the model saw
//! the least context. A Gaussian mask down-weights those voxels so that, where
//! tiles overlap, the centre of one tile dominates the edge of its neighbour
//! and no seams appear in the blended output.

use crate::core::config::WeightMode;
use crate::core::constants::{MIN_GAUSSIAN_SIGMA, MIN_IMPORTANCE};
use crate::core::errors::{InferError, InferResult};
use crate::core::validation::validate_non_empty_shape;
use ndarray::{ArrayD, ArrayViewD, IxDyn};

/// Per-voxel tile weights, generated once per pass and shared read-only.
///
/// Every entry is strictly positive and the peak is exactly 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightMask {
    weights: ArrayD<f32>,
    mode: WeightMode,
}

impl WeightMask {
    /// Generates the mask for `tile_shape`.
    ///
    /// A Gaussian whose sigma is unusable on any axis (zero scale, overflow)
    /// falls back to a flat mask; [`mode`](Self::mode) reports the mode that
    /// was actually used.
    pub fn generate(tile_shape: &[usize], mode: WeightMode) -> InferResult<Self> {
        if tile_shape.is_empty() {
            return Err(InferError::invalid_input("tile shape has no axes"));
        }
        validate_non_empty_shape(tile_shape, "tile_shape")?;

        match mode {
            WeightMode::Flat => Ok(Self::flat(tile_shape)),
            WeightMode::Gaussian { sigma_scale } => {
                let sigmas: Vec<f64> = tile_shape
                    .iter()
                    .map(|&len| sigma_scale as f64 * len as f64)
                    .collect();
                if sigmas
                    .iter()
                    .any(|&sigma| !sigma.is_finite() || sigma < MIN_GAUSSIAN_SIGMA)
                {
                    tracing::warn!(
                        "Gaussian sigma {:?} is degenerate for tile {:?}; using flat weights",
                        sigmas,
                        tile_shape
                    );
                    return Ok(Self::flat(tile_shape));
                }

                let Some(profiles) = tile_shape
                    .iter()
                    .zip(&sigmas)
                    .map(|(&len, &sigma)| gaussian_profile(len, sigma))
                    .collect::<Option<Vec<Vec<f64>>>>()
                else {
                    tracing::warn!(
                        "Gaussian sigma {:?} underflows on every voxel of tile {:?}; using flat weights",
                        sigmas,
                        tile_shape
                    );
                    return Ok(Self::flat(tile_shape));
                };
                let weights = ArrayD::from_shape_fn(IxDyn(tile_shape), |idx| {
                    let w: f64 = profiles
                        .iter()
                        .enumerate()
                        .map(|(axis, profile)| profile[idx[axis]])
                        .product();
                    (w as f32).max(MIN_IMPORTANCE)
                });
                Ok(Self { weights, mode })
            }
        }
    }

    fn flat(tile_shape: &[usize]) -> Self {
        Self {
            weights: ArrayD::ones(IxDyn(tile_shape)),
            mode: WeightMode::Flat,
        }
    }

    /// The weights, shaped like the tile.
    pub fn view(&self) -> ArrayViewD<'_, f32> {
        self.weights.view()
    }

    /// Tile shape.
    pub fn shape(&self) -> &[usize] {
        self.weights.shape()
    }

    /// Mode used to build the mask.
    pub fn mode(&self) -> WeightMode {
        self.mode
    }

    /// Smallest weight in the mask.
    pub fn min_weight(&self) -> f32 {
        self.weights.iter().copied().fold(f32::INFINITY, f32::min)
    }
}

/// Gaussian along one axis, centred at `(len - 1) / 2` and scaled to peak 1.
///
/// `None` when every sample underflows to zero.
fn gaussian_profile(len: usize, sigma: f64) -> Option<Vec<f64>> {
    let center = (len as f64 - 1.0) / 2.0;
    let denom = 2.0 * sigma * sigma;
    let raw: Vec<f64> = (0..len)
        .map(|x| {
            let d = x as f64 - center;
            (-(d * d) / denom).exp()
        })
        .collect();
    let peak = raw.iter().copied().fold(0.0f64, f64::max);
    if peak > 0.0 {
        Some(raw.into_iter().map(|v| v / peak).collect())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::DEFAULT_SIGMA_SCALE;
    use approx::assert_abs_diff_eq;

    fn gaussian() -> WeightMode {
        WeightMode::Gaussian {
            sigma_scale: DEFAULT_SIGMA_SCALE,
        }
    }

    #[test]
    fn gaussian_is_positive_with_unit_peak() {
        for shape in [vec![4, 4, 4], vec![5, 8, 3], vec![1, 9], vec![96]] {
            let mask = WeightMask::generate(&shape, gaussian()).unwrap();
            assert_eq!(mask.shape(), shape.as_slice());
            assert!(mask.view().iter().all(|&w| w > 0.0));
            let peak = mask.view().iter().copied().fold(0.0f32, f32::max);
            assert_abs_diff_eq!(peak, 1.0, epsilon = 1e-6);
            assert!(mask.min_weight() >= MIN_IMPORTANCE);
        }
    }

    #[test]
    fn gaussian_peaks_at_center_and_falls_off() {
        let mask = WeightMask::generate(&[7, 7], gaussian()).unwrap();
        let w = mask.view();
        assert_eq!(w[[3, 3]], 1.0);
        for axis_pos in 0..3 {
            // walking from a face toward the centre never decreases
            assert!(w[[axis_pos, 3]] <= w[[axis_pos + 1, 3]]);
            assert!(w[[3, axis_pos]] <= w[[3, axis_pos + 1]]);
            assert!(w[[6 - axis_pos, 3]] <= w[[5 - axis_pos, 3]]);
        }
        // symmetric about the centre
        assert_eq!(w[[0, 2]], w[[6, 4]]);
    }

    #[test]
    fn even_tiles_peak_on_both_central_voxels() {
        let mask = WeightMask::generate(&[4], gaussian()).unwrap();
        let w = mask.view();
        assert_eq!(w[[1]], 1.0);
        assert_eq!(w[[2]], 1.0);
        assert!(w[[0]] < w[[1]]);
        assert_eq!(w[[0]], w[[3]]);
    }

    #[test]
    fn flat_mode_is_uniform() {
        let mask = WeightMask::generate(&[3, 4], WeightMode::Flat).unwrap();
        assert!(mask.view().iter().all(|&w| w == 1.0));
        assert_eq!(mask.mode(), WeightMode::Flat);
    }

    #[test]
    fn degenerate_sigma_falls_back_to_flat() {
        let mask = WeightMask::generate(&[2, 2], WeightMode::Gaussian { sigma_scale: 0.0 })
            .unwrap();
        assert_eq!(mask.mode(), WeightMode::Flat);
        assert!(mask.view().iter().all(|&w| w == 1.0));
    }

    #[test]
    fn underflowing_gaussian_reports_flat_mode() {
        // sigma 0.0125 on a two-voxel tile: both samples sit 0.5 from the
        // centre and exp(-800) underflows.
        let mask =
            WeightMask::generate(&[2, 4], WeightMode::Gaussian { sigma_scale: 0.00625 }).unwrap();
        assert_eq!(mask.mode(), WeightMode::Flat);
        assert!(mask.view().iter().all(|&w| w == 1.0));
    }

    #[test]
    fn narrow_gaussian_is_floored() {
        let mask =
            WeightMask::generate(&[64], WeightMode::Gaussian { sigma_scale: 0.01 }).unwrap();
        assert_eq!(mask.min_weight(), MIN_IMPORTANCE);
    }

    #[test]
    fn empty_tile_is_rejected() {
        assert!(WeightMask::generate(&[], WeightMode::Flat).is_err());
        assert!(WeightMask::generate(&[3, 0], gaussian()).is_err());
    }
}
