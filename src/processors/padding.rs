//! Padding volumes up to the tile shape and cropping results back.
//!
//! Axes shorter than the tile are padded symmetrically: the original data is
//! placed at offset `(padded - original) / 2` and the remainder goes after it.
//! The [`PadRegion`] remembers that placement so outputs can be cropped back
//! to exactly the original voxels.

use crate::core::config::PaddingMode;
use crate::core::errors::{InferError, InferResult};
use ndarray::{ArrayD, ArrayViewD, CowArray, IxDyn, Slice};

/// Placement of the original volume inside its padded counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PadRegion {
    offsets: Vec<usize>,
    original_shape: Vec<usize>,
    padded_shape: Vec<usize>,
}

impl PadRegion {
    /// Centres `original_shape` inside `padded_shape`.
    pub fn symmetric(original_shape: &[usize], padded_shape: &[usize]) -> InferResult<Self> {
        if original_shape.len() != padded_shape.len() {
            return Err(InferError::invalid_input(format!(
                "original shape {:?} and padded shape {:?} differ in rank",
                original_shape, padded_shape
            )));
        }
        let mut offsets = Vec::with_capacity(original_shape.len());
        for (axis, (&original, &padded)) in original_shape.iter().zip(padded_shape).enumerate() {
            if padded < original {
                return Err(InferError::invalid_input(format!(
                    "padded length {} on axis {} is smaller than original length {}",
                    padded, axis, original
                )));
            }
            offsets.push((padded - original) / 2);
        }
        Ok(Self {
            offsets,
            original_shape: original_shape.to_vec(),
            padded_shape: padded_shape.to_vec(),
        })
    }

    /// Offset of the original data on each spatial axis.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Spatial shape before padding.
    pub fn original_shape(&self) -> &[usize] {
        &self.original_shape
    }

    /// Spatial shape after padding.
    pub fn padded_shape(&self) -> &[usize] {
        &self.padded_shape
    }

    /// True when no axis needed padding.
    pub fn is_identity(&self) -> bool {
        self.original_shape == self.padded_shape
    }

    /// Slice selecting the original data on array axis `axis`, where the first
    /// `leading` array axes are not spatial (channels, classes).
    fn slice_for(&self, axis: usize, leading: usize) -> Slice {
        if axis < leading {
            Slice::from(..)
        } else {
            let spatial = axis - leading;
            let start = self.offsets[spatial];
            Slice::from(start..start + self.original_shape[spatial])
        }
    }

    /// Crops an array of shape `[leading…, padded…]` back to `[leading…, original…]`.
    pub fn crop<'a>(
        &self,
        padded: ArrayViewD<'a, f32>,
        leading: usize,
    ) -> InferResult<ArrayViewD<'a, f32>> {
        self.check_spatial(padded.shape(), leading)?;
        let mut view = padded;
        view.slice_each_axis_inplace(|desc| self.slice_for(desc.axis.index(), leading));
        Ok(view)
    }

    fn check_spatial(&self, shape: &[usize], leading: usize) -> InferResult<()> {
        if shape.len() != leading + self.padded_shape.len()
            || shape[leading..] != self.padded_shape[..]
        {
            return Err(InferError::invalid_input(format!(
                "array shape {:?} does not end in padded shape {:?}",
                shape, self.padded_shape
            )));
        }
        Ok(())
    }
}

/// Pads a channel-first volume `[channels, spatial…]` to `region.padded_shape()`.
///
/// Returns a borrowed view when no padding is needed.
pub fn pad_volume<'a>(
    volume: ArrayViewD<'a, f32>,
    region: &PadRegion,
    mode: PaddingMode,
) -> InferResult<CowArray<'a, f32, IxDyn>> {
    let shape = volume.shape().to_vec();
    if shape.len() != region.original_shape.len() + 1 || shape[1..] != region.original_shape[..] {
        return Err(InferError::invalid_input(format!(
            "volume shape {:?} does not match [channels, {:?}]",
            shape, region.original_shape
        )));
    }
    if region.is_identity() {
        return Ok(CowArray::from(volume));
    }

    let mut full_shape = Vec::with_capacity(shape.len());
    full_shape.push(shape[0]);
    full_shape.extend_from_slice(&region.padded_shape);

    let padded = match mode {
        PaddingMode::Constant { value } => {
            let mut out = ArrayD::from_elem(IxDyn(&full_shape), value);
            out.slice_each_axis_mut(|desc| region.slice_for(desc.axis.index(), 1))
                .assign(&volume);
            out
        }
        PaddingMode::Replicate => {
            let mut src = vec![0usize; shape.len()];
            ArrayD::from_shape_fn(IxDyn(&full_shape), |idx| {
                src[0] = idx[0];
                for axis in 1..shape.len() {
                    let spatial = axis - 1;
                    let offset = region.offsets[spatial] as isize;
                    let pos = idx[axis] as isize - offset;
                    src[axis] = pos.clamp(0, shape[axis] as isize - 1) as usize;
                }
                volume[src.as_slice()]
            })
        }
    };

    tracing::debug!(
        "Padded volume {:?} -> {:?} ({:?})",
        shape,
        full_shape,
        mode
    );
    Ok(CowArray::from(padded))
}
