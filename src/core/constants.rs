//! Constants used throughout the sliding-window engine.

/// The default Gaussian spread, as a fraction of the tile length on each axis.
pub const DEFAULT_SIGMA_SCALE: f32 = 0.125;

/// The default overlap fraction between neighbouring tiles.
pub const DEFAULT_OVERLAP: f64 = 0.25;

/// The default number of tiles per scorer invocation.
pub const DEFAULT_BATCH_SIZE: usize = 1;

/// The default number of scored batches that may wait for the writer thread.
///
/// Bounds the memory held by in-flight scorer outputs.
pub const DEFAULT_QUEUE_DEPTH: usize = 4;

/// Lower bound applied to accumulated weights before division.
pub const DEFAULT_MIN_WEIGHT: f32 = 1e-6;

/// Floor for every entry of a Gaussian importance mask.
pub const MIN_IMPORTANCE: f32 = 1e-3;

/// Smallest Gaussian sigma (in voxels) considered numerically usable.
///
/// Below this the generator falls back to a flat mask.
pub const MIN_GAUSSIAN_SIGMA: f64 = 1e-3;

/// The maximum number of elements in one accumulation buffer.
#[cfg(target_pointer_width = "64")]
pub const MAX_BUFFER_ELEMENTS: usize = 4_000_000_000;

/// The maximum number of elements in one accumulation buffer.
///
/// Bounded by the largest `f32` allocation the address space allows.
#[cfg(not(target_pointer_width = "64"))]
pub const MAX_BUFFER_ELEMENTS: usize = isize::MAX as usize / std::mem::size_of::<f32>();
