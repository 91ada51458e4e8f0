//! Tile grid planning.
//!
//! A [`TilePlanner`] turns a volume's spatial shape into a padded shape and an
//! ordered list of tile origins that covers every voxel of it. Along each axis
//! origins advance by the step until the next tile would overshoot; if the
//! last regular tile stops short of the far edge one more tile is placed flush
//! against it. Tiles never extend beyond the padded volume.

use crate::core::errors::{InferError, InferResult};
use crate::core::validation::validate_same_length;
use std::fmt;

/// Lower corner of one tile inside the padded volume, one entry per spatial axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileOrigin(Vec<usize>);

impl TileOrigin {
    /// Creates an origin from per-axis coordinates.
    pub fn new(coords: impl Into<Vec<usize>>) -> Self {
        Self(coords.into())
    }

    /// Per-axis coordinates.
    pub fn coords(&self) -> &[usize] {
        &self.0
    }

    /// Number of spatial axes.
    pub fn ndim(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for TileOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (axis, coord) in self.0.iter().enumerate() {
            if axis > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", coord)?;
        }
        write!(f, ")")
    }
}

/// The ordered set of tile origins covering a padded volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    tile_shape: Vec<usize>,
    padded_shape: Vec<usize>,
    origins: Vec<TileOrigin>,
}

impl TileGrid {
    /// Builds a grid from caller-supplied origins.
    ///
    /// Every origin must keep its tile inside `padded_shape`. Coverage is not
    /// checked here; the finalizer reports voxels no tile reached.
    pub fn from_origins(
        tile_shape: Vec<usize>,
        padded_shape: Vec<usize>,
        origins: Vec<TileOrigin>,
    ) -> InferResult<Self> {
        validate_same_length(&tile_shape, &padded_shape, "tile_shape", "padded_shape")?;
        for origin in &origins {
            let fits = origin.ndim() == tile_shape.len()
                && origin
                    .coords()
                    .iter()
                    .zip(tile_shape.iter().zip(&padded_shape))
                    .all(|(&o, (&t, &p))| o + t <= p);
            if !fits {
                return Err(InferError::invalid_input(format!(
                    "tile at {} with shape {:?} does not fit in padded shape {:?}",
                    origin, tile_shape, padded_shape
                )));
            }
        }
        Ok(Self {
            tile_shape,
            padded_shape,
            origins,
        })
    }

    /// Tile shape shared by every tile.
    pub fn tile_shape(&self) -> &[usize] {
        &self.tile_shape
    }

    /// Shape of the padded volume the grid covers.
    pub fn padded_shape(&self) -> &[usize] {
        &self.padded_shape
    }

    /// Origins in processing order.
    pub fn origins(&self) -> &[TileOrigin] {
        &self.origins
    }

    /// Number of tiles.
    pub fn len(&self) -> usize {
        self.origins.len()
    }

    /// True when the grid has no tiles.
    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    /// Returns the same tiles in the order given by `order` (indices into the
    /// current origin list).
    pub fn reordered(&self, order: &[usize]) -> InferResult<Self> {
        let mut seen = vec![false; self.origins.len()];
        let mut origins = Vec::with_capacity(order.len());
        for &idx in order {
            match seen.get_mut(idx) {
                Some(slot) if !*slot => {
                    *slot = true;
                    origins.push(self.origins[idx].clone());
                }
                _ => {
                    return Err(InferError::invalid_input(format!(
                        "order is not a permutation of 0..{}: bad index {}",
                        self.origins.len(),
                        idx
                    )));
                }
            }
        }
        if origins.len() != self.origins.len() {
            return Err(InferError::invalid_input(format!(
                "order has {} entries, grid has {} tiles",
                origins.len(),
                self.origins.len()
            )));
        }
        Ok(Self {
            tile_shape: self.tile_shape.clone(),
            padded_shape: self.padded_shape.clone(),
            origins,
        })
    }
}

/// Plans tile grids for a fixed tile and step shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlanner {
    tile_shape: Vec<usize>,
    step_shape: Vec<usize>,
}

impl TilePlanner {
    /// Creates a planner, rejecting steps that would leave coverage gaps.
    ///
    /// # Errors
    ///
    /// `InvalidGridConfiguration` when a tile or step length is zero or a step
    /// exceeds the tile on the same axis.
    pub fn new(tile_shape: impl Into<Vec<usize>>, step_shape: impl Into<Vec<usize>>) -> InferResult<Self> {
        let tile_shape = tile_shape.into();
        let step_shape = step_shape.into();
        if tile_shape.is_empty() || tile_shape.len() != step_shape.len() {
            return Err(InferError::invalid_input(format!(
                "tile shape {:?} and step shape {:?} must have the same, non-zero rank",
                tile_shape, step_shape
            )));
        }
        for (axis, (&tile, &step)) in tile_shape.iter().zip(&step_shape).enumerate() {
            if tile == 0 {
                return Err(InferError::invalid_grid(axis, tile, step, "tile length must be positive"));
            }
            if step == 0 {
                return Err(InferError::invalid_grid(axis, tile, step, "step must be positive"));
            }
            if step > tile {
                return Err(InferError::invalid_grid(
                    axis,
                    tile,
                    step,
                    "step exceeds tile length, voxels between tiles would be skipped",
                ));
            }
        }
        Ok(Self {
            tile_shape,
            step_shape,
        })
    }

    /// Tile shape.
    pub fn tile_shape(&self) -> &[usize] {
        &self.tile_shape
    }

    /// Step shape.
    pub fn step_shape(&self) -> &[usize] {
        &self.step_shape
    }

    /// Shape after raising every axis shorter than the tile to the tile length.
    pub fn padded_shape(&self, spatial_shape: &[usize]) -> InferResult<Vec<usize>> {
        if spatial_shape.len() != self.tile_shape.len() {
            return Err(InferError::invalid_input(format!(
                "volume has {} spatial axes, tile shape {:?} has {}",
                spatial_shape.len(),
                self.tile_shape,
                self.tile_shape.len()
            )));
        }
        if let Some(axis) = spatial_shape.iter().position(|&len| len == 0) {
            return Err(InferError::invalid_input(format!(
                "volume spatial axis {} is empty: {:?}",
                axis, spatial_shape
            )));
        }
        Ok(spatial_shape
            .iter()
            .zip(&self.tile_shape)
            .map(|(&len, &tile)| len.max(tile))
            .collect())
    }

    /// Plans the grid for a volume of the given spatial shape.
    ///
    /// The grid covers the padded shape; origins are ordered row-major (last
    /// axis fastest).
    pub fn plan(&self, spatial_shape: &[usize]) -> InferResult<TileGrid> {
        let padded_shape = self.padded_shape(spatial_shape)?;
        let per_axis: Vec<Vec<usize>> = padded_shape
            .iter()
            .zip(self.tile_shape.iter().zip(&self.step_shape))
            .map(|(&len, (&tile, &step))| axis_origins(len, tile, step))
            .collect();

        let total: usize = per_axis.iter().map(Vec::len).product();
        let mut origins = Vec::with_capacity(total);
        let mut cursor = vec![0usize; per_axis.len()];
        for _ in 0..total {
            origins.push(TileOrigin::new(
                cursor
                    .iter()
                    .zip(&per_axis)
                    .map(|(&i, axis)| axis[i])
                    .collect::<Vec<_>>(),
            ));
            for axis in (0..cursor.len()).rev() {
                cursor[axis] += 1;
                if cursor[axis] < per_axis[axis].len() {
                    break;
                }
                cursor[axis] = 0;
            }
        }

        tracing::debug!(
            "Planned {} tiles of {:?} with step {:?} over padded shape {:?}",
            origins.len(),
            self.tile_shape,
            self.step_shape,
            padded_shape
        );

        Ok(TileGrid {
            tile_shape: self.tile_shape.clone(),
            padded_shape,
            origins,
        })
    }
}

/// Origins along one axis of length `len` (already at least `tile`).
///
/// Regular origins `0, step, 2·step, …` are kept while the tile fits; when the
/// last one stops short of the edge a final origin `len - tile` is appended.
pub fn axis_origins(len: usize, tile: usize, step: usize) -> Vec<usize> {
    let mut origins = Vec::new();
    let mut origin = 0;
    while origin + tile <= len {
        origins.push(origin);
        origin += step;
    }
    match origins.last() {
        Some(&last) if last + tile < len => origins.push(len - tile),
        None => origins.push(len.saturating_sub(tile)),
        _ => {}
    }
    origins
}

/// Derives a step shape from an overlap fraction in `[0, 1)`.
///
/// `step[i] = max(1, floor(tile[i] * (1 - overlap)))`.
pub fn steps_from_overlap(tile_shape: &[usize], overlap: f64) -> InferResult<Vec<usize>> {
    if !overlap.is_finite() || !(0.0..1.0).contains(&overlap) {
        return Err(InferError::config_error(format!(
            "overlap must be in [0, 1), got {}",
            overlap
        )));
    }
    Ok(tile_shape
        .iter()
        .map(|&tile| ((tile as f64 * (1.0 - overlap)).floor() as usize).max(1))
        .collect())
}
