//! Tile scoring and weighted accumulation.
//!
//! The [`Aggregator`] walks a [`TileGrid`] in batches, hands each batch to the
//! scorer and adds `score · mask` and `mask` into the [`AccumulationBuffers`]
//! at the tile offset. How those adds are scheduled is chosen by
//! [`AccumulationStrategy`]:
//!
//! - `Sequential` scores and writes on the calling thread.
//! - `SerializedWriter` scores batches on a rayon pool and queues the results
//!   to a single writer thread that owns the buffers. At most `queue_depth`
//!   scored batches wait in the queue.
//! - `Partitioned` splits the buffers into slabs along the first spatial axis,
//!   each behind its own mutex. A scored tile locks the slabs it touches one at
//!   a time.
//!
//! The scorer never runs while a buffer lock is held. The first batch is always
//! scored on the calling thread: its output fixes the number of classes, which
//! the buffers must know before they can be allocated.

use crate::core::cancel::CancellationToken;
use crate::core::config::{AccumulationStrategy, ParallelPolicy};
use crate::core::constants::{DEFAULT_BATCH_SIZE, DEFAULT_QUEUE_DEPTH, MAX_BUFFER_ELEMENTS};
use crate::core::errors::{InferError, InferResult, ProcessingStage};
use crate::core::traits::{Scorer, expected_output_shape};
use crate::core::validation::{checked_element_count, validate_positive, validate_tensor_shape};
use crate::processors::importance::WeightMask;
use crate::processors::planner::{TileGrid, TileOrigin};
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice, Zip};
use rayon::prelude::*;
use std::ops::Range;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

/// Weighted score and weight sums over a region of the padded volume.
///
/// `score_sum` has shape `[classes, extent…]` and `weight_sum` has shape
/// `[extent…]`. A buffer covering the whole padded volume has a zero base; a
/// slab records where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulationBuffers {
    base: Vec<usize>,
    score_sum: ArrayD<f32>,
    weight_sum: ArrayD<f32>,
}

impl AccumulationBuffers {
    /// Zeroed buffers covering a whole padded volume.
    pub fn zeros(classes: usize, padded_shape: &[usize]) -> InferResult<Self> {
        Self::region(classes, vec![0; padded_shape.len()], padded_shape)
    }

    /// Zeroed buffers covering `extent` voxels starting at `base`.
    pub fn region(classes: usize, base: Vec<usize>, extent: &[usize]) -> InferResult<Self> {
        if base.len() != extent.len() {
            return Err(InferError::invalid_input(format!(
                "buffer base {:?} and extent {:?} differ in rank",
                base, extent
            )));
        }
        let mut score_shape = Vec::with_capacity(extent.len() + 1);
        score_shape.push(classes);
        score_shape.extend_from_slice(extent);
        checked_element_count(&score_shape, MAX_BUFFER_ELEMENTS, "score_sum")?;

        Ok(Self {
            base,
            score_sum: ArrayD::zeros(IxDyn(&score_shape)),
            weight_sum: ArrayD::zeros(IxDyn(extent)),
        })
    }

    /// Number of classes.
    pub fn classes(&self) -> usize {
        self.score_sum.shape()[0]
    }

    /// Offset of this buffer inside the padded volume.
    pub fn base(&self) -> &[usize] {
        &self.base
    }

    /// Spatial extent covered by this buffer.
    pub fn extent(&self) -> &[usize] {
        self.weight_sum.shape()
    }

    /// Weighted score sums, `[classes, extent…]`.
    pub fn score_sum(&self) -> ArrayViewD<'_, f32> {
        self.score_sum.view()
    }

    /// Weight sums, `[extent…]`.
    pub fn weight_sum(&self) -> ArrayViewD<'_, f32> {
        self.weight_sum.view()
    }

    /// Consumes the buffers, returning `(score_sum, weight_sum)`.
    pub fn into_parts(self) -> (ArrayD<f32>, ArrayD<f32>) {
        (self.score_sum, self.weight_sum)
    }

    /// Adds one tile's weighted scores.
    ///
    /// `scores` is `[classes, tile…]` and `mask` is `[tile…]`. Only the part of
    /// the tile inside this buffer is written. Returns false when the tile
    /// does not touch the buffer at all.
    pub fn add_tile(
        &mut self,
        origin: &[usize],
        scores: ArrayViewD<'_, f32>,
        mask: ArrayViewD<'_, f32>,
    ) -> bool {
        let Some((tile_ranges, buffer_ranges)) = self.intersect(origin, mask.shape()) else {
            return false;
        };

        let mask_part =
            mask.slice_each_axis(|desc| Slice::from(tile_ranges[desc.axis.index()].clone()));
        let mut weight_part = self
            .weight_sum
            .slice_each_axis_mut(|desc| Slice::from(buffer_ranges[desc.axis.index()].clone()));
        Zip::from(&mut weight_part)
            .and(&mask_part)
            .for_each(|w, &m| *w += m);

        for (class, class_scores) in scores.axis_iter(Axis(0)).enumerate() {
            let score_part = class_scores
                .slice_each_axis(|desc| Slice::from(tile_ranges[desc.axis.index()].clone()));
            let mut plane = self.score_sum.index_axis_mut(Axis(0), class);
            let mut target = plane
                .slice_each_axis_mut(|desc| Slice::from(buffer_ranges[desc.axis.index()].clone()));
            Zip::from(&mut target)
                .and(&score_part)
                .and(&mask_part)
                .for_each(|acc, &s, &m| *acc += s * m);
        }
        true
    }

    /// Tile-local and buffer-local ranges of the overlap, per spatial axis.
    fn intersect(
        &self,
        origin: &[usize],
        tile_shape: &[usize],
    ) -> Option<(Vec<Range<usize>>, Vec<Range<usize>>)> {
        let extent = self.weight_sum.shape();
        let mut tile_ranges = Vec::with_capacity(extent.len());
        let mut buffer_ranges = Vec::with_capacity(extent.len());
        for axis in 0..extent.len() {
            let lo = origin[axis].max(self.base[axis]);
            let hi = (origin[axis] + tile_shape[axis]).min(self.base[axis] + extent[axis]);
            if lo >= hi {
                return None;
            }
            tile_ranges.push(lo - origin[axis]..hi - origin[axis]);
            buffer_ranges.push(lo - self.base[axis]..hi - self.base[axis]);
        }
        Some((tile_ranges, buffer_ranges))
    }

    fn add_batch(
        &mut self,
        origins: &[TileOrigin],
        scores: ArrayViewD<'_, f32>,
        mask: ArrayViewD<'_, f32>,
    ) {
        for (origin, tile_scores) in origins.iter().zip(scores.axis_iter(Axis(0))) {
            self.add_tile(origin.coords(), tile_scores, mask.view());
        }
    }
}

/// Buffers produced by a full pass, with counters for the pass statistics.
#[derive(Debug)]
pub struct Accumulated {
    /// Whole-volume buffers.
    pub buffers: AccumulationBuffers,
    /// Tiles accumulated.
    pub tiles: usize,
    /// Scorer invocations.
    pub batches: usize,
    /// Strategy that actually ran, after the parallel-policy fallback.
    pub strategy: AccumulationStrategy,
}

/// Drives the scorer over a tile grid and accumulates its output.
#[derive(Debug, Clone)]
pub struct Aggregator<'a> {
    grid: &'a TileGrid,
    mask: &'a WeightMask,
    batch_size: usize,
    strategy: AccumulationStrategy,
    queue_depth: usize,
    parallel: ParallelPolicy,
}

impl<'a> Aggregator<'a> {
    /// Creates a sequential aggregator with default batching.
    pub fn new(grid: &'a TileGrid, mask: &'a WeightMask) -> Self {
        Self {
            grid,
            mask,
            batch_size: DEFAULT_BATCH_SIZE,
            strategy: AccumulationStrategy::default(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            parallel: ParallelPolicy::default(),
        }
    }

    /// Sets the number of tiles per scorer call.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the accumulation strategy.
    pub fn with_strategy(mut self, strategy: AccumulationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets how many scored batches may wait for the writer thread.
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    /// Sets the thread policy for parallel strategies.
    pub fn with_parallel_policy(mut self, policy: ParallelPolicy) -> Self {
        self.parallel = policy;
        self
    }

    /// Scores every tile of the grid and returns the filled buffers.
    ///
    /// `volume` is the padded volume, `[in_channels, padded…]`. It is only
    /// read. On any error the partially filled buffers are dropped.
    ///
    /// # Errors
    ///
    /// * `ScorerFailure` with the origin of the first tile of the failing batch.
    /// * `ShapeMismatch` when the scorer output is not `[batch, classes, tile…]`
    ///   or the class count changes.
    /// * `Cancelled` when `cancel` trips before a batch is dispatched.
    pub fn run<S: Scorer + ?Sized>(
        &self,
        volume: ArrayViewD<'_, f32>,
        scorer: &S,
        cancel: &CancellationToken,
    ) -> InferResult<Accumulated> {
        self.validate(&volume)?;

        let tile_shape = self.grid.tile_shape();
        let batches: Vec<&[TileOrigin]> = self.grid.origins().chunks(self.batch_size).collect();
        let total = self.grid.len();
        let Some((first, rest)) = batches.split_first() else {
            return Err(InferError::invalid_input("tile grid is empty"));
        };

        if cancel.is_cancelled() {
            return Err(InferError::Cancelled {
                completed: 0,
                total,
            });
        }
        let first_scores = score_batch(scorer, &volume, first, tile_shape, None)?;
        let classes = first_scores.shape()[1];

        let strategy = match self.strategy {
            AccumulationStrategy::Sequential => AccumulationStrategy::Sequential,
            parallel if self.parallel.should_parallelize(rest.len()) => parallel,
            parallel => {
                tracing::debug!(
                    "{} remaining batches under threshold, running {:?} sequentially",
                    rest.len(),
                    parallel
                );
                AccumulationStrategy::Sequential
            }
        };

        tracing::debug!(
            "Accumulating {} tiles in {} batches of up to {} with {} ({} classes, {:?})",
            total,
            batches.len(),
            self.batch_size,
            scorer.name(),
            classes,
            strategy
        );

        let pass = Pass {
            volume: volume.view(),
            scorer,
            mask: self.mask.view(),
            tile_shape,
            classes,
            cancel,
            total,
        };
        let buffers = match strategy {
            AccumulationStrategy::Sequential => {
                self.run_sequential(&pass, first, first_scores.view(), rest)?
            }
            AccumulationStrategy::SerializedWriter => {
                self.run_serialized(&pass, first, first_scores.view(), rest)?
            }
            AccumulationStrategy::Partitioned { partitions } => {
                self.run_partitioned(&pass, partitions, first, first_scores.view(), rest)?
            }
        };

        Ok(Accumulated {
            buffers,
            tiles: total,
            batches: batches.len(),
            strategy,
        })
    }

    fn validate(&self, volume: &ArrayViewD<'_, f32>) -> InferResult<()> {
        let padded = self.grid.padded_shape();
        validate_tensor_shape(volume.shape(), padded.len() + 1, "volume")?;
        if volume.shape()[1..] != padded[..] {
            return Err(InferError::invalid_input(format!(
                "volume shape {:?} does not match [channels, {:?}]",
                volume.shape(),
                padded
            )));
        }
        if self.mask.shape() != self.grid.tile_shape() {
            return Err(InferError::invalid_input(format!(
                "weight mask shape {:?} differs from tile shape {:?}",
                self.mask.shape(),
                self.grid.tile_shape()
            )));
        }
        validate_positive(self.batch_size, "batch_size")?;
        validate_positive(self.queue_depth, "queue_depth")
    }

    fn run_sequential<S: Scorer + ?Sized>(
        &self,
        pass: &Pass<'_, S>,
        first: &[TileOrigin],
        first_scores: ArrayViewD<'_, f32>,
        rest: &[&[TileOrigin]],
    ) -> InferResult<AccumulationBuffers> {
        let mut buffers = AccumulationBuffers::zeros(pass.classes, self.grid.padded_shape())?;
        buffers.add_batch(first, first_scores, pass.mask.view());
        let mut completed = first.len();

        for batch in rest {
            pass.check_cancelled(completed)?;
            let scores = pass.score(batch)?;
            buffers.add_batch(batch, scores.view(), pass.mask.view());
            completed += batch.len();
        }
        Ok(buffers)
    }

    fn run_serialized<S: Scorer + ?Sized>(
        &self,
        pass: &Pass<'_, S>,
        first: &[TileOrigin],
        first_scores: ArrayViewD<'_, f32>,
        rest: &[&[TileOrigin]],
    ) -> InferResult<AccumulationBuffers> {
        let pool = self.build_pool()?;
        let mut buffers = AccumulationBuffers::zeros(pass.classes, self.grid.padded_shape())?;
        buffers.add_batch(first, first_scores, pass.mask.view());
        let first_len = first.len();
        let mask = pass.mask.view();

        let (tx, rx) = mpsc::sync_channel::<(usize, ArrayD<f32>)>(self.queue_depth);

        std::thread::scope(|scope| -> InferResult<AccumulationBuffers> {
            let writer = scope.spawn(move || {
                let mut buffers = buffers;
                let mut completed = first_len;
                for (idx, scores) in rx {
                    buffers.add_batch(rest[idx], scores.view(), mask.view());
                    completed += rest[idx].len();
                }
                (buffers, completed)
            });

            let scored = install(pool.as_ref(), || {
                rest.par_iter()
                    .enumerate()
                    .try_for_each_with(tx, |tx, (idx, batch)| {
                        pass.check_cancelled(0)?;
                        let scores = pass.score(batch)?;
                        tx.send((idx, scores))
                            .map_err(|_| InferError::accumulation("writer thread stopped receiving"))
                    })
            });

            let (buffers, completed) = writer
                .join()
                .map_err(|_| InferError::accumulation("writer thread panicked"))?;
            match scored {
                Ok(()) => Ok(buffers),
                Err(InferError::Cancelled { total, .. }) => {
                    Err(InferError::Cancelled { completed, total })
                }
                Err(err) => Err(err),
            }
        })
    }

    fn run_partitioned<S: Scorer + ?Sized>(
        &self,
        pass: &Pass<'_, S>,
        partitions: usize,
        first: &[TileOrigin],
        first_scores: ArrayViewD<'_, f32>,
        rest: &[&[TileOrigin]],
    ) -> InferResult<AccumulationBuffers> {
        let pool = self.build_pool()?;
        let slabs = Slabs::new(pass.classes, self.grid.padded_shape(), partitions)?;
        let completed = AtomicUsize::new(0);
        let tile_len = pass.tile_shape[0];

        slabs.add_batch(first, first_scores, pass.mask.view(), tile_len)?;
        completed.fetch_add(first.len(), Ordering::Relaxed);
        install(pool.as_ref(), || {
            rest.par_iter().try_for_each(|batch| -> InferResult<()> {
                pass.check_cancelled(completed.load(Ordering::Relaxed))?;
                let scores = pass.score(batch)?;
                slabs.add_batch(batch, scores.view(), pass.mask.view(), tile_len)?;
                completed.fetch_add(batch.len(), Ordering::Relaxed);
                Ok(())
            })
        })?;

        slabs.merge()
    }

    fn build_pool(&self) -> InferResult<Option<rayon::ThreadPool>> {
        self.parallel.build_pool().map_err(|e| {
            InferError::processing_error(
                ProcessingStage::Scoring,
                "failed to build scoring thread pool",
                e,
            )
        })
    }
}

/// Per-pass state shared by every worker.
struct Pass<'p, S: ?Sized> {
    volume: ArrayViewD<'p, f32>,
    scorer: &'p S,
    mask: ArrayViewD<'p, f32>,
    tile_shape: &'p [usize],
    classes: usize,
    cancel: &'p CancellationToken,
    total: usize,
}

impl<S: Scorer + ?Sized> Pass<'_, S> {
    fn score(&self, batch: &[TileOrigin]) -> InferResult<ArrayD<f32>> {
        score_batch(
            self.scorer,
            &self.volume,
            batch,
            self.tile_shape,
            Some(self.classes),
        )
    }

    fn check_cancelled(&self, completed: usize) -> InferResult<()> {
        if self.cancel.is_cancelled() {
            return Err(InferError::Cancelled {
                completed,
                total: self.total,
            });
        }
        Ok(())
    }
}

fn install<R: Send>(pool: Option<&rayon::ThreadPool>, op: impl FnOnce() -> R + Send) -> R {
    match pool {
        Some(pool) => pool.install(op),
        None => op(),
    }
}

/// The region `[origin, origin + tile)` of a channel-first volume.
fn tile_view<'v>(
    volume: &ArrayViewD<'v, f32>,
    origin: &TileOrigin,
    tile_shape: &[usize],
) -> ArrayViewD<'v, f32> {
    let mut view = volume.clone();
    view.slice_each_axis_inplace(|desc| match desc.axis.index() {
        0 => Slice::from(..),
        axis => {
            let start = origin.coords()[axis - 1];
            Slice::from(start..start + tile_shape[axis - 1])
        }
    });
    view
}

/// Stacks a batch of tiles, scores it and checks the output shape.
///
/// With `classes == None` any positive class count is accepted.
pub fn score_batch<S: Scorer + ?Sized>(
    scorer: &S,
    volume: &ArrayViewD<'_, f32>,
    batch: &[TileOrigin],
    tile_shape: &[usize],
    classes: Option<usize>,
) -> InferResult<ArrayD<f32>> {
    let first_origin = batch
        .first()
        .ok_or_else(|| InferError::invalid_input("empty tile batch"))?;
    let tiles: Vec<ArrayViewD<'_, f32>> = batch
        .iter()
        .map(|origin| tile_view(volume, origin, tile_shape))
        .collect();
    let input = ndarray::stack(Axis(0), &tiles)?;

    let output = scorer
        .score(input.view())
        .map_err(|source| InferError::scorer_failure(first_origin.clone(), source))?;

    let actual = output.shape();
    let actual_classes = actual.get(1).copied().unwrap_or(0);
    let expected_classes = classes.unwrap_or(actual_classes).max(1);
    let expected = expected_output_shape(batch.len(), expected_classes, tile_shape);
    if actual != expected.as_slice() {
        return Err(InferError::shape_mismatch(
            first_origin.clone(),
            &expected,
            actual,
        ));
    }
    Ok(output)
}

/// Accumulation buffers split into contiguous slabs along the first axis.
struct Slabs {
    rows: Vec<Range<usize>>,
    buffers: Vec<Mutex<AccumulationBuffers>>,
}

impl Slabs {
    /// Splits the padded volume into up to `partitions` slabs whose lengths
    /// differ by at most one.
    fn new(classes: usize, padded_shape: &[usize], partitions: usize) -> InferResult<Self> {
        let len = padded_shape[0];
        let count = partitions.clamp(1, len);
        let (size, remainder) = (len / count, len % count);
        let mut rows = Vec::with_capacity(count);
        let mut buffers = Vec::with_capacity(count);
        let mut start = 0;
        for idx in 0..count {
            let slab_len = size + usize::from(idx < remainder);
            let mut base = vec![0; padded_shape.len()];
            base[0] = start;
            let mut extent = padded_shape.to_vec();
            extent[0] = slab_len;
            buffers.push(Mutex::new(AccumulationBuffers::region(classes, base, &extent)?));
            rows.push(start..start + slab_len);
            start += slab_len;
        }
        Ok(Self { rows, buffers })
    }

    /// Indices of the slabs overlapping `rows` along the first axis.
    fn touching(&self, rows: Range<usize>) -> Range<usize> {
        let first = self.rows.partition_point(|slab| slab.end <= rows.start);
        let last = self.rows.partition_point(|slab| slab.start < rows.end);
        first..last.max(first)
    }

    /// Adds a scored batch, locking only the slabs each tile touches, one at a time.
    fn add_batch(
        &self,
        batch: &[TileOrigin],
        scores: ArrayViewD<'_, f32>,
        mask: ArrayViewD<'_, f32>,
        tile_len: usize,
    ) -> InferResult<()> {
        for (origin, tile_scores) in batch.iter().zip(scores.axis_iter(Axis(0))) {
            let start = origin.coords()[0];
            for idx in self.touching(start..start + tile_len) {
                let mut slab = self.buffers[idx]
                    .lock()
                    .map_err(|_| InferError::accumulation("partition lock poisoned"))?;
                slab.add_tile(origin.coords(), tile_scores.view(), mask.view());
            }
        }
        Ok(())
    }

    /// Joins the slabs back into whole-volume buffers.
    fn merge(self) -> InferResult<AccumulationBuffers> {
        let slabs = self
            .buffers
            .into_iter()
            .map(|slab| {
                slab.into_inner()
                    .map_err(|_| InferError::accumulation("partition lock poisoned"))
            })
            .collect::<InferResult<Vec<_>>>()?;
        let scores: Vec<ArrayViewD<'_, f32>> = slabs.iter().map(|s| s.score_sum.view()).collect();
        let weights: Vec<ArrayViewD<'_, f32>> =
            slabs.iter().map(|s| s.weight_sum.view()).collect();
        let score_sum = ndarray::concatenate(Axis(1), &scores)?;
        let weight_sum = ndarray::concatenate(Axis(0), &weights)?;
        Ok(AccumulationBuffers {
            base: vec![0; weight_sum.ndim()],
            score_sum,
            weight_sum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::WeightMode;
    use crate::core::errors::BoxError;
    use crate::core::traits::{ConstantScorer, scorer_fn};
    use crate::processors::planner::TilePlanner;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;

    fn ramp(shape: &[usize]) -> ArrayD<f32> {
        let len: usize = shape.iter().product();
        Array::from_shape_vec(IxDyn(shape), (0..len).map(|v| (v % 17) as f32).collect()).unwrap()
    }

    /// Two classes: the input channel and its negation.
    fn echo(tiles: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError> {
        let negative = tiles.mapv(|v| -v);
        Ok(ndarray::concatenate(Axis(1), &[tiles.view(), negative.view()])?)
    }

    fn eager() -> ParallelPolicy {
        ParallelPolicy::new().with_batch_threshold(0)
    }

    #[test]
    fn flat_weights_count_coverage() {
        let grid = TilePlanner::new(vec![4], vec![2]).unwrap().plan(&[10]).unwrap();
        let mask = WeightMask::generate(&[4], WeightMode::Flat).unwrap();
        let volume = ArrayD::<f32>::zeros(IxDyn(&[1, 10]));
        let run = Aggregator::new(&grid, &mask)
            .run(volume.view(), &ConstantScorer::new(1, 1.0), &CancellationToken::new())
            .unwrap();
        let weights: Vec<f32> = run.buffers.weight_sum().iter().copied().collect();
        assert_eq!(weights, vec![1.0, 1.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 1.0, 1.0]);
        assert_eq!(run.tiles, 4);
        assert_eq!(run.batches, 4);
    }

    #[test]
    fn slab_only_takes_its_share() {
        let mut slab = AccumulationBuffers::region(1, vec![3], &[2]).unwrap();
        let scores = ArrayD::from_elem(IxDyn(&[1, 4]), 2.0f32);
        let mask = ArrayD::from_elem(IxDyn(&[4]), 0.5f32);
        assert!(slab.add_tile(&[2], scores.view(), mask.view()));
        assert!(!slab.add_tile(&[5], scores.view(), mask.view()));
        assert_eq!(slab.weight_sum().iter().copied().collect::<Vec<_>>(), vec![0.5, 0.5]);
        assert_eq!(slab.score_sum().iter().copied().collect::<Vec<_>>(), vec![1.0, 1.0]);
    }

    #[test]
    fn strategies_agree() {
        let grid = TilePlanner::new(vec![4, 3, 5], vec![3, 2, 2])
            .unwrap()
            .plan(&[11, 7, 9])
            .unwrap();
        let mask = WeightMask::generate(grid.tile_shape(), WeightMode::default()).unwrap();
        let volume = ramp(&[1, 11, 7, 9]);
        let scorer = scorer_fn("echo", echo);

        let run = |strategy| {
            Aggregator::new(&grid, &mask)
                .with_batch_size(3)
                .with_strategy(strategy)
                .with_queue_depth(2)
                .with_parallel_policy(eager())
                .run(volume.view(), &scorer, &CancellationToken::new())
                .unwrap()
        };
        let reference = run(AccumulationStrategy::Sequential);
        for strategy in [
            AccumulationStrategy::SerializedWriter,
            AccumulationStrategy::Partitioned { partitions: 3 },
            AccumulationStrategy::Partitioned { partitions: 64 },
        ] {
            let other = run(strategy);
            assert_eq!(other.strategy, strategy);
            assert_eq!(other.buffers.extent(), reference.buffers.extent());
            for (a, b) in reference
                .buffers
                .score_sum()
                .iter()
                .zip(other.buffers.score_sum().iter())
            {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
            }
            for (a, b) in reference
                .buffers
                .weight_sum()
                .iter()
                .zip(other.buffers.weight_sum().iter())
            {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn small_grids_fall_back_to_sequential() {
        let grid = TilePlanner::new(vec![4], vec![4]).unwrap().plan(&[8]).unwrap();
        let mask = WeightMask::generate(&[4], WeightMode::Flat).unwrap();
        let volume = ArrayD::<f32>::zeros(IxDyn(&[1, 8]));
        let run = Aggregator::new(&grid, &mask)
            .with_strategy(AccumulationStrategy::SerializedWriter)
            .run(volume.view(), &ConstantScorer::new(1, 1.0), &CancellationToken::new())
            .unwrap();
        assert_eq!(run.strategy, AccumulationStrategy::Sequential);
    }

    #[test]
    fn scorer_failure_names_first_tile_of_batch() {
        let grid = TilePlanner::new(vec![2], vec![2]).unwrap().plan(&[8]).unwrap();
        let mask = WeightMask::generate(&[2], WeightMode::Flat).unwrap();
        let volume = ramp(&[1, 8]);
        // tiles at 0, 2, 4, 6; batches [0, 2] and [4, 6]
        let scorer = scorer_fn("fails", |tiles: ArrayViewD<'_, f32>| {
            if tiles.iter().any(|&v| v >= 6.0) {
                return Err("out of range".into());
            }
            Ok(tiles.to_owned())
        });
        for strategy in [
            AccumulationStrategy::Sequential,
            AccumulationStrategy::SerializedWriter,
            AccumulationStrategy::Partitioned { partitions: 2 },
        ] {
            let err = Aggregator::new(&grid, &mask)
                .with_batch_size(2)
                .with_strategy(strategy)
                .with_parallel_policy(eager())
                .run(volume.view(), &scorer, &CancellationToken::new())
                .unwrap_err();
            match err {
                InferError::ScorerFailure { origin, .. } => assert_eq!(origin.coords(), &[4]),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn changing_class_count_is_a_shape_mismatch() {
        let grid = TilePlanner::new(vec![2], vec![2]).unwrap().plan(&[6]).unwrap();
        let mask = WeightMask::generate(&[2], WeightMode::Flat).unwrap();
        let volume = ArrayD::<f32>::zeros(IxDyn(&[1, 6]));
        let calls = AtomicUsize::new(0);
        let scorer = scorer_fn("unstable", |tiles: ArrayViewD<'_, f32>| {
            let classes = if calls.fetch_add(1, Ordering::SeqCst) == 0 { 2 } else { 3 };
            Ok(ArrayD::zeros(IxDyn(&[tiles.shape()[0], classes, 2])))
        });
        let err = Aggregator::new(&grid, &mask)
            .run(volume.view(), &scorer, &CancellationToken::new())
            .unwrap_err();
        match err {
            InferError::ShapeMismatch {
                origin,
                expected,
                actual,
            } => {
                assert_eq!(origin.coords(), &[2]);
                assert_eq!(expected, vec![1, 2, 2]);
                assert_eq!(actual, vec![1, 3, 2]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wrong_spatial_extent_is_rejected() {
        let grid = TilePlanner::new(vec![4], vec![4]).unwrap().plan(&[4]).unwrap();
        let mask = WeightMask::generate(&[4], WeightMode::Flat).unwrap();
        let volume = ArrayD::<f32>::zeros(IxDyn(&[1, 4]));
        let scorer = scorer_fn("short", |_tiles: ArrayViewD<'_, f32>| {
            Ok(ArrayD::zeros(IxDyn(&[1, 1, 3])))
        });
        assert!(matches!(
            Aggregator::new(&grid, &mask).run(volume.view(), &scorer, &CancellationToken::new()),
            Err(InferError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn cancellation_stops_before_next_batch() {
        let grid = TilePlanner::new(vec![2], vec![2]).unwrap().plan(&[10]).unwrap();
        let mask = WeightMask::generate(&[2], WeightMode::Flat).unwrap();
        let volume = ArrayD::<f32>::zeros(IxDyn(&[1, 10]));
        let token = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let scorer = scorer_fn("cancels", |tiles: ArrayViewD<'_, f32>| {
            if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                token.cancel();
            }
            Ok(tiles.to_owned())
        });
        let err = Aggregator::new(&grid, &mask)
            .run(volume.view(), &scorer, &token)
            .unwrap_err();
        match err {
            InferError::Cancelled { completed, total } => {
                assert_eq!((completed, total), (2, 5));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancelled_token_aborts_every_strategy() {
        let grid = TilePlanner::new(vec![2, 2], vec![1, 1]).unwrap().plan(&[6, 6]).unwrap();
        let mask = WeightMask::generate(&[2, 2], WeightMode::Flat).unwrap();
        let volume = ArrayD::<f32>::zeros(IxDyn(&[1, 6, 6]));
        let token = CancellationToken::new();
        token.cancel();
        for strategy in [
            AccumulationStrategy::Sequential,
            AccumulationStrategy::SerializedWriter,
            AccumulationStrategy::Partitioned { partitions: 2 },
        ] {
            let result = Aggregator::new(&grid, &mask)
                .with_strategy(strategy)
                .with_parallel_policy(eager())
                .run(volume.view(), &ConstantScorer::new(1, 1.0), &token);
            assert!(matches!(
                result,
                Err(InferError::Cancelled { completed: 0, total: 25 })
            ));
        }
    }

    #[test]
    fn mismatched_volume_is_rejected() {
        let grid = TilePlanner::new(vec![2], vec![2]).unwrap().plan(&[6]).unwrap();
        let mask = WeightMask::generate(&[2], WeightMode::Flat).unwrap();
        let volume = ArrayD::<f32>::zeros(IxDyn(&[1, 7]));
        assert!(matches!(
            Aggregator::new(&grid, &mask).run(
                volume.view(),
                &ConstantScorer::new(1, 1.0),
                &CancellationToken::new()
            ),
            Err(InferError::InvalidInput { .. })
        ));
    }

    #[test]
    fn slabs_split_evenly() {
        let slabs = Slabs::new(2, &[7, 3], 3).unwrap();
        assert_eq!(slabs.rows, vec![0..3, 3..5, 5..7]);
        let bases: Vec<usize> = slabs
            .buffers
            .iter()
            .map(|s| s.lock().unwrap().base()[0])
            .collect();
        let lens: Vec<usize> = slabs
            .buffers
            .iter()
            .map(|s| s.lock().unwrap().extent()[0])
            .collect();
        assert_eq!(bases, vec![0, 3, 5]);
        assert_eq!(lens, vec![3, 2, 2]);
        let merged = slabs.merge().unwrap();
        assert_eq!(merged.score_sum().shape(), &[2, 7, 3]);
        assert_eq!(merged.base(), &[0, 0]);
    }

    #[test]
    fn tiles_lock_only_the_slabs_they_cross() {
        let slabs = Slabs::new(1, &[7], 3).unwrap();
        assert_eq!(slabs.touching(0..2), 0..1);
        assert_eq!(slabs.touching(2..4), 0..2);
        assert_eq!(slabs.touching(3..5), 1..2);
        assert_eq!(slabs.touching(5..7), 2..3);
        assert_eq!(slabs.touching(0..7), 0..3);

        // A poisoned slab the tile never touches must not be locked.
        let poisoned = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = slabs.buffers[2].lock().unwrap();
                    panic!("poison the last slab");
                })
                .join()
        });
        assert!(poisoned.is_err());

        let scores = ArrayD::from_elem(IxDyn(&[1, 1, 2]), 1.0f32);
        let mask = ArrayD::from_elem(IxDyn(&[2]), 1.0f32);
        let batch = [TileOrigin::new(vec![2])];
        slabs.add_batch(&batch, scores.view(), mask.view(), 2).unwrap();

        let batch = [TileOrigin::new(vec![5])];
        assert!(slabs.add_batch(&batch, scores.view(), mask.view(), 2).is_err());
    }

    #[test]
    fn cancellation_mid_pass_stops_parallel_strategies() {
        let grid = TilePlanner::new(vec![2], vec![1]).unwrap().plan(&[26]).unwrap();
        let mask = WeightMask::generate(&[2], WeightMode::Flat).unwrap();
        let volume = ArrayD::<f32>::zeros(IxDyn(&[1, 26]));
        for strategy in [
            AccumulationStrategy::SerializedWriter,
            AccumulationStrategy::Partitioned { partitions: 4 },
        ] {
            let token = CancellationToken::new();
            let calls = AtomicUsize::new(0);
            let scorer = scorer_fn("cancels", |tiles: ArrayViewD<'_, f32>| {
                if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                    token.cancel();
                }
                Ok(tiles.to_owned())
            });
            let err = Aggregator::new(&grid, &mask)
                .with_strategy(strategy)
                .with_queue_depth(2)
                .with_parallel_policy(eager().with_max_threads(Some(2)))
                .run(volume.view(), &scorer, &token)
                .unwrap_err();
            match err {
                InferError::Cancelled { completed, total } => {
                    assert_eq!(total, 25);
                    assert!(completed >= 1 && completed < total, "{strategy:?}: {completed}");
                }
                other => panic!("{strategy:?}: unexpected error: {other}"),
            }
            assert!(calls.load(Ordering::SeqCst) < 25);
        }
    }
}
