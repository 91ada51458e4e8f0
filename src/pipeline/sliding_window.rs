//! The sliding-window inference entry point.
//!
//! [`SlidingWindowInferer`] wires the stages of one pass together:
//!
//! 1. plan the tile grid for the volume's spatial shape,
//! 2. pad the volume up to the tile shape where it is smaller,
//! 3. score every tile and accumulate `score · weight` and `weight`,
//! 4. normalize, crop back to the original shape and optionally take labels.
//!
//! The importance mask and the planner depend only on the configuration, so
//! they are built once in [`SlidingWindowInferer::new`] and reused by every
//! pass.

use super::stats::{InferenceStats, PassStats, StatsManager};
use crate::core::cancel::CancellationToken;
use crate::core::config::{ConfigValidatorExt, SlidingWindowConfig};
use crate::core::errors::{InferError, InferResult};
use crate::core::traits::Scorer;
use crate::processors::aggregator::Aggregator;
use crate::processors::finalizer::Finalizer;
use crate::processors::importance::WeightMask;
use crate::processors::padding::{PadRegion, pad_volume};
use crate::processors::planner::{TileGrid, TilePlanner};
use ndarray::{ArrayD, ArrayViewD};
use std::time::Instant;
use tracing::{debug, info, warn};

/// The result of one pass.
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    /// Per-class averaged scores, `[classes, spatial…]`, over the original shape.
    pub scores: ArrayD<f32>,
    /// Per-voxel argmax class, when `emit_labels` is set.
    pub labels: Option<ArrayD<usize>>,
    /// Statistics for the pass.
    pub stats: PassStats,
}

/// Runs sliding-window passes with a fixed configuration.
///
/// An inferer holds no per-pass state: passes may run concurrently from
/// several threads, each with its own buffers.
#[derive(Debug)]
pub struct SlidingWindowInferer {
    config: SlidingWindowConfig,
    planner: TilePlanner,
    mask: WeightMask,
    stats: StatsManager,
}

impl SlidingWindowInferer {
    /// Validates `config` and prepares the planner and importance mask.
    ///
    /// # Errors
    ///
    /// `ConfigError` for out-of-range settings and `InvalidGridConfiguration`
    /// when a step cannot cover the volume.
    pub fn new(config: SlidingWindowConfig) -> InferResult<Self> {
        let config = config.validate_and_wrap()?;
        let steps = config.resolve_steps()?;
        let planner = TilePlanner::new(config.tile_shape.clone(), steps)?;
        let mask = WeightMask::generate(&config.tile_shape, config.weight_mode)?;

        info!(
            "Sliding-window inferer ready: tile {:?}, step {:?}, {:?} weights, {:?} accumulation",
            planner.tile_shape(),
            planner.step_shape(),
            mask.mode(),
            config.accumulation
        );
        Ok(Self {
            config,
            planner,
            mask,
            stats: StatsManager::new(),
        })
    }

    /// The configuration this inferer was built with.
    pub fn config(&self) -> &SlidingWindowConfig {
        &self.config
    }

    /// The tile planner.
    pub fn planner(&self) -> &TilePlanner {
        &self.planner
    }

    /// The importance mask applied to every tile.
    pub fn mask(&self) -> &WeightMask {
        &self.mask
    }

    /// Totals over every pass run so far.
    pub fn stats(&self) -> InferenceStats {
        self.stats.get_stats()
    }

    /// Plans the tile grid for a channel-first volume of `volume_shape`.
    pub fn plan(&self, volume_shape: &[usize]) -> InferResult<TileGrid> {
        let spatial = self.spatial_shape(volume_shape)?;
        self.planner.plan(spatial)
    }

    /// Runs one pass over a channel-first volume `[in_channels, spatial…]`.
    pub fn infer<S: Scorer + ?Sized>(
        &self,
        volume: ArrayViewD<'_, f32>,
        scorer: &S,
    ) -> InferResult<InferenceOutput> {
        self.infer_with_cancel(volume, scorer, &CancellationToken::new())
    }

    /// Runs one pass that can be aborted through `cancel`.
    pub fn infer_with_cancel<S: Scorer + ?Sized>(
        &self,
        volume: ArrayViewD<'_, f32>,
        scorer: &S,
        cancel: &CancellationToken,
    ) -> InferResult<InferenceOutput> {
        let grid = self.plan(volume.shape())?;
        self.infer_grid(volume, &grid, scorer, cancel)
    }

    /// Runs one pass over a caller-supplied grid.
    ///
    /// The grid must use this inferer's tile shape and cover a padded shape at
    /// least as large as the volume on every axis. Useful to process tiles in a
    /// different order or to restrict a pass to a subset of tiles; voxels no
    /// tile reaches are reported by the coverage check.
    pub fn infer_grid<S: Scorer + ?Sized>(
        &self,
        volume: ArrayViewD<'_, f32>,
        grid: &TileGrid,
        scorer: &S,
        cancel: &CancellationToken,
    ) -> InferResult<InferenceOutput> {
        let start = Instant::now();
        let result = self.run_pass(volume, grid, scorer, cancel, start);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(output) => {
                debug!("Pass complete: {}", output.stats);
                self.stats.record_success(&output.stats);
            }
            Err(err) => {
                warn!("Pass failed after {:.2} ms: {}", elapsed_ms, err);
                self.stats.record_failure(elapsed_ms);
            }
        }
        result
    }

    /// Runs one pass per volume, stopping at the first failure.
    pub fn infer_many<S: Scorer + ?Sized>(
        &self,
        volumes: &[ArrayViewD<'_, f32>],
        scorer: &S,
        cancel: &CancellationToken,
    ) -> InferResult<Vec<InferenceOutput>> {
        info!("Running {} passes with {}", volumes.len(), scorer.name());
        volumes
            .iter()
            .enumerate()
            .map(|(index, volume)| {
                debug!("Volume {}/{}: {:?}", index + 1, volumes.len(), volume.shape());
                self.infer_with_cancel(volume.view(), scorer, cancel)
            })
            .collect()
    }

    fn run_pass<S: Scorer + ?Sized>(
        &self,
        volume: ArrayViewD<'_, f32>,
        grid: &TileGrid,
        scorer: &S,
        cancel: &CancellationToken,
        start: Instant,
    ) -> InferResult<InferenceOutput> {
        let spatial = self.spatial_shape(volume.shape())?;
        if grid.tile_shape() != self.planner.tile_shape() {
            return Err(InferError::invalid_input(format!(
                "grid tile shape {:?} differs from configured tile shape {:?}",
                grid.tile_shape(),
                self.planner.tile_shape()
            )));
        }

        let region = PadRegion::symmetric(spatial, grid.padded_shape())?;
        let padded = pad_volume(volume, &region, self.config.padding)?;

        let accumulated = Aggregator::new(grid, &self.mask)
            .with_batch_size(self.config.batch_size)
            .with_strategy(self.config.accumulation)
            .with_queue_depth(self.config.queue_depth)
            .with_parallel_policy(self.config.parallel.clone())
            .run(padded.view(), scorer, cancel)?;
        let classes = accumulated.buffers.classes();

        let finalized = Finalizer::new()
            .with_min_weight(self.config.min_weight)
            .with_verify_coverage(self.config.verify_coverage)
            .with_labels(self.config.emit_labels)
            .finalize(accumulated.buffers, &region)?;

        Ok(InferenceOutput {
            scores: finalized.scores,
            labels: finalized.labels,
            stats: PassStats {
                tiles: accumulated.tiles,
                batches: accumulated.batches,
                classes,
                padded_shape: grid.padded_shape().to_vec(),
                strategy: accumulated.strategy,
                weight_mode: self.mask.mode(),
                elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
            },
        })
    }

    fn spatial_shape<'s>(&self, volume_shape: &'s [usize]) -> InferResult<&'s [usize]> {
        let dims = self.config.spatial_dims();
        if volume_shape.len() != dims + 1 {
            return Err(InferError::invalid_input(format!(
                "expected a [channels, {} spatial axes] volume, got shape {:?}",
                dims, volume_shape
            )));
        }
        if volume_shape[0] == 0 {
            return Err(InferError::invalid_input("volume has no channels"));
        }
        Ok(&volume_shape[1..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{AccumulationStrategy, ParallelPolicy, PaddingMode, WeightMode};
    use crate::core::errors::BoxError;
    use crate::core::traits::{ConstantScorer, scorer_fn};
    use approx::assert_relative_eq;
    use ndarray::{Array, Axis, IxDyn};

    fn ramp(shape: &[usize]) -> ArrayD<f32> {
        let len: usize = shape.iter().product();
        Array::from_shape_vec(
            IxDyn(shape),
            (0..len).map(|v| (v % 23) as f32 - 11.0).collect(),
        )
        .unwrap()
    }

    /// Two classes: the input channel and its negation.
    fn echo(tiles: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError> {
        let negative = tiles.mapv(|v| -v);
        Ok(ndarray::concatenate(Axis(1), &[tiles.view(), negative.view()])?)
    }

    fn strategies() -> [AccumulationStrategy; 3] {
        [
            AccumulationStrategy::Sequential,
            AccumulationStrategy::SerializedWriter,
            AccumulationStrategy::Partitioned { partitions: 3 },
        ]
    }

    fn eager() -> ParallelPolicy {
        ParallelPolicy::new().with_batch_threshold(0)
    }

    #[test]
    fn cube_with_constant_scorer_is_exactly_one() {
        let config = SlidingWindowConfig::new(vec![4, 4, 4]).with_step(vec![2, 2, 2]);
        let inferer = SlidingWindowInferer::new(config).unwrap();
        let volume = ArrayD::<f32>::zeros(IxDyn(&[1, 10, 10, 10]));
        let out = inferer.infer(volume.view(), &ConstantScorer::new(2, 1.0)).unwrap();

        assert_eq!(out.scores.shape(), &[2, 10, 10, 10]);
        assert!(out.scores.iter().all(|&v| v == 1.0));
        assert_eq!(out.stats.tiles, 64);
        assert_eq!(out.stats.classes, 2);
        assert_eq!(out.stats.padded_shape, vec![10, 10, 10]);
    }

    #[test]
    fn small_volume_is_padded_and_cropped() {
        let config = SlidingWindowConfig::new(vec![4, 4, 4]).with_step(vec![2, 2, 2]);
        let inferer = SlidingWindowInferer::new(config).unwrap();
        let volume = ArrayD::<f32>::zeros(IxDyn(&[1, 3, 3, 3]));
        let out = inferer.infer(volume.view(), &ConstantScorer::new(1, 1.0)).unwrap();

        assert_eq!(out.scores.shape(), &[1, 3, 3, 3]);
        assert!(out.scores.iter().all(|&v| v == 1.0));
        assert_eq!(out.stats.tiles, 1);
        assert_eq!(out.stats.padded_shape, vec![4, 4, 4]);
    }

    #[test]
    fn constant_scores_survive_every_mode_and_strategy() {
        for mode in [WeightMode::default(), WeightMode::Flat] {
            for strategy in strategies() {
                let config = SlidingWindowConfig::new(vec![5, 3, 4])
                    .with_overlap(0.4)
                    .with_weight_mode(mode)
                    .with_batch_size(2)
                    .with_accumulation(strategy)
                    .with_parallel_policy(eager());
                let inferer = SlidingWindowInferer::new(config).unwrap();
                let volume = ArrayD::<f32>::zeros(IxDyn(&[2, 11, 7, 3]));
                let out = inferer
                    .infer(volume.view(), &ConstantScorer::new(3, 0.7))
                    .unwrap();
                assert_eq!(out.scores.shape(), &[3, 11, 7, 3]);
                for &v in out.scores.iter() {
                    assert_relative_eq!(v, 0.7, max_relative = 1e-5);
                }
            }
        }
    }

    #[test]
    fn echoed_input_is_reproduced() {
        for strategy in strategies() {
            let config = SlidingWindowConfig::new(vec![4, 4, 4])
                .with_overlap(0.5)
                .with_padding(PaddingMode::Replicate)
                .with_accumulation(strategy)
                .with_parallel_policy(eager());
            let inferer = SlidingWindowInferer::new(config).unwrap();
            let volume = ramp(&[1, 3, 6, 9]);
            let out = inferer.infer(volume.view(), &scorer_fn("echo", echo)).unwrap();

            assert_eq!(out.scores.shape(), &[2, 3, 6, 9]);
            let positive = out.scores.index_axis(Axis(0), 0);
            for (got, want) in positive.iter().zip(volume.iter()) {
                assert_relative_eq!(*got, *want, epsilon = 1e-4, max_relative = 1e-5);
            }
        }
    }

    #[test]
    fn tile_order_does_not_matter() {
        let config = SlidingWindowConfig::new(vec![4, 4]).with_step(vec![3, 2]);
        let inferer = SlidingWindowInferer::new(config).unwrap();
        let volume = ramp(&[1, 13, 9]);
        let scorer = scorer_fn("echo", echo);
        let cancel = CancellationToken::new();

        let grid = inferer.plan(volume.shape()).unwrap();
        let reversed: Vec<usize> = (0..grid.len()).rev().collect();
        let interleaved: Vec<usize> = (0..grid.len())
            .step_by(2)
            .chain((1..grid.len()).step_by(2))
            .collect();

        let reference = inferer.infer_grid(volume.view(), &grid, &scorer, &cancel).unwrap();
        for order in [reversed, interleaved] {
            let shuffled = grid.reordered(&order).unwrap();
            let out = inferer
                .infer_grid(volume.view(), &shuffled, &scorer, &cancel)
                .unwrap();
            for (a, b) in reference.scores.iter().zip(out.scores.iter()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-5, max_relative = 1e-6);
            }
        }
    }

    #[test]
    fn labels_pick_the_larger_class() {
        let config = SlidingWindowConfig::new(vec![2, 2])
            .with_step(vec![1, 1])
            .with_labels(true);
        let inferer = SlidingWindowInferer::new(config).unwrap();
        let volume = ramp(&[1, 4, 5]);
        let out = inferer.infer(volume.view(), &scorer_fn("echo", echo)).unwrap();

        let labels = out.labels.unwrap();
        assert_eq!(labels.shape(), &[4, 5]);
        for (&label, &value) in labels.iter().zip(volume.iter()) {
            let expected = if value < 0.0 { 1 } else { 0 };
            assert_eq!(label, expected, "value {}", value);
        }
    }

    #[test]
    fn sparse_grid_fails_coverage() {
        let config = SlidingWindowConfig::new(vec![2]).with_step(vec![2]);
        let inferer = SlidingWindowInferer::new(config).unwrap();
        let volume = ArrayD::<f32>::zeros(IxDyn(&[1, 6]));
        let full = inferer.plan(volume.shape()).unwrap();
        let sparse = TileGrid::from_origins(
            full.tile_shape().to_vec(),
            full.padded_shape().to_vec(),
            vec![full.origins()[0].clone(), full.origins()[2].clone()],
        )
        .unwrap();

        let err = inferer
            .infer_grid(
                volume.view(),
                &sparse,
                &ConstantScorer::new(1, 1.0),
                &CancellationToken::new(),
            )
            .unwrap_err();
        match err {
            InferError::IncompleteCoverage { voxel, .. } => assert_eq!(voxel, vec![2]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(inferer.stats().failed_passes, 1);
    }

    #[test]
    fn many_volumes_share_one_inferer() {
        let inferer = SlidingWindowInferer::new(SlidingWindowConfig::new(vec![3, 3])).unwrap();
        let a = ramp(&[1, 5, 7]);
        let b = ramp(&[2, 2, 9]);
        let outputs = inferer
            .infer_many(
                &[a.view(), b.view()],
                &ConstantScorer::new(1, 1.0),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].scores.shape(), &[1, 5, 7]);
        assert_eq!(outputs[1].scores.shape(), &[1, 2, 9]);

        let stats = inferer.stats();
        assert_eq!(stats.successful_passes, 2);
        assert_eq!(
            stats.total_tiles,
            outputs[0].stats.tiles + outputs[1].stats.tiles
        );
    }

    #[test]
    fn cancelled_pass_returns_no_output() {
        let inferer = SlidingWindowInferer::new(SlidingWindowConfig::new(vec![2, 2])).unwrap();
        let volume = ArrayD::<f32>::zeros(IxDyn(&[1, 4, 4]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            inferer.infer_with_cancel(volume.view(), &ConstantScorer::new(1, 1.0), &cancel),
            Err(InferError::Cancelled { completed: 0, .. })
        ));
    }

    #[test]
    fn scorer_failure_carries_tile_origin() {
        let config = SlidingWindowConfig::new(vec![2, 2]).with_step(vec![2, 2]);
        let inferer = SlidingWindowInferer::new(config).unwrap();
        let volume = ArrayD::<f32>::zeros(IxDyn(&[1, 4, 4]));
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let scorer = scorer_fn("flaky", |tiles: ArrayViewD<'_, f32>| {
            if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 2 {
                return Err("device lost".into());
            }
            Ok(tiles.to_owned())
        });
        let err = inferer.infer(volume.view(), &scorer).unwrap_err();
        assert_eq!(err.tile_origin().map(|o| o.coords().to_vec()), Some(vec![2, 0]));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(matches!(
            SlidingWindowInferer::new(SlidingWindowConfig::new(vec![4, 4]).with_step(vec![4, 5])),
            Err(InferError::InvalidGridConfiguration { axis: 1, .. })
        ));
        assert!(matches!(
            SlidingWindowInferer::new(SlidingWindowConfig::new(vec![4]).with_batch_size(0)),
            Err(InferError::ConfigError { .. })
        ));

        let inferer = SlidingWindowInferer::new(SlidingWindowConfig::new(vec![4, 4])).unwrap();
        let flat = ArrayD::<f32>::zeros(IxDyn(&[4, 4]));
        assert!(matches!(
            inferer.infer(flat.view(), &ConstantScorer::new(1, 1.0)),
            Err(InferError::InvalidInput { .. })
        ));
    }
}
