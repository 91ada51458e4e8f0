//! Pass statistics.
//!
//! This module defines `PassStats`, returned with every successful pass, and the
//! `StatsManager` helper that accumulates thread-safe totals over the lifetime
//! of an inferer.

use crate::core::config::{AccumulationStrategy, WeightMode};
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Statistics for one sliding-window pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassStats {
    /// Tiles scored and accumulated.
    pub tiles: usize,
    /// Scorer invocations.
    pub batches: usize,
    /// Classes reported by the scorer.
    pub classes: usize,
    /// Spatial shape the grid covered, after padding.
    pub padded_shape: Vec<usize>,
    /// Strategy that ran.
    pub strategy: AccumulationStrategy,
    /// Weight mode used, after any fallback.
    pub weight_mode: WeightMode,
    /// Wall-clock time of the pass in milliseconds.
    pub elapsed_ms: f64,
}

impl PassStats {
    /// Tiles per second over the whole pass.
    pub fn tiles_per_second(&self) -> f64 {
        if self.elapsed_ms == 0.0 {
            0.0
        } else {
            self.tiles as f64 * 1000.0 / self.elapsed_ms
        }
    }
}

impl fmt::Display for PassStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tiles in {} batches over {:?} ({} classes, {:?}) in {:.2} ms",
            self.tiles, self.batches, self.padded_shape, self.classes, self.strategy, self.elapsed_ms
        )
    }
}

/// Totals across every pass run by one inferer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceStats {
    /// Passes attempted.
    pub total_passes: usize,
    /// Passes that produced an output.
    pub successful_passes: usize,
    /// Passes that returned an error, cancellations included.
    pub failed_passes: usize,
    /// Tiles accumulated by successful passes.
    pub total_tiles: usize,
    /// Average wall-clock time per pass in milliseconds.
    pub average_pass_time_ms: f64,
}

impl InferenceStats {
    /// Returns the success rate as a percentage (0.0 to 100.0).
    pub fn success_rate(&self) -> f64 {
        if self.total_passes == 0 {
            0.0
        } else {
            (self.successful_passes as f64 / self.total_passes as f64) * 100.0
        }
    }

    /// Returns the failure rate as a percentage (0.0 to 100.0).
    pub fn failure_rate(&self) -> f64 {
        if self.total_passes == 0 {
            0.0
        } else {
            (self.failed_passes as f64 / self.total_passes as f64) * 100.0
        }
    }
}

impl fmt::Display for InferenceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Inference Statistics:")?;
        writeln!(f, "  Passes: {}", self.total_passes)?;
        writeln!(
            f,
            "  Successful: {} ({:.1}%)",
            self.successful_passes,
            self.success_rate()
        )?;
        writeln!(
            f,
            "  Failed: {} ({:.1}%)",
            self.failed_passes,
            self.failure_rate()
        )?;
        writeln!(f, "  Tiles: {}", self.total_tiles)?;
        writeln!(
            f,
            "  Average pass time: {:.2} ms",
            self.average_pass_time_ms
        )?;
        Ok(())
    }
}

/// Thread-safe manager for updating statistics as passes complete.
#[derive(Debug, Default)]
pub struct StatsManager {
    stats: Mutex<InferenceStats>,
}

impl StatsManager {
    /// Creates a new `StatsManager` instance with zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current statistics snapshot.
    pub fn get_stats(&self) -> InferenceStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records a successful pass.
    pub fn record_success(&self, pass: &PassStats) {
        self.record(true, pass.tiles, pass.elapsed_ms);
    }

    /// Records a failed pass.
    pub fn record_failure(&self, elapsed_ms: f64) {
        self.record(false, 0, elapsed_ms);
    }

    fn record(&self, success: bool, tiles: usize, elapsed_ms: f64) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);

        let previous_total = stats.total_passes;
        let accumulated_time = stats.average_pass_time_ms * previous_total as f64;
        stats.total_passes = previous_total + 1;
        if success {
            stats.successful_passes += 1;
        } else {
            stats.failed_passes += 1;
        }
        stats.total_tiles += tiles;
        stats.average_pass_time_ms = (accumulated_time + elapsed_ms) / stats.total_passes as f64;
    }

    /// Resets the tracked statistics to their default state.
    pub fn reset_stats(&self) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        *stats = InferenceStats::default();
    }
}
