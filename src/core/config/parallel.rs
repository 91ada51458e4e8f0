//! Shared parallel processing configuration types.

use serde::{Deserialize, Serialize};

/// Configuration for parallel tile scoring.
///
/// Controls how many worker threads score tiles and when a pass is small
/// enough to run on the calling thread instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelPolicy {
    /// Maximum number of threads to use for tile scoring.
    /// If None, rayon will use the default thread pool size (typically number of CPU cores).
    /// Default: None (use rayon's default)
    #[serde(default)]
    pub max_threads: Option<usize>,

    /// Number of scorer batches processed sequentially (<= this uses sequential)
    /// Default: 1 (a single batch never pays for thread hand-off)
    #[serde(default = "ParallelPolicy::default_batch_threshold")]
    pub batch_threshold: usize,
}

impl ParallelPolicy {
    /// Create a new ParallelPolicy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of threads.
    pub fn with_max_threads(mut self, max_threads: Option<usize>) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Set the sequential batch threshold.
    pub fn with_batch_threshold(mut self, threshold: usize) -> Self {
        self.batch_threshold = threshold;
        self
    }

    /// Returns true when `batch_count` batches should be scored in parallel.
    pub fn should_parallelize(&self, batch_count: usize) -> bool {
        self.max_threads != Some(1) && batch_count > self.batch_threshold
    }

    /// Builds a dedicated rayon pool when `max_threads` is set.
    ///
    /// Returns `Ok(None)` when the global pool should be used.
    pub fn build_pool(&self) -> Result<Option<rayon::ThreadPool>, rayon::ThreadPoolBuildError> {
        match self.max_threads {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|idx| format!("voxtile-score-{idx}"))
                .build()
                .map(Some),
            None => Ok(None),
        }
    }

    /// Default value for batch threshold.
    fn default_batch_threshold() -> usize {
        1
    }
}

impl Default for ParallelPolicy {
    fn default() -> Self {
        Self {
            max_threads: None,
            batch_threshold: Self::default_batch_threshold(),
        }
    }
}
