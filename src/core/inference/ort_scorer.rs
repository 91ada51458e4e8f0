//! A [`Scorer`] running an ONNX segmentation model.

use super::session::load_session;
use crate::core::errors::{BoxError, InferError, InferResult};
use crate::core::traits::Scorer;
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin pool of ONNX Runtime sessions scoring tile batches.
///
/// The model must take one f32 input `[batch, in_channels, t0, …]` and
/// produce `[batch, classes, t0, …]`. Each session sits behind its own mutex,
/// so concurrent scorer calls from the aggregator's workers use different
/// sessions when the pool is larger than one.
pub struct OrtScorer {
    sessions: Vec<Mutex<Session>>,
    next_idx: AtomicUsize,
    input_name: String,
    output_name: Option<String>,
    model_path: PathBuf,
    model_name: String,
}

impl std::fmt::Debug for OrtScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrtScorer")
            .field("sessions", &self.sessions.len())
            .field("input_name", &self.input_name)
            .field("output_name", &self.output_name)
            .field("model_path", &self.model_path)
            .field("model_name", &self.model_name)
            .finish()
    }
}

impl OrtScorer {
    /// Loads a single session. The input name defaults to `"input"`.
    pub fn new(model_path: impl AsRef<Path>, input_name: Option<&str>) -> InferResult<Self> {
        Self::with_pool_size(model_path, input_name, 1)
    }

    /// Loads `pool_size` sessions of the same model.
    pub fn with_pool_size(
        model_path: impl AsRef<Path>,
        input_name: Option<&str>,
        pool_size: usize,
    ) -> InferResult<Self> {
        let path = model_path.as_ref();
        if pool_size == 0 {
            return Err(InferError::config_error("session pool size must be positive"));
        }
        let sessions = (0..pool_size)
            .map(|_| load_session(path).map(Mutex::new))
            .collect::<InferResult<Vec<_>>>()?;
        let model_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown_model")
            .to_string();

        tracing::info!(
            "Loaded ONNX model '{}' with {} session(s)",
            model_name,
            pool_size
        );
        Ok(Self {
            sessions,
            next_idx: AtomicUsize::new(0),
            input_name: input_name.unwrap_or("input").to_string(),
            output_name: None,
            model_path: path.to_path_buf(),
            model_name,
        })
    }

    /// Reads scores from the named output instead of the first one.
    pub fn with_output_name(mut self, output_name: impl Into<String>) -> Self {
        self.output_name = Some(output_name.into());
        self
    }

    /// Model file this scorer was loaded from.
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Number of sessions in the pool.
    pub fn pool_size(&self) -> usize {
        self.sessions.len()
    }

    fn output_name(&self, session: &Session) -> Result<String, BoxError> {
        if let Some(name) = &self.output_name {
            return Ok(name.clone());
        }
        session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| format!("model '{}' declares no outputs", self.model_name).into())
    }
}

impl Scorer for OrtScorer {
    fn score(&self, tiles: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, BoxError> {
        let tiles = tiles.as_standard_layout();
        let input_tensor = TensorRef::from_array_view(tiles.view())?;
        let inputs = ort::inputs![self.input_name.as_str() => input_tensor];

        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[idx].lock().map_err(|_| {
            format!(
                "session {}/{} of '{}' is poisoned",
                idx,
                self.sessions.len(),
                self.model_name
            )
        })?;
        let output_name = self.output_name(&session)?;

        let outputs = session.run(inputs)?;
        let (shape, data) = outputs[output_name.as_str()].try_extract_tensor::<f32>()?;
        let dims = shape
            .iter()
            .map(|&d| usize::try_from(d))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| format!("output '{}' has a negative dimension", output_name))?;
        Ok(ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec())?)
    }

    fn name(&self) -> &str {
        &self.model_name
    }
}
