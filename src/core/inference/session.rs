//! Helpers for working directly with ONNX Runtime sessions.

use crate::core::errors::{InferError, InferResult, ProcessingStage};
use ort::logging::LogLevel;
use ort::session::Session;
use std::path::Path;

/// Loads one session from `model_path` with ORT logging limited to errors.
pub fn load_session(model_path: impl AsRef<Path>) -> InferResult<Session> {
    let path = model_path.as_ref();
    let session = Session::builder()
        .and_then(|b| b.with_log_level(LogLevel::Error))
        .and_then(|b| b.commit_from_file(path))
        .map_err(|e| {
            InferError::processing_error(
                ProcessingStage::Scoring,
                &format!("failed to create ONNX session from '{}'", path.display()),
                e,
            )
        })?;
    Ok(session)
}
