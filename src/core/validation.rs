//! Input Validation Utilities
//!
//! Checks shared by the engine components so malformed shapes surface as
//! errors instead of panics inside ndarray slicing.

use crate::core::errors::InferError;

/// Validates that a value is positive (> 0).
#[inline]
pub fn validate_positive<T: PartialOrd + std::fmt::Display + Default>(
    value: T,
    param_name: &str,
) -> Result<(), InferError> {
    if value <= T::default() {
        return Err(InferError::InvalidInput {
            message: format!(
                "Parameter '{}' must be positive, got: {}",
                param_name, value
            ),
        });
    }
    Ok(())
}

/// Validates that two collections have the same length.
#[inline]
pub fn validate_same_length<T, U>(
    items1: &[T],
    items2: &[U],
    name1: &str,
    name2: &str,
) -> Result<(), InferError> {
    if items1.len() != items2.len() {
        return Err(InferError::InvalidInput {
            message: format!(
                "Length mismatch: {} has {} elements, but {} has {} elements",
                name1,
                items1.len(),
                name2,
                items2.len()
            ),
        });
    }
    Ok(())
}

/// Validates the rank of a tensor shape.
pub fn validate_tensor_shape(
    shape: &[usize],
    expected_dims: usize,
    tensor_name: &str,
) -> Result<(), InferError> {
    if shape.len() != expected_dims {
        return Err(InferError::InvalidInput {
            message: format!(
                "Tensor '{}' expected {}D shape, got {}D: {:?}",
                tensor_name,
                expected_dims,
                shape.len(),
                shape
            ),
        });
    }
    Ok(())
}

/// Validates that no axis of a shape is empty.
pub fn validate_non_empty_shape(shape: &[usize], tensor_name: &str) -> Result<(), InferError> {
    if let Some(axis) = shape.iter().position(|&len| len == 0) {
        return Err(InferError::InvalidInput {
            message: format!(
                "Tensor '{}' has an empty axis {}: {:?}",
                tensor_name, axis, shape
            ),
        });
    }
    Ok(())
}

/// Returns the element count of a shape, rejecting overflow and sizes above `limit`.
pub fn checked_element_count(
    shape: &[usize],
    limit: usize,
    tensor_name: &str,
) -> Result<usize, InferError> {
    let count = shape
        .iter()
        .try_fold(1usize, |acc, &len| acc.checked_mul(len))
        .ok_or_else(|| InferError::InvalidInput {
            message: format!(
                "Tensor '{}' dimensions {:?} would cause integer overflow",
                tensor_name, shape
            ),
        })?;
    if count > limit {
        return Err(InferError::InvalidInput {
            message: format!(
                "Tensor '{}' size {} exceeds maximum allowed size {}",
                tensor_name, count, limit
            ),
        });
    }
    Ok(count)
}
