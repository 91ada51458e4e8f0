//! Configuration error types and validation traits.

use thiserror::Error;

/// Errors that can occur during configuration validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error indicating that a batch size is invalid (must be greater than 0).
    #[error("batch size must be greater than 0")]
    InvalidBatchSize,

    /// Error indicating that a configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Error indicating that a resource limit has been exceeded.
    #[error("resource limit exceeded: {message}")]
    ResourceLimitExceeded { message: String },
}

/// A trait for validating configuration parameters.
///
/// Implementors provide `validate` and `get_defaults`; the remaining methods
/// are reusable checks for the value kinds that appear in engine configs.
pub trait ConfigValidator {
    /// Validates the configuration.
    fn validate(&self) -> Result<(), ConfigError>;

    /// Returns the default configuration.
    fn get_defaults() -> Self
    where
        Self: Sized;

    /// Validates a batch size.
    ///
    /// # Arguments
    ///
    /// * `batch_size` - The batch size to validate.
    ///
    /// # Returns
    ///
    /// A Result indicating success or a ConfigError if validation fails.
    fn validate_batch_size(&self, batch_size: usize) -> Result<(), ConfigError> {
        if batch_size == 0 {
            Err(ConfigError::InvalidBatchSize)
        } else {
            Ok(())
        }
    }

    /// Validates thread count.
    ///
    /// # Arguments
    ///
    /// * `thread_count` - The thread count to validate.
    ///
    /// # Returns
    ///
    /// A Result indicating success or a ConfigError if validation fails.
    fn validate_thread_count(&self, thread_count: usize) -> Result<(), ConfigError> {
        const MAX_REASONABLE_THREADS: usize = 256;

        if thread_count == 0 {
            Err(ConfigError::InvalidConfig {
                message: "Thread count must be greater than 0".to_string(),
            })
        } else if thread_count > MAX_REASONABLE_THREADS {
            Err(ConfigError::ResourceLimitExceeded {
                message: format!(
                    "Thread count {} exceeds reasonable maximum of {}",
                    thread_count, MAX_REASONABLE_THREADS
                ),
            })
        } else {
            Ok(())
        }
    }

    /// Validates a float value lies in the half-open range `[min, max)`.
    fn validate_f64_half_open(
        &self,
        value: f64,
        min: f64,
        max: f64,
        field_name: &str,
    ) -> Result<(), ConfigError> {
        if !value.is_finite() || value < min || value >= max {
            Err(ConfigError::InvalidConfig {
                message: format!(
                    "{} must be in [{}, {}), got {}",
                    field_name, min, max, value
                ),
            })
        } else {
            Ok(())
        }
    }

    /// Validates a float value is positive and finite.
    fn validate_positive_f32(&self, value: f32, field_name: &str) -> Result<(), ConfigError> {
        if !value.is_finite() || value <= 0.0 {
            Err(ConfigError::InvalidConfig {
                message: format!("{} must be greater than 0, got {}", field_name, value),
            })
        } else {
            Ok(())
        }
    }

    /// Validates that every entry of a shape is positive.
    fn validate_shape(&self, shape: &[usize], field_name: &str) -> Result<(), ConfigError> {
        if shape.is_empty() {
            return Err(ConfigError::InvalidConfig {
                message: format!("{} must have at least one axis", field_name),
            });
        }
        if let Some(axis) = shape.iter().position(|&len| len == 0) {
            return Err(ConfigError::InvalidConfig {
                message: format!(
                    "{} must be positive on every axis, got 0 on axis {} ({:?})",
                    field_name, axis, shape
                ),
            });
        }
        Ok(())
    }
}

/// Extension trait for ConfigValidator that provides error wrapping utilities.
pub trait ConfigValidatorExt: ConfigValidator {
    /// Validates configuration and wraps any errors into `InferError::ConfigError`.
    fn validate_and_wrap(self) -> Result<Self, crate::core::errors::InferError>
    where
        Self: Sized,
    {
        self.validate()?;
        Ok(self)
    }
}

// Blanket implementation for all ConfigValidator types
impl<T: ConfigValidator> ConfigValidatorExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestValidator;
    impl ConfigValidator for TestValidator {
        fn validate(&self) -> Result<(), ConfigError> {
            Ok(())
        }

        fn get_defaults() -> Self {
            TestValidator
        }
    }

    #[test]
    fn test_validate_batch_size() {
        let validator = TestValidator;
        assert!(validator.validate_batch_size(1).is_ok());
        assert!(validator.validate_batch_size(0).is_err());
    }

    #[test]
    fn test_validate_thread_count() {
        let validator = TestValidator;
        assert!(validator.validate_thread_count(8).is_ok());
        assert!(validator.validate_thread_count(0).is_err());
        assert!(validator.validate_thread_count(512).is_err());
    }

    #[test]
    fn test_validate_half_open() {
        let validator = TestValidator;
        assert!(validator.validate_f64_half_open(0.0, 0.0, 1.0, "overlap").is_ok());
        assert!(validator.validate_f64_half_open(0.5, 0.0, 1.0, "overlap").is_ok());
        assert!(validator.validate_f64_half_open(1.0, 0.0, 1.0, "overlap").is_err());
        assert!(validator.validate_f64_half_open(f64::NAN, 0.0, 1.0, "overlap").is_err());
    }

    #[test]
    fn test_validate_shape() {
        let validator = TestValidator;
        assert!(validator.validate_shape(&[4, 4, 4], "tile_shape").is_ok());
        assert!(validator.validate_shape(&[], "tile_shape").is_err());
        let err = validator.validate_shape(&[4, 0], "tile_shape").unwrap_err();
        assert!(err.to_string().contains("axis 1"));
    }
}
