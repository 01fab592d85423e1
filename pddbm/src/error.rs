//! Error taxonomy for inference and learning.
//!
//! There is no transient error class: nothing inside an inference or
//! learning step touches I/O, so every failure is a contract violation
//! surfaced to the caller immediately.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PddbmError>;

#[derive(Debug, Error)]
pub enum PddbmError {
    /// Bad schedule step, bad topology, non-positive chain count,
    /// unknown statistic name, out-of-range hyperparameter.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// dtype or shape mismatch between tensors that must agree.
    #[error("type/domain error: {0}")]
    TypeDomain(String),

    /// Failure inside the tensor backend.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shorthand for `Err(PddbmError::Configuration(format!(..)))`.
#[macro_export]
macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::PddbmError::Configuration(format!($($arg)*)))
    };
}

/// Shorthand for `Err(PddbmError::TypeDomain(format!(..)))`.
#[macro_export]
macro_rules! domain_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::PddbmError::TypeDomain(format!($($arg)*)))
    };
}
