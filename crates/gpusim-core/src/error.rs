//! Error types for gpusim

use thiserror::Error;

/// Main error type for the simulator
///
/// Every variant is fatal for the current simulation step. Expected
/// conditions such as a job that does not fit a node, or a job requested
/// before its submit time, are reported through return values instead.
#[derive(Error, Debug)]
pub enum SimError {
    /// A scheduling mode that is not implemented was selected
    #[error("Unsupported scheduling policy: {0}")]
    UnsupportedPolicy(String),

    /// The operation has no meaning in the current workload mode
    #[error("Operation `{operation}` is not applicable in {mode} mode")]
    NotApplicableInMode {
        operation: &'static str,
        mode: &'static str,
    },

    /// The placement map and the node tables disagree
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A reservation or release would leave a usage counter out of bounds
    #[error("Resource accounting violation: {0}")]
    ResourceViolation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed workload trace
    #[error("Trace error: {0}")]
    Trace(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV decoding error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Result type for simulator operations
pub type SimResult<T> = Result<T, SimError>;

impl From<toml::de::Error> for SimError {
    fn from(err: toml::de::Error) -> Self {
        SimError::Config(err.to_string())
    }
}
