//! Error kinds raised by the individual stages of a regulation pass.

use thiserror::Error;

/// Result type for regulation stages
pub type Result<T> = std::result::Result<T, RegulatorError>;

#[derive(Error, Debug)]
pub enum RegulatorError {
    /// Inventory or metadata source could not be reached. The pass ends
    /// with zero decisions.
    #[error("{source_name} unavailable: {reason}")]
    SourceUnavailable {
        source_name: &'static str,
        reason: String,
    },

    /// A single inventory line could not be parsed. Only that record is dropped.
    #[error("malformed inventory record `{line}`: {reason}")]
    MalformedRecord { line: String, reason: String },

    /// Signalling a process failed. Other pids are still attempted.
    #[error("failed to terminate pid {pid}: {reason}")]
    TerminationFailure { pid: u32, reason: String },

    /// Anything else. Aborts the current pass only.
    #[error("unexpected fault: {0}")]
    Unexpected(String),
}

impl From<nvml_wrapper::error::NvmlError> for RegulatorError {
    fn from(err: nvml_wrapper::error::NvmlError) -> Self {
        Self::SourceUnavailable {
            source_name: "nvml",
            reason: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for RegulatorError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Unexpected(format!("blocking task failed: {err}"))
    }
}
