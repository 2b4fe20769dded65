//! Error types for the compute dispatch pipeline.
//!
//! Every device operation surfaces failure through [`OclError`], one
//! variant per failure origin. There is no retry anywhere in the
//! pipeline; each operation is attempted exactly once and its outcome
//! propagated with `?`.

use serde::Serialize;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, OclError>;

/// Errors from pipeline operations, grouped by origin.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum OclError {
    /// No platform at the requested index, or no device of the
    /// requested class on it.
    #[error("device enumeration failed: {reason}")]
    Enumeration { reason: String },

    /// Context or queue creation rejected by the device layer.
    #[error("device rejected {operation}: {reason}")]
    Device { operation: &'static str, reason: String },

    /// Buffer creation rejected (zero or overflowing size, out of memory).
    #[error("buffer allocation ({size_bytes} bytes) failed: {reason}")]
    Allocation { size_bytes: usize, reason: String },

    /// Upload or download rejected (size mismatch, stale handle,
    /// queue and buffer from different contexts).
    #[error("data transfer failed: {reason}")]
    Transfer { reason: String },

    /// Kernel source failed to build for the target device set.
    #[error("program build failed: {log}")]
    Compile { log: String },

    /// Requested entry point absent from the compiled program.
    #[error("entry point '{name}' not found in program")]
    Symbol { name: String },

    /// Argument binding rejected by arity or access-mode mismatch.
    #[error("argument binding failed: {reason}")]
    Binding { reason: String },

    /// Work-size constraints violated or submission rejected.
    #[error("dispatch rejected: {reason}")]
    Dispatch { reason: String },
}

impl OclError {
    /// Short lowercase tag naming the failure origin, for logs and
    /// machine-readable reports.
    pub fn origin(&self) -> &'static str {
        match self {
            Self::Enumeration { .. } => "enumeration",
            Self::Device { .. } => "device",
            Self::Allocation { .. } => "allocation",
            Self::Transfer { .. } => "transfer",
            Self::Compile { .. } => "compile",
            Self::Symbol { .. } => "symbol",
            Self::Binding { .. } => "binding",
            Self::Dispatch { .. } => "dispatch",
        }
    }
}
