//! Error types
//!
//! This module provides the typed error surface of the diff engine using
//! `thiserror`. The five categories mirror the failure semantics of the
//! pipeline:
//! - **MalformedInput**: unsorted call-graph vertices, dangling edge
//!   endpoints, payload parse failures
//! - **InconsistentModel**: double attach of a flow graph, double matching
//! - **OutOfDomain**: API or CLI arguments that cannot be honored
//! - **Io / Database**: failures while reading payloads or writing results
//! - **Cancelled**: user-requested early exit (not an error in batch mode)

use thiserror::Error;

use crate::Address;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DiffError>;

/// Diff engine error types.
///
/// The matching driver never recovers from `MalformedInput` or
/// `InconsistentModel`; `Io` errors bubble up unchanged and `Cancelled` is
/// treated as a normal early exit by the batch driver.
#[derive(Error, Debug)]
pub enum DiffError {
    /// Input payload violates a structural requirement.
    ///
    /// Carries the offending address so the front-end export can be fixed.
    #[error("malformed input at {address:#010x}: {message}")]
    MalformedInput { message: String, address: Address },

    /// The in-memory model was driven into a state it forbids.
    #[error("inconsistent model: {0}")]
    InconsistentModel(String),

    /// Arguments are outside the domain of the requested operation.
    #[error("invalid argument: {0}")]
    OutOfDomain(String),

    /// File system failure while loading a payload or persisting a result.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Result database failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// User-requested early stop.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl DiffError {
    /// Shorthand for a `MalformedInput` error at `address`.
    #[cold] // Error paths are cold
    pub fn malformed(message: impl Into<String>, address: Address) -> Self {
        DiffError::MalformedInput {
            message: message.into(),
            address,
        }
    }
}

impl From<serde_json::Error> for DiffError {
    #[cold] // Error paths are cold
    fn from(err: serde_json::Error) -> Self {
        DiffError::MalformedInput {
            message: format!("payload parse error: {err}"),
            address: 0,
        }
    }
}
