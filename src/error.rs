use std::io;

use thiserror::Error;

/// The error taxonomy surfaced by the public API.
///
/// Per-flow failures (accept errors, connect failures, per-pair I/O errors,
/// UDP backpressure drops) never reach this type: they are contained to the
/// flow that raised them and are only observable through a deletion
/// listener and the log, not through a `Result` returned to the caller.
#[derive(Debug, Error)]
pub enum CrusherError {
    /// A builder was missing a required field, or carried an invalid
    /// combination of options. Raised synchronously from `build()`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An operation was invoked while the proxy was in the wrong
    /// open/closed/frozen state for it.
    #[error("lifecycle error: {0}")]
    LifecycleState(&'static str),

    /// A synchronous I/O error, e.g. the initial bind performed by `open()`.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CrusherError>;
