//! Shared error types for svclink.

use thiserror::Error;

/// Top-level error type shared by the svclink crates.
#[derive(Error, Debug)]
pub enum SvcLinkError {
    /// A dispatcher thread without a name or a known id.
    #[error("Invalid thread: {0}")]
    InvalidThread(String),

    /// A dispatcher thread with this name already exists.
    #[error("Thread already exists: {0}")]
    ThreadAlreadyExists(String),

    /// The service manager is not running.
    #[error("Service manager is not running")]
    ManagerNotRunning,

    /// The service manager was already started.
    #[error("Service manager is already running")]
    ManagerAlreadyRunning,

    /// The system is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,
}

/// Alias for Result with SvcLinkError.
pub type SvcLinkResult<T> = Result<T, SvcLinkError>;
