//! Failures of the kernel and its service manager task.

use svclink_types::error::SvcLinkError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    /// A request was refused by the registry or the manager queue.
    #[error(transparent)]
    SvcLink(#[from] SvcLinkError),

    /// The service manager task could not be spawned at boot.
    #[error("Service manager failed to start: {0}")]
    ManagerStart(#[source] SvcLinkError),

    /// Queued requests were still pending when the shutdown timeout expired.
    /// The task was aborted and those requests were dropped.
    #[error("Service manager did not drain within {timeout_ms} ms ({pending} requests dropped)")]
    DrainTimeout { timeout_ms: u64, pending: usize },

    /// The service manager task panicked or was cancelled.
    #[error("Service manager task failed: {0}")]
    ManagerTask(String),
}

pub type KernelResult<T> = Result<T, KernelError>;
