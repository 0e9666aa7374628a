//! Executor error types.

use std::time::Duration;

/// Errors that abort an execution.
///
/// Per-step failures never surface here; they are recorded on the step.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The automation server could not be spawned
    #[error("automation server failed to start: {0}")]
    Startup(String),

    /// The automation server did not pass its health check
    #[error("automation server health check failed: {0}")]
    HealthCheck(String),

    /// HTTP transport error talking to the control API
    #[error("control API request failed: {0}")]
    Remote(#[from] reqwest::Error),

    /// The control API answered with something unexpected
    #[error("control API protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The step loop ran past the execution time limit
    #[error("execution exceeded time limit of {}s", .0.as_secs())]
    TimedOut(Duration),

    /// The server script could not be rendered
    #[error("server script error: {0}")]
    Script(String),
}

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;
