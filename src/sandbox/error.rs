//! Error types for sandbox runtime interactions.

use std::time::Duration;

use crate::error::ErrorKind;

/// Errors that can occur talking to the sandbox runtime.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Listing processes failed.
    #[error("Could not list processes: {reason}")]
    ListFailed { reason: String },

    /// Starting a process failed.
    #[error("Process start failed: {reason}")]
    StartFailed { reason: String },

    /// Command or port wait timed out.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// Process exited before its port became reachable.
    #[error("Process {id} exited before becoming ready ({})", describe_exit(*exit_code))]
    ProcessExited { id: String, exit_code: Option<i32> },

    /// Killing a process failed.
    #[error("Kill failed for process {id}: {reason}")]
    KillFailed { id: String, reason: String },

    /// Log retrieval failed.
    #[error("Could not read logs for process {id}: {reason}")]
    LogsUnavailable { id: String, reason: String },

    /// Mounting the remote store failed.
    #[error("Mount failed at {path}: {reason}")]
    MountFailed { path: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Timeout(_) => ErrorKind::Timeout,
            SandboxError::MountFailed { .. } => ErrorKind::NotConfigured,
            _ => ErrorKind::ExecutionFailed,
        }
    }
}

fn describe_exit(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".to_string(),
    }
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
