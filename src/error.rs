//! Error types for moltkeeper.

use std::time::Duration;

use serde::Serialize;

use crate::sandbox::SandboxError;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Config file error: {0}")]
    ConfigFile(#[from] ConfigFileError),
}

/// Coarse machine classification shared by every public error.
///
/// Callers branch on this instead of matching individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Required credentials or bindings are absent. Never retried.
    NotConfigured,
    /// No backup or no process. Informational.
    NotFound,
    /// A port wait or command exceeded its deadline.
    Timeout,
    /// Hard refusal to run an operation that could lose data.
    Unsafe,
    /// A command ran but failed.
    ExecutionFailed,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::NotConfigured,
            Error::Sandbox(e) => e.kind(),
            Error::Store(_) => ErrorKind::ExecutionFailed,
            Error::Gateway(e) => e.kind(),
            Error::Sync(e) => e.kind(),
            Error::ConfigFile(e) => e.kind(),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

}

/// Remote blob store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid object key: {key}")]
    InvalidKey { key: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Gateway supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Failed to start gateway process: {0}")]
    StartFailed(#[source] SandboxError),

    #[error("Gateway failed to start. Stderr: {}", display_or_empty(stderr))]
    StartupFailed {
        process_id: String,
        stderr: String,
        stdout: String,
    },

    #[error("Gateway did not become ready: {0}")]
    NotReady(#[source] SandboxError),

    #[error("Gateway process not found")]
    NotRunning,

    #[error("Failed to parse device list")]
    DeviceListUnreadable { raw: String },

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::StartFailed(_) => ErrorKind::ExecutionFailed,
            GatewayError::StartupFailed { .. } | GatewayError::NotReady(_) => ErrorKind::Timeout,
            GatewayError::NotRunning => ErrorKind::NotFound,
            GatewayError::DeviceListUnreadable { .. } => ErrorKind::ExecutionFailed,
            GatewayError::Sandbox(e) => e.kind(),
        }
    }
}

/// Errors from restoring or backing up durable state.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("R2 storage is disabled")]
    Disabled,

    #[error("R2 storage is not configured (missing: {})", missing.join(", "))]
    NotConfigured { missing: Vec<String> },

    #[error("Failed to mount R2 storage: {reason}")]
    MountFailed { reason: String },

    #[error("No backup found in R2")]
    NoBackup,

    #[error("Restore required before backup")]
    RestoreRequired,

    #[error("Sync aborted: source missing {file}")]
    MissingSource { file: String },

    #[error("Restore failed: {details}")]
    RestoreFailed { details: String },

    #[error("Sync failed: {details}")]
    SyncFailed { details: String },

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Disabled | SyncError::NotConfigured { .. } | SyncError::MountFailed { .. } => {
                ErrorKind::NotConfigured
            }
            SyncError::NoBackup => ErrorKind::NotFound,
            SyncError::RestoreRequired | SyncError::MissingSource { .. } => ErrorKind::Unsafe,
            SyncError::RestoreFailed { .. } | SyncError::SyncFailed { .. } => {
                ErrorKind::ExecutionFailed
            }
            SyncError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Short headline without diagnostic detail.
    pub fn headline(&self) -> String {
        match self {
            SyncError::NotConfigured { .. } => "R2 storage is not configured".to_string(),
            SyncError::MountFailed { .. } => "Failed to mount R2 storage".to_string(),
            SyncError::RestoreFailed { .. } => "Restore failed".to_string(),
            SyncError::SyncFailed { .. } => "Sync failed".to_string(),
            other => other.to_string(),
        }
    }

    /// Human detail captured from the failing command, if any.
    pub fn details(&self) -> Option<String> {
        match self {
            SyncError::MountFailed { reason } => Some(reason.clone()),
            SyncError::RestoreFailed { details } | SyncError::SyncFailed { details } => {
                Some(details.clone())
            }
            SyncError::MissingSource { .. } => Some(
                "The local config directory is missing critical files. This could indicate \
                 corruption or an incomplete setup."
                    .to_string(),
            ),
            SyncError::NotConfigured { missing } => Some(format!("missing: {}", missing.join(", "))),
            _ => None,
        }
    }
}

impl From<SandboxError> for SyncError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::Timeout(d) => SyncError::Timeout(d),
            other => SyncError::SyncFailed {
                details: other.to_string(),
            },
        }
    }
}

/// Errors reading or writing a gateway config document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("Failed to read config file {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("Failed to write config file {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

impl ConfigFileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigFileError::ReadFailed { .. } => ErrorKind::NotFound,
            ConfigFileError::WriteFailed { .. } => ErrorKind::ExecutionFailed,
            ConfigFileError::Sandbox(e) => e.kind(),
        }
    }
}

fn display_or_empty(s: &str) -> &str {
    if s.trim().is_empty() { "(empty)" } else { s }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
