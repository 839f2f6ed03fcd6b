//! Sandbox runtime boundary.
//!
//! The gateway lives inside an ephemeral sandbox owned by an external runtime.
//! This module defines the two traits the rest of the crate consumes:
//!
//! - [`SandboxRuntime`]: lists and starts processes, mounts the remote store
//! - [`ProcessHandle`]: a non-owning handle to one process in the sandbox
//!
//! Handles are cheap to discard and are never assumed valid across calls. The
//! supervisor re-lists processes whenever it needs to know what is running.
//!
//! [`local::LocalRuntime`] is a tokio-process implementation used by the CLI
//! and the integration tests.

pub mod error;
pub mod local;
#[cfg(test)]
pub(crate) mod mock;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

pub use error::{Result, SandboxError};
pub use local::LocalRuntime;

/// Environment passed to a started process.
pub type EnvMap = BTreeMap<String, String>;

/// Shared handle to a sandbox process.
pub type SharedProcess = Arc<dyn ProcessHandle>;

/// Lifecycle status reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl ProcessStatus {
    /// Starting or running.
    pub fn is_live(self) -> bool {
        matches!(self, ProcessStatus::Starting | ProcessStatus::Running)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Captured output of a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessLogs {
    pub stdout: String,
    pub stderr: String,
}

/// Options for [`SandboxRuntime::start_process`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Environment variables set for the process.
    pub env: EnvMap,
    /// Structured tag recorded at start time, used to classify processes
    /// without parsing their command line.
    pub tag: Option<String>,
}

impl StartOptions {
    pub fn tagged(tag: impl Into<String>) -> Self {
        Self {
            env: EnvMap::new(),
            tag: Some(tag.into()),
        }
    }

    pub fn with_env(mut self, env: EnvMap) -> Self {
        self.env = env;
        self
    }
}

/// Everything the runtime needs to expose the remote store as a directory.
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub bucket: String,
    pub mount_path: PathBuf,
    pub endpoint: String,
    pub access_key_id: SecretString,
    pub secret_access_key: SecretString,
}

/// A process running inside the sandbox.
#[async_trait]
pub trait ProcessHandle: Send + Sync + std::fmt::Debug {
    /// Opaque runtime-assigned id.
    fn id(&self) -> &str;

    /// The command line the process was started with.
    fn command(&self) -> &str;

    /// Tag recorded at start time, if the runtime supports one.
    fn tag(&self) -> Option<&str> {
        None
    }

    /// Current status, re-queried from the runtime.
    async fn status(&self) -> ProcessStatus;

    /// Exit code, once the process is terminal.
    async fn exit_code(&self) -> Option<i32>;

    /// Captured stdout and stderr so far.
    async fn logs(&self) -> Result<ProcessLogs>;

    /// Wait until `port` accepts TCP connections, or fail after `timeout`.
    async fn wait_for_port(&self, port: u16, timeout: Duration) -> Result<()>;

    /// Terminate the process.
    async fn kill(&self) -> Result<()>;
}

/// The sandbox runtime hosting the gateway.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Identifier of this sandbox instance, used to key single-flight guards.
    fn id(&self) -> &str;

    /// All processes the runtime knows about, live or not.
    async fn list_processes(&self) -> Result<Vec<SharedProcess>>;

    /// Start `command` through the sandbox shell.
    async fn start_process(&self, command: &str, options: StartOptions) -> Result<SharedProcess>;

    /// Expose the remote bucket as a local directory at `request.mount_path`.
    async fn mount_bucket(&self, request: &MountRequest) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_statuses() {
        assert!(ProcessStatus::Starting.is_live());
        assert!(ProcessStatus::Running.is_live());
        assert!(!ProcessStatus::Stopped.is_live());
        assert!(!ProcessStatus::Failed.is_live());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ProcessStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        assert_eq!(ProcessStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_start_options_tagged() {
        let mut env = EnvMap::new();
        env.insert("A".to_string(), "1".to_string());
        let opts = StartOptions::tagged("gateway").with_env(env);
        assert_eq!(opts.tag.as_deref(), Some("gateway"));
        assert_eq!(opts.env.get("A").map(String::as_str), Some("1"));
    }
}
