//! Shell command execution inside the sandbox.
//!
//! All filesystem work (probing, copying, reading and writing files) is done by
//! starting a short-lived shell process through the [`SandboxRuntime`] and
//! polling it to completion under an explicit timeout. A command that
//! outlives its timeout is reported as failed and left to the runtime; nothing
//! here retries.

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::sandbox::{ProcessHandle, ProcessStatus, SandboxError, SandboxRuntime, StartOptions};

/// Tag attached to every helper command so it is never mistaken for the gateway.
pub const EXEC_TAG: &str = "exec";

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Best available diagnostic text: stderr, then stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "no exit code".to_string(),
        }
    }
}

/// Poll `process` until it leaves the starting/running states.
pub async fn wait_for_exit(
    process: &dyn ProcessHandle,
    timeout: Duration,
) -> Result<ProcessStatus, SandboxError> {
    let poll = async {
        loop {
            let status = process.status().await;
            if !status.is_live() {
                return status;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| SandboxError::Timeout(timeout))
}

/// Run `command` to completion and capture its output.
pub async fn run_command(
    runtime: &dyn SandboxRuntime,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput, SandboxError> {
    let process = runtime
        .start_process(command, StartOptions::tagged(EXEC_TAG))
        .await?;
    wait_for_exit(process.as_ref(), timeout).await?;
    let logs = process.logs().await?;
    Ok(CommandOutput {
        exit_code: process.exit_code().await,
        stdout: logs.stdout,
        stderr: logs.stderr,
    })
}

/// Quote `value` as a single POSIX shell word.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:+=@,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Shell snippet writing `content` verbatim to `path` through a quoted heredoc.
///
/// The delimiter is random, so content cannot terminate the heredoc early.
pub fn heredoc_write(path: &str, content: &str) -> String {
    let delimiter = format!("__CONFIG_{}__", Uuid::new_v4().simple());
    format!(
        "cat <<'{delimiter}' > {path}\n{content}\n{delimiter}",
        path = shell_quote(path)
    )
}
