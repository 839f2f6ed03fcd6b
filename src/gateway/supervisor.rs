//! Gateway process lifecycle.
//!
//! The supervisor keeps exactly one healthy gateway running in the sandbox.
//! Discovery and startup run under a per-sandbox guard, so concurrent callers
//! wait for the same process instead of racing to start their own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::ai_env::AiEnvOverride;
use crate::config::{Config, GatewayConfig};
use crate::error::GatewayError;
use crate::exec::{CommandOutput, run_command, shell_quote};
use crate::gateway::env::build_env_vars;
use crate::sandbox::{
    EnvMap, ProcessHandle, ProcessStatus, SandboxError, SandboxRuntime, SharedProcess,
    StartOptions,
};
use crate::store::RemoteStore;
use crate::sync::RemoteMount;

/// Tag recorded on the gateway process at start.
pub const GATEWAY_TAG: &str = "gateway";

/// Command fragments that identify a gateway started without a tag.
const GATEWAY_PATTERNS: &[&str] = &["start-moltbot.sh", "openclaw gateway", "clawdbot gateway"];

/// One-shot CLI invocations that share a prefix with the gateway command.
const CLI_EXCLUSIONS: &[&str] = &[
    "openclaw devices",
    "openclaw --version",
    "clawdbot devices",
    "clawdbot --version",
];

/// Whether an untagged command line is the gateway.
pub fn is_gateway_command(command: &str) -> bool {
    GATEWAY_PATTERNS.iter().any(|p| command.contains(p))
        && !CLI_EXCLUSIONS.iter().any(|p| command.contains(p))
}

/// Classify by tag when the runtime recorded one, else by command line.
pub fn is_gateway_process(process: &dyn ProcessHandle) -> bool {
    match process.tag() {
        Some(tag) => tag == GATEWAY_TAG,
        None => is_gateway_command(process.command()),
    }
}

/// Per-sandbox single-flight guards for discover-or-start.
///
/// Supervisors that share a registry serialize startup for the same sandbox.
#[derive(Debug, Default)]
pub struct StartGuards {
    guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StartGuards {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self, sandbox_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut guards = self.guards.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(guards.entry(sandbox_id.to_string()).or_default())
    }
}

/// Health of the gateway as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GatewayStatus {
    NotRunning,
    Running { process_id: String },
    NotResponding { process_id: String },
}

/// Captured gateway output.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayLogs {
    pub process_id: String,
    pub status: ProcessStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Outcome of approving every pending device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceApproval {
    pub approved: Vec<String>,
    pub failed: Vec<DeviceFailure>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceFailure {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Returned by [`GatewaySupervisor::restart`]; the new gateway boots in the
/// background.
#[derive(Debug)]
pub struct RestartOutcome {
    pub previous_process_id: Option<String>,
    pub boot: JoinHandle<Result<SharedProcess, GatewayError>>,
}

#[derive(Clone)]
pub struct GatewaySupervisor {
    runtime: Arc<dyn SandboxRuntime>,
    store: Arc<dyn RemoteStore>,
    mount: Arc<RemoteMount>,
    guards: Arc<StartGuards>,
    gateway: GatewayConfig,
    env: EnvMap,
    cli_timeout: Duration,
    update_timeout: Duration,
}

impl GatewaySupervisor {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        store: Arc<dyn RemoteStore>,
        mount: Arc<RemoteMount>,
        guards: Arc<StartGuards>,
        config: &Config,
    ) -> Self {
        Self {
            runtime,
            store,
            mount,
            guards,
            gateway: config.gateway.clone(),
            env: config.env.clone(),
            cli_timeout: config.timeouts.cli,
            update_timeout: config.timeouts.update,
        }
    }

    /// The first live gateway process, re-listed from the runtime.
    pub async fn find_existing(&self) -> Result<Option<SharedProcess>, SandboxError> {
        for process in self.runtime.list_processes().await? {
            if is_gateway_process(process.as_ref()) && process.status().await.is_live() {
                return Ok(Some(process));
            }
        }
        Ok(None)
    }

    async fn find_existing_logged(&self) -> Option<SharedProcess> {
        match self.find_existing().await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list processes");
                None
            }
        }
    }

    /// Return a ready gateway, starting one if needed.
    pub async fn ensure(&self) -> Result<SharedProcess, GatewayError> {
        // The launcher restores from the mount on boot, so mount first.
        self.mount.try_mount().await;

        let guard = self.guards.guard(self.runtime.id());
        let _held = guard.lock().await;

        if let Some(existing) = self.find_existing_logged().await {
            tracing::info!(process_id = %existing.id(), "Found existing gateway process");
            // A process can be running but still initializing, so always
            // allow the full startup timeout.
            match existing
                .wait_for_port(self.gateway.port, self.gateway.startup_timeout)
                .await
            {
                Ok(()) => return Ok(existing),
                Err(e) => {
                    tracing::warn!(
                        process_id = %existing.id(),
                        error = %e,
                        "Existing gateway not reachable, restarting"
                    );
                    if let Err(e) = existing.kill().await {
                        tracing::warn!(process_id = %existing.id(), error = %e, "Failed to kill gateway");
                    }
                }
            }
        }

        self.start_new().await
    }

    async fn start_new(&self) -> Result<SharedProcess, GatewayError> {
        let overrides = AiEnvOverride::load(self.store.as_ref()).await;
        let env = build_env_vars(&overrides.apply_to(&self.env));
        tracing::info!(
            command = %self.gateway.launcher,
            env_keys = ?env.keys().collect::<Vec<_>>(),
            "Starting gateway"
        );

        let process = self
            .runtime
            .start_process(
                &self.gateway.launcher,
                StartOptions::tagged(GATEWAY_TAG).with_env(env),
            )
            .await
            .map_err(GatewayError::StartFailed)?;
        tracing::info!(process_id = %process.id(), "Gateway process started");

        match process
            .wait_for_port(self.gateway.port, self.gateway.startup_timeout)
            .await
        {
            Ok(()) => {
                tracing::info!(process_id = %process.id(), port = self.gateway.port, "Gateway ready");
                Ok(process)
            }
            Err(wait_err) => match process.logs().await {
                Ok(logs) => {
                    tracing::error!(
                        process_id = %process.id(),
                        stderr = %logs.stderr,
                        stdout = %logs.stdout,
                        "Gateway failed to start"
                    );
                    Err(GatewayError::StartupFailed {
                        process_id: process.id().to_string(),
                        stderr: logs.stderr,
                        stdout: logs.stdout,
                    })
                }
                Err(log_err) => {
                    tracing::error!(error = %log_err, "Failed to fetch gateway logs");
                    Err(GatewayError::NotReady(wait_err))
                }
            },
        }
    }

    /// Kill the current gateway and boot a new one in the background.
    pub async fn restart(&self) -> RestartOutcome {
        let existing = self.find_existing_logged().await;
        let previous_process_id = existing.as_ref().map(|p| p.id().to_string());

        if let Some(process) = existing {
            tracing::info!(process_id = %process.id(), "Killing gateway for restart");
            if let Err(e) = process.kill().await {
                tracing::warn!(process_id = %process.id(), error = %e, "Failed to kill gateway");
            }
            tokio::time::sleep(self.gateway.restart_grace).await;
        }

        let this = self.clone();
        let boot = tokio::spawn(async move {
            let result = this.ensure().await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "Gateway restart failed");
            }
            result
        });

        RestartOutcome {
            previous_process_id,
            boot,
        }
    }

    /// Check the gateway port briefly.
    pub async fn status(&self) -> Result<GatewayStatus, GatewayError> {
        let Some(process) = self.find_existing().await? else {
            return Ok(GatewayStatus::NotRunning);
        };
        let process_id = process.id().to_string();
        match process
            .wait_for_port(self.gateway.port, self.gateway.status_check_timeout)
            .await
        {
            Ok(()) => Ok(GatewayStatus::Running { process_id }),
            Err(_) => Ok(GatewayStatus::NotResponding { process_id }),
        }
    }

    pub async fn logs(&self) -> Result<GatewayLogs, GatewayError> {
        let process = self.find_existing().await?.ok_or(GatewayError::NotRunning)?;
        let logs = process.logs().await?;
        Ok(GatewayLogs {
            process_id: process.id().to_string(),
            status: process.status().await,
            stdout: logs.stdout,
            stderr: logs.stderr,
        })
    }

    /// Run the gateway CLI with `args` once the gateway is up.
    pub async fn run_cli(&self, args: &[String]) -> Result<CommandOutput, GatewayError> {
        self.ensure().await?;
        self.exec_cli(args, self.cli_timeout).await
    }

    /// Update the gateway CLI in place. The gateway does not need to be up.
    pub async fn update(&self) -> Result<CommandOutput, GatewayError> {
        tracing::info!("Updating gateway CLI");
        self.exec_cli(&["update".to_string()], self.update_timeout).await
    }

    /// Approve every device with a pending pairing request.
    pub async fn approve_all_devices(&self) -> Result<DeviceApproval, GatewayError> {
        self.ensure().await?;
        let url = self.gateway_url();

        let listed = self
            .exec_cli(&cli_args(&["devices", "list", "--json", "--url", &url]), self.cli_timeout)
            .await?;
        let pending = parse_pending_devices(&listed.stdout).ok_or_else(|| {
            GatewayError::DeviceListUnreadable {
                raw: listed.stdout.clone(),
            }
        })?;
        if pending.is_empty() {
            return Ok(DeviceApproval {
                approved: Vec::new(),
                failed: Vec::new(),
                message: "No pending devices to approve".to_string(),
            });
        }

        let mut approved = Vec::new();
        let mut failed = Vec::new();
        for request_id in &pending {
            let args = cli_args(&["devices", "approve", request_id, "--url", &url]);
            match self.exec_cli(&args, self.cli_timeout).await {
                Ok(out) if approval_succeeded(&out) => approved.push(request_id.clone()),
                Ok(_) => failed.push(DeviceFailure {
                    request_id: request_id.clone(),
                    error: None,
                }),
                Err(e) => {
                    tracing::warn!(request_id = %request_id, error = %e, "Device approval failed");
                    failed.push(DeviceFailure {
                        request_id: request_id.clone(),
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let message = format!("Approved {} of {} device(s)", approved.len(), pending.len());
        tracing::info!(approved = approved.len(), pending = pending.len(), "Approved devices");
        Ok(DeviceApproval {
            approved,
            failed,
            message,
        })
    }

    fn gateway_url(&self) -> String {
        format!("ws://localhost:{}", self.gateway.port)
    }

    async fn exec_cli(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, GatewayError> {
        let cmd = cli_command(args);
        tracing::debug!(command = %cmd, "Running gateway CLI");
        Ok(run_command(self.runtime.as_ref(), &cmd, timeout).await?)
    }
}

fn cli_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// The CLI prints "Approved ..." but exit status alone also counts.
fn approval_succeeded(out: &CommandOutput) -> bool {
    out.success() || out.stdout.to_lowercase().contains("approved")
}

/// Request ids under `pending` in the first JSON object of `stdout`.
///
/// Output without a JSON object has nothing pending; `None` means the object
/// did not parse.
fn parse_pending_devices(stdout: &str) -> Option<Vec<String>> {
    let (Some(start), Some(end)) = (stdout.find('{'), stdout.rfind('}')) else {
        return Some(Vec::new());
    };
    if end < start {
        return Some(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_str(&stdout[start..=end]).ok()?;
    let pending = value
        .get("pending")
        .and_then(serde_json::Value::as_array)
        .map(|devices| {
            devices
                .iter()
                .filter_map(|d| d.get("requestId").and_then(serde_json::Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(pending)
}

/// Prefer the `openclaw` binary and fall back to `clawdbot`.
pub fn cli_command(args: &[String]) -> String {
    let args = args
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ");
    format!("if command -v openclaw >/dev/null 2>&1; then openclaw {args}; else clawdbot {args}; fi")
}
