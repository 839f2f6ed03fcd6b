//! Gateway management CLI commands.
//!
//! Ensure, restart and inspect the gateway process, and drive its CLI.

use clap::Subcommand;
use serde_json::json;

use crate::cli::print_json;
use crate::sandbox::ProcessHandle;
use crate::services::Services;

#[derive(Subcommand, Debug, Clone)]
pub enum GatewayCommand {
    /// Start the gateway if needed and wait until it is ready
    Ensure {
        /// Return once ready instead of holding the gateway until Ctrl-C
        #[arg(long)]
        detach: bool,
    },

    /// Kill the gateway and start a fresh one
    Restart,

    /// Check the gateway port
    Status,

    /// Show captured gateway output
    Logs,

    /// Approve every pending device pairing request
    ApproveDevices,

    /// Update the gateway CLI
    Update,

    /// Run the gateway CLI inside the sandbox
    Cli {
        /// Arguments passed to `openclaw` (or `clawdbot`)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
}

/// Run a gateway command.
pub async fn run_gateway_command(cmd: GatewayCommand, services: &Services) -> anyhow::Result<()> {
    let supervisor = &services.supervisor;
    match cmd {
        GatewayCommand::Ensure { detach } => {
            let process = supervisor.ensure().await?;
            print_json(&json!({
                "ok": true,
                "process_id": process.id(),
                "port": services.config.gateway.port,
            }))?;
            if !detach {
                hold_until_interrupt(process.as_ref()).await?;
            }
            Ok(())
        }
        GatewayCommand::Restart => {
            let outcome = supervisor.restart().await;
            let process = outcome.boot.await??;
            print_json(&json!({
                "ok": true,
                "previous_process_id": outcome.previous_process_id,
                "process_id": process.id(),
            }))
        }
        GatewayCommand::Status => print_json(&supervisor.status().await?),
        GatewayCommand::Logs => print_json(&supervisor.logs().await?),
        GatewayCommand::ApproveDevices => print_json(&supervisor.approve_all_devices().await?),
        GatewayCommand::Update => {
            let output = supervisor.update().await?;
            print_json(&output)?;
            if !output.success() {
                anyhow::bail!("gateway CLI update failed: {}", output.diagnostic());
            }
            Ok(())
        }
        GatewayCommand::Cli { args } => {
            let output = supervisor.run_cli(&args).await?;
            print_json(&output)?;
            if !output.success() {
                anyhow::bail!("gateway CLI failed: {}", output.diagnostic());
            }
            Ok(())
        }
    }
}

async fn hold_until_interrupt(process: &dyn ProcessHandle) -> anyhow::Result<()> {
    tracing::info!(process_id = %process.id(), "Gateway running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!(process_id = %process.id(), "Stopping gateway");
    process.kill().await?;
    Ok(())
}
