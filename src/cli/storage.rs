//! Remote storage CLI commands.

use clap::Subcommand;

use crate::cli::print_json;
use crate::services::Services;
use crate::sync::SyncReport;

#[derive(Subcommand, Debug, Clone)]
pub enum StorageCommand {
    /// Show storage configuration, last backup and restore state
    Status,

    /// Push local state to the remote store
    Sync,

    /// Pull state from the remote store into the sandbox
    Restore,
}

/// Run a storage command.
pub async fn run_storage_command(cmd: StorageCommand, services: &Services) -> anyhow::Result<()> {
    let report = match cmd {
        StorageCommand::Status => return print_json(&services.sync.status().await?),
        StorageCommand::Sync => SyncReport::from_result(&services.sync.sync().await.map(Some)),
        StorageCommand::Restore => SyncReport::from_result(&services.sync.restore().await),
    };
    print_json(&report)?;
    if let Some(error) = report.error {
        anyhow::bail!(error);
    }
    Ok(())
}
