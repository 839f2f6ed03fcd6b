//! CLI command handling.
//!
//! Provides subcommands for:
//! - Gateway lifecycle (`gateway ensure`, `gateway restart`, `gateway status`,
//!   `gateway logs`, `gateway cli`)
//! - Remote storage (`storage status`, `storage sync`, `storage restore`)
//! - Gateway config documents (`config get`, `config set`)
//! - AI provider overrides (`ai show`, `ai set`)
//!
//! Every command prints JSON on stdout.

mod ai;
mod config;
mod gateway;
mod storage;

pub use ai::{AiCommand, run_ai_command};
pub use config::{ConfigCommand, DocumentArg, run_config_command};
pub use gateway::{GatewayCommand, run_gateway_command};
pub use storage::{StorageCommand, run_storage_command};

use clap::{Parser, Subcommand};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "moltkeeper")]
#[command(about = "Supervise a sandboxed claw gateway and back up its state")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage the gateway process
    #[command(subcommand)]
    Gateway(GatewayCommand),

    /// Back up and restore durable state
    #[command(subcommand)]
    Storage(StorageCommand),

    /// Read and write gateway config documents
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Inspect and update AI provider overrides
    #[command(subcommand)]
    Ai(AiCommand),
}

/// Pretty-print `value` as JSON on stdout.
pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
