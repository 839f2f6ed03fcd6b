use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use moltkeeper::cli::{
    Cli, Command, run_ai_command, run_config_command, run_gateway_command, run_storage_command,
};
use moltkeeper::{Config, Services};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let services = Services::local(config);

    match cli.command {
        Command::Gateway(cmd) => run_gateway_command(cmd, &services).await,
        Command::Storage(cmd) => run_storage_command(cmd, &services).await,
        Command::Config(cmd) => run_config_command(cmd, &services).await,
        Command::Ai(cmd) => run_ai_command(cmd, &services).await,
    }
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("moltkeeper=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
