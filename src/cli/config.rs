//! Gateway config document CLI commands.

use std::path::PathBuf;

use clap::{Subcommand, ValueEnum};
use tokio::io::AsyncReadExt;

use crate::cli::print_json;
use crate::config_fallback::{ConfigDocument, ConfigRead};
use crate::services::Services;

/// Which config document to operate on.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentArg {
    /// `clawdbot.json`
    Classic,
    /// `openclaw.json`
    Next,
}

impl From<DocumentArg> for ConfigDocument {
    fn from(arg: DocumentArg) -> Self {
        match arg {
            DocumentArg::Classic => ConfigDocument::Classic,
            DocumentArg::Next => ConfigDocument::NextGen,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Print a config document, pulling a newer remote backup first
    Get {
        #[arg(value_enum)]
        document: DocumentArg,
    },

    /// Replace a config document
    Set {
        #[arg(value_enum)]
        document: DocumentArg,

        /// Read the new content from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Run a config command.
pub async fn run_config_command(cmd: ConfigCommand, services: &Services) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Get { document } => {
            let result = services.config_files.read(document.into()).await;
            print_json(&ConfigRead::from(&result))?;
            result?;
            Ok(())
        }
        ConfigCommand::Set { document, file } => {
            let content = match file {
                Some(path) => tokio::fs::read_to_string(&path).await?,
                None => {
                    let mut buf = String::new();
                    tokio::io::stdin().read_to_string(&mut buf).await?;
                    buf
                }
            };
            serde_json::from_str::<serde_json::Value>(&content)
                .map_err(|e| anyhow::anyhow!("config is not valid JSON: {e}"))?;
            services
                .config_files
                .write(document.into(), &content)
                .await?;
            print_json(&serde_json::json!({ "ok": true }))
        }
    }
}
