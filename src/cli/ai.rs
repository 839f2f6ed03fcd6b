//! AI provider override CLI commands.

use clap::Subcommand;

use crate::ai_env::AiEnvOverride;
use crate::cli::print_json;
use crate::services::Services;

#[derive(Subcommand, Debug, Clone)]
pub enum AiCommand {
    /// Show effective base URLs, key sources and the primary provider
    Show,

    /// List the names of base URLs and API keys that have a value
    Keys,

    /// Merge a JSON patch into the stored override
    Set {
        /// e.g. `{"primaryProvider":"deepseek","apiKeys":{"DEEPSEEK_API_KEY":"sk-..."}}`
        patch: String,
    },
}

/// Run an AI override command.
pub async fn run_ai_command(cmd: AiCommand, services: &Services) -> anyhow::Result<()> {
    match cmd {
        AiCommand::Show => print_json(&services.ai_summary().await),
        AiCommand::Keys => print_json(&services.ai_summary().await.configured_keys()),
        AiCommand::Set { patch } => {
            let patch: serde_json::Value = serde_json::from_str(&patch)
                .map_err(|e| anyhow::anyhow!("patch is not valid JSON: {e}"))?;
            if !patch.is_object() {
                anyhow::bail!("patch must be a JSON object");
            }
            let stored = AiEnvOverride::update(services.store.as_ref(), &patch).await?;
            print_json(&stored.summary(&services.config.env))
        }
    }
}
