//! Launch environment for the gateway process.
//!
//! [`build_env_vars`] is a pure mapping from the ambient environment (after the
//! AI override has been applied) to the variables the gateway container reads.
//! Provider credentials are routed onto either the OpenAI-shaped or the
//! Anthropic-shaped variable pair, and a fixed set of channel and backup
//! variables is passed through.

use crate::sandbox::EnvMap;

/// Variables copied to the launch environment, renamed where the container
/// expects a different name.
const PASS_THROUGH: &[(&str, &str)] = &[
    ("MOLTBOT_GATEWAY_TOKEN", "CLAWDBOT_GATEWAY_TOKEN"),
    ("DEV_MODE", "CLAWDBOT_DEV_MODE"),
    ("CLAWDBOT_BIND_MODE", "CLAWDBOT_BIND_MODE"),
    ("TELEGRAM_BOT_TOKEN", "TELEGRAM_BOT_TOKEN"),
    ("TELEGRAM_DM_POLICY", "TELEGRAM_DM_POLICY"),
    ("DISCORD_BOT_TOKEN", "DISCORD_BOT_TOKEN"),
    ("DISCORD_DM_POLICY", "DISCORD_DM_POLICY"),
    ("SLACK_BOT_TOKEN", "SLACK_BOT_TOKEN"),
    ("SLACK_APP_TOKEN", "SLACK_APP_TOKEN"),
    ("CDP_SECRET", "CDP_SECRET"),
    ("WORKER_URL", "WORKER_URL"),
    ("DISABLE_R2_STORAGE", "DISABLE_R2_STORAGE"),
    ("BACKUP_R2_ACCESS_KEY_ID", "BACKUP_R2_ACCESS_KEY_ID"),
    ("BACKUP_R2_SECRET_ACCESS_KEY", "BACKUP_R2_SECRET_ACCESS_KEY"),
    ("BACKUP_R2_ACCOUNT_ID", "BACKUP_R2_ACCOUNT_ID"),
    ("BACKUP_R2_BUCKET_NAME", "BACKUP_R2_BUCKET_NAME"),
    ("CODER_GITHUB_TOKEN", "CODER_GITHUB_TOKEN"),
    ("CODER_NPM_TOKEN", "CODER_NPM_TOKEN"),
];

/// Upstream AI API family whose credentials take precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryProvider {
    Auto,
    OpenAi,
    DeepSeek,
    Kimi,
    ChatGlm,
    /// Anthropic, and any unrecognized selector.
    Anthropic,
}

impl PrimaryProvider {
    /// Parse `AI_PRIMARY_PROVIDER`. Unset or empty means auto.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.filter(|s| !s.is_empty()) else {
            return PrimaryProvider::Auto;
        };
        match raw.to_ascii_lowercase().as_str() {
            "auto" => PrimaryProvider::Auto,
            "openai" => PrimaryProvider::OpenAi,
            "deepseek" => PrimaryProvider::DeepSeek,
            "kimi" => PrimaryProvider::Kimi,
            "chatglm" => PrimaryProvider::ChatGlm,
            _ => PrimaryProvider::Anthropic,
        }
    }
}

/// Which compatible variable pair a provider mirrors onto.
#[derive(Debug, Clone, Copy)]
enum Shape {
    OpenAi,
    Anthropic,
}

impl Shape {
    fn base_url_key(self) -> &'static str {
        match self {
            Shape::OpenAi => "OPENAI_BASE_URL",
            Shape::Anthropic => "ANTHROPIC_BASE_URL",
        }
    }

    fn api_key_key(self) -> &'static str {
        match self {
            Shape::OpenAi => "OPENAI_API_KEY",
            Shape::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

/// Strip trailing slashes.
pub fn normalize_base_url(url: &str) -> &str {
    url.trim_end_matches('/')
}

struct Inputs<'a> {
    env: &'a EnvMap,
}

impl<'a> Inputs<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.env
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn url(&self, key: &str) -> Option<&'a str> {
        self.get(key)
            .map(normalize_base_url)
            .filter(|v| !v.is_empty())
    }
}

/// Set a native provider pair and mirror it onto the compatible pair.
fn mirror_provider(
    out: &mut EnvMap,
    inputs: &Inputs<'_>,
    prefix: &str,
    shape: Shape,
    base_url: Option<&str>,
) {
    if let Some(url) = base_url {
        out.insert(format!("{prefix}_BASE_URL"), url.to_string());
        out.insert(shape.base_url_key().to_string(), url.to_string());
    }
    if let Some(key) = inputs.get(&format!("{prefix}_API_KEY")) {
        out.insert(format!("{prefix}_API_KEY"), key.to_string());
        out.insert(shape.api_key_key().to_string(), key.to_string());
    }
}

/// Route the generic gateway URL and key onto `shape`.
fn route_gateway(out: &mut EnvMap, inputs: &Inputs<'_>, url: &str, shape: Shape) {
    out.insert("AI_GATEWAY_BASE_URL".to_string(), url.to_string());
    if let Some(key) = inputs.get("AI_GATEWAY_API_KEY") {
        out.insert(shape.api_key_key().to_string(), key.to_string());
    }
    out.insert(shape.base_url_key().to_string(), url.to_string());
}

/// Copy a direct provider pair onto its own variables.
fn direct(out: &mut EnvMap, inputs: &Inputs<'_>, shape: Shape, base_url: Option<&str>) {
    if let Some(url) = base_url {
        out.insert(shape.base_url_key().to_string(), url.to_string());
    }
    if let Some(key) = inputs.get(shape.api_key_key()) {
        out.insert(shape.api_key_key().to_string(), key.to_string());
    }
}

/// Build the environment handed to the gateway launcher.
pub fn build_env_vars(env: &EnvMap) -> EnvMap {
    let inputs = Inputs { env };
    let mut out = EnvMap::new();

    let primary = PrimaryProvider::parse(inputs.get("AI_PRIMARY_PROVIDER"));
    let gateway_url = inputs.url("AI_GATEWAY_BASE_URL");
    let openai_gateway = gateway_url.is_some_and(|u| u.ends_with("/openai"));
    let openai_url = inputs.url("OPENAI_BASE_URL");
    let anthropic_url = inputs.url("ANTHROPIC_BASE_URL");
    let deepseek_url = inputs.url("DEEPSEEK_BASE_URL");
    let kimi_url = inputs.url("KIMI_BASE_URL");
    let chatglm_url = inputs.url("CHATGLM_BASE_URL");

    match primary {
        PrimaryProvider::DeepSeek => {
            mirror_provider(&mut out, &inputs, "DEEPSEEK", Shape::OpenAi, deepseek_url)
        }
        PrimaryProvider::Kimi => {
            mirror_provider(&mut out, &inputs, "KIMI", Shape::OpenAi, kimi_url)
        }
        PrimaryProvider::ChatGlm => {
            mirror_provider(&mut out, &inputs, "CHATGLM", Shape::Anthropic, chatglm_url)
        }
        PrimaryProvider::OpenAi => match gateway_url {
            Some(url) if openai_gateway => route_gateway(&mut out, &inputs, url, Shape::OpenAi),
            _ => direct(&mut out, &inputs, Shape::OpenAi, openai_url),
        },
        PrimaryProvider::Anthropic => match gateway_url {
            Some(url) if !openai_gateway => {
                route_gateway(&mut out, &inputs, url, Shape::Anthropic)
            }
            _ => direct(&mut out, &inputs, Shape::Anthropic, anthropic_url),
        },
        PrimaryProvider::Auto => {
            if let Some(url) = gateway_url {
                let shape = if openai_gateway {
                    Shape::OpenAi
                } else {
                    Shape::Anthropic
                };
                route_gateway(&mut out, &inputs, url, shape);
            } else if openai_url.is_some() {
                direct(&mut out, &inputs, Shape::OpenAi, openai_url);
            } else if anthropic_url.is_some() {
                direct(&mut out, &inputs, Shape::Anthropic, anthropic_url);
            } else if chatglm_url.is_some() {
                mirror_provider(&mut out, &inputs, "CHATGLM", Shape::Anthropic, chatglm_url);
            } else if deepseek_url.is_some() {
                mirror_provider(&mut out, &inputs, "DEEPSEEK", Shape::OpenAi, deepseek_url);
            } else if kimi_url.is_some() {
                mirror_provider(&mut out, &inputs, "KIMI", Shape::OpenAi, kimi_url);
            } else {
                // Bare keys, no URL anywhere. The gateway key lands on the
                // Anthropic pair and direct keys win over it.
                if let Some(key) = inputs.get("AI_GATEWAY_API_KEY") {
                    out.insert("ANTHROPIC_API_KEY".to_string(), key.to_string());
                }
                for key in ["ANTHROPIC_API_KEY", "OPENAI_API_KEY"] {
                    if let Some(value) = inputs.get(key) {
                        out.insert(key.to_string(), value.to_string());
                    }
                }
            }
        }
    }

    for (from, to) in PASS_THROUGH {
        if let Some(value) = inputs.get(from) {
            out.insert((*to).to_string(), value.to_string());
        }
    }

    out
}
