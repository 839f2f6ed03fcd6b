//! Operator overrides for AI provider settings.
//!
//! A single JSON document in the remote store can set, clear, or defer each
//! provider base URL and API key, plus the primary provider selector. The
//! override is applied over the ambient environment before the launch
//! environment is built.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;
use crate::sandbox::EnvMap;
use crate::store::RemoteStore;

/// Store key of the override document.
pub const AI_ENV_CONFIG_KEY: &str = "workspace-core/config/ai-env.json";

pub const BASE_URL_KEYS: [&str; 6] = [
    "AI_GATEWAY_BASE_URL",
    "ANTHROPIC_BASE_URL",
    "OPENAI_BASE_URL",
    "DEEPSEEK_BASE_URL",
    "KIMI_BASE_URL",
    "CHATGLM_BASE_URL",
];

pub const API_KEY_KEYS: [&str; 6] = [
    "AI_GATEWAY_API_KEY",
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "DEEPSEEK_API_KEY",
    "KIMI_API_KEY",
    "CHATGLM_API_KEY",
];

const DEFAULT_PRIMARY_PROVIDER: &str = "anthropic";

/// Base URL filled in when a provider is selected without one.
fn default_base_url(provider: &str) -> Option<(&'static str, &'static str)> {
    match provider {
        "chatglm" => Some(("CHATGLM_BASE_URL", "https://open.bigmodel.cn/api/anthropic")),
        "deepseek" => Some(("DEEPSEEK_BASE_URL", "https://api.deepseek.com/v1")),
        "kimi" => Some(("KIMI_BASE_URL", "https://api.moonshot.cn/v1")),
        "openai" => Some(("OPENAI_BASE_URL", "https://api.openai.com/v1")),
        _ => None,
    }
}

/// Per-key override: absent (`None`), cleared (`Some(None)`), or set.
pub type Overrides = BTreeMap<String, Option<String>>;

/// The persisted override document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiEnvOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_urls: Option<Overrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_keys: Option<Overrides>,
    /// `None` defers to the environment, `Some(None)` clears it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_provider: Option<Option<String>>,
}

impl AiEnvOverride {
    /// The document used when nothing usable is stored.
    pub fn fallback() -> Self {
        Self {
            primary_provider: Some(Some(DEFAULT_PRIMARY_PROVIDER.to_string())),
            ..Default::default()
        }
    }

    /// Parse a stored document. Non-object documents yield the fallback.
    ///
    /// Unknown keys and values that are neither strings nor null are ignored.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::fallback();
        };
        let primary_provider = match obj.get("primaryProvider") {
            None => Some(Some(DEFAULT_PRIMARY_PROVIDER.to_string())),
            Some(Value::Null) => Some(None),
            Some(Value::String(s)) => Some(Some(s.clone())),
            Some(_) => None,
        };
        Self {
            base_urls: obj.get("baseUrls").and_then(|v| parse_overrides(v, &BASE_URL_KEYS)),
            api_keys: obj.get("apiKeys").and_then(|v| parse_overrides(v, &API_KEY_KEYS)),
            primary_provider,
        }
    }

    /// Read the document from the store.
    ///
    /// `Ok(None)` when nothing usable is stored: the key is absent or the
    /// body is not JSON. Store failures are returned.
    pub async fn try_load(store: &dyn RemoteStore) -> Result<Option<Self>, StoreError> {
        let Some(object) = store.get(AI_ENV_CONFIG_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<Value>(&object.body) {
            Ok(value) => Ok(Some(Self::from_value(&value))),
            Err(e) => {
                tracing::warn!(error = %e, "AI env override is not valid JSON");
                Ok(None)
            }
        }
    }

    /// Read the document from the store. Every failure yields the fallback.
    pub async fn load(store: &dyn RemoteStore) -> Self {
        match Self::try_load(store).await {
            Ok(loaded) => loaded.unwrap_or_else(Self::fallback),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read AI env override");
                Self::fallback()
            }
        }
    }

    /// Apply the override over `env`.
    pub fn apply_to(&self, env: &EnvMap) -> EnvMap {
        let mut next = env.clone();
        for overrides in [&self.base_urls, &self.api_keys].into_iter().flatten() {
            for (key, value) in overrides {
                apply_one(&mut next, key, value.as_deref());
            }
        }
        if let Some(provider) = &self.primary_provider {
            apply_one(&mut next, "AI_PRIMARY_PROVIDER", provider.as_deref());
        }
        next
    }

    /// Merge an admin patch into this document.
    pub fn apply_patch(&mut self, patch: &Value) {
        if let Some(patch) = patch.as_object() {
            if let Some(urls) = patch.get("baseUrls").and_then(Value::as_object) {
                let target = self.base_urls.get_or_insert_with(Overrides::new);
                patch_overrides(target, urls, &BASE_URL_KEYS);
            }
            if let Some(keys) = patch.get("apiKeys").and_then(Value::as_object) {
                let target = self.api_keys.get_or_insert_with(Overrides::new);
                patch_overrides(target, keys, &API_KEY_KEYS);
            }
            if let Some(raw) = patch.get("primaryProvider")
                && let Some(value) = patch_value(raw)
            {
                self.primary_provider = Some(value);
            }
        }

        let provider = self
            .primary_provider
            .as_ref()
            .and_then(Option::as_deref)
            .map(str::to_ascii_lowercase);
        if let Some((key, url)) = provider.as_deref().and_then(default_base_url) {
            let urls = self.base_urls.get_or_insert_with(Overrides::new);
            let blank = urls
                .get(key)
                .and_then(Option::as_deref)
                .is_none_or(|v| v.trim().is_empty());
            if blank {
                urls.insert(key.to_string(), Some(url.to_string()));
            }
        }
    }

    /// Persist the whole document.
    pub async fn write(&self, store: &dyn RemoteStore) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(self)?;
        store
            .put(AI_ENV_CONFIG_KEY, Bytes::from(body), "application/json")
            .await
    }

    /// Read-modify-write with `patch`, returning the stored document.
    ///
    /// A failed read aborts the update, so keys absent from `patch` are never
    /// overwritten with defaults.
    pub async fn update(store: &dyn RemoteStore, patch: &Value) -> Result<Self, StoreError> {
        let mut config = Self::try_load(store).await?.unwrap_or_else(Self::fallback);
        config.apply_patch(patch);
        config.write(store).await?;
        tracing::info!("Updated AI env override");
        Ok(config)
    }

    /// Effective settings for display. Secrets are reduced to their source.
    pub fn summary(&self, env: &EnvMap) -> AiEnvSummary {
        let env_value = |key: &str| {
            env.get(key)
                .filter(|v| !v.trim().is_empty())
                .cloned()
        };

        let base_urls = BASE_URL_KEYS
            .iter()
            .map(|key| {
                let value = match self.base_urls.as_ref().and_then(|m| m.get(*key)) {
                    Some(None) => None,
                    Some(Some(v)) if !v.trim().is_empty() => Some(v.trim().to_string()),
                    _ => env_value(key),
                };
                (key.to_string(), value)
            })
            .collect();

        let api_keys = API_KEY_KEYS
            .iter()
            .map(|key| {
                let status = match self.api_keys.as_ref().and_then(|m| m.get(*key)) {
                    Some(None) => ApiKeyStatus::new(false, Some(KeySource::Cleared)),
                    Some(Some(v)) if !v.trim().is_empty() => {
                        ApiKeyStatus::new(true, Some(KeySource::Saved))
                    }
                    _ if env_value(key).is_some() => ApiKeyStatus::new(true, Some(KeySource::Env)),
                    _ => ApiKeyStatus::new(false, None),
                };
                (key.to_string(), status)
            })
            .collect();

        AiEnvSummary {
            base_urls,
            api_keys,
            primary_provider: self.primary_provider.clone().flatten(),
        }
    }
}

fn apply_one(env: &mut EnvMap, key: &str, value: Option<&str>) {
    match value {
        None => {
            env.remove(key);
        }
        Some(v) if !v.trim().is_empty() => {
            env.insert(key.to_string(), v.trim().to_string());
        }
        Some(_) => {}
    }
}

fn parse_overrides(value: &Value, known: &[&str]) -> Option<Overrides> {
    let obj = value.as_object()?;
    let parsed = known
        .iter()
        .filter_map(|key| match obj.get(*key)? {
            Value::Null => Some((key.to_string(), None)),
            Value::String(s) => Some((key.to_string(), Some(s.clone()))),
            _ => None,
        })
        .collect();
    Some(parsed)
}

/// `null` or blank clears, a string sets, anything else leaves the key alone.
fn patch_value(raw: &Value) -> Option<Option<String>> {
    match raw {
        Value::Null => Some(None),
        Value::String(s) if s.trim().is_empty() => Some(None),
        Value::String(s) => Some(Some(s.trim().to_string())),
        _ => None,
    }
}

fn patch_overrides(target: &mut Overrides, patch: &serde_json::Map<String, Value>, known: &[&str]) {
    for key in known {
        if let Some(value) = patch.get(*key).and_then(patch_value) {
            target.insert(key.to_string(), value);
        }
    }
}

/// Where an API key's effective value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    Saved,
    Env,
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyStatus {
    pub is_set: bool,
    pub source: Option<KeySource>,
}

impl ApiKeyStatus {
    fn new(is_set: bool, source: Option<KeySource>) -> Self {
        Self { is_set, source }
    }
}

/// Display view of the effective AI settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiEnvSummary {
    pub base_urls: BTreeMap<String, Option<String>>,
    pub api_keys: BTreeMap<String, ApiKeyStatus>,
    pub primary_provider: Option<String>,
}

impl AiEnvSummary {
    /// Names of the base URLs and API keys that currently have a value.
    pub fn configured_keys(&self) -> AiEnvKeys {
        AiEnvKeys {
            base_urls: self
                .base_urls
                .iter()
                .filter(|(_, value)| value.as_deref().is_some_and(|v| !v.trim().is_empty()))
                .map(|(key, _)| key.clone())
                .collect(),
            api_keys: self
                .api_keys
                .iter()
                .filter(|(_, status)| status.is_set)
                .map(|(key, _)| key.clone())
                .collect(),
        }
    }
}

/// Key names only, with no values or sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiEnvKeys {
    pub base_urls: Vec<String>,
    pub api_keys: Vec<String>,
}
