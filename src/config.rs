//! Runtime configuration.
//!
//! Configuration is resolved once at startup from environment variables
//! (optionally seeded from a `.env` file) and threaded explicitly through the
//! components. Nothing is cached in module state: the randomly generated
//! default bucket name is chosen when the [`Config`] is built and lives there.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::sandbox::{EnvMap, MountRequest};

/// Port the gateway listens on inside the sandbox.
pub const GATEWAY_PORT: u16 = 18789;

/// Maximum time to wait for the gateway to accept connections.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(180);

/// Where the remote store is mounted inside the sandbox.
pub const DEFAULT_MOUNT_PATH: &str = "/data/moltbot";

/// Launcher script that boots the gateway.
pub const DEFAULT_LAUNCHER: &str = "/usr/local/bin/start-moltbot.sh";

const BUCKET_SUFFIXES: [&str; 12] = [
    "shu", "niu", "hu", "tu", "long", "she", "ma", "yang", "hou", "ji", "gou", "zhu",
];

/// Local and mounted filesystem layout.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Classic gateway state root (`/root/.clawdbot`).
    pub state_dir: PathBuf,
    /// Next-generation gateway state root (`/root/.openclaw`).
    pub next_state_dir: PathBuf,
    /// Agent workspace (`/root/clawd`).
    pub workspace_dir: PathBuf,
    /// Mount point of the remote store.
    pub mount_path: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/root/.clawdbot"),
            next_state_dir: PathBuf::from("/root/.openclaw"),
            workspace_dir: PathBuf::from("/root/clawd"),
            mount_path: PathBuf::from(DEFAULT_MOUNT_PATH),
        }
    }
}

impl Paths {
    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join("clawdbot.json")
    }

    pub fn next_config_file(&self) -> PathBuf {
        self.next_state_dir.join("openclaw.json")
    }

    pub fn restore_marker(&self) -> PathBuf {
        self.state_dir.join(".restored-from-r2")
    }

    pub fn local_last_sync(&self) -> PathBuf {
        self.state_dir.join(".last-sync")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.workspace_dir.join("skills")
    }

    pub fn remote_config_dir(&self) -> PathBuf {
        self.mount_path.join("clawdbot")
    }

    pub fn remote_config_file(&self) -> PathBuf {
        self.remote_config_dir().join("clawdbot.json")
    }

    pub fn remote_legacy_config_file(&self) -> PathBuf {
        self.mount_path.join("clawdbot.json")
    }

    pub fn remote_skills_dir(&self) -> PathBuf {
        self.mount_path.join("skills")
    }

    pub fn remote_workspace_dir(&self) -> PathBuf {
        self.mount_path.join("workspace-core")
    }

    pub fn remote_last_sync(&self) -> PathBuf {
        self.mount_path.join(".last-sync")
    }
}

/// Remote storage credentials and bucket selection.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub disabled: bool,
    pub access_key_id: Option<SecretString>,
    pub secret_access_key: Option<SecretString>,
    pub account_id: Option<String>,
    pub bucket: String,
}

impl StorageConfig {
    /// Names of required credentials that are absent.
    pub fn missing(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.access_key_id.is_none() {
            missing.push("R2_ACCESS_KEY_ID".to_string());
        }
        if self.secret_access_key.is_none() {
            missing.push("R2_SECRET_ACCESS_KEY".to_string());
        }
        if self.account_id.is_none() {
            missing.push("CF_ACCOUNT_ID".to_string());
        }
        missing
    }

    pub fn has_credentials(&self) -> bool {
        self.missing().is_empty()
    }

    /// Mount request for `mount_path`, or `None` when credentials are absent.
    pub fn mount_request(&self, mount_path: PathBuf) -> Option<MountRequest> {
        let access_key_id = self.access_key_id.clone()?;
        let secret_access_key = self.secret_access_key.clone()?;
        let account_id = self.account_id.as_ref()?;
        Some(MountRequest {
            bucket: self.bucket.clone(),
            mount_path,
            endpoint: format!("https://{account_id}.r2.cloudflarestorage.com"),
            access_key_id,
            secret_access_key,
        })
    }
}

/// Gateway process settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub startup_timeout: Duration,
    pub launcher: String,
    /// Pause between killing the old gateway and booting a new one.
    pub restart_grace: Duration,
    /// Short wait used by status checks.
    pub status_check_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: GATEWAY_PORT,
            startup_timeout: STARTUP_TIMEOUT,
            launcher: DEFAULT_LAUNCHER.to_string(),
            restart_grace: Duration::from_secs(2),
            status_check_timeout: Duration::from_secs(5),
        }
    }
}

/// Timeouts for helper commands.
#[derive(Debug, Clone)]
pub struct CommandTimeouts {
    /// File checks, reads and small writes.
    pub check: Duration,
    /// Recursive copies.
    pub copy: Duration,
    /// Gateway CLI invocations.
    pub cli: Duration,
    /// Gateway CLI self-update.
    pub update: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            check: Duration::from_secs(5),
            copy: Duration::from_secs(30),
            cli: Duration::from_secs(20),
            update: Duration::from_secs(60),
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ambient environment handed to the gateway launch mapping.
    pub env: EnvMap,
    pub storage: StorageConfig,
    pub paths: Paths,
    pub gateway: GatewayConfig,
    pub timeouts: CommandTimeouts,
    /// Root directory of the local blob store used by the local runtime.
    pub store_root: PathBuf,
}

impl Config {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_vars(std::env::vars())
    }

    /// Build from an explicit set of variables.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let get = |key: &str| vars.get(key).filter(|v| !v.is_empty()).cloned();

        let bucket = get("R2_BUCKET_NAME").unwrap_or_else(|| default_bucket_name(Utc::now()));
        let storage = StorageConfig {
            disabled: get("DISABLE_R2_STORAGE").as_deref() == Some("true"),
            access_key_id: get("R2_ACCESS_KEY_ID").map(SecretString::from),
            secret_access_key: get("R2_SECRET_ACCESS_KEY").map(SecretString::from),
            account_id: get("CF_ACCOUNT_ID"),
            bucket,
        };

        let defaults = Paths::default();
        let paths = Paths {
            state_dir: get("MOLTKEEPER_STATE_DIR").map_or(defaults.state_dir, PathBuf::from),
            next_state_dir: get("MOLTKEEPER_NEXT_STATE_DIR")
                .map_or(defaults.next_state_dir, PathBuf::from),
            workspace_dir: get("MOLTKEEPER_WORKSPACE_DIR")
                .map_or(defaults.workspace_dir, PathBuf::from),
            mount_path: get("R2_MOUNT_PATH").map_or(defaults.mount_path, PathBuf::from),
        };

        let mut gateway = GatewayConfig::default();
        if let Some(launcher) = get("MOLTKEEPER_LAUNCHER") {
            gateway.launcher = launcher;
        }
        if let Some(raw) = get("MOLTKEEPER_STARTUP_TIMEOUT_SECS") {
            let secs = raw.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                key: "MOLTKEEPER_STARTUP_TIMEOUT_SECS".to_string(),
                message: e.to_string(),
            })?;
            gateway.startup_timeout = Duration::from_secs(secs);
        }

        let store_root = get("MOLTKEEPER_STORE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("moltkeeper")
                    .join("store")
            });

        Ok(Self {
            env: vars.into_iter().collect(),
            storage,
            paths,
            gateway,
            timeouts: CommandTimeouts::default(),
            store_root,
        })
    }
}

/// `openclaw-YYYYMMDD-<suffix>` with a random zodiac suffix.
pub fn default_bucket_name(now: DateTime<Utc>) -> String {
    let suffix = BUCKET_SUFFIXES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(BUCKET_SUFFIXES[0]);
    format!("openclaw-{}-{}", now.format("%Y%m%d"), suffix)
}
