//! Restore and backup of the gateway's durable state.
//!
//! The remote store is mounted into the sandbox and state moves between the
//! local directories and the mount with shell copies. Every copy is its own
//! command with its exit code checked, so a failure names the step that broke.
//!
//! Two guards protect the remote backup:
//! - a backup is refused until this sandbox has completed a restore, which
//!   leaves the `.restored-from-r2` marker behind;
//! - a backup is refused when the local config file is missing.

pub mod mount;

use std::path::Path;
use std::sync::{Arc, LazyLock};

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;

use crate::config::{CommandTimeouts, Paths};
use crate::error::{ErrorKind, SyncError};
use crate::exec::{CommandOutput, run_command, shell_quote};
use crate::sandbox::{SandboxError, SandboxRuntime};

pub use mount::RemoteMount;

const RSYNC: &str = "rsync -r --no-times --delete";

/// Workspace entries that are never copied in either direction.
const WORKSPACE_EXCLUDES: &[&str] = &[
    "/.git/",
    "/.git/**",
    "/skills/",
    "/skills/**",
    "/node_modules/",
    "/node_modules/**",
    "/config/ai-env.json",
];

/// Transient files left out of backups.
const TRANSIENT_EXCLUDES: &[&str] = &["*.lock", "*.log", "*.tmp"];

/// Which remote layout holds the config backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupLayout {
    /// `<mount>/clawdbot/clawdbot.json`
    Nested,
    /// `<mount>/clawdbot.json`
    Legacy,
}

/// Look on the mount for a config backup.
pub async fn detect_backup(
    runtime: &dyn SandboxRuntime,
    paths: &Paths,
    timeout: std::time::Duration,
) -> Result<Option<BackupLayout>, SandboxError> {
    let cmd = format!(
        "if [ -f {nested} ]; then echo nested; elif [ -f {legacy} ]; then echo legacy; fi",
        nested = quote_path(&paths.remote_config_file()),
        legacy = quote_path(&paths.remote_legacy_config_file()),
    );
    let out = run_command(runtime, &cmd, timeout).await?;
    Ok(match out.stdout.trim() {
        "nested" => Some(BackupLayout::Nested),
        "legacy" => Some(BackupLayout::Legacy),
        _ => None,
    })
}

/// `true` when `value` starts with a `YYYY-MM-DD` date.
pub fn is_valid_timestamp(value: &str) -> bool {
    static DATE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}").expect("date prefix pattern should compile")
    });
    DATE_PREFIX.is_match(value)
}

pub(crate) fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Directory path with a trailing slash, so rsync copies contents.
fn dir_arg(path: &Path) -> String {
    let mut s = path.to_string_lossy().into_owned();
    if !s.ends_with('/') {
        s.push('/');
    }
    shell_quote(&s)
}

fn excludes(patterns: &[&str]) -> String {
    patterns
        .iter()
        .map(|p| format!("--exclude={}", shell_quote(p)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A labelled command that must exit zero.
struct Step {
    label: &'static str,
    command: String,
}

impl Step {
    fn new(label: &'static str, command: String) -> Self {
        Self { label, command }
    }
}

/// Remote storage state for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageStatus {
    pub configured: bool,
    pub missing: Vec<String>,
    pub last_sync: Option<String>,
    pub restored: bool,
}

/// Result view of a restore or sync for boundary callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl SyncReport {
    pub fn from_result(result: &Result<Option<String>, SyncError>) -> Self {
        match result {
            Ok(last_sync) => Self {
                ok: true,
                last_sync: last_sync.clone(),
                error: None,
                details: None,
                kind: None,
            },
            Err(e) => Self {
                ok: false,
                last_sync: None,
                error: Some(e.headline()),
                details: e.details(),
                kind: Some(e.kind()),
            },
        }
    }
}

/// Moves durable state between the sandbox and the mounted remote store.
pub struct SyncEngine {
    runtime: Arc<dyn SandboxRuntime>,
    mount: Arc<RemoteMount>,
    paths: Paths,
    timeouts: CommandTimeouts,
}

impl SyncEngine {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        mount: Arc<RemoteMount>,
        paths: Paths,
        timeouts: CommandTimeouts,
    ) -> Self {
        Self {
            runtime,
            mount,
            paths,
            timeouts,
        }
    }

    /// Whether this sandbox has completed a restore.
    ///
    /// Any failure to check reads as "not restored".
    pub async fn has_restore_marker(&self) -> bool {
        self.file_exists(&self.paths.restore_marker()).await
    }

    async fn file_exists(&self, path: &Path) -> bool {
        let cmd = format!("test -f {} && echo ok", quote_path(path));
        match run_command(self.runtime.as_ref(), &cmd, self.timeouts.check).await {
            Ok(out) => out.stdout.contains("ok"),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "File check failed");
                false
            }
        }
    }

    /// Remote timestamp, trimmed, if present and non-empty.
    async fn read_remote_timestamp(&self) -> Result<Option<String>, SandboxError> {
        let cmd = format!(
            "cat {} 2>/dev/null || true",
            quote_path(&self.paths.remote_last_sync())
        );
        let out = run_command(self.runtime.as_ref(), &cmd, self.timeouts.check).await?;
        let ts = out.stdout.trim();
        Ok((!ts.is_empty()).then(|| ts.to_string()))
    }

    async fn run_steps(
        &self,
        steps: Vec<Step>,
        fail: fn(String) -> SyncError,
    ) -> Result<(), SyncError> {
        for step in steps {
            tracing::debug!(step = step.label, "Running sync step");
            let out: CommandOutput =
                match run_command(self.runtime.as_ref(), &step.command, self.timeouts.copy).await {
                    Ok(out) => out,
                    Err(SandboxError::Timeout(d)) => {
                        tracing::warn!(step = step.label, "Sync step timed out");
                        return Err(SyncError::Timeout(d));
                    }
                    Err(e) => return Err(fail(format!("{}: {e}", step.label))),
                };
            if !out.success() {
                tracing::warn!(step = step.label, stderr = %out.stderr.trim(), "Sync step failed");
                return Err(fail(format!("{}: {}", step.label, out.diagnostic())));
            }
        }
        Ok(())
    }

    fn restore_steps(&self, layout: BackupLayout) -> Vec<Step> {
        let p = &self.paths;
        let marker_name = p
            .restore_marker()
            .file_name()
            .map(|n| format!("/{}", n.to_string_lossy()))
            .unwrap_or_default();

        let config = match layout {
            BackupLayout::Nested => format!(
                "{RSYNC} {} {} {}",
                excludes(&[marker_name.as_str()]),
                dir_arg(&p.remote_config_dir()),
                dir_arg(&p.state_dir),
            ),
            BackupLayout::Legacy => format!(
                "cp -a {} {}",
                quote_path(&p.remote_legacy_config_file()),
                quote_path(&p.config_file()),
            ),
        };

        vec![
            Step::new(
                "create local directories",
                format!(
                    "mkdir -p {} {} {}",
                    quote_path(&p.state_dir),
                    quote_path(&p.workspace_dir),
                    quote_path(&p.skills_dir()),
                ),
            ),
            Step::new("restore config", config),
            Step::new(
                "restore skills",
                format!(
                    "if [ -d {src} ]; then {RSYNC} {src_dir} {dst}; fi",
                    src = quote_path(&p.remote_skills_dir()),
                    src_dir = dir_arg(&p.remote_skills_dir()),
                    dst = dir_arg(&p.skills_dir()),
                ),
            ),
            Step::new(
                "restore workspace",
                format!(
                    "if [ -d {src} ]; then {RSYNC} {ex} {src_dir} {dst}; fi",
                    src = quote_path(&p.remote_workspace_dir()),
                    ex = excludes(WORKSPACE_EXCLUDES),
                    src_dir = dir_arg(&p.remote_workspace_dir()),
                    dst = dir_arg(&p.workspace_dir),
                ),
            ),
            Step::new(
                "restore timestamp",
                format!(
                    "if [ -f {src} ]; then cp -f {src} {dst}; fi",
                    src = quote_path(&p.remote_last_sync()),
                    dst = quote_path(&p.local_last_sync()),
                ),
            ),
            Step::new(
                "write restore marker",
                format!(
                    "printf '%s\\n' {} > {}",
                    now_timestamp(),
                    quote_path(&p.restore_marker())
                ),
            ),
        ]
    }

    fn sync_steps(&self) -> Vec<Step> {
        let p = &self.paths;
        let marker_name = p
            .restore_marker()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut config_excludes: Vec<&str> = TRANSIENT_EXCLUDES.to_vec();
        config_excludes.push(&marker_name);
        let mut workspace_excludes: Vec<&str> = WORKSPACE_EXCLUDES.to_vec();
        workspace_excludes.extend_from_slice(TRANSIENT_EXCLUDES);

        vec![
            Step::new(
                "push config",
                format!(
                    "mkdir -p {dst_q} && {RSYNC} {ex} {src} {dst}",
                    dst_q = quote_path(&p.remote_config_dir()),
                    ex = excludes(&config_excludes),
                    src = dir_arg(&p.state_dir),
                    dst = dir_arg(&p.remote_config_dir()),
                ),
            ),
            Step::new(
                "push skills",
                format!(
                    "mkdir -p {src_q} {dst_q} && {RSYNC} {src} {dst}",
                    src_q = quote_path(&p.skills_dir()),
                    dst_q = quote_path(&p.remote_skills_dir()),
                    src = dir_arg(&p.skills_dir()),
                    dst = dir_arg(&p.remote_skills_dir()),
                ),
            ),
            Step::new(
                "push workspace",
                format!(
                    "mkdir -p {dst_q} && {RSYNC} {ex} {src} {dst}",
                    dst_q = quote_path(&p.remote_workspace_dir()),
                    ex = excludes(&workspace_excludes),
                    src = dir_arg(&p.workspace_dir),
                    dst = dir_arg(&p.remote_workspace_dir()),
                ),
            ),
            Step::new(
                "stamp remote timestamp",
                format!(
                    "printf '%s\\n' {} > {}",
                    now_timestamp(),
                    quote_path(&p.remote_last_sync())
                ),
            ),
        ]
    }

    /// Pull the remote backup into the sandbox.
    ///
    /// Returns the backup's timestamp when it is present and well formed.
    pub async fn restore(&self) -> Result<Option<String>, SyncError> {
        self.mount.ensure().await?;

        let layout = detect_backup(self.runtime.as_ref(), &self.paths, self.timeouts.check)
            .await
            .map_err(|e| SyncError::RestoreFailed {
                details: format!("detect backup: {e}"),
            })?
            .ok_or(SyncError::NoBackup)?;
        tracing::info!(layout = ?layout, "Restoring from remote store");

        self.run_steps(self.restore_steps(layout), |details| {
            SyncError::RestoreFailed { details }
        })
        .await?;

        let last_sync = match self.read_remote_timestamp().await {
            Ok(ts) => ts.filter(|t| is_valid_timestamp(t)),
            Err(e) => {
                tracing::debug!(error = %e, "Could not read backup timestamp");
                None
            }
        };
        tracing::info!(last_sync = ?last_sync, "Restore complete");
        Ok(last_sync)
    }

    /// Push local state to the remote store.
    ///
    /// Refuses before touching the remote when the sandbox has not been
    /// restored or the local config is missing.
    pub async fn sync(&self) -> Result<String, SyncError> {
        if self.mount.storage().disabled {
            return Err(SyncError::Disabled);
        }
        if !self.has_restore_marker().await {
            tracing::warn!("Refusing backup before restore");
            return Err(SyncError::RestoreRequired);
        }
        if !self.file_exists(&self.paths.config_file()).await {
            tracing::warn!(path = %self.paths.config_file().display(), "Refusing backup without config");
            return Err(SyncError::MissingSource {
                file: "clawdbot.json".to_string(),
            });
        }
        self.mount.ensure().await?;

        self.run_steps(self.sync_steps(), |details| SyncError::SyncFailed { details })
            .await?;

        let stamped = self.read_remote_timestamp().await?;
        match stamped {
            Some(ts) if is_valid_timestamp(&ts) => {
                tracing::info!(last_sync = %ts, "Backup complete");
                Ok(ts)
            }
            other => Err(SyncError::SyncFailed {
                details: format!(
                    "timestamp unreadable after sync: {}",
                    other.as_deref().unwrap_or("no timestamp file created")
                ),
            }),
        }
    }

    /// Storage configuration, remote timestamp and restore state.
    pub async fn status(&self) -> Result<StorageStatus, SyncError> {
        let storage = self.mount.storage();
        if storage.disabled {
            return Err(SyncError::Disabled);
        }
        let missing = storage.missing();
        let configured = missing.is_empty();

        let last_sync = if configured && self.mount.try_mount().await {
            self.read_remote_timestamp().await.unwrap_or_else(|e| {
                tracing::debug!(error = %e, "Could not read remote timestamp");
                None
            })
        } else {
            None
        };

        Ok(StorageStatus {
            configured,
            missing,
            last_sync,
            restored: self.has_restore_marker().await,
        })
    }
}
