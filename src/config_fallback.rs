//! Reading and writing the gateway's config documents.
//!
//! Reads fall back to the remote backup when the local copy is missing, blank,
//! or older than the backup's timestamp. The remote copy is pulled over the
//! local file and then re-read, so the local file stays the source of truth
//! for the gateway.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::config::{CommandTimeouts, Paths};
use crate::error::{ConfigFileError, ErrorKind};
use crate::exec::{heredoc_write, run_command};
use crate::sandbox::SandboxRuntime;
use crate::sync::{BackupLayout, RemoteMount, detect_backup, quote_path};

/// One of the two gateway config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigDocument {
    /// `clawdbot.json` under the classic state directory.
    Classic,
    /// `openclaw.json` under the next-generation state directory.
    NextGen,
}

impl ConfigDocument {
    pub fn path(self, paths: &Paths) -> PathBuf {
        match self {
            ConfigDocument::Classic => paths.config_file(),
            ConfigDocument::NextGen => paths.next_config_file(),
        }
    }
}

/// Parse a timestamp file: RFC 3339, or a bare `YYYY-MM-DD` date.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Whether the remote copy should replace the local one.
///
/// `local` is `None` when the local read failed. A remote timestamp that does
/// not parse never wins on age; a local one that does not parse always loses.
pub fn should_pull(local: Option<&str>, remote_ts: &str, local_ts: &str) -> bool {
    let Some(content) = local else {
        return true;
    };
    if content.trim().is_empty() {
        return true;
    }
    match (parse_timestamp(remote_ts), parse_timestamp(local_ts)) {
        (Some(remote), Some(local)) => remote > local,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Result view of a config read for boundary callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigRead {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl From<&Result<String, ConfigFileError>> for ConfigRead {
    fn from(result: &Result<String, ConfigFileError>) -> Self {
        match result {
            Ok(content) => Self {
                ok: true,
                content: Some(content.clone()),
                error: None,
                kind: None,
            },
            Err(e) => Self {
                ok: false,
                content: None,
                error: Some(e.to_string()),
                kind: Some(e.kind()),
            },
        }
    }
}

pub struct ConfigFallbackResolver {
    runtime: Arc<dyn SandboxRuntime>,
    mount: Arc<RemoteMount>,
    paths: Paths,
    timeouts: CommandTimeouts,
}

impl ConfigFallbackResolver {
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

    /// Read `doc`, pulling the remote backup first when it is newer.
    pub async fn read(&self, doc: ConfigDocument) -> Result<String, ConfigFileError> {
        self.read_with_fallback(&doc.path(&self.paths)).await
    }

    /// Replace `doc` with `content`.
    pub async fn write(&self, doc: ConfigDocument, content: &str) -> Result<(), ConfigFileError> {
        let path = doc.path(&self.paths);
        let dir = path.parent().unwrap_or(Path::new("/"));
        let body = content.strip_suffix('\n').unwrap_or(content);
        let cmd = format!(
            "set -e; mkdir -p {}; {}",
            quote_path(dir),
            heredoc_write(&path.to_string_lossy(), body)
        );
        let out = run_command(self.runtime.as_ref(), &cmd, self.timeouts.check).await?;
        if !out.success() {
            return Err(ConfigFileError::WriteFailed {
                path: path.display().to_string(),
                reason: non_empty_or(&out.stderr, "Failed to write config file"),
            });
        }
        tracing::info!(path = %path.display(), bytes = content.len(), "Wrote config file");
        Ok(())
    }

    /// Read a local file.
    pub async fn read_local(&self, path: &Path) -> Result<String, ConfigFileError> {
        let cmd = format!("cat {}", quote_path(path));
        let out = run_command(self.runtime.as_ref(), &cmd, self.timeouts.check).await?;
        if !out.success() {
            return Err(ConfigFileError::ReadFailed {
                path: path.display().to_string(),
                reason: non_empty_or(&out.stderr, "Failed to read config file"),
            });
        }
        Ok(out.stdout)
    }

    /// Read `local_path`, preferring the remote backup when it is newer or the
    /// local copy is unusable.
    ///
    /// Any failure on the remote side falls back to the local result.
    pub async fn read_with_fallback(&self, local_path: &Path) -> Result<String, ConfigFileError> {
        let local = self.read_local(local_path).await;

        if !self.mount.is_configured() || !self.mount.try_mount().await {
            return local;
        }

        let layout = match detect_backup(self.runtime.as_ref(), &self.paths, self.timeouts.check).await
        {
            Ok(Some(layout)) => layout,
            Ok(None) => return local,
            Err(e) => {
                tracing::debug!(error = %e, "Backup lookup failed");
                return local;
            }
        };
        let remote_file = match layout {
            BackupLayout::Nested => self.paths.remote_config_file(),
            BackupLayout::Legacy => self.paths.remote_legacy_config_file(),
        };

        let dir = local_path.parent().unwrap_or(Path::new("/"));
        let local_sync = dir.join(".last-sync");
        let remote_ts = self.read_quiet(&self.paths.remote_last_sync()).await;
        let local_ts = self.read_quiet(&local_sync).await;

        let local_content = local.as_ref().ok().map(String::as_str);
        if !should_pull(local_content, &remote_ts, &local_ts) {
            return local;
        }

        tracing::info!(
            path = %local_path.display(),
            remote_ts = %remote_ts.trim(),
            local_ts = %local_ts.trim(),
            "Pulling config from remote backup"
        );
        let remote_sync = self.paths.remote_last_sync();
        let cmd = format!(
            "set -e; mkdir -p {dir}; cp -a {remote} {local}; \
             if [ -f {rts} ]; then cp -f {rts} {lts}; fi",
            dir = quote_path(dir),
            remote = quote_path(&remote_file),
            local = quote_path(local_path),
            rts = quote_path(&remote_sync),
            lts = quote_path(&local_sync),
        );
        match run_command(self.runtime.as_ref(), &cmd, self.timeouts.check).await {
            Ok(out) if out.success() => self.read_local(local_path).await,
            Ok(out) => {
                tracing::warn!(error = %out.diagnostic(), "Config pull failed");
                local
            }
            Err(e) => {
                tracing::warn!(error = %e, "Config pull failed");
                local
            }
        }
    }

    /// File contents, or empty on any failure.
    async fn read_quiet(&self, path: &Path) -> String {
        let cmd = format!("cat {} 2>/dev/null || true", quote_path(path));
        run_command(self.runtime.as_ref(), &cmd, self.timeouts.check)
            .await
            .map(|out| out.stdout)
            .unwrap_or_default()
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sandbox::mock::{MockRuntime, Scripted};
    use pretty_assertions::assert_eq;

    const REMOTE_TS: &str = "2024-01-02T00:00:00Z";
    const LOCAL_TS: &str = "2024-01-01T00:00:00Z";

    fn resolver(runtime: Arc<MockRuntime>, configured: bool) -> ConfigFallbackResolver {
        let vars: Vec<(String, String)> = if configured {
            vec![
                ("R2_ACCESS_KEY_ID".to_string(), "k".to_string()),
                ("R2_SECRET_ACCESS_KEY".to_string(), "s".to_string()),
                ("CF_ACCOUNT_ID".to_string(), "a".to_string()),
            ]
        } else {
            Vec::new()
        };
        let config = Config::from_vars(vars).unwrap();
        let mount = Arc::new(RemoteMount::new(
            runtime.clone(),
            config.storage.clone(),
            config.paths.mount_path.clone(),
        ));
        ConfigFallbackResolver::new(runtime, mount, config.paths, config.timeouts)
    }

    /// Sandbox with a nested backup and the given timestamps.
    fn sandbox(local: Option<&'static str>, remote_ts: &'static str, local_ts: &'static str) -> MockRuntime {
        MockRuntime::new("/l", move |cmd| {
            if cmd == "cat /root/.clawdbot/clawdbot.json" {
                match local {
                    Some(content) => Scripted::ok(content),
                    None => Scripted::fail(1, "cat: /root/.clawdbot/clawdbot.json: No such file"),
                }
            } else if cmd.starts_with("cat /data/moltbot/.last-sync") {
                Scripted::ok(remote_ts)
            } else if cmd.starts_with("cat /root/.clawdbot/.last-sync") {
                Scripted::ok(local_ts)
            } else if cmd.contains("echo nested") {
                Scripted::ok("nested\n")
            } else {
                Scripted::ok("")
            }
        })
    }

    #[test]
    fn test_should_pull_rules() {
        assert!(should_pull(Some("{}"), REMOTE_TS, LOCAL_TS));
        assert!(!should_pull(Some("{}"), LOCAL_TS, REMOTE_TS));
        assert!(!should_pull(Some("{}"), REMOTE_TS, REMOTE_TS));
        assert!(should_pull(None, "", ""));
        assert!(should_pull(Some("  \n"), "", ""));
        assert!(should_pull(Some("{}"), REMOTE_TS, ""));
        assert!(!should_pull(Some("{}"), "", LOCAL_TS));
        assert!(!should_pull(Some("{}"), "garbage", ""));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-01-02T00:00:00+00:00\n").is_some());
        assert_eq!(parse_timestamp("2024-01-02"), parse_timestamp(REMOTE_TS));
        assert!(parse_timestamp("").is_none());
    }

    #[tokio::test]
    async fn test_newer_remote_is_pulled() {
        let runtime = Arc::new(sandbox(Some("{\"local\":true}"), REMOTE_TS, LOCAL_TS));
        let content = resolver(runtime.clone(), true)
            .read(ConfigDocument::Classic)
            .await
            .unwrap();
        assert_eq!(content, "{\"local\":true}");
        let pull = runtime
            .commands()
            .into_iter()
            .find(|c| c.contains("cp -a"))
            .unwrap();
        assert!(pull.contains("cp -a /data/moltbot/clawdbot/clawdbot.json /root/.clawdbot/clawdbot.json"));
        assert!(pull.contains("cp -f /data/moltbot/.last-sync /root/.clawdbot/.last-sync"));
        assert_eq!(
            runtime
                .commands()
                .iter()
                .filter(|c| *c == "cat /root/.clawdbot/clawdbot.json")
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_newer_local_is_kept() {
        let runtime = Arc::new(sandbox(Some("{}"), LOCAL_TS, REMOTE_TS));
        resolver(runtime.clone(), true)
            .read(ConfigDocument::Classic)
            .await
            .unwrap();
        assert!(!runtime.ran("cp -a"));
    }

    #[tokio::test]
    async fn test_failed_local_read_always_pulls() {
        let runtime = Arc::new(sandbox(None, "", ""));
        let err = resolver(runtime.clone(), true)
            .read(ConfigDocument::Classic)
            .await
            .unwrap_err();
        // The mock file never appears, so the re-read still fails.
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(runtime.ran("cp -a"));
    }

    #[tokio::test]
    async fn test_unconfigured_returns_local() {
        let runtime = Arc::new(sandbox(None, REMOTE_TS, LOCAL_TS));
        let err = resolver(runtime.clone(), false)
            .read(ConfigDocument::Classic)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No such file"));
        assert_eq!(runtime.commands().len(), 1);
        assert_eq!(runtime.mounts.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_remote_backup_returns_local() {
        let runtime = Arc::new(MockRuntime::new("/l", |cmd| {
            if cmd.starts_with("cat /root") {
                Scripted::ok("{}")
            } else {
                Scripted::ok("")
            }
        }));
        let content = resolver(runtime.clone(), true)
            .read(ConfigDocument::Classic)
            .await
            .unwrap();
        assert_eq!(content, "{}");
        assert!(!runtime.ran("cp -a"));
    }

    #[tokio::test]
    async fn test_failed_pull_returns_local() {
        let runtime = Arc::new(MockRuntime::new("/l", |cmd| {
            if cmd.contains("cp -a") {
                Scripted::fail(1, "cp: permission denied")
            } else if cmd.starts_with("cat /data/moltbot/.last-sync") {
                Scripted::ok(REMOTE_TS)
            } else if cmd.contains("echo nested") {
                Scripted::ok("nested")
            } else if cmd == "cat /root/.clawdbot/clawdbot.json" {
                Scripted::ok("")
            } else {
                Scripted::ok("")
            }
        }));
        let content = resolver(runtime, true)
            .read(ConfigDocument::Classic)
            .await
            .unwrap();
        assert_eq!(content, "");
    }

    #[tokio::test]
    async fn test_write_uses_heredoc_in_state_dir() {
        let runtime = Arc::new(MockRuntime::new("/l", |_| Scripted::ok("")));
        resolver(runtime.clone(), false)
            .write(ConfigDocument::NextGen, "{\"a\":1}\n")
            .await
            .unwrap();
        let cmd = runtime.commands().pop().unwrap();
        assert!(cmd.starts_with("set -e; mkdir -p /root/.openclaw; cat <<'__CONFIG_"));
        assert!(cmd.contains("> /root/.openclaw/openclaw.json\n{\"a\":1}\n__CONFIG_"));
    }

    #[tokio::test]
    async fn test_write_failure_reports_stderr() {
        let runtime = Arc::new(MockRuntime::new("/l", |_| Scripted::fail(1, "read-only file system")));
        let err = resolver(runtime, false)
            .write(ConfigDocument::Classic, "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigFileError::WriteFailed { ref reason, .. } if reason == "read-only file system"));
        assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
    }

    #[test]
    fn test_config_read_view() {
        let view = ConfigRead::from(&Ok::<_, ConfigFileError>("{}".to_string()));
        assert!(view.ok);
        let view = ConfigRead::from(&Err(ConfigFileError::ReadFailed {
            path: "/x".to_string(),
            reason: "missing".to_string(),
        }));
        assert_eq!(view.kind, Some(ErrorKind::NotFound));
    }
}
