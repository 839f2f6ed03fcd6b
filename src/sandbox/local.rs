//! Local sandbox runtime backed by `tokio::process`.
//!
//! Every command runs through `sh -c` on the host in its own process group.
//! Each process gets a directory in an on-disk registry under
//! `<store_root>/.sandbox/processes/<id>/`:
//!
//! ```text
//! meta.json    id, command, tag, pid, start time
//! stdout.log   raw stdout
//! stderr.log   raw stderr
//! exit         exit code, written by the wrapper shell on normal exit
//! ```
//!
//! Output goes straight to the log files, so a process keeps running after
//! the invocation that started it exits. Any runtime rooted at the same
//! directory lists, reads and kills it from the registry.
//!
//! The "mount" is a symlink from the mount path to `<store_root>/<bucket>`,
//! which is also where [`crate::store::fs::FsStore`] keeps its objects.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{RwLock, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    MountRequest, ProcessHandle, ProcessLogs, ProcessStatus, Result, SandboxError,
    SandboxRuntime, SharedProcess, StartOptions,
};
use crate::exec::{EXEC_TAG, shell_quote};

const REGISTRY_DIR: &str = ".sandbox/processes";
const META_FILE: &str = "meta.json";
const STDOUT_FILE: &str = "stdout.log";
const STDERR_FILE: &str = "stderr.log";
const EXIT_FILE: &str = "exit";

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);
const KILL_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a finished process started elsewhere stays listed.
const TERMINAL_RETENTION: Duration = Duration::from_secs(60);

/// Sandbox runtime that runs processes on the local host.
pub struct LocalRuntime {
    id: String,
    store_root: PathBuf,
    registry: PathBuf,
    processes: RwLock<Vec<Arc<LocalProcess>>>,
}

impl LocalRuntime {
    /// Create a runtime whose mounts and process registry live under
    /// `store_root`. Runtimes sharing a root share the sandbox.
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        let store_root = store_root.into();
        Self {
            id: format!("local:{}", store_root.display()),
            registry: store_root.join(REGISTRY_DIR),
            store_root,
            processes: RwLock::new(Vec::new()),
        }
    }

    /// Drop finished helper commands nobody holds a handle to.
    async fn prune_owned(&self) {
        let mut owned = self.processes.write().await;
        let mut kept = Vec::with_capacity(owned.len());
        for process in owned.drain(..) {
            let unreferenced = Arc::strong_count(&process) == 1;
            if unreferenced && process.is_helper() && !process.status().await.is_live() {
                process.remove_files().await;
            } else {
                kept.push(process);
            }
        }
        *owned = kept;
    }

    /// Processes recorded on disk by other runtimes sharing this root.
    async fn adopt_foreign(&self, owned: &[Arc<LocalProcess>]) -> Result<Vec<Arc<LocalProcess>>> {
        let mut entries = match tokio::fs::read_dir(&self.registry).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SandboxError::ListFailed {
                    reason: format!("{}: {e}", self.registry.display()),
                });
            }
        };

        let mut adopted = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| SandboxError::ListFailed {
            reason: e.to_string(),
        })? {
            let dir = entry.path();
            // Written right after spawn; a missing record is a start in flight.
            let Some(record) = read_record(&dir).await else {
                continue;
            };
            if owned.iter().any(|p| p.record.id == record.id) {
                continue;
            }

            let process = LocalProcess::adopted(record, dir);
            if !process.status().await.is_live()
                && process.idle_for().await.is_some_and(|idle| idle >= TERMINAL_RETENTION)
            {
                process.remove_files().await;
                continue;
            }
            adopted.push(Arc::new(process));
        }
        Ok(adopted)
    }
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_processes(&self) -> Result<Vec<SharedProcess>> {
        self.prune_owned().await;
        let owned = self.processes.read().await;
        let mut all: Vec<Arc<LocalProcess>> = owned.iter().cloned().collect();
        all.extend(self.adopt_foreign(&owned).await?);
        all.sort_by_key(|p| p.record.started_at);
        Ok(all.into_iter().map(|p| p as SharedProcess).collect())
    }

    async fn start_process(&self, command: &str, options: StartOptions) -> Result<SharedProcess> {
        self.prune_owned().await;
        let id = Uuid::new_v4().to_string();
        let dir = self.registry.join(&id);
        let process = Arc::new(LocalProcess::spawn(id, dir, command, options).await?);
        tracing::debug!(
            process_id = %process.record.id,
            pid = process.record.pid,
            command,
            "Started local process"
        );
        self.processes.write().await.push(Arc::clone(&process));
        Ok(process)
    }

    async fn mount_bucket(&self, request: &MountRequest) -> Result<()> {
        let source = self.store_root.join(&request.bucket);
        tokio::fs::create_dir_all(&source).await?;
        let mount_path = &request.mount_path;

        match tokio::fs::read_link(mount_path).await {
            Ok(target) if target == source => return Ok(()),
            Ok(target) => {
                return Err(SandboxError::MountFailed {
                    path: mount_path.display().to_string(),
                    reason: format!("already linked to {}", target.display()),
                });
            }
            Err(_) if tokio::fs::try_exists(mount_path).await.unwrap_or(false) => {
                return Err(SandboxError::MountFailed {
                    path: mount_path.display().to_string(),
                    reason: "path exists and is not a mount".to_string(),
                });
            }
            Err(_) => {}
        }

        if let Some(parent) = mount_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        link(&source, mount_path).await
    }
}

#[cfg(unix)]
async fn link(source: &Path, mount_path: &Path) -> Result<()> {
    tokio::fs::symlink(source, mount_path)
        .await
        .map_err(|e| SandboxError::MountFailed {
            path: mount_path.display().to_string(),
            reason: e.to_string(),
        })
}

#[cfg(not(unix))]
async fn link(_source: &Path, mount_path: &Path) -> Result<()> {
    Err(SandboxError::MountFailed {
        path: mount_path.display().to_string(),
        reason: "local mounts require a unix host".to_string(),
    })
}

/// Registry entry persisted as `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessRecord {
    id: String,
    command: String,
    tag: Option<String>,
    /// Pid of the wrapper shell, which also leads the process group.
    pid: u32,
    started_at: DateTime<Utc>,
}

async fn read_record(dir: &Path) -> Option<ProcessRecord> {
    let raw = tokio::fs::read(dir.join(META_FILE)).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "Skipping unreadable process record");
            None
        }
    }
}

/// In-process watcher state for a child this runtime spawned.
#[derive(Debug)]
struct Watch {
    reaped: Arc<AtomicBool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

/// A process in the local registry.
#[derive(Debug)]
pub struct LocalProcess {
    record: ProcessRecord,
    dir: PathBuf,
    /// Present only in the runtime that spawned the process.
    watch: Option<Watch>,
}

impl LocalProcess {
    async fn spawn(id: String, dir: PathBuf, command: &str, options: StartOptions) -> Result<Self> {
        let start_failed = |e: std::io::Error| SandboxError::StartFailed {
            reason: e.to_string(),
        };
        tokio::fs::create_dir_all(&dir).await.map_err(start_failed)?;
        let stdout = std::fs::File::create(dir.join(STDOUT_FILE)).map_err(start_failed)?;
        let stderr = std::fs::File::create(dir.join(STDERR_FILE)).map_err(start_failed)?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(wrap_command(command, &dir.join(EXIT_FILE)))
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        // Own process group so kill reaches everything the shell spawned.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(start_failed)?;
        let pid = child.id().ok_or_else(|| SandboxError::StartFailed {
            reason: "process exited before its pid was read".to_string(),
        })?;

        let record = ProcessRecord {
            id,
            command: command.to_string(),
            tag: options.tag,
            pid,
            started_at: Utc::now(),
        };
        let meta = serde_json::to_vec(&record).map_err(|e| SandboxError::StartFailed {
            reason: e.to_string(),
        })?;
        if let Err(e) = tokio::fs::write(dir.join(META_FILE), meta).await {
            kill_group(pid).await;
            let _ = child.wait().await;
            return Err(start_failed(e));
        }

        let reaped = Arc::new(AtomicBool::new(false));
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let watch_reaped = Arc::clone(&reaped);
        tokio::spawn(async move {
            let killed = tokio::select! {
                _ = child.wait() => false,
                Ok(()) = &mut kill_rx => true,
            };
            if killed {
                kill_group(pid).await;
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            watch_reaped.store(true, Ordering::Release);
        });

        Ok(Self {
            record,
            dir,
            watch: Some(Watch {
                reaped,
                kill_tx: Mutex::new(Some(kill_tx)),
            }),
        })
    }

    fn adopted(record: ProcessRecord, dir: PathBuf) -> Self {
        Self {
            record,
            dir,
            watch: None,
        }
    }

    fn is_helper(&self) -> bool {
        self.record.tag.as_deref() == Some(EXEC_TAG)
    }

    async fn recorded_exit(&self) -> Option<i32> {
        let raw = tokio::fs::read_to_string(self.dir.join(EXIT_FILE)).await.ok()?;
        raw.trim().parse().ok()
    }

    /// Time since any registry file last changed.
    async fn idle_for(&self) -> Option<Duration> {
        let mut latest: Option<SystemTime> = None;
        for name in [META_FILE, STDOUT_FILE, STDERR_FILE, EXIT_FILE] {
            if let Ok(meta) = tokio::fs::metadata(self.dir.join(name)).await
                && let Ok(modified) = meta.modified()
            {
                latest = Some(latest.map_or(modified, |l| l.max(modified)));
            }
        }
        latest.and_then(|t| t.elapsed().ok())
    }

    async fn remove_files(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::debug!(process_id = %self.record.id, error = %e, "Failed to prune process record");
        }
    }

    async fn read_log(&self, name: &str) -> Result<String> {
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(SandboxError::LogsUnavailable {
                id: self.record.id.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn is_running(&self) -> bool {
        match &self.watch {
            Some(watch) => !watch.reaped.load(Ordering::Acquire),
            None => pid_alive(self.record.pid).await,
        }
    }
}

/// Run `command` in a subshell and record its exit code in `exit_file`.
///
/// A process killed by signal never reaches the `printf`, so it leaves no
/// exit record.
fn wrap_command(command: &str, exit_file: &Path) -> String {
    format!(
        "(\n{command}\n)\nstatus=$?\nprintf '%s' \"$status\" > {exit_file}\nexit \"$status\"",
        exit_file = shell_quote(&exit_file.display().to_string())
    )
}

#[cfg(unix)]
async fn kill_group(pid: u32) {
    let _ = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

#[cfg(not(unix))]
async fn kill_group(_pid: u32) {}

#[cfg(unix)]
async fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|s| s.success())
}

#[cfg(not(unix))]
async fn pid_alive(_pid: u32) -> bool {
    false
}

#[async_trait]
impl ProcessHandle for LocalProcess {
    fn id(&self) -> &str {
        &self.record.id
    }

    fn command(&self) -> &str {
        &self.record.command
    }

    fn tag(&self) -> Option<&str> {
        self.record.tag.as_deref()
    }

    async fn status(&self) -> ProcessStatus {
        if let Some(code) = self.recorded_exit().await {
            return if code == 0 {
                ProcessStatus::Stopped
            } else {
                ProcessStatus::Failed
            };
        }
        if self.is_running().await {
            ProcessStatus::Running
        } else {
            ProcessStatus::Stopped
        }
    }

    async fn exit_code(&self) -> Option<i32> {
        self.recorded_exit().await
    }

    async fn logs(&self) -> Result<ProcessLogs> {
        Ok(ProcessLogs {
            stdout: self.read_log(STDOUT_FILE).await?,
            stderr: self.read_log(STDERR_FILE).await?,
        })
    }

    async fn wait_for_port(&self, port: u16, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.status().await.is_live() {
                return Err(SandboxError::ProcessExited {
                    id: self.record.id.clone(),
                    exit_code: self.exit_code().await,
                });
            }

            let attempt =
                tokio::time::timeout(CONNECT_ATTEMPT_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
                    .await;
            if let Ok(Ok(_)) = attempt {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SandboxError::Timeout(timeout));
            }
            tokio::time::sleep(PORT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn kill(&self) -> Result<()> {
        match &self.watch {
            Some(watch) => {
                let sender = watch
                    .kill_tx
                    .lock()
                    .map_err(|e| SandboxError::KillFailed {
                        id: self.record.id.clone(),
                        reason: e.to_string(),
                    })?
                    .take();
                if let Some(tx) = sender {
                    let _ = tx.send(());
                }
            }
            None => {
                if self.is_running().await {
                    kill_group(self.record.pid).await;
                }
            }
        }

        let deadline = Instant::now() + KILL_SETTLE_TIMEOUT;
        while self.is_running().await {
            if Instant::now() >= deadline {
                return Err(SandboxError::KillFailed {
                    id: self.record.id.clone(),
                    reason: "process did not exit".to_string(),
                });
            }
            tokio::time::sleep(KILL_POLL_INTERVAL).await;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use tempfile::TempDir;

    async fn wait_terminal(process: &SharedProcess) -> ProcessStatus {
        for _ in 0..150 {
            let status = process.status().await;
            if !status.is_live() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        process.status().await
    }

    fn registry_entries(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path().join(REGISTRY_DIR))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let runtime = LocalRuntime::new(dir.path());
        let process = runtime
            .start_process("echo hello; echo oops 1>&2; exit 3", StartOptions::default())
            .await
            .unwrap();

        assert_eq!(wait_terminal(&process).await, ProcessStatus::Failed);
        assert_eq!(process.exit_code().await, Some(3));
        let logs = process.logs().await.unwrap();
        assert_eq!(logs.stdout, "hello\n");
        assert_eq!(logs.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_env_and_tag_are_applied() {
        let dir = TempDir::new().unwrap();
        let runtime = LocalRuntime::new(dir.path());
        let mut opts = StartOptions::tagged("gateway");
        opts.env.insert("MOLT_TEST_VALUE".to_string(), "42".to_string());
        let process = runtime
            .start_process("printf '%s' \"$MOLT_TEST_VALUE\"", opts)
            .await
            .unwrap();

        assert_eq!(wait_terminal(&process).await, ProcessStatus::Stopped);
        assert_eq!(process.tag(), Some("gateway"));
        assert_eq!(process.logs().await.unwrap().stdout, "42");
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_is_kept_and_process_survives() {
        let dir = TempDir::new().unwrap();
        let runtime = LocalRuntime::new(dir.path());
        let process = runtime
            .start_process(
                "printf 'a\\377b\\n'; sleep 0.2; echo after",
                StartOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(wait_terminal(&process).await, ProcessStatus::Stopped);
        assert_eq!(process.exit_code().await, Some(0));
        assert_eq!(process.logs().await.unwrap().stdout, "a\u{FFFD}b\nafter\n");
    }

    #[tokio::test]
    async fn test_list_and_kill() {
        let dir = TempDir::new().unwrap();
        let runtime = LocalRuntime::new(dir.path());
        let process = runtime
            .start_process("sleep 30", StartOptions::default())
            .await
            .unwrap();

        let listed = runtime.list_processes().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id(), process.id());
        assert!(process.status().await.is_live());

        process.kill().await.unwrap();
        assert_eq!(process.status().await, ProcessStatus::Stopped);
        assert_eq!(process.exit_code().await, None);
    }

    #[tokio::test]
    async fn test_runtimes_sharing_a_root_see_each_others_processes() {
        let dir = TempDir::new().unwrap();
        let first = LocalRuntime::new(dir.path());
        let second = LocalRuntime::new(dir.path());
        assert_eq!(first.id(), second.id());

        let process = first
            .start_process("echo booted; sleep 30", StartOptions::tagged("gateway"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let listed = second.list_processes().await.unwrap();
        assert_eq!(listed.len(), 1);
        let adopted = &listed[0];
        assert_eq!(adopted.id(), process.id());
        assert_eq!(adopted.tag(), Some("gateway"));
        assert_eq!(adopted.status().await, ProcessStatus::Running);
        assert_eq!(adopted.logs().await.unwrap().stdout, "booted\n");

        adopted.kill().await.unwrap();
        assert!(!adopted.status().await.is_live());
        assert_eq!(wait_terminal(&process).await, ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn test_process_outlives_its_runtime() {
        let dir = TempDir::new().unwrap();
        let id = {
            let runtime = LocalRuntime::new(dir.path());
            let process = runtime
                .start_process("sleep 30", StartOptions::tagged("gateway"))
                .await
                .unwrap();
            process.id().to_string()
        };

        let runtime = LocalRuntime::new(dir.path());
        let listed = runtime.list_processes().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id(), id);
        assert_eq!(listed[0].status().await, ProcessStatus::Running);
        listed[0].kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_helpers_are_pruned() {
        let dir = TempDir::new().unwrap();
        let runtime = LocalRuntime::new(dir.path());
        for _ in 0..3 {
            let process = runtime
                .start_process("true", StartOptions::tagged(EXEC_TAG))
                .await
                .unwrap();
            wait_terminal(&process).await;
        }
        let gateway = runtime
            .start_process("sleep 30", StartOptions::tagged("gateway"))
            .await
            .unwrap();

        let listed = runtime.list_processes().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id(), gateway.id());
        assert_eq!(registry_entries(&dir), 1);
        gateway.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_held_helper_keeps_its_logs() {
        let dir = TempDir::new().unwrap();
        let runtime = LocalRuntime::new(dir.path());
        let process = runtime
            .start_process("echo kept", StartOptions::tagged(EXEC_TAG))
            .await
            .unwrap();
        wait_terminal(&process).await;

        runtime.list_processes().await.unwrap();
        assert_eq!(process.logs().await.unwrap().stdout, "kept\n");
    }

    #[tokio::test]
    async fn test_wait_for_port_succeeds_when_listening() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dir = TempDir::new().unwrap();
        let runtime = LocalRuntime::new(dir.path());
        let process = runtime
            .start_process("sleep 30", StartOptions::default())
            .await
            .unwrap();
        process
            .wait_for_port(port, Duration::from_secs(5))
            .await
            .expect("port should be reachable");
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_port_reports_early_exit() {
        let dir = TempDir::new().unwrap();
        let runtime = LocalRuntime::new(dir.path());
        let process = runtime
            .start_process("exit 7", StartOptions::default())
            .await
            .unwrap();
        wait_terminal(&process).await;

        let err = process
            .wait_for_port(1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::ProcessExited {
                exit_code: Some(7),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_mount_is_idempotent_symlink() {
        let dir = TempDir::new().unwrap();
        let runtime = LocalRuntime::new(dir.path().join("store"));
        let request = MountRequest {
            bucket: "bucket-a".to_string(),
            mount_path: dir.path().join("mnt").join("moltbot"),
            endpoint: "https://acct.r2.cloudflarestorage.com".to_string(),
            access_key_id: SecretString::from("key"),
            secret_access_key: SecretString::from("secret"),
        };

        runtime.mount_bucket(&request).await.unwrap();
        runtime.mount_bucket(&request).await.unwrap();

        std::fs::write(request.mount_path.join("marker.txt"), "x").unwrap();
        assert!(dir.path().join("store/bucket-a/marker.txt").exists());
    }

    #[tokio::test]
    async fn test_mount_refuses_occupied_path() {
        let dir = TempDir::new().unwrap();
        let runtime = LocalRuntime::new(dir.path().join("store"));
        let mount_path = dir.path().join("occupied");
        std::fs::create_dir_all(&mount_path).unwrap();

        let request = MountRequest {
            bucket: "b".to_string(),
            mount_path,
            endpoint: String::new(),
            access_key_id: SecretString::from("k"),
            secret_access_key: SecretString::from("s"),
        };
        let err = runtime.mount_bucket(&request).await.unwrap_err();
        assert!(matches!(err, SandboxError::MountFailed { .. }));
    }
}
