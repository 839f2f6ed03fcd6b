//! Scripted sandbox runtime for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{
    MountRequest, ProcessHandle, ProcessLogs, ProcessStatus, Result, SandboxError,
    SandboxRuntime, SharedProcess, StartOptions,
};

/// Outcome of a scripted shell command.
#[derive(Debug, Clone)]
pub(crate) struct Scripted {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Scripted {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        Self {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// How a mock long-running process responds to port waits.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Readiness {
    /// Port accepts connections after the delay.
    After(Duration),
    /// Port never opens.
    Never,
}

type Handler = Box<dyn Fn(&str) -> Scripted + Send + Sync>;

pub(crate) struct MockRuntime {
    id: String,
    processes: Mutex<Vec<Arc<MockProcess>>>,
    handler: Handler,
    launcher: String,
    launcher_readiness: Mutex<Readiness>,
    launcher_logs: Mutex<Result<ProcessLogs>>,
    fail_start: Mutex<bool>,
    mount_error: Mutex<Option<String>>,
    commands: Mutex<Vec<String>>,
    pub mounts: AtomicUsize,
    pub launches: AtomicUsize,
}

impl MockRuntime {
    pub fn new(launcher: &str, handler: impl Fn(&str) -> Scripted + Send + Sync + 'static) -> Self {
        Self {
            id: "mock-sandbox".to_string(),
            processes: Mutex::new(Vec::new()),
            handler: Box::new(handler),
            launcher: launcher.to_string(),
            launcher_readiness: Mutex::new(Readiness::After(Duration::ZERO)),
            launcher_logs: Mutex::new(Ok(ProcessLogs::default())),
            fail_start: Mutex::new(false),
            mount_error: Mutex::new(None),
            commands: Mutex::new(Vec::new()),
            mounts: AtomicUsize::new(0),
            launches: AtomicUsize::new(0),
        }
    }

    pub fn with_launcher_readiness(self, readiness: Readiness) -> Self {
        *self.launcher_readiness.lock().unwrap() = readiness;
        self
    }

    pub fn with_launcher_logs(self, logs: Result<ProcessLogs>) -> Self {
        *self.launcher_logs.lock().unwrap() = logs;
        self
    }

    pub fn with_failing_start(self) -> Self {
        *self.fail_start.lock().unwrap() = true;
        self
    }

    pub fn with_mount_error(self, reason: &str) -> Self {
        *self.mount_error.lock().unwrap() = Some(reason.to_string());
        self
    }

    /// Seed a pre-existing process.
    pub fn seed(&self, process: MockProcess) -> Arc<MockProcess> {
        let process = Arc::new(process);
        self.processes.lock().unwrap().push(Arc::clone(&process));
        process
    }

    pub fn process(&self, id: &str) -> Option<Arc<MockProcess>> {
        self.processes
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    /// Every shell command started so far, excluding launcher starts.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.commands().iter().any(|c| c.contains(needle))
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_processes(&self) -> Result<Vec<SharedProcess>> {
        Ok(self
            .processes
            .lock()
            .unwrap()
            .iter()
            .map(|p| Arc::clone(p) as SharedProcess)
            .collect())
    }

    async fn start_process(&self, command: &str, options: StartOptions) -> Result<SharedProcess> {
        if command == self.launcher {
            if *self.fail_start.lock().unwrap() {
                return Err(SandboxError::StartFailed {
                    reason: "container unavailable".to_string(),
                });
            }
            let n = self.launches.fetch_add(1, Ordering::SeqCst);
            let readiness = *self.launcher_readiness.lock().unwrap();
            let logs = match &*self.launcher_logs.lock().unwrap() {
                Ok(logs) => Ok(logs.clone()),
                Err(e) => Err(SandboxError::LogsUnavailable {
                    id: format!("gw-{n}"),
                    reason: e.to_string(),
                }),
            };
            let mut process = MockProcess::long_running(&format!("gw-{n}"), command, readiness)
                .with_env(options.env);
            process.tag = options.tag;
            process.logs = logs;
            return Ok(self.seed(process));
        }

        self.commands.lock().unwrap().push(command.to_string());
        let scripted = (self.handler)(command);
        let n = self.commands.lock().unwrap().len();
        let mut process = MockProcess::finished(&format!("cmd-{n}"), command, scripted);
        process.tag = options.tag;
        Ok(self.seed(process))
    }

    async fn mount_bucket(&self, request: &MountRequest) -> Result<()> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        match &*self.mount_error.lock().unwrap() {
            Some(reason) => Err(SandboxError::MountFailed {
                path: request.mount_path.display().to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct MockProcess {
    id: String,
    command: String,
    pub tag: Option<String>,
    status: Mutex<ProcessStatus>,
    exit_code: Mutex<Option<i32>>,
    logs: Result<ProcessLogs>,
    readiness: Readiness,
    started: Instant,
    pub env: super::EnvMap,
    pub kills: AtomicUsize,
    fail_kill: bool,
}

impl MockProcess {
    pub fn long_running(id: &str, command: &str, readiness: Readiness) -> Self {
        Self {
            id: id.to_string(),
            command: command.to_string(),
            tag: None,
            status: Mutex::new(ProcessStatus::Running),
            exit_code: Mutex::new(None),
            logs: Ok(ProcessLogs::default()),
            readiness,
            started: Instant::now(),
            env: super::EnvMap::new(),
            kills: AtomicUsize::new(0),
            fail_kill: false,
        }
    }

    pub fn finished(id: &str, command: &str, scripted: Scripted) -> Self {
        let status = if scripted.exit_code == 0 {
            ProcessStatus::Stopped
        } else {
            ProcessStatus::Failed
        };
        Self {
            id: id.to_string(),
            command: command.to_string(),
            tag: None,
            status: Mutex::new(status),
            exit_code: Mutex::new(Some(scripted.exit_code)),
            logs: Ok(ProcessLogs {
                stdout: scripted.stdout,
                stderr: scripted.stderr,
            }),
            readiness: Readiness::Never,
            started: Instant::now(),
            env: super::EnvMap::new(),
            kills: AtomicUsize::new(0),
            fail_kill: false,
        }
    }

    pub fn with_status(self, status: ProcessStatus) -> Self {
        *self.status.lock().unwrap() = status;
        self
    }

    pub fn with_failing_kill(mut self) -> Self {
        self.fail_kill = true;
        self
    }

    fn with_env(mut self, env: super::EnvMap) -> Self {
        self.env = env;
        self
    }
}

#[async_trait]
impl ProcessHandle for MockProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn command(&self) -> &str {
        &self.command
    }

    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    async fn status(&self) -> ProcessStatus {
        *self.status.lock().unwrap()
    }

    async fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap()
    }

    async fn logs(&self) -> Result<ProcessLogs> {
        match &self.logs {
            Ok(logs) => Ok(logs.clone()),
            Err(e) => Err(SandboxError::LogsUnavailable {
                id: self.id.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn wait_for_port(&self, _port: u16, timeout: Duration) -> Result<()> {
        if !self.status.lock().unwrap().is_live() {
            return Err(SandboxError::ProcessExited {
                id: self.id.clone(),
                exit_code: *self.exit_code.lock().unwrap(),
            });
        }
        match self.readiness {
            Readiness::After(delay) => {
                let ready_at = self.started + delay;
                let now = Instant::now();
                if ready_at <= now {
                    return Ok(());
                }
                if ready_at - now > timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(SandboxError::Timeout(timeout));
                }
                tokio::time::sleep_until(ready_at).await;
                Ok(())
            }
            Readiness::Never => {
                tokio::time::sleep(timeout).await;
                Err(SandboxError::Timeout(timeout))
            }
        }
    }

    async fn kill(&self) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if self.fail_kill {
            return Err(SandboxError::KillFailed {
                id: self.id.clone(),
                reason: "permission denied".to_string(),
            });
        }
        *self.status.lock().unwrap() = ProcessStatus::Stopped;
        Ok(())
    }
}
