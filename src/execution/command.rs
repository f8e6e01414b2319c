//! Shell command execution.
//!
//! [`ShellExecutor`] runs a job's command line through `sh -c`, inheriting
//! the worker's stdin, stdout and stderr. It always resolves to an exit
//! status: a command that cannot be started reports [`SPAWN_FAILURE_STATUS`]
//! instead of an error, so the worker loop only ever deals with numbers.
//!
//! ```rust,no_run
//! use queuectl::{CommandExecutor, ShellExecutor};
//! use std::time::Duration;
//!
//! # async fn demo() {
//! let executor = ShellExecutor::new().with_timeout(Duration::from_secs(30));
//! let status = executor.execute("echo hello && exit 3").await;
//! assert_eq!(status, 3);
//! # }
//! ```

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Status reported when the command could not be spawned or awaited.
pub const SPAWN_FAILURE_STATUS: i32 = 127;

/// Status reported when the command outlived the executor's timeout.
pub const TIMEOUT_STATUS: i32 = 124;

/// Runs a job command and reports its exit status.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute `command` to completion and return its exit status.
    async fn execute(&self, command: &str) -> i32;
}

/// Executes commands with a POSIX shell.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    /// Shell used to interpret the command line.
    shell: String,
    /// Extra environment variables for every command.
    env: Vec<(String, String)>,
    /// Working directory, inherited when unset.
    working_dir: Option<PathBuf>,
    /// Kill the command after this long. Unbounded when unset.
    timeout: Option<Duration>,
}

impl ShellExecutor {
    /// Executor using `sh` with no timeout.
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
            env: Vec::new(),
            working_dir: None,
            timeout: None,
        }
    }

    /// Use a different shell binary.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Kill commands that run longer than `duration`.
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    fn command(&self, line: &str) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(line);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str) -> i32 {
        let mut child = match self.command(command).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(shell = %self.shell, error = %e, "Failed to spawn command");
                return SPAWN_FAILURE_STATUS;
            }
        };

        let waited = match self.timeout {
            Some(duration) => match timeout(duration, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    tracing::warn!(timeout = ?duration, "Command timed out, killing it");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "Failed to kill timed out command");
                    }
                    return TIMEOUT_STATUS;
                }
            },
            None => child.wait().await,
        };

        match waited {
            Ok(status) => exit_code(status),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wait for command");
                SPAWN_FAILURE_STATUS
            }
        }
    }
}

/// Map an exit status to a number, following the shell's `128 + signal`
/// convention for commands killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
