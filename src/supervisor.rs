//! Background worker processes.
//!
//! `worker start` launches detached worker processes and records their pids
//! in a small JSON manifest; `worker stop` reads the manifest back, sends
//! each pid SIGTERM and removes the file. Stopped workers finish the job in
//! hand before exiting.

use chrono::Utc;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

/// Manifest location used when none is configured.
pub const DEFAULT_PID_FILE: &str = "queuectl.pids.json";

/// Errors that can occur while starting or stopping workers.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Spawning a worker or touching the manifest failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The manifest could not be encoded or decoded.
    #[error("invalid pid file: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Pids of the workers started by the last `worker start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidManifest {
    pub pids: Vec<u32>,
    /// Unix milliseconds.
    pub started_at: i64,
}

impl PidManifest {
    /// A manifest stamped with the current time.
    pub fn new(pids: Vec<u32>) -> Self {
        Self {
            pids,
            started_at: Utc::now().timestamp_millis(),
        }
    }

    /// Read a manifest, returning `None` when the file does not exist.
    pub fn read(path: &Path) -> Result<Option<Self>, SupervisorError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Write the manifest, replacing any previous one.
    pub fn write(&self, path: &Path) -> Result<(), SupervisorError> {
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Outcome of signalling the workers in a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Pids that were sent SIGTERM.
    pub signalled: Vec<u32>,
    /// Pids that could not be signalled, with the reason.
    pub failed: Vec<(u32, String)>,
}

/// Starts and stops background workers.
#[derive(Debug, Clone)]
pub struct Supervisor {
    program: PathBuf,
    args: Vec<OsString>,
    pid_file: PathBuf,
}

impl Supervisor {
    /// Launch `program` with `args` for every worker.
    pub fn new(program: impl Into<PathBuf>, pid_file: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            pid_file: pid_file.into(),
        }
    }

    /// Re-run the current executable as `worker run` against `db`.
    pub fn for_current_exe(
        db: impl Into<OsString>,
        pid_file: impl Into<PathBuf>,
    ) -> Result<Self, SupervisorError> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(exe, pid_file).with_args([
            OsString::from("--db"),
            db.into(),
            OsString::from("worker"),
            OsString::from("run"),
        ]))
    }

    /// Append arguments passed to every worker.
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Path of the pid manifest.
    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// Spawn `count` detached workers and record their pids.
    ///
    /// Workers share this process's stdout and stderr. If a spawn fails the
    /// workers already started are still recorded before the error returns.
    pub fn start(&self, count: usize) -> Result<PidManifest, SupervisorError> {
        let mut pids = Vec::with_capacity(count);
        let mut failure = None;

        for _ in 0..count {
            let spawned = Command::new(&self.program)
                .args(&self.args)
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .spawn();
            match spawned {
                Ok(child) => {
                    tracing::info!(pid = child.id(), "started worker");
                    pids.push(child.id());
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let manifest = PidManifest::new(pids);
        manifest.write(&self.pid_file)?;
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(manifest),
        }
    }

    /// Send SIGTERM to every recorded worker and remove the manifest.
    ///
    /// Returns `None` when there is no manifest. A pid that cannot be
    /// signalled (usually because it already exited) is reported, not fatal.
    pub fn stop(&self) -> Result<Option<StopReport>, SupervisorError> {
        let Some(manifest) = PidManifest::read(&self.pid_file)? else {
            return Ok(None);
        };

        let mut report = StopReport::default();
        for pid in manifest.pids {
            match terminate(pid) {
                Ok(()) => {
                    tracing::info!(pid, "sent SIGTERM");
                    report.signalled.push(pid);
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "failed to signal worker");
                    report.failed.push((pid, e.to_string()));
                }
            }
        }

        std::fs::remove_file(&self.pid_file)?;
        Ok(Some(report))
    }
}

fn terminate(pid: u32) -> Result<(), nix::Error> {
    // 0 and negative pids address process groups, not a single worker
    let raw = i32::try_from(pid)
        .ok()
        .filter(|&raw| raw > 0)
        .ok_or(nix::Error::ESRCH)?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)
}
