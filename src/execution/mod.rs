//! Job command execution.
//!
//! This module provides the executor abstraction the worker uses to run a
//! claimed job's command and the default shell-based implementation.

mod command;

pub use command::{CommandExecutor, SPAWN_FAILURE_STATUS, ShellExecutor, TIMEOUT_STATUS};
