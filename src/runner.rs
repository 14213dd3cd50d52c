//! Subprocess runner trait and implementations.
//!
//! Every external process the core starts (interpreter runs, package
//! installs, environment creation) goes through a `ProcessRunner`, so the
//! supervisor can be driven by a scripted runner in tests.

mod local;

pub use local::LocalRunner;

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::RunError;

/// One subprocess to start.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Program to execute, either a path or a name looked up on `PATH`.
    pub program: PathBuf,
    /// Positional arguments.
    pub args: Vec<OsString>,
    /// Working directory of the child.
    pub cwd: PathBuf,
    /// Extra environment variables layered over the inherited ones.
    pub envs: Vec<(String, String)>,
    /// Wall-clock bound for the whole run.
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            envs: Vec::new(),
            timeout,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// Captured result of one finished subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionAttempt {
    /// Exit code of the process (0 = success, -1 = killed by a signal).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ExecutionAttempt {
    pub const fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Starts subprocesses and waits for them to finish.
///
/// Implementations must kill the child when the timeout expires or the
/// token is cancelled, and must not return before the child is reaped.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ExecutionAttempt, RunError>;
}
