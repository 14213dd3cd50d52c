//! Runner that spawns processes directly on the host.

use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{ExecutionAttempt, Invocation, ProcessRunner};
use crate::error::RunError;

/// Runs invocations as local child processes.
#[derive(Debug, Default, Clone)]
pub struct LocalRunner {}

impl LocalRunner {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }
}

enum Finish {
    Done(std::io::Result<(ExitStatus, Vec<u8>, Vec<u8>)>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ProcessRunner for LocalRunner {
    #[instrument(skip(self, cancel), fields(program = %invocation.program.display(), timeout = ?invocation.timeout))]
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ExecutionAttempt, RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.cwd)
            .envs(invocation.envs.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        // Take pipe handles out so `child` stays in scope for kill
        let mut child_stdout = child.stdout.take().ok_or_else(|| {
            RunError::Io(std::io::Error::other("child stdout was not captured"))
        })?;
        let mut child_stderr = child.stderr.take().ok_or_else(|| {
            RunError::Io(std::io::Error::other("child stderr was not captured"))
        })?;

        // Bounded as a whole: a child can close its output and keep running
        let run_to_exit = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (r1, r2) = tokio::join!(
                child_stdout.read_to_end(&mut stdout_buf),
                child_stderr.read_to_end(&mut stderr_buf),
            );
            r1?;
            r2?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout_buf, stderr_buf))
        };

        let finish = tokio::select! {
            result = tokio::time::timeout(invocation.timeout, run_to_exit) => {
                result.map_or(Finish::TimedOut, Finish::Done)
            }
            () = cancel.cancelled() => Finish::Cancelled,
        };

        let (status, stdout_buf, stderr_buf) = match finish {
            Finish::Done(finished) => finished?,
            Finish::TimedOut => {
                reap(&mut child).await;
                return Err(RunError::TimedOut(invocation.timeout));
            }
            Finish::Cancelled => {
                reap(&mut child).await;
                return Err(RunError::Cancelled);
            }
        };

        let attempt = ExecutionAttempt {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        };

        debug!(exit_code = attempt.exit_code, "Process finished");

        Ok(attempt)
    }
}

async fn reap(child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill child process");
    }
}
