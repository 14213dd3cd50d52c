//! Error taxonomy for a single execution request.
//!
//! Every variant is terminal for the request that produced it. The supervisor
//! renders it into `ExecutionResult::error`; nothing here escalates past the
//! request boundary.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure of one execution request.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The requested virtual path is not covered by any mount.
    #[error("Path '{path}' is outside all mounted directories")]
    PathOutsideMounts { path: String },

    /// The workspace could not be prepared.
    #[error("Failed to stage code: {message}")]
    StagingFailed { message: String },

    /// A disposable environment could not be created.
    #[error("Failed to create isolated environment at {}: {message}", .root.display())]
    EnvironmentCreateFailed { root: PathBuf, message: String },

    /// Non-zero exit that is not a resolvable missing dependency.
    #[error("{diagnostic}")]
    OtherFailure { diagnostic: String },

    /// A missing dependency was detected but could not be satisfied.
    #[error("{diagnostic}")]
    MissingDependencyUnresolved { dependency: String, diagnostic: String },

    /// A run attempt exceeded its wall-clock bound.
    #[error("Execution timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// The request was aborted by its caller.
    #[error("Execution was cancelled")]
    Cancelled,

    /// The name would be interpreted as something other than a package name.
    #[error("Refusing to install '{0}': not a valid dependency name")]
    InvalidDependencyName(String),
}

impl ExecError {
    pub(crate) fn staging(message: impl Into<String>) -> Self {
        Self::StagingFailed {
            message: message.into(),
        }
    }
}

/// Failure of a single subprocess invocation, below the request level.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while running process: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Process was cancelled")]
    Cancelled,
}

impl From<RunError> for ExecError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::TimedOut(limit) => Self::Timeout(limit),
            RunError::Cancelled => Self::Cancelled,
            other => Self::OtherFailure {
                diagnostic: other.to_string(),
            },
        }
    }
}
