//! Interpreter environments.
//!
//! A request runs against one of three environments:
//! - `Supplied`: a pre-built environment directory from configuration
//! - `Ephemeral`: a virtual environment created for this request only
//! - `Ambient`: whatever interpreter and package manager are on `PATH`
//!
//! Only ephemeral environments are created and destroyed here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{ExecError, RunError};
use crate::runner::{Invocation, ProcessRunner};

/// Who owns the environment's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Ambient,
    Supplied,
    Ephemeral,
}

/// A runnable interpreter / package-manager pair.
#[derive(Debug)]
pub struct Environment {
    pub interpreter: PathBuf,
    pub package_manager: PathBuf,
    pub lifecycle: Lifecycle,
    /// Root directory, for supplied and ephemeral environments.
    pub root: Option<PathBuf>,
    /// Owns the directory of an ephemeral environment.
    guard: Option<TempDir>,
}

impl Environment {
    fn ambient(interpreter: &Path, package_manager: &Path) -> Self {
        Self {
            interpreter: interpreter.to_path_buf(),
            package_manager: package_manager.to_path_buf(),
            lifecycle: Lifecycle::Ambient,
            root: None,
            guard: None,
        }
    }

    fn supplied(root: &Path) -> Self {
        let (interpreter, package_manager) = env_binaries(root);
        Self {
            interpreter,
            package_manager,
            lifecycle: Lifecycle::Supplied,
            root: Some(root.to_path_buf()),
            guard: None,
        }
    }

    fn ephemeral(dir: TempDir) -> Self {
        let (interpreter, package_manager) = env_binaries(dir.path());
        Self {
            interpreter,
            package_manager,
            lifecycle: Lifecycle::Ephemeral,
            root: Some(dir.path().to_path_buf()),
            guard: Some(dir),
        }
    }

    /// Variables that activate this environment for a child process.
    pub fn activation_vars(&self) -> Vec<(String, String)> {
        self.root
            .iter()
            .map(|root| ("VIRTUAL_ENV".to_string(), root.display().to_string()))
            .collect()
    }
}

/// Interpreter and package-manager locations inside an environment root.
pub fn env_binaries(root: &Path) -> (PathBuf, PathBuf) {
    if cfg!(windows) {
        let scripts = root.join("Scripts");
        (scripts.join("python.exe"), scripts.join("pip.exe"))
    } else {
        let bin = root.join("bin");
        (bin.join("python"), bin.join("pip"))
    }
}

/// Settings that decide which environment a request gets.
#[derive(Debug, Clone)]
pub struct EnvironmentSettings {
    /// Pre-built environment to use for every request.
    pub environment_path: Option<PathBuf>,
    /// Create a disposable environment per request.
    pub ephemeral: bool,
    /// Ambient interpreter, also used to create ephemeral environments.
    pub interpreter: PathBuf,
    /// Ambient package manager.
    pub package_manager: PathBuf,
    /// Parent directory for ephemeral environments.
    pub scratch_dir: PathBuf,
    /// Bound on environment creation.
    pub create_timeout: Duration,
}

/// Hands out environments and tears down the disposable ones.
#[derive(Debug, Clone)]
pub struct EnvironmentManager {
    settings: EnvironmentSettings,
}

impl EnvironmentManager {
    pub const fn new(settings: EnvironmentSettings) -> Self {
        Self { settings }
    }

    pub const fn settings(&self) -> &EnvironmentSettings {
        &self.settings
    }

    /// Obtain an environment for one request.
    #[instrument(skip_all)]
    pub async fn acquire(
        &self,
        runner: &dyn ProcessRunner,
        cancel: &CancellationToken,
    ) -> Result<Environment, ExecError> {
        if let Some(root) = &self.settings.environment_path {
            debug!(root = %root.display(), "Using supplied environment");
            return Ok(Environment::supplied(root));
        }

        if self.settings.ephemeral {
            return self.create_ephemeral(runner, cancel).await;
        }

        debug!(
            interpreter = %self.settings.interpreter.display(),
            "Using ambient environment"
        );
        Ok(Environment::ambient(
            &self.settings.interpreter,
            &self.settings.package_manager,
        ))
    }

    /// Release an environment. Ephemeral roots are deleted; failures are logged.
    pub fn release(&self, env: Environment) {
        let Some(dir) = env.guard else {
            return;
        };
        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => debug!(root = %path.display(), "Removed ephemeral environment"),
            Err(e) => warn!(
                root = %path.display(),
                error = %e,
                "Failed to remove ephemeral environment"
            ),
        }
    }

    async fn create_ephemeral(
        &self,
        runner: &dyn ProcessRunner,
        cancel: &CancellationToken,
    ) -> Result<Environment, ExecError> {
        let dir = tempfile::Builder::new()
            .prefix("env-")
            .tempdir_in(&self.settings.scratch_dir)
            .map_err(|e| ExecError::EnvironmentCreateFailed {
                root: self.settings.scratch_dir.clone(),
                message: e.to_string(),
            })?;
        let root = dir.path().to_path_buf();
        let failed = |message: String| ExecError::EnvironmentCreateFailed {
            root: root.clone(),
            message,
        };

        info!(root = %root.display(), "Creating ephemeral environment");

        let invocation = Invocation::new(
            &self.settings.interpreter,
            &self.settings.scratch_dir,
            self.settings.create_timeout,
        )
        .arg("-m")
        .arg("venv")
        .arg(root.as_os_str());

        match runner.run(&invocation, cancel).await {
            Ok(attempt) if attempt.succeeded() => {}
            Ok(attempt) => return Err(failed(attempt.stderr.trim().to_string())),
            Err(RunError::Cancelled) => return Err(ExecError::Cancelled),
            Err(e) => return Err(failed(e.to_string())),
        }

        let env = Environment::ephemeral(dir);
        if !env.interpreter.exists() {
            return Err(failed(format!(
                "interpreter not found at {}",
                env.interpreter.display()
            )));
        }

        Ok(env)
    }
}
