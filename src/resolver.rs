//! Missing-dependency detection and installation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::environment::Environment;
use crate::error::{ExecError, RunError};
use crate::runner::{Invocation, ProcessRunner};

/// `ModuleNotFoundError: No module named 'x'` and the older unquoted
/// `ImportError: No module named x`.
static MISSING_MODULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:ModuleNotFoundError|ImportError): No module named '?([A-Za-z_][A-Za-z0-9_.]*)'?")
        .expect("valid regex")
});

/// Package names the package manager accepts as a single positional argument.
static DEPENDENCY_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[A-Za-z0-9][A-Za-z0-9._-]*(\[[A-Za-z0-9._,-]+\])?((==|>=|<=|~=|!=|<|>)[A-Za-z0-9.*+!_-]+)?$",
    )
    .expect("valid regex")
});

/// Import names whose distribution is published under a different name.
pub const DEFAULT_PACKAGE_ALIASES: &[(&str, &str)] = &[
    ("PIL", "pillow"),
    ("bs4", "beautifulsoup4"),
    ("cv2", "opencv-python"),
    ("dateutil", "python-dateutil"),
    ("dotenv", "python-dotenv"),
    ("skimage", "scikit-image"),
    ("sklearn", "scikit-learn"),
    ("yaml", "pyyaml"),
];

/// Verdict on a failed run's diagnostic output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The run failed because this package is not installed.
    MissingDependency(String),
    OtherFailure,
}

/// Result of one package-manager invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { output: String },
    Failed { diagnostic: String },
}

/// Recognizes missing-module diagnostics and installs what they name.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    aliases: HashMap<String, String>,
    install_timeout: Duration,
}

impl DependencyResolver {
    /// Create a resolver. `aliases` extend and override the built-in table.
    pub fn new(aliases: HashMap<String, String>, install_timeout: Duration) -> Self {
        let mut table: HashMap<String, String> = DEFAULT_PACKAGE_ALIASES
            .iter()
            .map(|(module, package)| ((*module).to_string(), (*package).to_string()))
            .collect();
        table.extend(aliases);
        Self {
            aliases: table,
            install_timeout,
        }
    }

    /// Classify stderr of a failed run.
    ///
    /// The last matching diagnostic wins, since chained tracebacks report the
    /// final exception last. Submodule paths collapse to their top-level
    /// module before alias lookup.
    pub fn classify(&self, stderr: &str) -> Classification {
        let Some(module) = MISSING_MODULE_RE
            .captures_iter(stderr)
            .last()
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
        else {
            return Classification::OtherFailure;
        };

        let top_level = module.split('.').next().unwrap_or(module);
        if top_level.is_empty() {
            return Classification::OtherFailure;
        }

        let package = self
            .aliases
            .get(top_level)
            .cloned()
            .unwrap_or_else(|| top_level.to_string());
        Classification::MissingDependency(package)
    }

    /// Run `<package manager> install <name>` in the given environment.
    ///
    /// Only an invalid name or cancellation are errors; everything else the
    /// package manager reports is an `InstallOutcome`.
    #[instrument(skip(self, runner, env, cwd, cancel), fields(package_manager = %env.package_manager.display()))]
    pub async fn install(
        &self,
        runner: &dyn ProcessRunner,
        env: &Environment,
        name: &str,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome, ExecError> {
        if !is_valid_dependency_name(name) {
            return Err(ExecError::InvalidDependencyName(name.to_string()));
        }

        info!(dependency = %name, "Installing dependency");

        let mut invocation = Invocation::new(&env.package_manager, cwd, self.install_timeout)
            .arg("install")
            .arg(name)
            .env("PIP_DISABLE_PIP_VERSION_CHECK", "1")
            .env("PIP_NO_INPUT", "1");
        invocation.envs.extend(env.activation_vars());

        let outcome = match runner.run(&invocation, cancel).await {
            Ok(attempt) if attempt.succeeded() => InstallOutcome::Installed {
                output: attempt.stdout,
            },
            Ok(attempt) => InstallOutcome::Failed {
                diagnostic: if attempt.stderr.trim().is_empty() {
                    attempt.stdout
                } else {
                    attempt.stderr
                },
            },
            Err(RunError::Cancelled) => return Err(ExecError::Cancelled),
            Err(e) => InstallOutcome::Failed {
                diagnostic: e.to_string(),
            },
        };

        match &outcome {
            InstallOutcome::Installed { .. } => info!(dependency = %name, "Dependency installed"),
            InstallOutcome::Failed { diagnostic } => {
                warn!(dependency = %name, diagnostic = %diagnostic.trim(), "Dependency install failed");
            }
        }

        Ok(outcome)
    }
}

/// Reject names the package manager would parse as options or multiple args.
pub fn is_valid_dependency_name(name: &str) -> bool {
    DEPENDENCY_NAME_RE.is_match(name)
}
