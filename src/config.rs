//! Daemon configuration.
//!
//! Configuration is read from the `CODE_RUNNER_CONFIG` environment variable
//! as JSON when present, then overridden by command-line flags. It is
//! validated once, before the supervisor is built, and never changes after.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::mounts::{normalize_virtual, MountEntry, MountTable};

/// Environment variable holding the JSON configuration.
pub const CONFIG_ENV_VAR: &str = "CODE_RUNNER_CONFIG";

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Virtual mounts. The first one is the primary mount and working directory.
    #[serde(default)]
    pub mounts: Vec<MountEntry>,

    /// Pre-built environment directory to run every request in.
    #[serde(default)]
    pub environment_path: Option<PathBuf>,

    /// Create a disposable environment for every request.
    #[serde(default)]
    pub ephemeral: bool,

    /// Interpreter looked up on `PATH` when no environment is supplied.
    #[serde(default = "default_interpreter")]
    pub interpreter: PathBuf,

    /// Package manager looked up on `PATH` when no environment is supplied.
    #[serde(default = "default_package_manager")]
    pub package_manager: PathBuf,

    /// Maximum interpreter runs per request.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Wall-clock bound of one run, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Bound on one install or environment creation, in seconds.
    #[serde(default = "default_install_timeout")]
    pub install_timeout_seconds: u64,

    /// Parent directory for workspaces and ephemeral environments.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Extra import-name to package-name mappings.
    #[serde(default)]
    pub package_aliases: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mounts: Vec::new(),
            environment_path: None,
            ephemeral: false,
            interpreter: default_interpreter(),
            package_manager: default_package_manager(),
            max_attempts: default_max_attempts(),
            timeout_seconds: default_timeout(),
            install_timeout_seconds: default_install_timeout(),
            scratch_dir: None,
            package_aliases: HashMap::new(),
        }
    }
}

fn default_interpreter() -> PathBuf {
    "python3".into()
}

fn default_package_manager() -> PathBuf {
    "pip3".into()
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_timeout() -> u64 {
    30
}

const fn default_install_timeout() -> u64 {
    120
}

impl Config {
    /// Load configuration from `CODE_RUNNER_CONFIG`, or defaults if unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(json) => Self::from_json(&json)
                .with_context(|| format!("Failed to parse {CONFIG_ENV_VAR}")),
            Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Cannot read {CONFIG_ENV_VAR}")),
        }
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Parse a `HOST=VIRTUAL` mount argument.
    ///
    /// Splits on the last `=`, since virtual prefixes never contain one.
    pub fn parse_mount(spec: &str) -> Result<MountEntry> {
        let (host, virtual_prefix) = spec
            .rsplit_once('=')
            .with_context(|| format!("Mount '{spec}' must look like HOST=VIRTUAL"))?;
        Ok(MountEntry::new(host, virtual_prefix))
    }

    /// Check every setting the core relies on.
    pub fn validate(&self) -> Result<()> {
        self.mount_table()?;

        anyhow::ensure!(self.max_attempts >= 1, "max_attempts must be at least 1");
        anyhow::ensure!(self.timeout_seconds > 0, "timeout_seconds must be positive");
        anyhow::ensure!(
            self.install_timeout_seconds > 0,
            "install_timeout_seconds must be positive"
        );
        anyhow::ensure!(
            !self.interpreter.as_os_str().is_empty(),
            "interpreter must not be empty"
        );
        anyhow::ensure!(
            !self.package_manager.as_os_str().is_empty(),
            "package_manager must not be empty"
        );
        if let Some(path) = &self.environment_path {
            anyhow::ensure!(
                !path.as_os_str().is_empty(),
                "environment_path must not be empty"
            );
            if !path.is_dir() {
                warn!(path = %path.display(), "Supplied environment directory does not exist");
            }
            if self.ephemeral {
                info!("environment_path is set; ephemeral environments are disabled");
            }
        }
        Ok(())
    }

    /// Build the mount table, normalizing and validating every entry.
    ///
    /// Relative host paths are resolved against the current directory.
    /// Two mounts with the same virtual prefix are rejected, since neither
    /// would be more specific than the other.
    pub fn mount_table(&self) -> Result<MountTable> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(self.mounts.len());

        for mount in &self.mounts {
            anyhow::ensure!(
                !mount.host_path.as_os_str().is_empty(),
                "Mount for '{}' has an empty host path",
                mount.virtual_prefix
            );

            let virtual_prefix = normalize_virtual(&mount.virtual_prefix).with_context(|| {
                format!(
                    "Virtual prefix '{}' must be an absolute path",
                    mount.virtual_prefix
                )
            })?;

            anyhow::ensure!(
                seen.insert(virtual_prefix.clone()),
                "Virtual prefix '{virtual_prefix}' is mounted more than once"
            );

            let host_path = if mount.host_path.is_absolute() {
                mount.host_path.clone()
            } else {
                std::env::current_dir()
                    .context("Cannot resolve relative mount path")?
                    .join(&mount.host_path)
            };

            if !host_path.is_dir() {
                warn!(path = %host_path.display(), "Mounted host directory does not exist");
            }

            entries.push(MountEntry::new(host_path, virtual_prefix));
        }

        Ok(MountTable::new(entries))
    }

    /// Directory that holds per-request workspaces and environments.
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
