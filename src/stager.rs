//! Workspace staging.
//!
//! Writes the code units of one request into a fresh temporary directory,
//! translating virtual path literals to host paths on the way in, and maps
//! host paths in captured output back to virtual ones on the way out.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::ExecError;
use crate::mounts::{normalize_virtual, MountTable};

/// File name used for the entry point of code-string requests.
pub const DEFAULT_ENTRY_POINT: &str = "main.py";

/// One named source blob to place in the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionUnit {
    pub source_name: String,
    pub source_text: String,
    pub is_entry_point: bool,
}

impl ExecutionUnit {
    pub fn entry_point(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_name: name.into(),
            source_text: text.into(),
            is_entry_point: true,
        }
    }

    pub fn support(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_name: name.into(),
            source_text: text.into(),
            is_entry_point: false,
        }
    }
}

/// Per-request scratch directory holding the staged sources.
///
/// Removed when closed or dropped.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    entry_point: PathBuf,
    /// Host strings to hide from output, with their replacements.
    aliases: Vec<(String, String)>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Host path of the staged entry-point file.
    pub fn entry_point(&self) -> &Path {
        &self.entry_point
    }

    /// Remove the workspace, logging rather than failing on error.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!(path = %path.display(), "Removed workspace"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove workspace"),
        }
    }
}

/// Materializes execution units into workspaces.
#[derive(Debug, Clone)]
pub struct CodeStager {
    mounts: Arc<MountTable>,
    scratch_dir: PathBuf,
}

impl CodeStager {
    pub const fn new(mounts: Arc<MountTable>, scratch_dir: PathBuf) -> Self {
        Self {
            mounts,
            scratch_dir,
        }
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Stage a set of units. Exactly one must be the entry point.
    pub fn stage(&self, units: &[ExecutionUnit]) -> Result<Workspace, ExecError> {
        let mut workspace = self.stage_units(units)?;
        workspace
            .aliases
            .push((workspace.path().display().to_string(), "<workspace>".into()));
        Ok(workspace)
    }

    /// Stage an existing file addressed by its virtual path.
    ///
    /// The staged copy is reported under the caller's virtual path.
    pub fn stage_file(&self, virtual_path: &str) -> Result<Workspace, ExecError> {
        let host_path = self.mounts.resolve_virtual_to_host(virtual_path)?;

        let source_text = std::fs::read_to_string(&host_path).map_err(|e| {
            ExecError::staging(format!("cannot read '{virtual_path}': {e}"))
        })?;
        let source_name = host_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ExecError::staging(format!("'{virtual_path}' is not a file")))?;

        let mut workspace =
            self.stage_units(&[ExecutionUnit::entry_point(source_name, source_text)])?;

        let shown_as = normalize_virtual(virtual_path).unwrap_or_else(|| virtual_path.to_string());
        workspace
            .aliases
            .push((workspace.entry_point().display().to_string(), shown_as));
        workspace
            .aliases
            .push((workspace.path().display().to_string(), "<workspace>".into()));
        Ok(workspace)
    }

    /// Rewrite host paths in captured text back into the caller's namespace.
    pub fn to_virtual_text(&self, workspace: Option<&Workspace>, text: &str) -> String {
        let aliases = workspace.map_or(&[][..], |ws| ws.aliases.as_slice());
        self.mounts.host_to_virtual_text(text, aliases)
    }

    fn stage_units(&self, units: &[ExecutionUnit]) -> Result<Workspace, ExecError> {
        let entry_count = units.iter().filter(|u| u.is_entry_point).count();
        if entry_count != 1 {
            return Err(ExecError::staging(format!(
                "expected exactly one entry point, got {entry_count}"
            )));
        }

        let dir = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(&self.scratch_dir)
            .map_err(|e| {
                ExecError::staging(format!(
                    "cannot create workspace in {}: {e}",
                    self.scratch_dir.display()
                ))
            })?;

        let mut entry_point = None;
        for unit in units {
            if !is_plain_file_name(&unit.source_name) {
                return Err(ExecError::staging(format!(
                    "invalid source file name '{}'",
                    unit.source_name
                )));
            }

            let target = dir.path().join(&unit.source_name);
            let text = self.mounts.virtual_to_host_text(&unit.source_text);
            std::fs::write(&target, text).map_err(|e| {
                ExecError::staging(format!("cannot write '{}': {e}", unit.source_name))
            })?;

            if unit.is_entry_point {
                entry_point = Some(target);
            }
        }

        let entry_point = entry_point
            .ok_or_else(|| ExecError::staging("entry point was not written"))?;

        debug!(
            workspace = %dir.path().display(),
            files = units.len(),
            "Staged workspace"
        );

        Ok(Workspace {
            dir,
            entry_point,
            aliases: Vec::new(),
        })
    }
}

/// A single relative path component, so a unit cannot escape its workspace.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
