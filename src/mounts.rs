//! Virtual path namespace backed by host directories.
//!
//! A `MountTable` maps absolute virtual prefixes (e.g. `/working`) onto host
//! directories. Bindings may nest: the most specific virtual prefix wins.
//! Path resolution is exact and component-based; the text rewriting helpers
//! are only used to make emitted source and output readable in the other
//! namespace.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// One virtual-prefix to host-directory binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// Directory on the host that backs the prefix.
    pub host_path: PathBuf,

    /// Absolute virtual prefix with no trailing separator (`/` for the root).
    pub virtual_prefix: String,
}

impl MountEntry {
    pub fn new(host_path: impl Into<PathBuf>, virtual_prefix: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            virtual_prefix: virtual_prefix.into(),
        }
    }
}

/// Immutable, specificity-ordered view over the configured mounts.
///
/// Built once at startup; shared read-only between requests.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    /// Configuration order. The first entry is the primary mount.
    entries: Vec<MountEntry>,
    /// Indices into `entries`, longest virtual prefix first.
    by_virtual: Vec<usize>,
    /// Indices into `entries`, longest host path first.
    by_host: Vec<usize>,
}

impl MountTable {
    /// Build a table from already validated entries.
    pub fn new(entries: Vec<MountEntry>) -> Self {
        let mut by_virtual: Vec<usize> = (0..entries.len()).collect();
        by_virtual.sort_by_key(|&i| std::cmp::Reverse(entries[i].virtual_prefix.len()));

        let mut by_host: Vec<usize> = (0..entries.len()).collect();
        by_host.sort_by_key(|&i| std::cmp::Reverse(entries[i].host_path.as_os_str().len()));

        Self {
            entries,
            by_virtual,
            by_host,
        }
    }

    /// Entries in configuration order.
    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// The first configured mount, used as working directory.
    pub fn primary(&self) -> Option<&MountEntry> {
        self.entries.first()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a virtual path to the host path backing it.
    ///
    /// `.` and `..` segments are folded before matching, so a path cannot
    /// climb out of one mount into another by traversal.
    pub fn resolve_virtual_to_host(&self, virtual_path: &str) -> Result<PathBuf, ExecError> {
        let outside = || ExecError::PathOutsideMounts {
            path: virtual_path.to_string(),
        };
        let normalized = normalize_virtual(virtual_path).ok_or_else(outside)?;

        self.by_virtual
            .iter()
            .map(|&i| &self.entries[i])
            .find_map(|entry| {
                strip_virtual_prefix(&normalized, &entry.virtual_prefix).map(|rest| {
                    if rest.is_empty() {
                        entry.host_path.clone()
                    } else {
                        entry.host_path.join(rest)
                    }
                })
            })
            .ok_or_else(outside)
    }

    /// Map a host path back into the virtual namespace.
    pub fn resolve_host_to_virtual(&self, host_path: &Path) -> Result<String, ExecError> {
        self.by_host
            .iter()
            .map(|&i| &self.entries[i])
            .find_map(|entry| {
                let rest = host_path.strip_prefix(&entry.host_path).ok()?;
                let segments: Vec<_> = rest
                    .components()
                    .filter_map(|c| match c {
                        Component::Normal(s) => Some(s.to_string_lossy()),
                        _ => None,
                    })
                    .collect();
                Some(join_virtual(&entry.virtual_prefix, &segments.join("/")))
            })
            .ok_or_else(|| ExecError::PathOutsideMounts {
                path: host_path.display().to_string(),
            })
    }

    /// Rewrite virtual path literals in source text to their host paths.
    pub fn virtual_to_host_text(&self, text: &str) -> String {
        let pairs: Vec<(String, String)> = self
            .by_virtual
            .iter()
            .map(|&i| &self.entries[i])
            .map(|e| (e.virtual_prefix.clone(), e.host_path.display().to_string()))
            .collect();
        rewrite_text(text, &pairs, Direction::ToHost)
    }

    /// Rewrite host paths in emitted text back to their virtual form.
    ///
    /// `aliases` are extra host-to-display pairs (such as a workspace
    /// directory) merged with the mounts; the longest host path wins.
    pub fn host_to_virtual_text(&self, text: &str, aliases: &[(String, String)]) -> String {
        let mut pairs: Vec<(String, String)> = self
            .by_host
            .iter()
            .map(|&i| &self.entries[i])
            .map(|e| (e.host_path.display().to_string(), e.virtual_prefix.clone()))
            .collect();
        pairs.extend_from_slice(aliases);
        pairs.sort_by_key(|(from, _)| std::cmp::Reverse(from.len()));
        rewrite_text(text, &pairs, Direction::ToVirtual)
    }
}

/// Fold an absolute virtual path into canonical form.
///
/// Returns `None` for relative paths. The result has no trailing separator
/// except for the root itself.
pub fn normalize_virtual(path: &str) -> Option<String> {
    if !path.starts_with('/') {
        return None;
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    Some(format!("/{}", segments.join("/")))
}

/// Remainder of `path` below `prefix`, or `None` if `prefix` does not cover it.
///
/// An exact match yields an empty remainder; a partial segment match
/// (`/working2` against `/working`) does not match.
fn strip_virtual_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return path.strip_prefix('/');
    }
    if path == prefix {
        return Some("");
    }
    path.strip_prefix(prefix)?.strip_prefix('/')
}

fn join_virtual(prefix: &str, rest: &str) -> String {
    match (prefix, rest) {
        (p, "") => p.to_string(),
        ("/", r) => format!("/{r}"),
        (p, r) => format!("{p}/{r}"),
    }
}

const fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '\\')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Source text: only exact path tokens are rewritten.
    ToHost,
    /// Emitted text: also paths ending a sentence or following a `scheme://`.
    ToVirtual,
}

/// Replace each `from` with `to` wherever it appears as a whole path prefix.
///
/// `pairs` are tried in order, so callers pass them longest first. A match
/// must start at a non-path character and be followed by a separator or a
/// non-path character. The bare root `/` is never rewritten in text.
fn rewrite_text(text: &str, pairs: &[(String, String)], direction: Direction) -> String {
    let pairs: Vec<_> = pairs
        .iter()
        .filter(|(from, _)| !from.is_empty() && from != "/")
        .collect();
    if pairs.is_empty() {
        return text.to_string();
    }

    let lenient = direction == Direction::ToVirtual;
    let mut out = String::with_capacity(text.len());
    let mut prev: Option<char> = None;
    let mut i = 0;

    'scan: while i < text.len() {
        let rest = &text[i..];

        let starts_token = prev.map_or(true, |c| !is_path_char(c))
            || (lenient && text[..i].ends_with("://"));
        if starts_token {
            for (from, to) in &pairs {
                let Some(after) = rest.strip_prefix(from.as_str()) else {
                    continue;
                };
                let mut next = after.chars();
                let bounded = match next.next() {
                    None | Some('/' | '\\') => true,
                    Some('.') if lenient => next.next().map_or(true, char::is_whitespace),
                    Some(c) => !is_path_char(c),
                };
                if bounded {
                    out.push_str(to);
                    i += from.len();
                    prev = from.chars().last();
                    continue 'scan;
                }
            }
        }

        let Some(c) = rest.chars().next() else {
            break;
        };
        out.push(c);
        i += c.len_utf8();
        prev = Some(c);
    }

    out
}
