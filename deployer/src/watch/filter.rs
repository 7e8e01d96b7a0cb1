//! Path classification for watch events

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Path segments that never trigger a redeploy.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "node_modules",
    ".git",
    "target",
    "dist",
    "build",
    "__pycache__",
    ".venv",
    "venv",
    "vendor",
    ".idea",
    ".vscode",
    ".next",
    ".cache",
];

/// Drops events under excluded directories and editor temp files.
#[derive(Debug, Clone)]
pub struct PathFilter {
    excludes: HashSet<String>,
}

impl PathFilter {
    pub fn new(extra_excludes: &[String]) -> Self {
        let excludes = DEFAULT_EXCLUDES
            .iter()
            .map(|s| s.to_string())
            .chain(extra_excludes.iter().cloned())
            .collect();
        Self { excludes }
    }

    /// `relative` is the path below the repository directory.
    pub fn is_excluded(&self, relative: &Path) -> bool {
        let excluded_segment = relative.components().any(|c| match c {
            Component::Normal(segment) => self
                .excludes
                .contains(segment.to_string_lossy().as_ref()),
            _ => false,
        });
        if excluded_segment {
            return true;
        }

        relative
            .file_name()
            .map(|name| is_temp_file(&name.to_string_lossy()))
            .unwrap_or(false)
    }
}

impl Default for PathFilter {
    fn default() -> Self {
        Self::new(&[])
    }
}

/// Editor swap, backup and probe files.
pub fn is_temp_file(name: &str) -> bool {
    name.ends_with('~')
        || name.ends_with(".swp")
        || name.ends_with(".swx")
        || name.ends_with(".swo")
        || name.ends_with(".tmp")
        || name.starts_with(".#")
        || (name.len() > 1 && name.starts_with('#') && name.ends_with('#'))
        || name == "4913"
}

/// Name of `path` when it is a direct child of `root`.
pub fn top_level_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    }
}

/// Split a path below `root` into its repository directory and the path
/// inside that repository. `None` for `root` itself and its direct children.
pub fn split_repo(root: &Path, path: &Path) -> Option<(PathBuf, PathBuf)> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let repo = match components.next()? {
        Component::Normal(name) => root.join(name),
        _ => return None,
    };
    let inner = components.as_path().to_path_buf();
    if inner.as_os_str().is_empty() {
        return None;
    }
    Some((repo, inner))
}
