//! Registry of synchronized projects.
//!
//! Maps project ids to their absolute root directories and resolves absolute
//! paths back to `(project, relative path)` pairs.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

/// A path resolved against a registered project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub project_id: String,
    /// Relative path with `/` separators; empty for the root itself.
    pub relative: String,
}

/// Thread-safe `project id -> root` map.
///
/// Wrap in `Arc` to share between the repository provider and its watch service.
#[derive(Default)]
pub struct ProjectRegistry {
    roots: RwLock<HashMap<String, PathBuf>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` unless it already exists. Returns false for duplicates.
    pub fn insert(&self, id: &str, root: PathBuf) -> bool {
        let mut roots = self.roots.write().unwrap_or_else(|e| e.into_inner());
        if roots.contains_key(id) {
            return false;
        }
        roots.insert(id.to_string(), root);
        true
    }

    /// Remove `id`, returning its root if it was registered.
    pub fn remove(&self, id: &str) -> Option<PathBuf> {
        self.roots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn root(&self, id: &str) -> Option<PathBuf> {
        self.roots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.roots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .roots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.roots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the project whose root contains `path`.
    ///
    /// When roots are nested, the deepest root wins.
    pub fn resolve(&self, path: &Path) -> Option<ResolvedPath> {
        let roots = self.roots.read().unwrap_or_else(|e| e.into_inner());
        roots
            .iter()
            .filter_map(|(id, root)| {
                let rest = path.strip_prefix(root).ok()?;
                Some((id, root.components().count(), rest))
            })
            .max_by_key(|(_, depth, _)| *depth)
            .map(|(id, _, rest)| ResolvedPath {
                project_id: id.clone(),
                relative: to_relative_string(rest),
            })
    }
}

/// Join a relative filesystem path with `/`, whatever the platform separator.
pub fn to_relative_string(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
