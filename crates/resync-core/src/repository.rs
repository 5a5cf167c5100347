//! RepositoryProvider trait: the storage boundary used by protocol handlers.
//!
//! Implementations:
//! - `MemoryRepository` - For testing
//! - `FsRepository` (in resync-daemon) - Plain filesystem with a watch service

use crate::resource::{Resource, ResourceError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Watch error: {0}")]
    Watch(String),
}

impl RepositoryError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<ResourceError> for RepositoryError {
    fn from(e: ResourceError) -> Self {
        match e {
            ResourceError::InvalidArgument(msg) => Self::InvalidArgument(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Check that a project root is usable: absolute, existing, a directory.
pub fn validate_root(id: &str, root: &Path) -> Result<()> {
    if id.is_empty() {
        return Err(RepositoryError::InvalidArgument(
            "project id cannot be empty".to_string(),
        ));
    }
    if !root.is_absolute() {
        return Err(RepositoryError::InvalidArgument(format!(
            "project root must be absolute: {}",
            root.display()
        )));
    }
    if !root.is_dir() {
        return Err(RepositoryError::InvalidArgument(format!(
            "project root is not an existing directory: {}",
            root.display()
        )));
    }
    Ok(())
}

/// Storage backend holding synchronized projects.
///
/// Every mutating operation is idempotent: creating an existing resource,
/// updating or deleting a missing one are no-ops, never errors.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    /// Identity of this repository instance, used to recognize our own requests.
    fn repository_id(&self) -> &str;

    /// Register a project. Returns false if `id` is already registered.
    async fn add_project(&self, id: &str, root: &Path) -> Result<bool>;

    /// Unregister a project. Returns false if `id` is unknown.
    async fn remove_project(&self, id: &str) -> Result<bool>;

    fn has_project(&self, id: &str) -> bool;

    fn project_ids(&self) -> Vec<String>;

    /// Snapshot the resource at `path`, or `None` if project or entry is missing.
    async fn get_resource(&self, project_id: &str, path: &str) -> Result<Option<Resource>>;

    /// Create the resource unless something already exists at its path.
    async fn create_resource(&self, resource: &Resource) -> Result<()>;

    /// Overwrite content and timestamp if the path exists; no-op otherwise.
    async fn update_resource(&self, resource: &Resource) -> Result<()>;

    /// Remove the resource (recursively for folders); no-op if absent.
    async fn delete_resource(&self, resource: &Resource) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_root_rejects_relative() {
        let err = validate_root("P", Path::new("relative/dir")).unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidArgument(_)));
    }

    #[test]
    fn test_validate_root_rejects_empty_id() {
        let dir = std::env::temp_dir();
        assert!(validate_root("", &dir).is_err());
        assert!(validate_root("P", &dir).is_ok());
    }

    #[test]
    fn test_validate_root_rejects_missing() {
        let missing = std::env::temp_dir().join("resync-definitely-missing-root");
        assert!(validate_root("P", &missing).is_err());
    }
}
