//! Plain-filesystem repository provider.
//!
//! Each project maps to a directory on disk. Local changes are observed by
//! the embedded `WatchService` and published on the repository's event bus;
//! writes coming from peers go through tokio::fs and then get their mtime
//! set to the resource timestamp so later comparisons are stable.

use crate::snapshot;
use crate::watcher::{WatchError, WatchService};
use async_trait::async_trait;
use filetime::FileTime;
use resync_core::events::RepositoryEventBus;
use resync_core::project::ProjectRegistry;
use resync_core::repository::{validate_root, RepositoryError, RepositoryProvider, Result};
use resync_core::resource::{normalize_path, Resource, ResourceType};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

impl From<WatchError> for RepositoryError {
    fn from(e: WatchError) -> Self {
        match e {
            WatchError::InvalidArgument(msg) => RepositoryError::InvalidArgument(msg),
            other => RepositoryError::Watch(other.to_string()),
        }
    }
}

/// Repository storing every project as a directory tree.
pub struct FsRepository {
    id: String,
    projects: Arc<ProjectRegistry>,
    events: Arc<RepositoryEventBus>,
    watcher: WatchService,
}

impl FsRepository {
    /// Create a repository with a fresh random identity.
    pub fn new() -> Result<Self> {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Result<Self> {
        let projects = Arc::new(ProjectRegistry::new());
        let events = Arc::new(RepositoryEventBus::new());
        let watcher = WatchService::start(Arc::clone(&projects), Arc::clone(&events))?;
        Ok(Self {
            id: id.into(),
            projects,
            events,
            watcher,
        })
    }

    /// Bus receiving CREATED/MODIFIED/DELETED events for local changes.
    pub fn events(&self) -> &Arc<RepositoryEventBus> {
        &self.events
    }

    pub fn watcher(&self) -> &WatchService {
        &self.watcher
    }

    pub fn project_root(&self, project_id: &str) -> Option<PathBuf> {
        self.projects.root(project_id)
    }

    /// Absolute path of `path` inside `project_id`, or `None` for unknown projects.
    fn locate(&self, project_id: &str, path: &str) -> Result<Option<(String, PathBuf)>> {
        let Some(root) = self.projects.root(project_id) else {
            return Ok(None);
        };
        let relative = normalize_path(path)?;
        let full = if relative.is_empty() {
            root
        } else {
            root.join(&relative)
        };
        Ok(Some((relative, full)))
    }

    /// Like `locate`, but refuses the project root itself.
    fn locate_entry(&self, resource: &Resource) -> Result<Option<PathBuf>> {
        match self.locate(resource.project_id(), resource.path())? {
            Some((relative, _)) if relative.is_empty() => Err(RepositoryError::InvalidArgument(
                format!("cannot modify the root of project {}", resource.project_id()),
            )),
            Some((_, full)) => Ok(Some(full)),
            None => {
                debug!("Ignoring {} for unknown project", resource);
                Ok(None)
            }
        }
    }
}

async fn exists(path: &Path) -> Result<bool> {
    fs::try_exists(path)
        .await
        .map_err(|e| RepositoryError::io(path, e))
}

fn set_mtime(path: &Path, timestamp: i64) -> Result<()> {
    let mtime = FileTime::from_unix_time(
        timestamp.div_euclid(1000),
        (timestamp.rem_euclid(1000) * 1_000_000) as u32,
    );
    filetime::set_file_mtime(path, mtime).map_err(|e| RepositoryError::io(path, e))
}

#[async_trait]
impl RepositoryProvider for FsRepository {
    fn repository_id(&self) -> &str {
        &self.id
    }

    async fn add_project(&self, id: &str, root: &Path) -> Result<bool> {
        if self.projects.contains(id) {
            return Ok(false);
        }
        validate_root(id, root)?;
        // Watch events report resolved paths (e.g. /private/var on macOS).
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

        if !self.projects.insert(id, root.clone()) {
            return Ok(false);
        }
        if let Err(e) = self.watcher.watch(&root) {
            self.projects.remove(id);
            return Err(e.into());
        }
        info!("Added project {} at {}", id, root.display());
        Ok(true)
    }

    async fn remove_project(&self, id: &str) -> Result<bool> {
        let Some(root) = self.projects.root(id) else {
            return Ok(false);
        };
        if root.is_dir() {
            self.watcher.unwatch(&root)?;
        } else {
            // Root vanished; its watches are stale but still registered.
            self.watcher.retire(&root);
        }
        self.projects.remove(id);
        info!("Removed project {}", id);
        Ok(true)
    }

    fn has_project(&self, id: &str) -> bool {
        self.projects.contains(id)
    }

    fn project_ids(&self) -> Vec<String> {
        self.projects.ids()
    }

    async fn get_resource(&self, project_id: &str, path: &str) -> Result<Option<Resource>> {
        let Some((relative, full)) = self.locate(project_id, path)? else {
            return Ok(None);
        };
        let metadata = match fs::metadata(&full).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RepositoryError::io(full, e)),
        };
        let content = if metadata.is_file() {
            fs::read(&full)
                .await
                .map_err(|e| RepositoryError::io(&full, e))?
        } else {
            Vec::new()
        };
        Ok(Some(snapshot::from_metadata(
            project_id, &relative, &metadata, content,
        )?))
    }

    async fn create_resource(&self, resource: &Resource) -> Result<()> {
        let Some(full) = self.locate_entry(resource)? else {
            return Ok(());
        };
        if exists(&full).await? {
            debug!("{} already exists, not overwriting", resource);
            return Ok(());
        }

        match resource.resource_type() {
            ResourceType::Folder => {
                fs::create_dir_all(&full)
                    .await
                    .map_err(|e| RepositoryError::io(&full, e))?;
            }
            ResourceType::File => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|e| RepositoryError::io(parent, e))?;
                }
                fs::write(&full, resource.content())
                    .await
                    .map_err(|e| RepositoryError::io(&full, e))?;
            }
            ResourceType::Unknown => {
                return Err(RepositoryError::InvalidArgument(format!(
                    "cannot create {} of unknown type",
                    resource.path()
                )));
            }
        }
        set_mtime(&full, resource.timestamp())?;
        debug!("Created {}", resource);
        Ok(())
    }

    async fn update_resource(&self, resource: &Resource) -> Result<()> {
        let Some(full) = self.locate_entry(resource)? else {
            return Ok(());
        };
        let metadata = match fs::metadata(&full).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} is absent, nothing to update", resource);
                return Ok(());
            }
            Err(e) => return Err(RepositoryError::io(full, e)),
        };

        if metadata.is_file() && resource.resource_type().is_file() {
            fs::write(&full, resource.content())
                .await
                .map_err(|e| RepositoryError::io(&full, e))?;
        }
        set_mtime(&full, resource.timestamp())?;
        debug!("Updated {}", resource);
        Ok(())
    }

    async fn delete_resource(&self, resource: &Resource) -> Result<()> {
        let Some(full) = self.locate_entry(resource)? else {
            return Ok(());
        };
        let metadata = match fs::symlink_metadata(&full).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(RepositoryError::io(full, e)),
        };

        let removed = if metadata.is_dir() {
            fs::remove_dir_all(&full).await
        } else {
            fs::remove_file(&full).await
        };
        match removed {
            Ok(()) => {
                debug!("Deleted {}:{}", resource.project_id(), resource.path());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RepositoryError::io(full, e)),
        }
    }
}
