//! In-memory repository for testing protocol handlers without a filesystem.

use crate::project::ProjectRegistry;
use crate::repository::{validate_root, RepositoryError, RepositoryProvider, Result};
use crate::resource::{Resource, ResourceType};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

#[derive(Debug, Clone)]
struct Entry {
    resource_type: ResourceType,
    timestamp: i64,
    content: Vec<u8>,
}

/// Repository keeping every resource in a map keyed by `(project, path)`.
pub struct MemoryRepository {
    id: String,
    projects: ProjectRegistry,
    entries: RwLock<BTreeMap<(String, String), Entry>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            projects: ProjectRegistry::new(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a project without touching the real filesystem.
    pub fn add_virtual_project(&self, id: &str) -> bool {
        self.projects.insert(id, std::env::temp_dir().join(id))
    }

    /// Number of stored entries across all projects.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a mutation of `resource` should be applied. The project root is never a target.
    fn writable(&self, resource: &Resource) -> Result<bool> {
        if !self.projects.contains(resource.project_id()) {
            return Ok(false);
        }
        if resource.path().is_empty() {
            return Err(RepositoryError::InvalidArgument(format!(
                "cannot modify the root of project {}",
                resource.project_id()
            )));
        }
        Ok(true)
    }

    fn key(resource: &Resource) -> (String, String) {
        (
            resource.project_id().to_string(),
            resource.path().to_string(),
        )
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RepositoryProvider for MemoryRepository {
    fn repository_id(&self) -> &str {
        &self.id
    }

    async fn add_project(&self, id: &str, root: &Path) -> Result<bool> {
        if self.projects.contains(id) {
            return Ok(false);
        }
        validate_root(id, root)?;
        Ok(self.projects.insert(id, root.to_path_buf()))
    }

    async fn remove_project(&self, id: &str) -> Result<bool> {
        Ok(self.projects.remove(id).is_some())
    }

    fn has_project(&self, id: &str) -> bool {
        self.projects.contains(id)
    }

    fn project_ids(&self) -> Vec<String> {
        self.projects.ids()
    }

    async fn get_resource(&self, project_id: &str, path: &str) -> Result<Option<Resource>> {
        if !self.projects.contains(project_id) {
            return Ok(None);
        }
        let path = crate::resource::normalize_path(path)?;
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(&(project_id.to_string(), path.clone())) {
            Some(entry) => Ok(Some(Resource::new(
                project_id,
                &path,
                entry.timestamp,
                entry.resource_type,
                entry.content.clone(),
            )?)),
            None => Ok(None),
        }
    }

    async fn create_resource(&self, resource: &Resource) -> Result<()> {
        if !self.writable(resource)? {
            return Ok(());
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.entry(Self::key(resource)).or_insert_with(|| Entry {
            resource_type: resource.resource_type(),
            timestamp: resource.timestamp(),
            content: resource.content().to_vec(),
        });
        Ok(())
    }

    async fn update_resource(&self, resource: &Resource) -> Result<()> {
        if !self.writable(resource)? {
            return Ok(());
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(&Self::key(resource)) {
            if entry.resource_type.is_file() {
                entry.content = resource.content().to_vec();
            }
            entry.timestamp = resource.timestamp();
        }
        Ok(())
    }

    async fn delete_resource(&self, resource: &Resource) -> Result<()> {
        if !self.writable(resource)? {
            return Ok(());
        }
        let project = resource.project_id();
        let path = resource.path();
        let prefix = format!("{}/", path);
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(p, entry_path), _| {
                p != project || (entry_path != path && !entry_path.starts_with(&prefix))
            });
        Ok(())
    }
}
