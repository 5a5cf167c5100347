//! Resource value objects.
//!
//! A `Resource` is an immutable snapshot of one file or folder inside a
//! project: where it lives, when it last changed, what it contains, and the
//! content hash peers compare to decide whether a transfer is needed.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Hash used for every resource that carries no content (folders, deleted entries).
pub const EMPTY_HASH: &str = "0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, ResourceError>;

/// Kind of entry a resource describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceType {
    File,
    Folder,
    /// The entry is gone and its former type cannot be recovered.
    Unknown,
}

impl ResourceType {
    pub fn is_file(&self) -> bool {
        matches!(self, Self::File)
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, Self::Folder)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "FILE"),
            Self::Folder => write!(f, "FOLDER"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Compute the content hash for a resource of the given type.
///
/// Files hash to the lowercase hex SHA-1 of their bytes; everything else
/// hashes to [`EMPTY_HASH`].
pub fn content_hash(resource_type: ResourceType, content: &[u8]) -> String {
    match resource_type {
        ResourceType::File => {
            let mut hasher = Sha1::new();
            hasher.update(content);
            hex::encode(hasher.finalize())
        }
        ResourceType::Folder | ResourceType::Unknown => EMPTY_HASH.to_string(),
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Normalize a project-relative path to forward slashes without a trailing slash.
///
/// Rejects absolute paths and `..` components.
pub fn normalize_path(path: &str) -> Result<String> {
    let unified = path.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Err(ResourceError::InvalidArgument(format!(
            "resource path must be relative: {}",
            path
        )));
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(ResourceError::InvalidArgument(format!(
                    "resource path escapes the project root: {}",
                    path
                )));
            }
            other => segments.push(other),
        }
    }

    Ok(segments.join("/"))
}

/// `C:` or `C:/...`. Names like `a:b.txt` are ordinary relative paths.
fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes.len() == 2 || bytes[2] == b'/')
}

/// Immutable snapshot of a synchronized file or folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    project_id: String,
    path: String,
    timestamp: i64,
    resource_type: ResourceType,
    hash: String,
    content: Vec<u8>,
}

impl Resource {
    /// Build a resource, computing its hash from type and content.
    ///
    /// Content is discarded for folders and unknown entries.
    pub fn new(
        project_id: impl Into<String>,
        path: &str,
        timestamp: i64,
        resource_type: ResourceType,
        content: Vec<u8>,
    ) -> Result<Self> {
        let project_id = project_id.into();
        if project_id.is_empty() {
            return Err(ResourceError::InvalidArgument(
                "project id cannot be empty".to_string(),
            ));
        }
        let path = normalize_path(path)?;
        let content = if resource_type.is_file() {
            content
        } else {
            Vec::new()
        };
        let hash = content_hash(resource_type, &content);

        Ok(Self {
            project_id,
            path,
            timestamp,
            resource_type,
            hash,
            content,
        })
    }

    pub fn file(
        project_id: impl Into<String>,
        path: &str,
        timestamp: i64,
        content: Vec<u8>,
    ) -> Result<Self> {
        Self::new(project_id, path, timestamp, ResourceType::File, content)
    }

    pub fn folder(project_id: impl Into<String>, path: &str, timestamp: i64) -> Result<Self> {
        Self::new(project_id, path, timestamp, ResourceType::Folder, Vec::new())
    }

    /// Resource for an entry that no longer exists, stamped with the current time.
    pub fn unknown(project_id: impl Into<String>, path: &str) -> Result<Self> {
        Self::new(
            project_id,
            path,
            now_millis(),
            ResourceType::Unknown,
            Vec::new(),
        )
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Path relative to the project root, using `/` separators.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last modification time in milliseconds since epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_content(self) -> Vec<u8> {
        self.content
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} ({}, {})",
            self.project_id, self.path, self.resource_type, self.hash
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_hash_is_sha1_hex() {
        let resource = Resource::file("P", "a.txt", 1, b"hello".to_vec()).unwrap();
        assert_eq!(resource.hash(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(resource.resource_type(), ResourceType::File);
        assert_eq!(resource.content(), b"hello");
    }

    #[test]
    fn test_equal_content_equal_hash() {
        let a = Resource::file("P", "a.txt", 1, b"same".to_vec()).unwrap();
        let b = Resource::file("Q", "dir/b.txt", 99, b"same".to_vec()).unwrap();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_folder_and_unknown_hash_to_zero() {
        assert_eq!(content_hash(ResourceType::Folder, b"ignored"), EMPTY_HASH);
        assert_eq!(content_hash(ResourceType::Unknown, b"ignored"), EMPTY_HASH);

        let folder = Resource::new("P", "dir", 5, ResourceType::Folder, b"x".to_vec()).unwrap();
        assert_eq!(folder.hash(), "0");
        assert!(folder.content().is_empty());

        let gone = Resource::unknown("P", "dir/file").unwrap();
        assert_eq!(gone.hash(), "0");
        assert!(gone.timestamp() > 0);
    }

    #[test]
    fn test_empty_file_hash() {
        assert_eq!(
            content_hash(ResourceType::File, b""),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(normalize_path("b/").unwrap(), "b");
        assert_eq!(normalize_path("a\\b\\c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(normalize_path("./a//b").unwrap(), "a/b");
        assert_eq!(normalize_path("").unwrap(), "");
        assert_eq!(normalize_path("a:b.txt").unwrap(), "a:b.txt");
        assert_eq!(normalize_path("notes/x:y").unwrap(), "notes/x:y");
    }

    #[test]
    fn test_rejects_absolute_and_escaping_paths() {
        assert!(normalize_path("/etc/passwd").is_err());
        assert!(normalize_path("C:/Windows").is_err());
        assert!(normalize_path("C:\\Windows").is_err());
        assert!(normalize_path("d:").is_err());
        assert!(normalize_path("a/../../b").is_err());
    }

    #[test]
    fn test_rejects_empty_project_id() {
        let err = Resource::folder("", "dir", 0).unwrap_err();
        assert!(matches!(err, ResourceError::InvalidArgument(_)));
    }
}
