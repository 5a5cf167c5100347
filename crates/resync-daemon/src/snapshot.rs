//! Building `Resource` snapshots from filesystem entries.

use resync_core::resource::{now_millis, Resource, ResourceError, ResourceType};
use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Modification time in milliseconds since the epoch, or now if unavailable.
pub fn mtime_millis(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or_else(now_millis)
}

/// FILE or FOLDER depending on what the metadata describes.
pub fn type_of(metadata: &Metadata) -> ResourceType {
    if metadata.is_dir() {
        ResourceType::Folder
    } else if metadata.is_file() {
        ResourceType::File
    } else {
        ResourceType::Unknown
    }
}

/// Snapshot from already-read metadata and content.
pub fn from_metadata(
    project_id: &str,
    relative: &str,
    metadata: &Metadata,
    content: Vec<u8>,
) -> Result<Resource, ResourceError> {
    Resource::new(
        project_id,
        relative,
        mtime_millis(metadata),
        type_of(metadata),
        content,
    )
}

/// Blocking snapshot of the entry at `path`.
///
/// A missing entry yields an UNKNOWN resource stamped with the current time.
pub fn read_blocking(project_id: &str, relative: &str, path: &Path) -> io::Result<Resource> {
    let resource = match std::fs::metadata(path) {
        Ok(metadata) => {
            let content = if metadata.is_file() {
                std::fs::read(path)?
            } else {
                Vec::new()
            };
            from_metadata(project_id, relative, &metadata, content)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Resource::unknown(project_id, relative),
        Err(e) => return Err(e),
    };
    resource.map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}
