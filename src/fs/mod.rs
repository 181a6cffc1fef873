//! Repository filesystem views.
//!
//! All paths are repository-relative, `/`-separated and normalised by
//! [`normalize_path`]; the repository root is the empty string.
//!
//! - [`RemoteTreeFs`] is a read-only view of a tree on the platform
//! - [`MemoryFs`] is a read-only view over an in-memory file map
//! - [`StagingFs`] is a copy-on-write overlay over either of them

mod memory;
mod remote;
mod staging;

pub use memory::MemoryFs;
pub use remote::RemoteTreeFs;
pub use staging::{Changelist, StagingFs};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::FsError;
pub use crate::platform::EntryKind;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type", serialize_with = "serialize_kind")]
    pub kind: EntryKind,
}

impl DirEntry {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Dir,
        }
    }
}

fn serialize_kind<S: serde::Serializer>(kind: &EntryKind, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(match kind {
        EntryKind::File => "file",
        EntryKind::Dir => "dir",
    })
}

/// Read-only filesystem operations.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>, FsError>;

    async fn file_exists(&self, path: &str) -> Result<bool, FsError>;

    async fn is_dir(&self, path: &str) -> Result<bool, FsError>;

    /// Immediate children of `path`, sorted by name.
    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError>;
}

/// Normalise a repository-relative path.
///
/// Strips `.` components, leading `./` and redundant separators; rejects
/// absolute paths and any `..` component.
pub fn normalize_path(path: &str) -> Result<String, FsError> {
    let trimmed = path.trim();
    if trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(FsError::InvalidPath {
            path: path.to_string(),
            reason: "absolute paths are not allowed".to_string(),
        });
    }

    let mut parts = Vec::new();
    for component in trimmed.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                return Err(FsError::InvalidPath {
                    path: path.to_string(),
                    reason: "parent directory references are not allowed".to_string(),
                });
            }
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

/// If `path` lies under `dir`, the name of the immediate child of `dir` that
/// leads to it and whether that child is `path` itself.
pub(crate) fn child_of<'a>(dir: &str, path: &'a str) -> Option<(&'a str, bool)> {
    let rest = if dir.is_empty() {
        path
    } else {
        path.strip_prefix(dir)?.strip_prefix('/')?
    };
    if rest.is_empty() {
        return None;
    }
    match rest.split_once('/') {
        Some((name, _)) => Some((name, false)),
        None => Some((rest, true)),
    }
}

/// Parent directories of `path`, nearest first. Excludes the root.
pub(crate) fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut cursor = path;
    std::iter::from_fn(move || {
        let (parent, _) = cursor.rsplit_once('/')?;
        cursor = parent;
        Some(parent)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("src/lib.rs").unwrap(), "src/lib.rs");
        assert_eq!(normalize_path("./src//lib.rs").unwrap(), "src/lib.rs");
        assert_eq!(normalize_path("src/./lib.rs").unwrap(), "src/lib.rs");
        assert_eq!(normalize_path("").unwrap(), "");
        assert_eq!(normalize_path(".").unwrap(), "");
        assert_eq!(normalize_path("docs/").unwrap(), "docs");
    }

    #[test]
    fn test_normalize_rejects_escapes() {
        assert!(matches!(
            normalize_path("/etc/passwd"),
            Err(FsError::InvalidPath { .. })
        ));
        assert!(matches!(
            normalize_path("src/../../secret"),
            Err(FsError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_child_of() {
        assert_eq!(child_of("", "README.md"), Some(("README.md", true)));
        assert_eq!(child_of("", "src/lib.rs"), Some(("src", false)));
        assert_eq!(child_of("src", "src/lib.rs"), Some(("lib.rs", true)));
        assert_eq!(child_of("src", "src/a/b.rs"), Some(("a", false)));
        assert_eq!(child_of("src", "srcfoo/lib.rs"), None);
        assert_eq!(child_of("src", "src"), None);
    }

    #[test]
    fn test_ancestors() {
        let all: Vec<&str> = ancestors("a/b/c.txt").collect();
        assert_eq!(all, vec!["a/b", "a"]);
        assert_eq!(ancestors("top.txt").count(), 0);
    }

    #[test]
    fn test_dir_entry_serializes_kind() {
        let json = serde_json::to_value(DirEntry::dir("src")).unwrap();
        assert_eq!(json, serde_json::json!({"name": "src", "type": "dir"}));
    }
}
