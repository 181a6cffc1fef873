//! Read-only filesystem over an in-memory file map.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::error::FsError;
use crate::fs::{DirEntry, FileSystem, child_of, normalize_path};

/// Immutable map of files. Directories are implied by path prefixes.
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_files(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(path, content)| (path.to_string(), content.as_bytes().to_vec()))
                .collect(),
        }
    }

    fn has_descendant(&self, dir: &str) -> bool {
        dir.is_empty() || self.files.keys().any(|p| child_of(dir, p).is_some())
    }
}

#[async_trait]
impl FileSystem for MemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let path = normalize_path(path)?;
        if let Some(content) = self.files.get(&path) {
            return Ok(content.clone());
        }
        if self.has_descendant(&path) {
            return Err(FsError::IsDirectory(path));
        }
        Err(FsError::FileNotFound(path))
    }

    async fn file_exists(&self, path: &str) -> Result<bool, FsError> {
        Ok(self.files.contains_key(&normalize_path(path)?))
    }

    async fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        Ok(self.has_descendant(&normalize_path(path)?))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let path = normalize_path(path)?;
        if self.files.contains_key(&path) {
            return Err(FsError::NotADirectory(path));
        }
        if !self.has_descendant(&path) {
            return Err(FsError::FileNotFound(path));
        }

        let entries: BTreeSet<DirEntry> = self
            .files
            .keys()
            .filter_map(|p| child_of(&path, p))
            .map(|(name, leaf)| {
                if leaf {
                    DirEntry::file(name)
                } else {
                    DirEntry::dir(name)
                }
            })
            .collect();
        Ok(entries.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_fs_listing() {
        let fs = MemoryFs::from_files(&[("README.md", "hi"), ("src/lib.rs", ""), ("src/a/b.rs", "")]);

        assert_eq!(
            fs.list_dir("").await.unwrap(),
            vec![DirEntry::file("README.md"), DirEntry::dir("src")]
        );
        assert_eq!(
            fs.list_dir("src").await.unwrap(),
            vec![DirEntry::dir("a"), DirEntry::file("lib.rs")]
        );
        assert!(matches!(fs.list_dir("nope").await, Err(FsError::FileNotFound(_))));
        assert!(matches!(fs.list_dir("README.md").await, Err(FsError::NotADirectory(_))));
        assert!(matches!(fs.read("src").await, Err(FsError::IsDirectory(_))));
        assert!(fs.is_dir("src/a").await.unwrap());
        assert_eq!(fs.read("README.md").await.unwrap(), b"hi");
    }
}
