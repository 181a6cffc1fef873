//! Read-only view of a repository tree at a fixed revision.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OnceCell, RwLock};

use crate::error::FsError;
use crate::fs::{DirEntry, EntryKind, FileSystem, child_of, normalize_path};
use crate::platform::{PlatformClient, RepoRef, TreeEntry};

/// Platform-backed tree view.
///
/// The recursive tree listing is fetched once on first use; blob contents are
/// fetched lazily and cached by sha.
pub struct RemoteTreeFs {
    platform: Arc<dyn PlatformClient>,
    repo: RepoRef,
    tree_sha: String,
    index: OnceCell<BTreeMap<String, TreeEntry>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl RemoteTreeFs {
    pub fn new(platform: Arc<dyn PlatformClient>, repo: RepoRef, tree_sha: impl Into<String>) -> Self {
        Self {
            platform,
            repo,
            tree_sha: tree_sha.into(),
            index: OnceCell::new(),
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn tree_sha(&self) -> &str {
        &self.tree_sha
    }

    async fn index(&self) -> Result<&BTreeMap<String, TreeEntry>, FsError> {
        self.index
            .get_or_try_init(|| async {
                let entries = self.platform.get_tree(&self.repo, &self.tree_sha).await?;
                tracing::debug!(
                    "Indexed {} entries of tree {} in {}",
                    entries.len(),
                    self.tree_sha,
                    self.repo
                );
                Ok::<_, FsError>(entries.into_iter().map(|e| (e.path.clone(), e)).collect())
            })
            .await
    }

    async fn kind_of(&self, path: &str) -> Result<Option<EntryKind>, FsError> {
        if path.is_empty() {
            return Ok(Some(EntryKind::Dir));
        }
        Ok(self.index().await?.get(path).map(|e| e.kind))
    }
}

#[async_trait]
impl FileSystem for RemoteTreeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let path = normalize_path(path)?;
        let index = self.index().await?;
        let entry = match index.get(&path) {
            Some(e) if e.kind == EntryKind::File => e,
            Some(_) => return Err(FsError::IsDirectory(path)),
            None if path.is_empty() => return Err(FsError::IsDirectory(path)),
            None => return Err(FsError::FileNotFound(path)),
        };

        if let Some(cached) = self.blobs.read().await.get(&entry.sha) {
            return Ok(cached.clone());
        }
        let content = self.platform.get_blob(&self.repo, &entry.sha).await?;
        self.blobs
            .write()
            .await
            .insert(entry.sha.clone(), content.clone());
        Ok(content)
    }

    async fn file_exists(&self, path: &str) -> Result<bool, FsError> {
        let path = normalize_path(path)?;
        Ok(self.kind_of(&path).await? == Some(EntryKind::File))
    }

    async fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        let path = normalize_path(path)?;
        Ok(self.kind_of(&path).await? == Some(EntryKind::Dir))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let path = normalize_path(path)?;
        match self.kind_of(&path).await? {
            Some(EntryKind::Dir) => {}
            Some(EntryKind::File) => return Err(FsError::NotADirectory(path)),
            None => return Err(FsError::FileNotFound(path)),
        }

        let entries: BTreeSet<DirEntry> = self
            .index()
            .await?
            .values()
            .filter_map(|e| match child_of(&path, &e.path) {
                Some((name, true)) => Some(DirEntry {
                    name: name.to_string(),
                    kind: e.kind,
                }),
                _ => None,
            })
            .collect();
        Ok(entries.into_iter().collect())
    }
}
