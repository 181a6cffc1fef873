//! Copy-on-write staging overlay.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::FsError;
use crate::fs::{DirEntry, EntryKind, FileSystem, ancestors, child_of, normalize_path};

/// The writes and deletions accumulated by one task attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changelist {
    pub writes: BTreeMap<String, Vec<u8>>,
    pub deletes: BTreeSet<String>,
}

impl Changelist {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len() + self.deletes.len()
    }

    /// Every touched path, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self
            .writes
            .keys()
            .chain(self.deletes.iter())
            .map(String::as_str)
            .collect();
        paths.sort_unstable();
        paths
    }
}

/// In-memory overlay over a read-only base.
///
/// A path is never in both `working_tree` and `deleted`.
pub struct StagingFs {
    base: Arc<dyn FileSystem>,
    working_tree: BTreeMap<String, Vec<u8>>,
    deleted: BTreeSet<String>,
}

impl StagingFs {
    pub fn new(base: Arc<dyn FileSystem>) -> Self {
        Self {
            base,
            working_tree: BTreeMap::new(),
            deleted: BTreeSet::new(),
        }
    }

    /// Stage `content` at `path`.
    pub async fn write(&mut self, path: &str, content: Vec<u8>) -> Result<(), FsError> {
        let path = normalize_path(path)?;
        if path.is_empty() {
            return Err(FsError::IsDirectory(path));
        }
        if self.is_dir(&path).await? {
            return Err(FsError::IsDirectory(path));
        }
        for parent in ancestors(&path) {
            if self.file_exists(parent).await? {
                return Err(FsError::NotADirectory(parent.to_string()));
            }
        }

        self.deleted.remove(&path);
        self.working_tree.insert(path, content);
        Ok(())
    }

    /// Stage the removal of the file at `path`.
    pub async fn delete(&mut self, path: &str) -> Result<(), FsError> {
        let path = normalize_path(path)?;
        if self.deleted.contains(&path) {
            return Err(FsError::FileNotFound(path));
        }

        let in_base = self.base.file_exists(&path).await?;
        if self.working_tree.remove(&path).is_some() {
            if in_base {
                self.deleted.insert(path);
            }
            return Ok(());
        }
        if in_base {
            self.deleted.insert(path);
            return Ok(());
        }
        if self.is_dir(&path).await? {
            return Err(FsError::IsDirectory(path));
        }
        Err(FsError::FileNotFound(path))
    }

    /// Snapshot the overlay. The overlay stays writable.
    pub fn get_changelist(&self) -> Changelist {
        Changelist {
            writes: self.working_tree.clone(),
            deletes: self.deleted.clone(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.working_tree.is_empty() && self.deleted.is_empty()
    }

    fn overlay_has_descendant(&self, dir: &str) -> bool {
        self.working_tree
            .keys()
            .any(|p| child_of(dir, p).is_some())
    }

    fn is_deleted(&self, path: &str) -> bool {
        self.deleted.contains(path)
    }

    /// Whether the base directory `dir` still holds a file that has not been
    /// deleted. A directory whose files are all deleted no longer exists.
    async fn base_dir_survives(&self, dir: &str) -> Result<bool, FsError> {
        if !self.deleted.iter().any(|p| child_of(dir, p).is_some()) {
            return Ok(true);
        }
        let mut pending = vec![dir.to_string()];
        while let Some(current) = pending.pop() {
            for entry in self.base.list_dir(&current).await? {
                let full = join(&current, &entry.name);
                match entry.kind {
                    EntryKind::File if !self.is_deleted(&full) => return Ok(true),
                    EntryKind::File => {}
                    EntryKind::Dir => pending.push(full),
                }
            }
        }
        Ok(false)
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

#[async_trait]
impl FileSystem for StagingFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let path = normalize_path(path)?;
        if self.is_deleted(&path) {
            return Err(FsError::FileNotFound(path));
        }
        if let Some(content) = self.working_tree.get(&path) {
            return Ok(content.clone());
        }
        if self.overlay_has_descendant(&path) {
            return Err(FsError::IsDirectory(path));
        }
        self.base.read(&path).await
    }

    async fn file_exists(&self, path: &str) -> Result<bool, FsError> {
        let path = normalize_path(path)?;
        if self.is_deleted(&path) {
            return Ok(false);
        }
        if self.working_tree.contains_key(&path) {
            return Ok(true);
        }
        self.base.file_exists(&path).await
    }

    async fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        let path = normalize_path(path)?;
        if path.is_empty() || self.overlay_has_descendant(&path) {
            return Ok(true);
        }
        if self.working_tree.contains_key(&path) {
            return Ok(false);
        }
        if !self.base.is_dir(&path).await? {
            return Ok(false);
        }
        self.base_dir_survives(&path).await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let path = normalize_path(path)?;
        if self.file_exists(&path).await? {
            return Err(FsError::NotADirectory(path));
        }

        let mut entries: BTreeMap<String, EntryKind> = BTreeMap::new();
        let base_is_dir = self.base.is_dir(&path).await?;
        let exists = path.is_empty()
            || self.overlay_has_descendant(&path)
            || (base_is_dir && self.base_dir_survives(&path).await?);
        if !exists {
            return Err(FsError::FileNotFound(path));
        }
        if base_is_dir {
            for entry in self.base.list_dir(&path).await? {
                if entry.kind == EntryKind::Dir {
                    let full = join(&path, &entry.name);
                    if !self.overlay_has_descendant(&full) && !self.base_dir_survives(&full).await? {
                        continue;
                    }
                }
                entries.insert(entry.name, entry.kind);
            }
        }

        for staged in self.working_tree.keys() {
            if let Some((name, leaf)) = child_of(&path, staged) {
                let kind = if leaf { EntryKind::File } else { EntryKind::Dir };
                entries.insert(name.to_string(), kind);
            }
        }
        for removed in &self.deleted {
            if let Some((name, true)) = child_of(&path, removed) {
                entries.remove(name);
            }
        }

        Ok(entries
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;

    fn staging() -> StagingFs {
        StagingFs::new(Arc::new(MemoryFs::from_files(&[
            ("README.md", "readme"),
            ("src/lib.rs", "pub fn a() {}"),
            ("src/old.rs", "old"),
        ])))
    }

    fn assert_disjoint(fs: &StagingFs) {
        let cl = fs.get_changelist();
        for path in cl.writes.keys() {
            assert!(!cl.deletes.contains(path), "{} in both sets", path);
        }
    }

    // ==================== Overlay semantics ====================

    #[tokio::test]
    async fn test_read_falls_through_to_base() {
        let fs = staging();
        assert_eq!(fs.read("README.md").await.unwrap(), b"readme");
        assert!(fs.is_clean());
    }

    #[tokio::test]
    async fn test_write_shadows_base() {
        let mut fs = staging();
        fs.write("README.md", b"new".to_vec()).await.unwrap();
        assert_eq!(fs.read("README.md").await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_read_after_delete_is_not_found() {
        let mut fs = staging();
        fs.delete("src/old.rs").await.unwrap();
        assert!(matches!(fs.read("src/old.rs").await, Err(FsError::FileNotFound(_))));
        assert!(!fs.file_exists("src/old.rs").await.unwrap());

        // also for a file that only ever lived in the overlay
        fs.write("tmp.txt", b"x".to_vec()).await.unwrap();
        fs.delete("tmp.txt").await.unwrap();
        assert!(matches!(fs.read("tmp.txt").await, Err(FsError::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_write_and_delete_keep_sets_disjoint() {
        let mut fs = staging();
        fs.delete("src/lib.rs").await.unwrap();
        assert_disjoint(&fs);
        fs.write("src/lib.rs", b"again".to_vec()).await.unwrap();
        assert_disjoint(&fs);
        fs.delete("src/lib.rs").await.unwrap();
        assert_disjoint(&fs);
        fs.write("new.rs", b"n".to_vec()).await.unwrap();
        fs.delete("new.rs").await.unwrap();
        assert_disjoint(&fs);

        let cl = fs.get_changelist();
        assert!(cl.writes.is_empty());
        assert_eq!(cl.deletes.iter().collect::<Vec<_>>(), vec!["src/lib.rs"]);
    }

    #[tokio::test]
    async fn test_list_dir_unions_and_subtracts() {
        let mut fs = staging();
        fs.write("src/new.rs", b"n".to_vec()).await.unwrap();
        fs.write("src/nested/mod.rs", b"m".to_vec()).await.unwrap();
        fs.delete("src/old.rs").await.unwrap();

        assert_eq!(
            fs.list_dir("src").await.unwrap(),
            vec![
                DirEntry::file("lib.rs"),
                DirEntry::dir("nested"),
                DirEntry::file("new.rs"),
            ]
        );
        assert_eq!(
            fs.list_dir("src/nested").await.unwrap(),
            vec![DirEntry::file("mod.rs")]
        );
    }

    #[tokio::test]
    async fn test_directory_with_every_file_deleted_is_gone() {
        let mut fs = staging();
        fs.delete("src/lib.rs").await.unwrap();
        fs.delete("src/old.rs").await.unwrap();

        assert!(!fs.is_dir("src").await.unwrap());
        assert_eq!(fs.list_dir("").await.unwrap(), vec![DirEntry::file("README.md")]);
        assert!(matches!(fs.list_dir("src").await, Err(FsError::FileNotFound(_))));

        // the name is free for a file
        fs.write("src", b"not a dir".to_vec()).await.unwrap();
        assert_eq!(fs.read("src").await.unwrap(), b"not a dir");
        assert_eq!(
            fs.list_dir("").await.unwrap(),
            vec![DirEntry::file("README.md"), DirEntry::file("src")]
        );
        assert_disjoint(&fs);
    }

    #[tokio::test]
    async fn test_emptied_nested_directory_leaves_parent() {
        let mut fs = StagingFs::new(Arc::new(MemoryFs::from_files(&[
            ("docs/guide/intro.md", "intro"),
            ("docs/index.md", "index"),
        ])));
        fs.delete("docs/guide/intro.md").await.unwrap();

        assert!(!fs.is_dir("docs/guide").await.unwrap());
        assert!(fs.is_dir("docs").await.unwrap());
        assert_eq!(fs.list_dir("docs").await.unwrap(), vec![DirEntry::file("index.md")]);

        // staging a file inside brings the directory back
        fs.write("docs/guide/setup.md", b"setup".to_vec()).await.unwrap();
        assert!(fs.is_dir("docs/guide").await.unwrap());
        assert_eq!(
            fs.list_dir("docs").await.unwrap(),
            vec![DirEntry::dir("guide"), DirEntry::file("index.md")]
        );
    }

    // ==================== Errors ====================

    #[tokio::test]
    async fn test_write_rejects_directories_and_file_parents() {
        let mut fs = staging();
        assert!(matches!(fs.write("src", vec![]).await, Err(FsError::IsDirectory(_))));
        assert!(matches!(
            fs.write("README.md/child", vec![]).await,
            Err(FsError::NotADirectory(p)) if p == "README.md"
        ));
        assert!(matches!(
            fs.write("../escape", vec![]).await,
            Err(FsError::InvalidPath { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_and_twice() {
        let mut fs = staging();
        assert!(matches!(fs.delete("nope.rs").await, Err(FsError::FileNotFound(_))));
        assert!(matches!(fs.delete("src").await, Err(FsError::IsDirectory(_))));
        fs.delete("README.md").await.unwrap();
        assert!(matches!(fs.delete("README.md").await, Err(FsError::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_changelist_is_a_snapshot() {
        let mut fs = staging();
        fs.write("a.txt", b"1".to_vec()).await.unwrap();
        let before = fs.get_changelist();
        fs.write("b.txt", b"2".to_vec()).await.unwrap();

        assert_eq!(before.paths(), vec!["a.txt"]);
        assert_eq!(fs.get_changelist().paths(), vec!["a.txt", "b.txt"]);
    }
}
