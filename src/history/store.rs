//! History store implementations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::HistoryError;
use crate::history::{ConversationHistory, HISTORY_VERSION, HistoryStore};

/// One JSON file per task key under a directory.
///
/// Files are replaced atomically (write to a temporary sibling, then rename)
/// so a crash mid-save never leaves a truncated transcript.
pub struct FileHistoryStore {
    dir: PathBuf,
}

impl FileHistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `acme/widgets#12` → `acme_widgets_12-<hash>.json`. The hash keeps keys
    /// that sanitise to the same stem apart.
    fn path_for(&self, key: &str) -> PathBuf {
        let stem: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{}-{}.json", stem, &digest[..12]))
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn load(&self, key: &str) -> Result<Option<ConversationHistory>, HistoryError> {
        let path = self.path_for(key);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let history: ConversationHistory = serde_json::from_str(&data)?;
        if history.version != HISTORY_VERSION {
            return Err(HistoryError::UnsupportedVersion {
                found: history.version,
                expected: HISTORY_VERSION,
            });
        }
        tracing::debug!(
            "Loaded history for {} ({} turns) from {}",
            key,
            history.turns.len(),
            path.display()
        );
        Ok(Some(history))
    }

    async fn save(&self, key: &str, history: &ConversationHistory) -> Result<(), HistoryError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(key);
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(history)?;

        tokio::fs::write(&tmp, &json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tracing::debug!("Saved history for {} to {}", key, path.display());
        Ok(())
    }
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryHistoryStore {
    entries: RwLock<HashMap<String, ConversationHistory>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn load(&self, key: &str) -> Result<Option<ConversationHistory>, HistoryError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, history: &ConversationHistory) -> Result<(), HistoryError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), history.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::llm::{ChatMessage, ContentBlock, Role};

    fn sample() -> ConversationHistory {
        let mut history = ConversationHistory::new("acme/widgets#7", "You fix issues.");
        history.push_message(ChatMessage::user("Issue #7: crash on empty input"));
        history.record_response(ChatMessage {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text {
                    text: "I'll write the fix.".into(),
                },
                ContentBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "write_file".into(),
                    input: serde_json::json!({"path": "src/lib.rs", "content": "fn main() {}\n"}),
                },
            ],
        });
        history.push_message(ChatMessage::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "toolu_1".into(),
            content: "{\"path\":\"src/lib.rs\"}".into(),
            is_error: false,
        }]));
        history
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path().join("histories"));

        assert!(store.load("acme/widgets#7").await.unwrap().is_none());

        let original = sample();
        store.save("acme/widgets#7", &original).await.unwrap();
        let loaded = store.load("acme/widgets#7").await.unwrap().unwrap();
        assert_eq!(loaded, original);

        // save → load again is stable
        store.save("acme/widgets#7", &loaded).await.unwrap();
        assert_eq!(store.load("acme/widgets#7").await.unwrap().unwrap(), original);

        // no temporary files are left behind
        let files: Vec<_> = std::fs::read_dir(store.dir()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_keys_do_not_collide() {
        let dir = tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path());
        assert_ne!(store.path_for("a/b_1#2"), store.path_for("a/b#1_2"));
    }

    #[tokio::test]
    async fn test_file_store_rejects_unknown_version() {
        let dir = tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path());
        let mut history = sample();
        history.version = 99;
        store.save("k", &history).await.unwrap();

        let err = store.load("k").await.unwrap_err();
        assert!(matches!(err, HistoryError::UnsupportedVersion { found: 99, .. }));
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryHistoryStore::new();
        let original = sample();
        store.save("k", &original).await.unwrap();
        assert_eq!(store.load("k").await.unwrap(), Some(original));
        assert_eq!(store.len().await, 1);
    }
}
