//! JSON file per conversation under a state directory.
//!
//! File names are the hex SHA-256 of the context key, since keys are opaque and may
//! contain path separators. The directory is held with an exclusive lock file for the
//! lifetime of the store so two gateways cannot write the same state.

use crate::queue::QueueSnapshot;
use crate::store::{QueueStore, StoreError};
use async_trait::async_trait;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = ".lock";

pub struct FileQueueStore {
    dir: PathBuf,
    _lock: File,
}

impl FileQueueStore {
    /// Create the directory if needed and take its lock.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let lock = File::create(dir.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(dir.display().to_string()))?;
        Ok(Self { dir, _lock: lock })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn load(&self, key: &str) -> Result<Option<QueueSnapshot>, StoreError> {
        let path = self.path_for(key);
        let s = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&s) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                log::warn!(
                    "ignoring unreadable queue state {}: {}",
                    path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &str, snapshot: &QueueSnapshot) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueItem;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("chatq-store-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = temp_dir();
        let store = FileQueueStore::open(&dir).unwrap();
        let snapshot = QueueSnapshot {
            items: vec![
                QueueItem {
                    id: "a1".into(),
                    text: "first".into(),
                },
                QueueItem {
                    id: "b2".into(),
                    text: "second".into(),
                },
            ],
            paused: true,
        };
        store.save("tab/1", &snapshot).await.unwrap();
        assert_eq!(store.load("tab/1").await.unwrap(), Some(snapshot));
        assert_eq!(store.load("tab/2").await.unwrap(), None);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn persisted_record_has_only_items_and_paused() {
        let dir = temp_dir();
        let store = FileQueueStore::open(&dir).unwrap();
        store
            .save("k", &QueueSnapshot::default())
            .await
            .unwrap();
        let raw = std::fs::read_to_string(store.path_for("k")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let mut keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        keys.sort();
        assert_eq!(keys, ["items", "paused"]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_absent() {
        let dir = temp_dir();
        let store = FileQueueStore::open(&dir).unwrap();
        std::fs::write(store.path_for("k"), b"{not json").unwrap();
        assert_eq!(store.load("k").await.unwrap(), None);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn second_open_of_same_dir_is_refused() {
        let dir = temp_dir();
        let _first = FileQueueStore::open(&dir).unwrap();
        assert!(matches!(
            FileQueueStore::open(&dir),
            Err(StoreError::Locked(_))
        ));
        let _ = std::fs::remove_dir_all(dir);
    }
}
