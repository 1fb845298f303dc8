use super::StateStore;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use weftcore::{ExecutionId, StoreError};

/// One directory per execution, one JSON document per key.
///
/// Writes go to a `.tmp` sibling first and are renamed into place, so a
/// crash mid-write leaves the previous value intact. Keys are percent-encoded
/// into file names.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn execution_dir(&self, execution_id: ExecutionId) -> PathBuf {
        self.root.join(execution_id.to_string())
    }

    fn key_path(&self, execution_id: ExecutionId, key: &str) -> PathBuf {
        self.execution_dir(execution_id)
            .join(format!("{}.json", encode_key(key)))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, execution_id: ExecutionId, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let path = self.key_path(execution_id, key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                execution_id,
                reason: format!("{}: {}", path.display(), e),
            })
    }

    async fn set(&self, execution_id: ExecutionId, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let dir = self.execution_dir(execution_id);
        fs::create_dir_all(&dir).await?;

        let path = self.key_path(execution_id, key);
        let tmp_path = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(&value)?;
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn keys(&self, execution_id: ExecutionId) -> Result<Vec<String>, StoreError> {
        let mut entries = match fs::read_dir(self.execution_dir(execution_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Some(key) = decode_key(stem) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn executions(&self) -> Result<Vec<ExecutionId>, StoreError> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match entry.file_name().to_str().map(uuid::Uuid::parse_str) {
                Some(Ok(id)) => ids.push(id),
                _ => tracing::debug!("skipping foreign entry in state dir: {:?}", entry.path()),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn remove(&self, execution_id: ExecutionId) -> Result<(), StoreError> {
        match fs::remove_dir_all(self.execution_dir(execution_id)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' => out.push(byte as char),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn key_encoding_is_reversible() {
        assert_eq!(encode_key("result/fetch-1"), "result%2Ffetch-1");
        assert_eq!(decode_key("result%2Ffetch-1").as_deref(), Some("result/fetch-1"));
        assert_eq!(decode_key("%zz"), None);
        // dots would collide with the extension
        assert_eq!(encode_key("a.b"), "a%2Eb");
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        {
            let store = FileStateStore::open(dir.path()).await.unwrap();
            store.set(id, "header", json!({"status": "paused"})).await.unwrap();
            store.set(id, "result/fetch", json!({"url": "http://x"})).await.unwrap();
            store.set(id, "header", json!({"status": "running"})).await.unwrap();
        }

        let store = FileStateStore::open(dir.path()).await.unwrap();
        assert_eq!(store.executions().await.unwrap(), vec![id]);
        assert_eq!(store.keys(id).await.unwrap(), vec!["header", "result/fetch"]);
        assert_eq!(store.get(id, "header").await.unwrap(), Some(json!({"status": "running"})));
        assert_eq!(store.get(id, "missing").await.unwrap(), None);
        assert_eq!(store.get(Uuid::new_v4(), "header").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_documents_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();
        let id = Uuid::new_v4();
        store.set(id, "header", json!({})).await.unwrap();
        std::fs::write(dir.path().join(id.to_string()).join("header.json"), b"{not json").unwrap();

        assert!(matches!(
            store.get(id, "header").await,
            Err(StoreError::Corrupt { execution_id, .. }) if execution_id == id
        ));

        store.remove(id).await.unwrap();
        store.remove(id).await.unwrap();
        assert!(store.executions().await.unwrap().is_empty());
    }
}
