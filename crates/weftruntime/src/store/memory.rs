use super::StateStore;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use weftcore::{ExecutionId, StoreError};

/// Process-local backend, used by tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemoryStateStore {
    data: RwLock<HashMap<ExecutionId, BTreeMap<String, serde_json::Value>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, execution_id: ExecutionId, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let data = self.data.read().await;
        Ok(data.get(&execution_id).and_then(|keys| keys.get(key)).cloned())
    }

    async fn set(&self, execution_id: ExecutionId, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        data.entry(execution_id).or_default().insert(key.to_string(), value);
        Ok(())
    }

    async fn keys(&self, execution_id: ExecutionId) -> Result<Vec<String>, StoreError> {
        let data = self.data.read().await;
        Ok(data
            .get(&execution_id)
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn executions(&self) -> Result<Vec<ExecutionId>, StoreError> {
        Ok(self.data.read().await.keys().copied().collect())
    }

    async fn remove(&self, execution_id: ExecutionId) -> Result<(), StoreError> {
        self.data.write().await.remove(&execution_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn executions_are_isolated() {
        let store = MemoryStateStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.set(a, "header", json!({"status": "running"})).await.unwrap();
        store.set(a, "result/fetch", json!({"url": "http://x"})).await.unwrap();
        store.set(b, "header", json!({"status": "paused"})).await.unwrap();

        assert_eq!(store.keys(a).await.unwrap(), vec!["header", "result/fetch"]);
        assert_eq!(store.get(b, "header").await.unwrap(), Some(json!({"status": "paused"})));
        assert_eq!(store.get(b, "result/fetch").await.unwrap(), None);

        store.remove(a).await.unwrap();
        assert_eq!(store.executions().await.unwrap(), vec![b]);
        assert!(store.keys(a).await.unwrap().is_empty());
    }
}
