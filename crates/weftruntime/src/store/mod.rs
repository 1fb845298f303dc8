//! Key/value persistence scoped by execution.
//!
//! Backends only know about JSON documents under string keys; the layout of
//! an execution's keyspace belongs to [`crate::ExecutionStateStore`].

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use async_trait::async_trait;
use weftcore::{ExecutionId, StoreError};

/// Durable get/set of JSON values by `(execution_id, key)`.
///
/// Each `set` is an atomic upsert of one key. Writes for different keys of
/// the same execution may happen concurrently.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns `None` if the key does not exist.
    async fn get(&self, execution_id: ExecutionId, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    async fn set(&self, execution_id: ExecutionId, key: &str, value: serde_json::Value) -> Result<(), StoreError>;

    /// Keys stored for one execution, sorted.
    async fn keys(&self, execution_id: ExecutionId) -> Result<Vec<String>, StoreError>;

    /// Every execution with at least one key.
    async fn executions(&self) -> Result<Vec<ExecutionId>, StoreError>;

    /// Drop an execution's whole keyspace. No-op if it does not exist.
    async fn remove(&self, execution_id: ExecutionId) -> Result<(), StoreError>;
}
