//! Abstract persistence seam used by the Workflow State Machine and the
//! Checkpoint service.
//!
//! The core never reaches into a concrete database; it only calls this
//! trait. Production hosts implement it against whatever durable store they
//! already run (a file, a key-value service, a SQL table keyed on a string
//! column) — the contract is intentionally the smallest thing that can
//! persist a JSON-serialised snapshot under a string key.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A tiny async key/value seam. All three operations are best-effort from the
/// caller's perspective: a failing `set_item`/`remove_item` is logged by the
/// caller, never propagated as a fatal error.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Reads a value, or `None` if the key is absent.
    async fn get_item(&self, key: &str) -> std::result::Result<Option<String>, String>;

    /// Writes a value, overwriting any previous value for the key.
    async fn set_item(&self, key: &str, value: String) -> std::result::Result<(), String>;

    /// Removes a key. A no-op if the key is absent.
    async fn remove_item(&self, key: &str) -> std::result::Result<(), String>;
}

/// In-memory `StorageAdapter` used by tests and as a default when no durable
/// backend is configured.
#[derive(Debug, Default)]
pub struct InMemoryStorageAdapter {
    items: RwLock<HashMap<String, String>>,
}

impl InMemoryStorageAdapter {
    /// Creates an empty adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStorageAdapter {
    async fn get_item(&self, key: &str) -> std::result::Result<Option<String>, String> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> std::result::Result<(), String> {
        self.items.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> std::result::Result<(), String> {
        self.items.write().await.remove(key);
        Ok(())
    }
}
