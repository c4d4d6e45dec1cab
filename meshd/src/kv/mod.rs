//! Key/value datastore abstraction used by the mapping store.
//!
//! Backends provide plain get/put/delete, prefix listing, TTL-bounded
//! create-if-absent (used as the cluster lock) and a prefix watch.

pub mod memory;
pub mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::KvError;

pub use memory::MemoryKv;
pub use sqlite::SqliteKv;

/// A key and its current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Change notification delivered by [`KvStore::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    /// Explicit delete or lease expiry.
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        }
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, KvError>>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Set `key`, replacing any previous value and lease.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Set `key` only if it is absent (or its lease has lapsed).
    ///
    /// Returns `false` if someone else holds the key.
    async fn create(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> Result<bool, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// All live keys starting with `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, KvError>;

    /// Stream of changes to keys starting with `prefix`.
    ///
    /// The stream ends or yields an error when the subscription breaks;
    /// callers are expected to resync and watch again.
    async fn watch(&self, prefix: &str) -> Result<WatchStream, KvError>;
}

/// Datastore backends selectable at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatastoreKind {
    /// Process-local store. Only useful for a single node or tests.
    Memory,
    /// SQLite database file, shareable by nodes on one host.
    Sqlite { path: PathBuf },
}

/// Open the configured backend.
pub async fn open(kind: &DatastoreKind) -> Result<Arc<dyn KvStore>, KvError> {
    match kind {
        DatastoreKind::Memory => Ok(MemoryKv::new()),
        DatastoreKind::Sqlite { path } => Ok(Arc::new(SqliteKv::open(path).await?)),
    }
}

/// Key layout under the configured prefix.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn config(&self) -> String {
        format!("{}/config", self.prefix)
    }

    pub fn lock(&self) -> String {
        format!("{}/lock", self.prefix)
    }

    /// Prefix shared by every node record, including the trailing slash.
    pub fn nodes(&self) -> String {
        format!("{}/nodes/", self.prefix)
    }

    /// Key of a node record: a machine id, or the address of a floating IP.
    pub fn node(&self, name: &str) -> String {
        format!("{}/nodes/{}", self.prefix, name)
    }

    /// Record name encoded in a node key, if `key` is one.
    pub fn node_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix)?
            .strip_prefix("/nodes/")
            .filter(|name| !name.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeyLayout::new("/meshd/");
        assert_eq!(keys.config(), "/meshd/config");
        assert_eq!(keys.lock(), "/meshd/lock");
        assert_eq!(keys.nodes(), "/meshd/nodes/");
        assert_eq!(keys.node("abc"), "/meshd/nodes/abc");
        assert_eq!(keys.node_name("/meshd/nodes/abc"), Some("abc"));
        assert_eq!(keys.node_name("/meshd/nodes/"), None);
        assert_eq!(keys.node_name("/meshd/config"), None);
        assert_eq!(keys.node_name("/other/nodes/abc"), None);
    }

    #[tokio::test]
    async fn test_open_memory() {
        let kv = open(&DatastoreKind::Memory).await.unwrap();
        kv.put("a", b"1".to_vec(), None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(b"1".to_vec()));
    }
}
