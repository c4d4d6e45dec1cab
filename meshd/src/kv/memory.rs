//! In-process datastore with lease expiry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::trace;

use super::{KeyValue, KvStore, WatchEvent, WatchStream};
use crate::error::KvError;

const EVENT_BACKLOG: usize = 1024;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Datastore held entirely in memory.
///
/// Expired keys are removed lazily on access and by a background sweeper,
/// which also emits the matching `Delete` events to watchers.
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, Entry>>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryKv {
    /// Create the store and its sweeper. Must be called inside a tokio runtime.
    pub fn new() -> Arc<Self> {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(interval: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BACKLOG);
        let kv = Arc::new(Self {
            entries: Mutex::new(BTreeMap::new()),
            events,
        });
        tokio::spawn(sweep(Arc::downgrade(&kv), interval));
        kv
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop expired entries and notify watchers.
    fn expire(&self, entries: &mut BTreeMap<String, Entry>) {
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in expired {
            entries.remove(&key);
            trace!(key = %key, "lease expired");
            let _ = self.events.send(WatchEvent::Delete { key });
        }
    }
}

async fn sweep(kv: Weak<MemoryKv>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(kv) = kv.upgrade() else {
            break;
        };
        let mut entries = kv.lock();
        kv.expire(&mut entries);
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut entries = self.lock();
        self.expire(&mut entries);
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut entries = self.lock();
        self.expire(&mut entries);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at: deadline(ttl),
            },
        );
        let _ = self.events.send(WatchEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn create(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut entries = self.lock();
        self.expire(&mut entries);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at: deadline(ttl),
            },
        );
        let _ = self.events.send(WatchEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut entries = self.lock();
        self.expire(&mut entries);
        if entries.remove(key).is_some() {
            let _ = self.events.send(WatchEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, KvError> {
        let mut entries = self.lock();
        self.expire(&mut entries);
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
            })
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, KvError> {
        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |event| {
            match event {
                Ok(event) if event.key().starts_with(&prefix) => Some(Ok(event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(n)) => Some(Err(KvError::Lagged(n))),
            }
        });
        Ok(Box::pin(stream))
    }
}
