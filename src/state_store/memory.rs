//! In-memory backend implementation.
//!
//! This module provides [`MemoryBackend`], a process-local implementation of
//! [`StateBackend`]. It is what [`StateStore`](super::StateStore) falls back
//! to when the shared store is unreachable, and the usual backend in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

use super::{BackendKind, Notification, StateBackend};
use crate::Result;

/// Default capacity of the broadcast channel and the replay log.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct Lease {
    token: String,
    expires_at: Instant,
}

/// Internal storage for the memory backend.
#[derive(Debug, Default)]
struct Storage {
    entries: HashMap<String, Entry>,
    leases: HashMap<String, Lease>,
    log: VecDeque<Notification>,
    next_id: u64,
}

/// A process-local implementation of [`StateBackend`].
///
/// Uses `Arc<RwLock<...>>` internally, so clones share the same data. Two
/// simulated workers in one test can therefore share a `MemoryBackend` the
/// way two real workers share a database file.
///
/// Expiry uses `tokio::time::Instant`, so tests running with paused time can
/// step past a TTL without sleeping.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use waypost::{MemoryBackend, StateBackend};
///
/// # async fn example() -> waypost::Result<()> {
/// let backend = MemoryBackend::new();
/// backend.set("k", "v", Duration::from_secs(60)).await?;
/// assert_eq!(backend.get("k").await?.as_deref(), Some("v"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    storage: Arc<RwLock<Storage>>,
    events: broadcast::Sender<Notification>,
    log_capacity: usize,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an empty backend whose broadcast channel and replay log hold
    /// `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (events, _) = broadcast::channel(capacity);
        Self {
            storage: Arc::new(RwLock::new(Storage::default())),
            events,
            log_capacity: capacity,
        }
    }

    /// Returns the number of live keys.
    ///
    /// Useful for testing.
    pub async fn entry_count(&self) -> usize {
        let now = Instant::now();
        self.storage
            .read()
            .await
            .entries
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// Clears all keys, leases and logged messages.
    ///
    /// Useful for resetting state between tests.
    pub async fn clear(&self) {
        let mut storage = self.storage.write().await;
        storage.entries.clear();
        storage.leases.clear();
        storage.log.clear();
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalFallback
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        {
            let storage = self.storage.read().await;
            match storage.entries.get(key) {
                None => return Ok(None),
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        // Expired: drop it unless a writer refreshed it in the meantime.
        let mut storage = self.storage.write().await;
        if storage
            .entries
            .get(key)
            .is_some_and(|e| e.expires_at <= Instant::now())
        {
            storage.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut storage = self.storage.write().await;
        let now = Instant::now();
        storage.entries.retain(|_, e| e.expires_at > now);
        storage.leases.retain(|_, l| l.expires_at > now);
        storage.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut storage = self.storage.write().await;
        let now = Instant::now();
        Ok(storage
            .entries
            .remove(key)
            .is_some_and(|e| e.expires_at > now))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut storage = self.storage.write().await;
        let now = Instant::now();
        storage.entries.retain(|_, e| e.expires_at > now);

        let mut keys: Vec<String> = storage
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut storage = self.storage.write().await;
        let now = Instant::now();

        if let Some(held) = storage.leases.get(name) {
            if held.expires_at > now && held.token != token {
                return Ok(false);
            }
        }

        storage.leases.insert(
            name.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool> {
        let mut storage = self.storage.write().await;
        match storage.leases.get(name) {
            Some(held) if held.token == token => {
                storage.leases.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        let notification = {
            let mut storage = self.storage.write().await;
            storage.next_id += 1;
            let notification = Notification {
                id: storage.next_id,
                channel: channel.to_string(),
                payload: payload.to_string(),
                published_at: Utc::now(),
            };
            storage.log.push_back(notification.clone());
            while storage.log.len() > self.log_capacity {
                storage.log.pop_front();
            }
            notification
        };

        let id = notification.id;
        // No subscribers is not an error.
        let _ = self.events.send(notification);
        Ok(id)
    }

    async fn notifications_since(
        &self,
        channel: &str,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<Notification>> {
        let storage = self.storage.read().await;
        Ok(storage
            .log
            .iter()
            .filter(|n| n.channel == channel && n.id > after_id)
            .take(limit)
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }
}
