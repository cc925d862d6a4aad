//! A backend with slow, detached operations for unit tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{BackendKind, MemoryBackend, Notification, StateBackend};
use crate::{CoordError, Result};

/// Wraps a [`MemoryBackend`], delaying writes, deletes and lock attempts.
///
/// Delayed operations run on their own task, the way a statement handed to a
/// blocking pool keeps running after its caller stops waiting. Deletes take
/// effect before the delay; writes and lock attempts after it.
#[derive(Debug, Clone, Default)]
pub(crate) struct SlowBackend {
    pub(crate) inner: MemoryBackend,
    pub(crate) write_delay: Duration,
    pub(crate) delete_delay: Duration,
    pub(crate) lock_delay: Duration,
}

impl SlowBackend {
    pub(crate) fn shared(self) -> Arc<dyn StateBackend> {
        Arc::new(self)
    }
}

fn joined<T>(outcome: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    outcome.map_err(|e| CoordError::StoreUnavailable(e.to_string()))?
}

#[async_trait]
impl StateBackend for SlowBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Shared
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let inner = self.inner.clone();
        let (key, value, delay) = (key.to_string(), value.to_string(), self.write_delay);
        joined(
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.set(&key, &value, ttl).await
            })
            .await,
        )
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.inner.delete(key).await?;
        tokio::time::sleep(self.delete_delay).await;
        Ok(removed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.keys_with_prefix(prefix).await
    }

    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let inner = self.inner.clone();
        let (name, token, delay) = (name.to_string(), token.to_string(), self.lock_delay);
        joined(
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.try_lock(&name, &token, ttl).await
            })
            .await,
        )
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool> {
        self.inner.unlock(name, token).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        self.inner.publish(channel, payload).await
    }

    async fn notifications_since(
        &self,
        channel: &str,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<Notification>> {
        self.inner.notifications_since(channel, after_id, limit).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.subscribe()
    }
}
