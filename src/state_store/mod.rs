//! State storage for waypost.
//!
//! This module provides the [`StateBackend`] capability trait, the two
//! interchangeable backends, and [`StateStore`], the wrapper every other
//! component talks to:
//!
//! - [`SqliteBackend`]: a database file shared by every worker process
//!   (feature `sqlite`, on by default)
//! - [`MemoryBackend`]: process-local maps, used as the degraded fallback
//!   and in tests
//!
//! The backend is chosen once, in [`StateStore::connect`]. Call sites never
//! branch on which one is active; they can ask through
//! [`StateStore::is_degraded`] when they care.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use waypost::{CoordinationConfig, MemoryBackend, StateStore, WorkflowState, WorkflowStatus};
//!
//! # async fn example() {
//! let config = CoordinationConfig::default();
//! let store = StateStore::with_backend(Arc::new(MemoryBackend::new()), &config);
//!
//! let mut state = WorkflowState::new("abc-123");
//! state.status = WorkflowStatus::DataUploaded;
//! assert!(store.set(&mut state, "host:1").await);
//!
//! let stored = store.get("abc-123").await.unwrap();
//! assert_eq!(stored.status, WorkflowStatus::DataUploaded);
//! # }
//! ```

mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryBackend;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{BackendChoice, CoordinationConfig};
use crate::lock::{DistributedLock, LockGuard};
use crate::notifier::ChangeNotifier;
use crate::state::validate_session_id;
use crate::{CoordError, Result, WorkflowState};

/// Key prefix for session state records.
pub const STATE_KEY_PREFIX: &str = "workflow_state:";
/// Key prefix for per-session locks.
pub const LOCK_KEY_PREFIX: &str = "workflow_lock:";
/// Channel prefix for full-state update notifications.
pub const UPDATE_CHANNEL_PREFIX: &str = "workflow_updates:";
/// Channel prefix for discrete milestone events.
pub const EVENT_CHANNEL_PREFIX: &str = "workflow_events:";

/// Storage key of a session's state record.
pub fn state_key(session_id: &str) -> String {
    format!("{STATE_KEY_PREFIX}{session_id}")
}

/// Name of a session's lock.
pub fn lock_key(session_id: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{session_id}")
}

/// Which kind of backend a store ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Visible to every worker.
    Shared,
    /// Private to this process; cross-worker consistency is lost.
    LocalFallback,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("shared"),
            Self::LocalFallback => f.write_str("local-fallback"),
        }
    }
}

/// A message published on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Monotonic id assigned by the backend; used for replay.
    pub id: u64,
    /// Channel the message was published on.
    pub channel: String,
    /// Serialized message body.
    pub payload: String,
    /// When the message was published.
    pub published_at: DateTime<Utc>,
}

/// The capabilities waypost needs from a key-value store.
///
/// Any store offering atomic single-key get/set with expiry, a TTL'd
/// mutual-exclusion primitive, and publish/subscribe can implement this.
///
/// # Object Safety
///
/// This trait is object-safe; [`StateStore`] holds an
/// `Arc<dyn StateBackend>` so backends can be swapped at construction.
#[async_trait]
pub trait StateBackend: Send + Sync + fmt::Debug {
    /// Reports whether this backend is shared across workers.
    fn kind(&self) -> BackendKind;

    /// Checks that the backend answers.
    async fn ping(&self) -> Result<()>;

    /// Reads a key, returning `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes a key, replacing its value and resetting its time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Deletes a key. Returns true if something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Lists live keys starting with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Takes the named lock for `token` unless another live holder has it.
    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Releases the named lock if `token` still holds it.
    async fn unlock(&self, name: &str, token: &str) -> Result<bool>;

    /// Publishes a message and returns its id.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64>;

    /// Returns messages on `channel` with ids greater than `after_id`.
    async fn notifications_since(
        &self,
        channel: &str,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<Notification>>;

    /// Subscribes to every message published through this process.
    fn subscribe(&self) -> broadcast::Receiver<Notification>;
}

/// Session state persistence with pub/sub, over one chosen backend.
///
/// Reads and plain writes never return errors: an unreachable backend
/// yields `None` or `false` and a log line. The locked
/// [`update`](StateStore::update) cycle is the one place that reports
/// failure, because it must fail closed.
///
/// `StateStore` is cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    notifier: ChangeNotifier,
    lock: DistributedLock,
    state_ttl: Duration,
    operation_timeout: Duration,
}

impl StateStore {
    /// Opens the configured backend, degrading to a process-local one if the
    /// shared store cannot be reached.
    ///
    /// The degradation is logged at `warn` and visible through
    /// [`is_degraded`](Self::is_degraded).
    pub async fn connect(config: &CoordinationConfig) -> Self {
        if let Err(e) = config.validate() {
            warn!(
                error = %e,
                "store timeouts exceed the lock TTL, a slow write may outlive its lock"
            );
        }
        let backend: Arc<dyn StateBackend> = match config.store.backend {
            BackendChoice::Memory => {
                info!("using process-local state store by configuration");
                Arc::new(MemoryBackend::with_capacity(
                    config.notifications.channel_capacity,
                ))
            }
            BackendChoice::Sqlite => Self::open_shared(config).await,
        };
        Self::with_backend(backend, config)
    }

    #[cfg(feature = "sqlite")]
    async fn open_shared(config: &CoordinationConfig) -> Arc<dyn StateBackend> {
        let path = &config.store.path;
        let opened = tokio::time::timeout(
            config.store.connect_timeout(),
            SqliteBackend::open(path, &config.store, &config.notifications),
        )
        .await
        .unwrap_or_else(|_| {
            Err(CoordError::StoreUnavailable(
                "timed out opening shared store".to_string(),
            ))
        });

        match opened {
            Ok(backend) => {
                info!(path = %path.display(), "connected to shared state store");
                Arc::new(backend)
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "shared state store unreachable, degrading to process-local store; \
                     other workers will not see this worker's writes"
                );
                Arc::new(MemoryBackend::with_capacity(
                    config.notifications.channel_capacity,
                ))
            }
        }
    }

    #[cfg(not(feature = "sqlite"))]
    async fn open_shared(config: &CoordinationConfig) -> Arc<dyn StateBackend> {
        warn!(
            path = %config.store.path.display(),
            "built without the sqlite feature, degrading to process-local store"
        );
        Arc::new(MemoryBackend::with_capacity(
            config.notifications.channel_capacity,
        ))
    }

    /// Wraps an already-constructed backend.
    pub fn with_backend(backend: Arc<dyn StateBackend>, config: &CoordinationConfig) -> Self {
        let operation_timeout = config.store.operation_timeout();
        Self {
            notifier: ChangeNotifier::new(Arc::clone(&backend), operation_timeout),
            lock: DistributedLock::new(Arc::clone(&backend), &config.lock, operation_timeout),
            backend,
            state_ttl: config.store.state_ttl(),
            operation_timeout,
        }
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    /// Which backend is active.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Returns true when running on the process-local fallback.
    pub fn is_degraded(&self) -> bool {
        self.backend_kind() == BackendKind::LocalFallback
    }

    /// The notifier writes are published through.
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// The per-session lock used by [`update`](Self::update).
    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Idle time after which an unrefreshed record expires.
    pub fn state_ttl(&self) -> Duration {
        self.state_ttl
    }

    /// Returns true if the backend answers within the operation timeout.
    pub async fn is_healthy(&self) -> bool {
        self.guarded("ping", self.backend.ping()).await.is_ok()
    }

    /// Reads a session's state.
    ///
    /// Returns `None` when the record is absent, expired, unreadable, or the
    /// backend is unreachable. A checksum mismatch is logged and the record
    /// is still returned.
    pub async fn get(&self, session_id: &str) -> Option<WorkflowState> {
        match self.load(session_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(session_id, error = %e, "state read failed, treating as absent");
                None
            }
        }
    }

    /// Reads a session's state, reporting backend failures.
    ///
    /// Corrupted payloads still read as `Ok(None)`; only an unreachable
    /// backend or an invalid session id is an error.
    pub async fn load(&self, session_id: &str) -> Result<Option<WorkflowState>> {
        validate_session_id(session_id)?;
        let raw = self
            .guarded("get", self.backend.get(&state_key(session_id)))
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<WorkflowState>(&raw) {
            Ok(state) => {
                if !state.verify_checksum() {
                    warn!(
                        session_id,
                        stored = %state.checksum,
                        writer_id = %state.writer_id,
                        "state checksum mismatch, record may be corrupted"
                    );
                }
                Ok(Some(state))
            }
            Err(e) => {
                warn!(session_id, error = %e, "stored state is not decodable, treating as absent");
                Ok(None)
            }
        }
    }

    /// Writes a session's state without taking the session lock.
    ///
    /// Stamps `last_updated`, `writer_id`, `version` and `checksum` on
    /// `state`, refreshes the record's TTL and publishes the result on the
    /// session's update channel. Returns false on any failure.
    ///
    /// A write that outlives the operation timeout is waited on until the
    /// backend answers, so the result always says whether it landed.
    ///
    /// Concurrent callers race: the later write wins wholesale. Use
    /// [`update`](Self::update) for read-modify-write.
    pub async fn set(&self, state: &mut WorkflowState, writer_id: &str) -> bool {
        match self.write(state, writer_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %state.session_id, error = %e, "state write failed");
                false
            }
        }
    }

    pub(crate) async fn write(&self, state: &mut WorkflowState, writer_id: &str) -> Result<()> {
        validate_session_id(&state.session_id)?;
        state.stamp(writer_id);
        let payload = serde_json::to_string(&*state)?;

        self.settled(
            "set",
            self.backend
                .set(&state_key(&state.session_id), &payload, self.state_ttl),
        )
        .await?;

        debug!(
            session_id = %state.session_id,
            version = state.version,
            status = %state.status,
            "state written"
        );

        self.notifier
            .publish_state_payload(&state.session_id, &payload)
            .await;
        Ok(())
    }

    /// Applies `apply` to a session's state under the session lock.
    ///
    /// Acquires the lock, reads the current record (or synthesizes a fresh
    /// `NOT_STARTED` one), runs `apply`, writes the result and releases the
    /// lock. At most one such cycle per session runs at a time across all
    /// workers sharing the backend.
    ///
    /// # Errors
    ///
    /// - [`CoordError::LockTimeout`] if the lock was not acquired in time;
    ///   nothing is written.
    /// - [`CoordError::StoreUnavailable`] if the read or the write failed.
    /// - Any error returned by `apply`, in which case nothing is written.
    pub async fn update<F>(
        &self,
        session_id: &str,
        writer_id: &str,
        apply: F,
    ) -> Result<WorkflowState>
    where
        F: FnOnce(&mut WorkflowState) -> Result<()> + Send,
    {
        validate_session_id(session_id)?;
        let span = info_span!("update_state", session_id, writer_id);

        async move {
            let guard = self.lock.acquire(session_id).await?;
            let result = self.update_held(&guard, session_id, writer_id, apply).await;
            guard.release().await;
            result
        }
        .instrument(span)
        .await
    }

    /// The read-modify-write cycle of [`update`](Self::update), for a caller
    /// already holding the session's lock.
    pub(crate) async fn update_held<F>(
        &self,
        _held: &LockGuard,
        session_id: &str,
        writer_id: &str,
        apply: F,
    ) -> Result<WorkflowState>
    where
        F: FnOnce(&mut WorkflowState) -> Result<()> + Send,
    {
        let mut state = match self.load(session_id).await? {
            Some(existing) => existing,
            None => WorkflowState::new(session_id),
        };
        apply(&mut state)?;
        self.write(&mut state, writer_id).await?;
        Ok(state)
    }

    /// Deletes a session's record. Returns true if one was removed.
    pub async fn delete(&self, session_id: &str) -> bool {
        if validate_session_id(session_id).is_err() {
            return false;
        }
        match self
            .settled("delete", self.backend.delete(&state_key(session_id)))
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                warn!(session_id, error = %e, "state delete failed");
                false
            }
        }
    }

    /// Lists session ids with a live record, sorted.
    pub async fn list_sessions(&self) -> Vec<String> {
        match self
            .guarded("keys", self.backend.keys_with_prefix(STATE_KEY_PREFIX))
            .await
        {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(STATE_KEY_PREFIX).map(str::to_string))
                .collect(),
            Err(e) => {
                warn!(error = %e, "session listing failed");
                Vec::new()
            }
        }
    }

    /// Runs a mutating backend call to completion.
    ///
    /// A shared backend may apply a statement after its caller stops
    /// waiting, so past the operation timeout the call is logged and still
    /// awaited. Its result is the backend's real answer.
    async fn settled<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::pin!(fut);
        let outcome = match tokio::time::timeout(self.operation_timeout, &mut fut).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    op,
                    timeout = ?self.operation_timeout,
                    "store write outlived the operation timeout, waiting for it to settle"
                );
                fut.await
            }
        };
        outcome.map_err(|e| CoordError::StoreUnavailable(format!("{op}: {e}")))
    }

    /// Bounds a read-only backend call by the operation timeout.
    async fn guarded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CoordError::StoreUnavailable(format!("{op}: {e}"))),
            Err(_) => Err(CoordError::StoreUnavailable(format!(
                "{op}: no answer within {:?}",
                self.operation_timeout
            ))),
        }
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.backend.kind())
            .field("state_ttl", &self.state_ttl)
            .finish_non_exhaustive()
    }
}
