//! Per-session mutual exclusion across workers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::state_store::{lock_key, StateBackend};
use crate::{CoordError, Result};

/// A TTL'd lock keyed by session id, held in the shared backend.
///
/// Each acquisition gets a fresh random token; only the holder of that token
/// can release it. If a holder crashes, the lease expires after the
/// configured TTL and another worker may take it.
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn StateBackend>,
    ttl: Duration,
    acquire_timeout: Duration,
    retry_interval: Duration,
    attempt_timeout: Duration,
}

impl DistributedLock {
    /// Creates a lock manager over `backend`.
    ///
    /// A single backend attempt is given at most `attempt_timeout` (the
    /// store's operation timeout) before it counts as "not acquired".
    pub fn new(
        backend: Arc<dyn StateBackend>,
        config: &LockConfig,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            ttl: config.ttl(),
            acquire_timeout: config.acquire_timeout(),
            retry_interval: config.retry_interval(),
            attempt_timeout,
        }
    }

    /// Lease length of each acquisition.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Acquires the lock for `session_id`, retrying until the acquire
    /// timeout elapses.
    ///
    /// Backend errors during an attempt count as "not acquired" and are
    /// retried, so an unreachable backend ends in a timeout. An attempt that
    /// does not answer within the attempt timeout is left running and waited
    /// on again instead of being duplicated; every attempt of one call uses
    /// the same token, so a late answer still grants this caller the lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::LockTimeout`] if the lock stayed held by
    /// someone else for the whole acquire timeout.
    pub async fn acquire(&self, session_id: &str) -> Result<LockGuard> {
        let name = lock_key(session_id);
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;
        let mut pending: Option<JoinHandle<Result<bool>>> = None;

        loop {
            let mut attempt = match pending.take() {
                Some(attempt) => attempt,
                None => self.spawn_attempt(&name, &token),
            };
            let budget = self
                .attempt_timeout
                .min(deadline.saturating_duration_since(Instant::now()));

            match tokio::time::timeout(budget, &mut attempt).await {
                Ok(Ok(Ok(true))) => {
                    debug!(session_id, waited = ?started.elapsed(), "lock acquired");
                    return Ok(self.guard(name, token));
                }
                Ok(Ok(Ok(false))) => {}
                Ok(Ok(Err(e))) => debug!(session_id, error = %e, "lock attempt failed"),
                Ok(Err(e)) => debug!(session_id, error = %e, "lock attempt aborted"),
                Err(_) => {
                    debug!(session_id, timeout = ?budget, "lock attempt still running");
                    pending = Some(attempt);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                if let Some(attempt) = pending {
                    self.abandon(attempt, name, token);
                }
                warn!(session_id, waited = ?started.elapsed(), "lock acquisition timed out");
                return Err(CoordError::LockTimeout {
                    session_id: session_id.to_string(),
                    waited: started.elapsed(),
                });
            }
            if pending.is_none() {
                tokio::time::sleep(self.retry_interval.min(deadline - now)).await;
            }
        }
    }

    /// Attempts the lock once, waiting no longer than the attempt timeout.
    ///
    /// An attempt that does not answer in time counts as "not acquired".
    pub async fn try_acquire(&self, session_id: &str) -> Result<Option<LockGuard>> {
        let name = lock_key(session_id);
        let token = Uuid::new_v4().to_string();
        let mut attempt = self.spawn_attempt(&name, &token);

        match tokio::time::timeout(self.attempt_timeout, &mut attempt).await {
            Ok(Ok(Ok(true))) => Ok(Some(self.guard(name, token))),
            Ok(Ok(Ok(false))) => Ok(None),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(e)) => Err(CoordError::StoreUnavailable(format!("lock attempt: {e}"))),
            Err(_) => {
                debug!(session_id, "lock attempt still running, giving up");
                self.abandon(attempt, name, token);
                Ok(None)
            }
        }
    }

    /// Runs one backend attempt on its own task so that dropping the
    /// waiter never cancels a statement already in flight.
    fn spawn_attempt(&self, name: &str, token: &str) -> JoinHandle<Result<bool>> {
        let backend = Arc::clone(&self.backend);
        let name = name.to_string();
        let token = token.to_string();
        let ttl = self.ttl;
        tokio::spawn(async move { backend.try_lock(&name, &token, ttl).await })
    }

    /// Releases whatever an abandoned attempt ends up taking.
    fn abandon(&self, attempt: JoinHandle<Result<bool>>, name: String, token: String) {
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            if let Ok(Ok(true)) = attempt.await {
                debug!(lock = %name, "releasing lock taken by an abandoned attempt");
                let _ = backend.unlock(&name, &token).await;
            }
        });
    }

    fn guard(&self, name: String, token: String) -> LockGuard {
        LockGuard {
            backend: Arc::clone(&self.backend),
            name,
            token,
            released: false,
        }
    }
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("ttl", &self.ttl)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

/// Proof of holding a session lock.
///
/// Release explicitly with [`release`](LockGuard::release). A guard dropped
/// without releasing schedules a release on the current runtime; failing
/// that, the lease runs out on its own.
pub struct LockGuard {
    backend: Arc<dyn StateBackend>,
    name: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Name of the held lock.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Releases the lock. Returns false if the lease had already expired
    /// and been taken by someone else, or the backend could not be reached.
    pub async fn release(mut self) -> bool {
        self.released = true;
        match self.backend.unlock(&self.name, &self.token).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(lock = %self.name, "lock lease expired before release");
                false
            }
            Err(e) => {
                warn!(lock = %self.name, error = %e, "lock release failed, lease will expire");
                false
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let backend = Arc::clone(&self.backend);
            let name = std::mem::take(&mut self.name);
            let token = std::mem::take(&mut self.token);
            handle.spawn(async move {
                let _ = backend.unlock(&name, &token).await;
            });
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
