//! The coordination façade.
//!
//! [`WorkflowStateManager`] is what request handlers and pipeline stages
//! hold. It wires one [`StateStore`], one [`EvidenceResolver`], the marker
//! directory and this worker's cache together, and exposes the session
//! operations in terms of those parts.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{info, info_span, warn, Instrument};

use crate::config::CoordinationConfig;
use crate::evidence::{ArtifactProbe, EvidenceResolver, LocalMilestoneCache, Readiness};
use crate::marker::MarkerStore;
use crate::notifier::{SessionNotification, SessionSubscription, WorkflowEvent};
use crate::report::SessionReport;
use crate::state_store::StateBackend;
use crate::{
    CoordError, Milestone, Result, StateStore, StateUpdate, WorkflowState, WorkflowStatus,
};

/// How status writes that move backward are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionPolicy {
    /// Any status may be written; backward moves are logged.
    #[default]
    Permissive,
    /// Backward moves are rejected. Forward skips are allowed; the only
    /// reset is [`WorkflowStateManager::clear_state`].
    Strict,
}

impl TransitionPolicy {
    /// Checks a status change for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::IllegalTransition`] under
    /// [`TransitionPolicy::Strict`] when `to` precedes `from`.
    pub fn check(&self, session_id: &str, from: WorkflowStatus, to: WorkflowStatus) -> Result<()> {
        if to >= from {
            return Ok(());
        }
        match self {
            Self::Permissive => {
                warn!(session_id, %from, %to, "status moved backward");
                Ok(())
            }
            Self::Strict => Err(CoordError::IllegalTransition {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

/// What [`WorkflowStateManager::mark_milestone_complete`] managed to do.
///
/// Every side effect is attempted even when an earlier one fails.
#[derive(Debug, Clone, PartialEq)]
pub struct MilestoneReceipt {
    /// The record as written, or `None` if the locked update failed.
    pub state: Option<WorkflowState>,
    /// Whether the durable marker was written (or already present).
    pub marker_written: bool,
    /// Whether the milestone event was published.
    pub event_published: bool,
}

impl MilestoneReceipt {
    /// Returns true if the shared record now carries the flag.
    pub fn persisted(&self) -> bool {
        self.state.is_some()
    }
}

/// Returns `<hostname>:<pid>` for this process.
pub fn default_writer_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{host}:{}", std::process::id())
}

/// Per-session workflow coordination for one worker.
///
/// Cheap to clone; clones share the store, the cache and the backend.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use waypost::{CoordinationConfig, MemoryBackend, Milestone, WorkflowStateManager, WorkflowStatus};
///
/// # async fn example() -> waypost::Result<()> {
/// let dir = std::env::temp_dir().join("waypost-doc");
/// let mut config = CoordinationConfig::default();
/// config.evidence.session_root = dir;
///
/// let manager = WorkflowStateManager::with_backend(Arc::new(MemoryBackend::new()), &config);
/// assert_eq!(manager.get_status("abc-123").await, WorkflowStatus::NotStarted);
///
/// manager.mark_milestone_complete("abc-123", Milestone::AnalysisComplete).await;
/// assert!(manager.is_milestone_complete("abc-123", Milestone::AnalysisComplete).await);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WorkflowStateManager {
    store: StateStore,
    resolver: EvidenceResolver,
    markers: MarkerStore,
    cache: LocalMilestoneCache,
    marker_milestones: Arc<[Milestone]>,
    policy: TransitionPolicy,
    writer_id: String,
}

impl WorkflowStateManager {
    /// Connects to the configured store (degrading if unreachable) and
    /// builds a manager around it.
    pub async fn new(config: &CoordinationConfig) -> Self {
        let store = StateStore::connect(config).await;
        Self::from_store(store, config)
    }

    /// Builds a manager over an already-constructed backend.
    pub fn with_backend(backend: Arc<dyn StateBackend>, config: &CoordinationConfig) -> Self {
        Self::from_store(StateStore::with_backend(backend, config), config)
    }

    /// Builds a manager around an existing store.
    pub fn from_store(store: StateStore, config: &CoordinationConfig) -> Self {
        let writer_id = config.writer_id.clone().unwrap_or_else(default_writer_id);
        let markers = MarkerStore::new(&config.evidence.session_root);
        let cache = LocalMilestoneCache::new();
        let resolver = EvidenceResolver::new(
            store.clone(),
            markers.clone(),
            ArtifactProbe::new(config.evidence.artifacts.clone()),
            cache.clone(),
            writer_id.clone(),
        )
        .with_read_repair(config.evidence.read_repair);

        info!(
            writer_id = %writer_id,
            backend = %store.backend_kind(),
            policy = ?config.transitions.policy,
            "workflow state manager ready"
        );

        Self {
            store,
            resolver,
            markers,
            cache,
            marker_milestones: config.evidence.marker_milestones.clone().into(),
            policy: config.transitions.policy,
            writer_id,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The readiness resolver.
    pub fn resolver(&self) -> &EvidenceResolver {
        &self.resolver
    }

    /// This worker's milestone cache.
    pub fn cache(&self) -> &LocalMilestoneCache {
        &self.cache
    }

    /// The marker directory.
    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    /// Identity stamped on every write from this manager.
    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }

    /// The active transition policy.
    pub fn policy(&self) -> TransitionPolicy {
        self.policy
    }

    /// Returns true when running on the process-local fallback store.
    pub fn is_degraded(&self) -> bool {
        self.store.is_degraded()
    }

    /// Reads a session's record. `None` means never written, expired, or
    /// unreadable.
    pub async fn get_state(&self, session_id: &str) -> Option<WorkflowState> {
        self.store.get(session_id).await
    }

    /// Writes a whole record without the session lock.
    ///
    /// Last writer wins. Under [`TransitionPolicy::Strict`] a write that
    /// moves the stored status backward is refused. Returns false on any
    /// failure.
    pub async fn set_state(&self, state: &mut WorkflowState) -> bool {
        if self.policy == TransitionPolicy::Strict {
            if let Some(current) = self.store.get(&state.session_id).await {
                if let Err(e) = self
                    .policy
                    .check(&state.session_id, current.status, state.status)
                {
                    warn!(session_id = %state.session_id, error = %e, "state write refused");
                    return false;
                }
            }
        }
        self.store.set(state, &self.writer_id).await
    }

    /// Applies a partial update under the session lock.
    ///
    /// # Errors
    ///
    /// Fails closed with [`CoordError::LockTimeout`] or
    /// [`CoordError::StoreUnavailable`], in which case nothing was written,
    /// or with [`CoordError::IllegalTransition`] under the strict policy.
    pub async fn update_state(&self, session_id: &str, update: StateUpdate) -> Result<WorkflowState> {
        let policy = self.policy;
        self.store
            .update(session_id, &self.writer_id, move |state| {
                if let Some(to) = update.status {
                    policy.check(&state.session_id, state.status, to)?;
                }
                state.apply(&update);
                Ok(())
            })
            .await
    }

    /// Applies untyped fields under the session lock.
    ///
    /// `status` and milestone names are type-checked; other keys land in
    /// metadata.
    pub async fn update_fields(
        &self,
        session_id: &str,
        fields: &Map<String, JsonValue>,
    ) -> Result<WorkflowState> {
        let update = StateUpdate::from_fields(fields)?;
        self.update_state(session_id, update).await
    }

    /// Runs a computed update under the session lock.
    ///
    /// The closure sees the current record (or a fresh one) and may change
    /// it freely; the transition policy is checked on the result.
    pub async fn update_with<F>(&self, session_id: &str, apply: F) -> Result<WorkflowState>
    where
        F: FnOnce(&mut WorkflowState) -> Result<()> + Send,
    {
        let policy = self.policy;
        self.store
            .update(session_id, &self.writer_id, move |state| {
                let before = state.status;
                apply(state)?;
                policy.check(&state.session_id, before, state.status)
            })
            .await
    }

    /// Records that `milestone` completed for a session.
    ///
    /// Records it in this worker's cache, sets the flag through the locked
    /// update (advancing the status when that is forward progress),
    /// publishes a [`WorkflowEvent::MilestoneCompleted`], and writes the
    /// durable marker for milestones configured to leave one. A failure in
    /// one step is logged and does not stop the others.
    pub async fn mark_milestone_complete(
        &self,
        session_id: &str,
        milestone: Milestone,
    ) -> MilestoneReceipt {
        let span = info_span!("mark_milestone_complete", session_id, %milestone);
        async move {
            self.cache.record(session_id, milestone).await;

            let state = match self
                .store
                .update(session_id, &self.writer_id, |state| {
                    state.set_milestone(milestone, true);
                    let implied = milestone.implied_status();
                    if implied > state.status {
                        state.status = implied;
                    }
                    Ok(())
                })
                .await
            {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(error = %e, "milestone flag not persisted, relying on other evidence");
                    None
                }
            };

            let event_published = self
                .store
                .notifier()
                .publish_event(&WorkflowEvent::MilestoneCompleted {
                    session_id: session_id.to_string(),
                    milestone,
                    writer_id: self.writer_id.clone(),
                })
                .await;

            let marker_written = if self.marker_milestones.contains(&milestone) {
                match self.markers.touch(session_id, milestone).await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(error = %e, "durable marker not written");
                        false
                    }
                }
            } else {
                false
            };

            info!(
                persisted = state.is_some(),
                marker_written, event_published, "milestone recorded"
            );
            MilestoneReceipt {
                state,
                marker_written,
                event_published,
            }
        }
        .instrument(span)
        .await
    }

    /// Resolves a milestone against every evidence source.
    pub async fn readiness(&self, session_id: &str, milestone: Milestone) -> Readiness {
        self.resolver.resolve(session_id, milestone).await
    }

    /// Returns true if any evidence source confirms the milestone.
    pub async fn is_milestone_complete(&self, session_id: &str, milestone: Milestone) -> bool {
        self.resolver.is_complete(session_id, milestone).await
    }

    /// Gate for downstream stages.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::MilestoneNotReady`] unless some evidence
    /// source confirms the milestone.
    pub async fn require_milestone(&self, session_id: &str, milestone: Milestone) -> Result<Readiness> {
        let readiness = self.readiness(session_id, milestone).await;
        if readiness.complete {
            Ok(readiness)
        } else {
            Err(CoordError::MilestoneNotReady {
                session_id: session_id.to_string(),
                milestone: milestone.to_string(),
            })
        }
    }

    /// The stored status, or `NOT_STARTED` when there is no record.
    pub async fn get_status(&self, session_id: &str) -> WorkflowStatus {
        self.get_state(session_id)
            .await
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// Resets a session.
    ///
    /// Under the session lock: removes the session's markers, deletes the
    /// record and forgets this worker's cached milestones. Then publishes
    /// [`WorkflowEvent::StateCleared`]. Output artifacts are left alone.
    ///
    /// A resolver that saw a marker before the clear re-checks it under the
    /// same lock before repairing, so a cleared session stays cleared.
    ///
    /// Returns true if a record was deleted. If the lock cannot be acquired
    /// nothing is cleared and false is returned.
    pub async fn clear_state(&self, session_id: &str) -> bool {
        let guard = match self.store.lock().acquire(session_id).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(session_id, error = %e, "session not cleared");
                return false;
            }
        };

        match self.markers.remove_all(session_id).await {
            Ok(count) if count > 0 => info!(session_id, count, "markers removed"),
            Ok(_) => {}
            Err(e) => warn!(session_id, error = %e, "markers not removed"),
        }
        let removed = self.store.delete(session_id).await;
        self.cache.clear_session(session_id).await;
        guard.release().await;

        self.store
            .notifier()
            .publish_event(&WorkflowEvent::StateCleared {
                session_id: session_id.to_string(),
            })
            .await;

        info!(session_id, removed, "session state cleared");
        removed
    }

    /// Session ids with a live record, sorted.
    pub async fn list_active_sessions(&self) -> Vec<String> {
        self.store.list_sessions().await
    }

    /// Builds a report of the session's status and every milestone's
    /// evidence.
    ///
    /// Reporting never writes: milestones confirmed only by fallback
    /// evidence show up as stale instead of being repaired.
    pub async fn session_report(&self, session_id: &str) -> SessionReport {
        let resolver = self.resolver.clone().with_read_repair(false);
        let state = self.get_state(session_id).await;
        let mut readiness = Vec::with_capacity(Milestone::ALL.len());
        for milestone in Milestone::ALL {
            readiness.push(resolver.resolve(session_id, milestone).await);
        }
        SessionReport::new(
            session_id,
            state.as_ref(),
            self.store.backend_kind(),
            readiness,
        )
    }

    /// Subscribes to a session's updates and events.
    pub fn subscribe(&self, session_id: &str) -> SessionSubscription {
        self.store.notifier().subscribe(session_id)
    }

    /// Returns a session's retained notifications after `after_id`.
    pub async fn replay(&self, session_id: &str, after_id: u64) -> Result<Vec<SessionNotification>> {
        self.store.notifier().replay(session_id, after_id).await
    }
}

impl fmt::Debug for WorkflowStateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowStateManager")
            .field("writer_id", &self.writer_id)
            .field("store", &self.store)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
