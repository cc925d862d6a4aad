//! Change notifications.
//!
//! This module provides [`ChangeNotifier`], which publishes two kinds of
//! per-session messages:
//!
//! - the full serialized [`WorkflowState`] after every write, on
//!   `workflow_updates:<session_id>`
//! - discrete [`WorkflowEvent`]s such as a milestone completing, on
//!   `workflow_events:<session_id>`, for edge-triggered consumers
//!
//! Notifications are advisory. A subscriber that misses one can always
//! reconstruct the current state with a read, or catch up with
//! [`ChangeNotifier::replay`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::evidence::EvidenceSource;
use crate::state_store::{Notification, StateBackend, EVENT_CHANNEL_PREFIX, UPDATE_CHANNEL_PREFIX};
use crate::{CoordError, Milestone, Result, WorkflowState};

/// Most messages returned by one replay call.
const REPLAY_LIMIT: usize = 1_000;

/// Channel carrying full state snapshots for a session.
pub fn update_channel(session_id: &str) -> String {
    format!("{UPDATE_CHANNEL_PREFIX}{session_id}")
}

/// Channel carrying discrete events for a session.
pub fn event_channel(session_id: &str) -> String {
    format!("{EVENT_CHANNEL_PREFIX}{session_id}")
}

/// A discrete, named change to a session.
///
/// Events are serialized as JSON with an `event` tag so non-Rust
/// consumers can dispatch on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum WorkflowEvent {
    /// A milestone flag was set.
    MilestoneCompleted {
        /// The session's identifier.
        session_id: String,
        /// The milestone that completed.
        milestone: Milestone,
        /// Worker that recorded it.
        writer_id: String,
    },

    /// The session was reset.
    StateCleared {
        /// The session's identifier.
        session_id: String,
    },

    /// The store was rewritten from weaker evidence.
    StateRepaired {
        /// The session's identifier.
        session_id: String,
        /// The milestone that was restored.
        milestone: Milestone,
        /// Where the completion evidence came from.
        source: EvidenceSource,
    },
}

impl WorkflowEvent {
    /// Returns the session ID for this event.
    pub fn session_id(&self) -> &str {
        match self {
            Self::MilestoneCompleted { session_id, .. }
            | Self::StateCleared { session_id }
            | Self::StateRepaired { session_id, .. } => session_id,
        }
    }

    /// Returns the milestone for this event, if applicable.
    pub fn milestone(&self) -> Option<Milestone> {
        match self {
            Self::MilestoneCompleted { milestone, .. } | Self::StateRepaired { milestone, .. } => {
                Some(*milestone)
            }
            Self::StateCleared { .. } => None,
        }
    }
}

impl fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MilestoneCompleted {
                session_id,
                milestone,
                writer_id,
            } => write!(f, "{session_id}: {milestone} completed by {writer_id}"),
            Self::StateCleared { session_id } => write!(f, "{session_id}: cleared"),
            Self::StateRepaired {
                session_id,
                milestone,
                source,
            } => write!(f, "{session_id}: {milestone} repaired from {source}"),
        }
    }
}

/// A decoded message received for one session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotification {
    /// A full state snapshot written by some worker.
    State {
        /// Backend-assigned message id.
        id: u64,
        /// The state as written.
        state: Box<WorkflowState>,
    },
    /// A discrete event.
    Event {
        /// Backend-assigned message id.
        id: u64,
        /// The event.
        event: WorkflowEvent,
    },
}

impl SessionNotification {
    /// Backend-assigned message id, usable as a replay cursor.
    pub fn id(&self) -> u64 {
        match self {
            Self::State { id, .. } | Self::Event { id, .. } => *id,
        }
    }

    fn decode(session_id: &str, notification: &Notification) -> Option<Self> {
        let decoded = if notification.channel.starts_with(UPDATE_CHANNEL_PREFIX) {
            serde_json::from_str::<WorkflowState>(&notification.payload).map(|state| Self::State {
                id: notification.id,
                state: Box::new(state),
            })
        } else {
            serde_json::from_str::<WorkflowEvent>(&notification.payload).map(|event| Self::Event {
                id: notification.id,
                event,
            })
        };

        match decoded {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(
                    session_id,
                    channel = %notification.channel,
                    error = %e,
                    "skipping undecodable notification"
                );
                None
            }
        }
    }
}

/// Publishes state snapshots and events through the store's backend.
///
/// Publishing never fails the caller: a failed publish is logged and
/// reported as `false`.
#[derive(Clone)]
pub struct ChangeNotifier {
    backend: Arc<dyn StateBackend>,
    timeout: Duration,
}

impl ChangeNotifier {
    /// Creates a notifier over `backend`, bounding each publish by `timeout`.
    pub fn new(backend: Arc<dyn StateBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    async fn publish(&self, session_id: &str, channel: &str, payload: &str) -> bool {
        match tokio::time::timeout(self.timeout, self.backend.publish(channel, payload)).await {
            Ok(Ok(id)) => {
                debug!(session_id, channel, id, "notification published");
                true
            }
            Ok(Err(e)) => {
                warn!(session_id, channel, error = %e, "notification publish failed");
                false
            }
            Err(_) => {
                warn!(session_id, channel, "notification publish timed out");
                false
            }
        }
    }

    /// Publishes an already-serialized state on the session's update channel.
    pub async fn publish_state_payload(&self, session_id: &str, payload: &str) -> bool {
        self.publish(session_id, &update_channel(session_id), payload)
            .await
    }

    /// Serializes and publishes a state snapshot.
    pub async fn publish_state(&self, state: &WorkflowState) -> bool {
        match serde_json::to_string(state) {
            Ok(payload) => self.publish_state_payload(&state.session_id, &payload).await,
            Err(e) => {
                warn!(session_id = %state.session_id, error = %e, "state not serializable");
                false
            }
        }
    }

    /// Publishes a discrete event on the session's event channel.
    pub async fn publish_event(&self, event: &WorkflowEvent) -> bool {
        let session_id = event.session_id();
        match serde_json::to_string(event) {
            Ok(payload) => {
                self.publish(session_id, &event_channel(session_id), &payload)
                    .await
            }
            Err(e) => {
                warn!(session_id, error = %e, "event not serializable");
                false
            }
        }
    }

    /// Subscribes to one session's updates and events as published through
    /// this process.
    ///
    /// Workers in other processes see the same messages through
    /// [`replay`](Self::replay).
    pub fn subscribe(&self, session_id: &str) -> SessionSubscription {
        SessionSubscription {
            session_id: session_id.to_string(),
            update_channel: update_channel(session_id),
            event_channel: event_channel(session_id),
            receiver: self.backend.subscribe(),
        }
    }

    /// Returns the session's retained messages with ids above `after_id`,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::StoreUnavailable`] if the backend cannot be
    /// queried.
    pub async fn replay(&self, session_id: &str, after_id: u64) -> Result<Vec<SessionNotification>> {
        let query = async {
            let mut raw = self
                .backend
                .notifications_since(&update_channel(session_id), after_id, REPLAY_LIMIT)
                .await?;
            raw.extend(
                self.backend
                    .notifications_since(&event_channel(session_id), after_id, REPLAY_LIMIT)
                    .await?,
            );
            Ok::<_, CoordError>(raw)
        };

        let mut raw = tokio::time::timeout(self.timeout, query)
            .await
            .map_err(|_| CoordError::StoreUnavailable("replay: timed out".to_string()))?
            .map_err(|e| CoordError::StoreUnavailable(format!("replay: {e}")))?;

        raw.sort_by_key(|n| n.id);
        Ok(raw
            .iter()
            .filter_map(|n| SessionNotification::decode(session_id, n))
            .collect())
    }
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("backend", &self.backend.kind())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A live feed of one session's notifications.
#[derive(Debug)]
pub struct SessionSubscription {
    session_id: String,
    update_channel: String,
    event_channel: String,
    receiver: broadcast::Receiver<Notification>,
}

impl SessionSubscription {
    /// The subscribed session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Waits for the next message for this session.
    ///
    /// Messages for other sessions are skipped. If the subscriber fell
    /// behind and messages were dropped, that is logged and receiving
    /// continues; [`ChangeNotifier::replay`] can fill the gap. Returns
    /// `None` once the backend is gone.
    pub async fn recv(&mut self) -> Option<SessionNotification> {
        loop {
            match self.receiver.recv().await {
                Ok(notification) => {
                    if notification.channel != self.update_channel
                        && notification.channel != self.event_channel
                    {
                        continue;
                    }
                    if let Some(message) = SessionNotification::decode(&self.session_id, &notification)
                    {
                        return Some(message);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session_id = %self.session_id, skipped, "subscriber lagged, notifications dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
