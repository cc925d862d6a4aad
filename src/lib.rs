//! # Waypost
//!
//! Per-session workflow state shared by many worker processes.
//!
//! A multi-stage analysis pipeline is served by N independent workers, and
//! any request for a session may land on any of them. Waypost keeps one
//! [`WorkflowState`] record per session in a store every worker can reach,
//! serializes read-modify-write cycles per session with a TTL'd lock, and
//! answers the question downstream stages actually ask ("did risk analysis
//! finish for this session?") through an [`EvidenceResolver`] that tolerates
//! any one evidence source being stale or unreachable.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use waypost::{CoordinationConfig, Milestone, StateUpdate, WorkflowStateManager, WorkflowStatus};
//!
//! let config = CoordinationConfig::load()?;
//! let manager = WorkflowStateManager::new(&config).await;
//!
//! manager
//!     .update_state("abc-123", StateUpdate::new().status(WorkflowStatus::RiskAnalyzing))
//!     .await?;
//!
//! // ...risk scoring runs...
//! manager.mark_milestone_complete("abc-123", Milestone::AnalysisComplete).await;
//!
//! // Later, possibly on another worker:
//! manager.require_milestone("abc-123", Milestone::AnalysisComplete).await?;
//! ```
//!
//! ## Failure Model
//!
//! Coordination trades strict consistency for availability. An unreachable
//! store degrades to a process-local one (logged, and visible through
//! [`StateStore::is_degraded`]); reads of unreachable or corrupted records
//! come back empty. The one thing that never degrades is a readiness gate:
//! when no source confirms a milestone, the answer is "not complete".

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod evidence;
pub mod lock;
pub mod manager;
pub mod marker;
pub mod notifier;
pub mod report;
pub mod state;
pub mod state_store;
pub mod telemetry;

pub use crate::config::CoordinationConfig;
pub use error::{CoordError, Result};
pub use evidence::{
    ArtifactProbe, ArtifactRule, EvidenceResolver, EvidenceSource, LocalMilestoneCache, Readiness,
};
pub use lock::{DistributedLock, LockGuard};
pub use manager::{MilestoneReceipt, TransitionPolicy, WorkflowStateManager};
pub use marker::MarkerStore;
pub use notifier::{ChangeNotifier, SessionNotification, SessionSubscription, WorkflowEvent};
pub use report::SessionReport;
pub use state::{Milestone, StateUpdate, WorkflowState, WorkflowStatus};
pub use state_store::{BackendKind, MemoryBackend, Notification, StateBackend, StateStore};

#[cfg(feature = "sqlite")]
pub use state_store::SqliteBackend;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_returns_valid_semver() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
