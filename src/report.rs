//! Session status reporting.
//!
//! This module provides [`SessionReport`] for inspecting where a session
//! is in the pipeline and which evidence backs each milestone.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::evidence::{EvidenceSource, Readiness};
use crate::state_store::BackendKind;
use crate::{Milestone, WorkflowState, WorkflowStatus};

/// Readiness of one milestone within a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MilestoneEntry {
    /// The milestone.
    pub milestone: Milestone,
    /// Whether the stored flag is set.
    pub flagged: bool,
    /// Evidence found for it, if any.
    pub readiness: Readiness,
}

impl MilestoneEntry {
    /// Builds an entry from a stored record and a resolver answer.
    pub fn new(state: Option<&WorkflowState>, readiness: Readiness) -> Self {
        Self {
            milestone: readiness.milestone,
            flagged: state.is_some_and(|s| s.milestone(readiness.milestone)),
            readiness,
        }
    }

    /// Returns true if any source confirms the milestone.
    pub fn is_complete(&self) -> bool {
        self.readiness.complete
    }

    /// Returns a status indicator character.
    pub fn status_char(&self) -> char {
        match self.readiness.source {
            Some(EvidenceSource::StateStore) => '✅',
            Some(_) => '🔁', // complete, but only weaker evidence says so
            None => '⏳',
        }
    }
}

/// A snapshot of one session for dashboards and logs.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    /// The session's identifier.
    pub session_id: String,
    /// Stored status, or `NOT_STARTED` when absent.
    pub status: WorkflowStatus,
    /// Whether a record exists in the store.
    pub stored: bool,
    /// Record version, if stored.
    pub version: Option<u64>,
    /// Last writer, if stored.
    pub writer_id: Option<String>,
    /// Last write time, if stored.
    pub last_updated: Option<DateTime<Utc>>,
    /// Which backend answered.
    pub backend: BackendKind,
    /// One entry per milestone, in pipeline order.
    pub milestones: Vec<MilestoneEntry>,
}

impl SessionReport {
    /// Builds a report from the stored record and per-milestone answers.
    pub fn new(
        session_id: impl Into<String>,
        state: Option<&WorkflowState>,
        backend: BackendKind,
        readiness: impl IntoIterator<Item = Readiness>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            status: state.map(|s| s.status).unwrap_or_default(),
            stored: state.is_some(),
            version: state.map(|s| s.version),
            writer_id: state.map(|s| s.writer_id.clone()),
            last_updated: state.map(|s| s.last_updated),
            backend,
            milestones: readiness
                .into_iter()
                .map(|r| MilestoneEntry::new(state, r))
                .collect(),
        }
    }

    /// Returns true if every milestone is confirmed.
    pub fn is_complete(&self) -> bool {
        self.milestones.iter().all(MilestoneEntry::is_complete)
    }

    /// Milestones confirmed only by weaker evidence than the store flag.
    pub fn stale_milestones(&self) -> Vec<Milestone> {
        self.milestones
            .iter()
            .filter(|m| m.is_complete() && !m.flagged)
            .map(|m| m.milestone)
            .collect()
    }

    /// Returns the overall progress as a percentage.
    pub fn progress_percent(&self) -> f32 {
        if self.milestones.is_empty() {
            return 100.0;
        }
        let completed = self.milestones.iter().filter(|m| m.is_complete()).count();
        (completed as f32 / self.milestones.len() as f32) * 100.0
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Session \"{}\": {}", self.session_id, self.status)?;

        if self.stored {
            let time = self
                .last_updated
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "  version {} by {} at {} ({} store)",
                self.version.unwrap_or_default(),
                self.writer_id.as_deref().unwrap_or("-"),
                time,
                self.backend
            )?;
        } else {
            writeln!(f, "  no stored record ({} store)", self.backend)?;
        }
        writeln!(f)?;

        for entry in &self.milestones {
            let source = entry
                .readiness
                .source
                .map(|s| s.as_str())
                .unwrap_or("-");
            write!(
                f,
                "  {} {:<22} {}",
                entry.status_char(),
                entry.milestone.as_str(),
                source
            )?;
            if entry.readiness.repaired {
                write!(f, "  (repaired)")?;
            }
            writeln!(f)?;
        }

        writeln!(f)?;
        write!(f, "Progress: {:.0}%", self.progress_percent())
    }
}
