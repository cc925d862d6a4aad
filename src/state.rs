//! The per-session workflow state record.
//!
//! This module defines [`WorkflowState`], the single record kept per
//! session, together with the status vocabulary ([`WorkflowStatus`]), the
//! milestone flags ([`Milestone`]) and the partial-update type
//! ([`StateUpdate`]) applied during a locked read-modify-write.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{CoordError, Result};

/// Longest session id accepted as a storage key.
const MAX_SESSION_ID_LEN: usize = 256;

/// Position of a session in the analysis pipeline.
///
/// Variants are declared in pipeline order, so the derived ordering can be
/// used to tell forward progress from regression. The store itself never
/// enforces that order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Nothing has been written for the session.
    #[default]
    NotStarted,
    /// Input data has been uploaded.
    DataUploaded,
    /// Test positivity rate calculation finished.
    TprComplete,
    /// Risk scoring is running.
    RiskAnalyzing,
    /// Risk scoring finished.
    RiskComplete,
    /// Net distribution planning is running.
    ItnPlanning,
    /// Net distribution planning finished.
    ItnComplete,
    /// Report generation is running.
    ReportGenerating,
    /// The session is done.
    Complete,
}

impl WorkflowStatus {
    /// Every status, in pipeline order.
    pub const ALL: [WorkflowStatus; 9] = [
        Self::NotStarted,
        Self::DataUploaded,
        Self::TprComplete,
        Self::RiskAnalyzing,
        Self::RiskComplete,
        Self::ItnPlanning,
        Self::ItnComplete,
        Self::ReportGenerating,
        Self::Complete,
    ];

    /// Returns the wire name, e.g. `RISK_ANALYZING`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::DataUploaded => "DATA_UPLOADED",
            Self::TprComplete => "TPR_COMPLETE",
            Self::RiskAnalyzing => "RISK_ANALYZING",
            Self::RiskComplete => "RISK_COMPLETE",
            Self::ItnPlanning => "ITN_PLANNING",
            Self::ItnComplete => "ITN_COMPLETE",
            Self::ReportGenerating => "REPORT_GENERATING",
            Self::Complete => "COMPLETE",
        }
    }

    /// Zero-based position in the pipeline.
    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    /// The conventional successor, or `None` for [`WorkflowStatus::Complete`].
    pub fn next(&self) -> Option<WorkflowStatus> {
        Self::ALL.get(self.ordinal() + 1).copied()
    }

    /// Returns true for the status with no outgoing transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| CoordError::UnknownStatus(s.to_string()))
    }
}

/// A named completion flag for one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    /// Any input data is available.
    DataLoaded,
    /// The tabular upload was parsed.
    CsvLoaded,
    /// The boundary shapefile was parsed.
    ShapefileLoaded,
    /// Test positivity rate calculation finished.
    TprCompleted,
    /// Risk scoring finished and its rankings were written.
    AnalysisComplete,
    /// Net distribution planning finished.
    ItnPlanningComplete,
}

impl Milestone {
    /// Every milestone, in pipeline order.
    pub const ALL: [Milestone; 6] = [
        Self::DataLoaded,
        Self::CsvLoaded,
        Self::ShapefileLoaded,
        Self::TprCompleted,
        Self::AnalysisComplete,
        Self::ItnPlanningComplete,
    ];

    /// Returns the field name used on the wire and in markers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataLoaded => "data_loaded",
            Self::CsvLoaded => "csv_loaded",
            Self::ShapefileLoaded => "shapefile_loaded",
            Self::TprCompleted => "tpr_completed",
            Self::AnalysisComplete => "analysis_complete",
            Self::ItnPlanningComplete => "itn_planning_complete",
        }
    }

    /// The status a session reaches when this milestone completes.
    pub fn implied_status(&self) -> WorkflowStatus {
        match self {
            Self::DataLoaded | Self::CsvLoaded | Self::ShapefileLoaded => {
                WorkflowStatus::DataUploaded
            }
            Self::TprCompleted => WorkflowStatus::TprComplete,
            Self::AnalysisComplete => WorkflowStatus::RiskComplete,
            Self::ItnPlanningComplete => WorkflowStatus::ItnComplete,
        }
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Milestone {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| CoordError::UnknownMilestone(s.to_string()))
    }
}

/// Checks that a session id is usable as a key and as a path component.
///
/// # Errors
///
/// Returns [`CoordError::InvalidSessionId`] for empty or oversized ids, and
/// for ids containing path separators, `..`, or control characters.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let invalid = session_id.is_empty()
        || session_id.len() > MAX_SESSION_ID_LEN
        || session_id == "."
        || session_id.contains("..")
        || session_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if invalid {
        return Err(CoordError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

/// The coordination record for one session.
///
/// Created implicitly by the first write, refreshed by every later write,
/// and removed either by TTL expiry or by an explicit clear. Absence in the
/// store means "never written or expired", not "not started".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Opaque correlation key supplied by the calling layer.
    pub session_id: String,

    /// Current pipeline status. Not validated against the previous value.
    pub status: WorkflowStatus,

    /// Any input data is available.
    #[serde(default)]
    pub data_loaded: bool,

    /// The tabular upload was parsed.
    #[serde(default)]
    pub csv_loaded: bool,

    /// The boundary shapefile was parsed.
    #[serde(default)]
    pub shapefile_loaded: bool,

    /// Test positivity rate calculation finished.
    #[serde(default)]
    pub tpr_completed: bool,

    /// Risk scoring finished.
    #[serde(default)]
    pub analysis_complete: bool,

    /// Net distribution planning finished.
    #[serde(default)]
    pub itn_planning_complete: bool,

    /// Number of successful writes of this record.
    #[serde(default)]
    pub version: u64,

    /// When the record was first synthesized.
    pub created_at: DateTime<Utc>,

    /// Refreshed on every write.
    pub last_updated: DateTime<Utc>,

    /// Diagnostic identity of the last writer (`host:pid`).
    #[serde(default)]
    pub writer_id: String,

    /// FNV-1a hash of the canonical serialization, excluding this field.
    #[serde(default)]
    pub checksum: String,

    /// Fields not covered by the typed attributes.
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

impl WorkflowState {
    /// Creates a fresh `NOT_STARTED` record for a session.
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            status: WorkflowStatus::NotStarted,
            data_loaded: false,
            csv_loaded: false,
            shapefile_loaded: false,
            tpr_completed: false,
            analysis_complete: false,
            itn_planning_complete: false,
            version: 0,
            created_at: now,
            last_updated: now,
            writer_id: String::new(),
            checksum: String::new(),
            metadata: Map::new(),
        }
    }

    /// Returns the value of a milestone flag.
    pub fn milestone(&self, milestone: Milestone) -> bool {
        match milestone {
            Milestone::DataLoaded => self.data_loaded,
            Milestone::CsvLoaded => self.csv_loaded,
            Milestone::ShapefileLoaded => self.shapefile_loaded,
            Milestone::TprCompleted => self.tpr_completed,
            Milestone::AnalysisComplete => self.analysis_complete,
            Milestone::ItnPlanningComplete => self.itn_planning_complete,
        }
    }

    /// Sets a milestone flag. Resetting to `false` is allowed.
    pub fn set_milestone(&mut self, milestone: Milestone, value: bool) {
        let flag = match milestone {
            Milestone::DataLoaded => &mut self.data_loaded,
            Milestone::CsvLoaded => &mut self.csv_loaded,
            Milestone::ShapefileLoaded => &mut self.shapefile_loaded,
            Milestone::TprCompleted => &mut self.tpr_completed,
            Milestone::AnalysisComplete => &mut self.analysis_complete,
            Milestone::ItnPlanningComplete => &mut self.itn_planning_complete,
        };
        *flag = value;
    }

    /// Milestones currently set to `true`, in pipeline order.
    pub fn completed_milestones(&self) -> Vec<Milestone> {
        Milestone::ALL
            .iter()
            .copied()
            .filter(|m| self.milestone(*m))
            .collect()
    }

    /// Applies a partial update in place.
    pub fn apply(&mut self, update: &StateUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        for (milestone, value) in &update.milestones {
            self.set_milestone(*milestone, *value);
        }
        for (key, value) in &update.metadata {
            self.metadata.insert(key.clone(), value.clone());
        }
    }

    /// Stamps writer identity and time, bumps the version and recomputes
    /// the checksum. Called by the store immediately before every write.
    pub fn stamp(&mut self, writer_id: &str) {
        self.last_updated = Utc::now();
        self.writer_id = writer_id.to_string();
        self.version += 1;
        self.checksum = self.compute_checksum();
    }

    /// Computes the checksum over the canonical serialization.
    ///
    /// The record is rendered as a `serde_json::Value` (whose maps are
    /// key-sorted) with `checksum` removed, then hashed with FNV-1a 64.
    pub fn compute_checksum(&self) -> String {
        let canonical = match serde_json::to_value(self) {
            Ok(JsonValue::Object(mut fields)) => {
                fields.remove("checksum");
                JsonValue::Object(fields).to_string()
            }
            Ok(other) => other.to_string(),
            Err(_) => return String::new(),
        };
        format!("{:016x}", fnv1a64(canonical.as_bytes()))
    }

    /// Returns true if the stored checksum matches the record's content.
    pub fn verify_checksum(&self) -> bool {
        !self.checksum.is_empty() && self.checksum == self.compute_checksum()
    }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut h = OFFSET;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

/// A partial update applied to a [`WorkflowState`].
///
/// Build one with the chained setters, or from an untyped field map with
/// [`StateUpdate::from_fields`].
///
/// # Example
///
/// ```
/// use waypost::{Milestone, StateUpdate, WorkflowStatus};
///
/// let update = StateUpdate::new()
///     .status(WorkflowStatus::RiskAnalyzing)
///     .milestone(Milestone::CsvLoaded, true)
///     .metadata("variables", serde_json::json!(["rainfall", "elevation"]));
/// assert_eq!(update.status, Some(WorkflowStatus::RiskAnalyzing));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    /// New status, if any.
    pub status: Option<WorkflowStatus>,
    /// Milestone flags to set, in application order.
    pub milestones: Vec<(Milestone, bool)>,
    /// Keys merged into the record's metadata.
    pub metadata: Map<String, JsonValue>,
}

impl StateUpdate {
    /// Creates an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status.
    pub fn status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets a milestone flag.
    pub fn milestone(mut self, milestone: Milestone, value: bool) -> Self {
        self.milestones.push((milestone, value));
        self
    }

    /// Merges a metadata key.
    pub fn metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns true if applying this update would change nothing.
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.milestones.is_empty() && self.metadata.is_empty()
    }

    /// Builds an update from untyped fields.
    ///
    /// `status` and the milestone names are recognised and type-checked;
    /// any other key is merged into metadata. `metadata` itself, when given
    /// as an object, is merged key by key.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::InvalidField`] when a recognised key has the
    /// wrong JSON type, and [`CoordError::UnknownStatus`] for an
    /// unrecognised status string.
    pub fn from_fields(fields: &Map<String, JsonValue>) -> Result<Self> {
        let mut update = Self::new();
        for (key, value) in fields {
            if key == "status" {
                let name = value.as_str().ok_or_else(|| CoordError::InvalidField {
                    field: key.clone(),
                    reason: format!("expected a string, got {}", value),
                })?;
                update.status = Some(name.parse()?);
            } else if let Ok(milestone) = key.parse::<Milestone>() {
                let flag = value.as_bool().ok_or_else(|| CoordError::InvalidField {
                    field: key.clone(),
                    reason: format!("expected a boolean, got {}", value),
                })?;
                update.milestones.push((milestone, flag));
            } else if key == "metadata" && value.is_object() {
                if let Some(nested) = value.as_object() {
                    for (k, v) in nested {
                        update.metadata.insert(k.clone(), v.clone());
                    }
                }
            } else {
                update.metadata.insert(key.clone(), value.clone());
            }
        }
        Ok(update)
    }

    /// Combines two updates into their field-union; `later` wins on overlap.
    pub fn merge(mut self, later: StateUpdate) -> Self {
        if later.status.is_some() {
            self.status = later.status;
        }
        self.milestones.extend(later.milestones);
        for (key, value) in later.metadata {
            self.metadata.insert(key, value);
        }
        self
    }
}
