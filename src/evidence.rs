//! Milestone readiness from several independent evidence sources.
//!
//! [`EvidenceResolver`] answers "is milestone X complete for this session?"
//! by consulting, in strict precedence order and stopping at the first
//! affirmative:
//!
//! 1. the flag in the shared [`StateStore`]
//! 2. a durable marker file ([`MarkerStore`])
//! 3. known output artifacts on disk, or known columns in a derived dataset
//! 4. this worker's [`LocalMilestoneCache`]
//!
//! When every source is silent or unreachable the answer is "not complete".
//! When a weaker source affirms what the store did not, the store is
//! repaired through the locked update so later callers take the fast path.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::marker::MarkerStore;
use crate::notifier::WorkflowEvent;
use crate::state::validate_session_id;
use crate::{Milestone, Result, StateStore};

/// Where a readiness answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    /// The milestone flag in the shared store.
    StateStore,
    /// A durable marker file.
    DurableMarker,
    /// Output files or dataset columns on disk.
    Artifacts,
    /// This worker's in-memory record.
    LocalCache,
}

impl EvidenceSource {
    /// Every source, in precedence order.
    pub const ALL: [EvidenceSource; 4] = [
        Self::StateStore,
        Self::DurableMarker,
        Self::Artifacts,
        Self::LocalCache,
    ];

    /// Short name used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateStore => "state_store",
            Self::DurableMarker => "durable_marker",
            Self::Artifacts => "artifacts",
            Self::LocalCache => "local_cache",
        }
    }
}

impl fmt::Display for EvidenceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The answer to a readiness query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    /// Milestone that was checked.
    pub milestone: Milestone,
    /// Whether any source confirmed completion.
    pub complete: bool,
    /// First source that confirmed it; `None` when inconclusive.
    pub source: Option<EvidenceSource>,
    /// Whether the store was rewritten as a result of this query.
    pub repaired: bool,
}

impl Readiness {
    fn inconclusive(milestone: Milestone) -> Self {
        Self {
            milestone,
            complete: false,
            source: None,
            repaired: false,
        }
    }

    fn confirmed(milestone: Milestone, source: EvidenceSource) -> Self {
        Self {
            milestone,
            complete: true,
            source: Some(source),
            repaired: false,
        }
    }
}

/// Known outputs that prove a milestone ran.
///
/// Paths are relative to the session directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRule {
    /// Milestone these artifacts prove.
    pub milestone: Milestone,
    /// Any of these files existing proves completion.
    #[serde(default)]
    pub files: Vec<String>,
    /// A CSV dataset whose header is inspected for `columns`.
    #[serde(default)]
    pub dataset: Option<String>,
    /// Any of these columns in `dataset` proves completion.
    #[serde(default)]
    pub columns: Vec<String>,
}

impl ArtifactRule {
    /// Rule proving `milestone` by file presence only.
    pub fn files(milestone: Milestone, files: &[&str]) -> Self {
        Self {
            milestone,
            files: files.iter().map(|f| f.to_string()).collect(),
            dataset: None,
            columns: Vec::new(),
        }
    }

    /// Adds a dataset whose header is checked for any of `columns`.
    pub fn with_columns(mut self, dataset: &str, columns: &[&str]) -> Self {
        self.dataset = Some(dataset.to_string());
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// The outputs written by the analysis pipeline's stages.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::files(
                Milestone::AnalysisComplete,
                &[
                    "analysis_vulnerability_rankings.csv",
                    "analysis_vulnerability_rankings_pca.csv",
                ],
            )
            .with_columns(
                "unified_dataset.csv",
                &["composite_score", "pca_score", "composite_rank", "pca_rank"],
            ),
            Self::files(
                Milestone::ItnPlanningComplete,
                &["itn_distribution_results.json"],
            ),
            Self::files(Milestone::TprCompleted, &["tpr_results.csv"]),
            Self::files(Milestone::CsvLoaded, &["raw_data.csv"]),
            Self::files(Milestone::ShapefileLoaded, &["raw_shapefile.zip"]),
        ]
    }
}

/// Reads CSV headers off the blocking pool.
async fn read_csv_header(path: PathBuf) -> Result<Vec<String>> {
    let header = tokio::task::spawn_blocking(move || -> std::result::Result<Vec<String>, csv::Error> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(&path)?;
        Ok(reader.headers()?.iter().map(|h| h.trim().to_string()).collect())
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    header.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e).into())
}

/// Checks a session directory against [`ArtifactRule`]s.
#[derive(Debug, Clone)]
pub struct ArtifactProbe {
    rules: Vec<ArtifactRule>,
}

impl ArtifactProbe {
    /// Creates a probe with the given rules.
    pub fn new(rules: Vec<ArtifactRule>) -> Self {
        Self { rules }
    }

    /// Columns declared for `milestone` across all rules.
    pub fn columns_for(&self, milestone: Milestone) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .filter(move |r| r.milestone == milestone)
            .flat_map(|r| r.columns.iter().map(String::as_str))
    }

    /// Returns true if any artifact for `milestone` is present under
    /// `session_dir`. Unreadable files count as absent.
    pub async fn detect(&self, session_dir: &Path, milestone: Milestone) -> bool {
        for rule in self.rules.iter().filter(|r| r.milestone == milestone) {
            for file in &rule.files {
                let path = session_dir.join(file);
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    debug!(%milestone, path = %path.display(), "artifact found");
                    return true;
                }
            }

            let Some(dataset) = &rule.dataset else {
                continue;
            };
            let path = session_dir.join(dataset);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                continue;
            }
            match read_csv_header(path.clone()).await {
                Ok(header) => {
                    if rule.columns.iter().any(|c| header.contains(c)) {
                        debug!(%milestone, path = %path.display(), "result columns found");
                        return true;
                    }
                }
                Err(e) => {
                    debug!(%milestone, path = %path.display(), error = %e, "dataset unreadable");
                }
            }
        }
        false
    }
}

#[derive(Debug, Default)]
struct SessionCache {
    milestones: HashSet<Milestone>,
    dataset_columns: HashSet<String>,
}

/// Milestones this worker completed itself, and the columns of datasets
/// it holds in memory.
///
/// Private to the process and never authoritative; it only stops a worker
/// from answering "not complete" about work it just did when every shared
/// source failed. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct LocalMilestoneCache {
    sessions: Arc<RwLock<HashMap<String, SessionCache>>>,
}

impl LocalMilestoneCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that this worker completed `milestone`.
    pub async fn record(&self, session_id: &str, milestone: Milestone) {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .milestones
            .insert(milestone);
    }

    /// Records the columns of a derived dataset this worker has loaded.
    pub async fn record_dataset_columns<I, S>(&self, session_id: &str, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .dataset_columns
            .extend(columns.into_iter().map(Into::into));
    }

    /// Returns true if this worker recorded `milestone`.
    pub async fn contains(&self, session_id: &str, milestone: Milestone) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .is_some_and(|s| s.milestones.contains(&milestone))
    }

    /// Returns true if any of `columns` is in a dataset this worker loaded.
    pub async fn has_any_column<'a>(
        &self,
        session_id: &str,
        mut columns: impl Iterator<Item = &'a str>,
    ) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(s) => columns.any(|c| s.dataset_columns.contains(c)),
            None => false,
        }
    }

    /// Forgets everything about a session.
    pub async fn clear_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }
}

enum Repair {
    Applied,
    Failed,
    Withdrawn,
}

/// Fail-closed readiness predicate with read-repair.
#[derive(Debug, Clone)]
pub struct EvidenceResolver {
    store: StateStore,
    markers: MarkerStore,
    probe: ArtifactProbe,
    cache: LocalMilestoneCache,
    read_repair: bool,
    writer_id: String,
}

impl EvidenceResolver {
    /// Creates a resolver over the given sources.
    pub fn new(
        store: StateStore,
        markers: MarkerStore,
        probe: ArtifactProbe,
        cache: LocalMilestoneCache,
        writer_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            markers,
            probe,
            cache,
            read_repair: true,
            writer_id: writer_id.into(),
        }
    }

    /// Enables or disables read-repair.
    pub fn with_read_repair(mut self, enabled: bool) -> Self {
        self.read_repair = enabled;
        self
    }

    /// The worker-local cache consulted as the last tier.
    pub fn cache(&self) -> &LocalMilestoneCache {
        &self.cache
    }

    /// The marker store consulted as the second tier.
    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    /// Returns true if any source confirms `milestone`.
    pub async fn is_complete(&self, session_id: &str, milestone: Milestone) -> bool {
        self.resolve(session_id, milestone).await.complete
    }

    /// Consults every source in precedence order and reports which one, if
    /// any, confirmed the milestone.
    pub async fn resolve(&self, session_id: &str, milestone: Milestone) -> Readiness {
        if let Err(e) = validate_session_id(session_id) {
            warn!(session_id, error = %e, "readiness check on invalid session id");
            return Readiness::inconclusive(milestone);
        }

        let span = info_span!("resolve_readiness", session_id, %milestone);
        async move {
            // Repair is only attempted when the store answered and said no.
            let store_answered = match self.store.load(session_id).await {
                Ok(Some(state)) if state.milestone(milestone) => {
                    return Readiness::confirmed(milestone, EvidenceSource::StateStore);
                }
                Ok(_) => true,
                Err(e) => {
                    warn!(error = %e, "state store unreadable, consulting other evidence");
                    false
                }
            };

            let Some(source) = self.fallback_source(session_id, milestone).await else {
                debug!("no evidence of completion");
                return Readiness::inconclusive(milestone);
            };

            info!(%source, "completion confirmed by fallback evidence");
            let mut readiness = Readiness::confirmed(milestone, source);
            if self.read_repair && store_answered {
                match self.repair(session_id, milestone, source).await {
                    Repair::Applied => readiness.repaired = true,
                    Repair::Failed => {}
                    Repair::Withdrawn => return Readiness::inconclusive(milestone),
                }
            }
            readiness
        }
        .instrument(span)
        .await
    }

    async fn fallback_source(
        &self,
        session_id: &str,
        milestone: Milestone,
    ) -> Option<EvidenceSource> {
        match self.markers.exists(session_id, milestone).await {
            Ok(true) => return Some(EvidenceSource::DurableMarker),
            Ok(false) => {}
            Err(e) => debug!(error = %e, "marker check failed"),
        }

        if let Ok(dir) = self.markers.session_dir(session_id) {
            if self.probe.detect(&dir, milestone).await {
                return Some(EvidenceSource::Artifacts);
            }
        }
        if self
            .cache
            .has_any_column(session_id, self.probe.columns_for(milestone))
            .await
        {
            return Some(EvidenceSource::Artifacts);
        }

        if self.cache.contains(session_id, milestone).await {
            return Some(EvidenceSource::LocalCache);
        }
        None
    }

    /// Sets the flag through the locked update. Failure is logged only.
    /// Writes the flag back under the session lock.
    ///
    /// The evidence is checked again once the lock is held: a concurrent
    /// clear removes markers while holding the same lock, and its session
    /// must stay cleared.
    async fn repair(
        &self,
        session_id: &str,
        milestone: Milestone,
        source: EvidenceSource,
    ) -> Repair {
        let guard = match self.store.lock().acquire(session_id).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(%source, error = %e, "read-repair skipped");
                return Repair::Failed;
            }
        };

        let repaired = match self.fallback_source(session_id, milestone).await {
            None => None,
            Some(_) => Some(
                self.store
                    .update_held(&guard, session_id, &self.writer_id, |state| {
                        state.set_milestone(milestone, true);
                        let implied = milestone.implied_status();
                        if implied > state.status {
                            state.status = implied;
                        }
                        Ok(())
                    })
                    .await,
            ),
        };
        guard.release().await;

        match repaired {
            None => {
                info!(%source, "evidence withdrawn before repair, session was cleared");
                Repair::Withdrawn
            }
            Some(Ok(state)) => {
                info!(%source, version = state.version, "state store repaired");
                self.store
                    .notifier()
                    .publish_event(&WorkflowEvent::StateRepaired {
                        session_id: session_id.to_string(),
                        milestone,
                        source,
                    })
                    .await;
                Repair::Applied
            }
            Some(Err(e)) => {
                warn!(%source, error = %e, "read-repair failed");
                Repair::Failed
            }
        }
    }
}
