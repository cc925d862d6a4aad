//! Integration tests for waypost.
//!
//! These tests exercise the coordination stack the way a fleet of workers
//! uses it:
//! - Locked read-modify-write under contention (and what goes wrong without it)
//! - Readiness checks when the store is stale, evicted or failing
//! - Read-repair convergence
//! - Notifications and replay
//! - Two processes sharing a SQLite file

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{broadcast, Barrier};

use waypost::state_store::state_key;
use waypost::{
    BackendKind, CoordError, CoordinationConfig, EvidenceSource, MemoryBackend, Milestone,
    Notification, Result, SessionNotification, StateBackend, StateUpdate, TransitionPolicy,
    WorkflowEvent, WorkflowState, WorkflowStateManager, WorkflowStatus,
};

/// A memory backend whose reads or writes can be switched off, standing in
/// for a store that accepts connections but fails requests. Deletes can be
/// made slow: they take effect at once but answer after `delete_delay`.
#[derive(Debug, Clone, Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    fail_writes: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    delete_delay: Duration,
}

impl FlakyBackend {
    fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(CoordError::StoreUnavailable("write rejected".to_string()))
        } else {
            Ok(())
        }
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            Err(CoordError::StoreUnavailable("read rejected".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StateBackend for FlakyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Shared
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_read()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.inner.delete(key).await?;
        tokio::time::sleep(self.delete_delay).await;
        Ok(removed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_read()?;
        self.inner.keys_with_prefix(prefix).await
    }

    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.inner.try_lock(name, token, ttl).await
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

fn config_for(dir: &tempfile::TempDir, writer: &str) -> CoordinationConfig {
    let mut config = CoordinationConfig::default();
    config.evidence.session_root = dir.path().to_path_buf();
    config.writer_id = Some(writer.to_string());
    config
}

/// Builds `count` managers ("workers") sharing one backend.
fn workers(
    backend: &MemoryBackend,
    dir: &tempfile::TempDir,
    count: usize,
) -> Vec<WorkflowStateManager> {
    (0..count)
        .map(|i| {
            WorkflowStateManager::with_backend(
                Arc::new(backend.clone()),
                &config_for(dir, &format!("worker-{i}:{i}")),
            )
        })
        .collect()
}

fn counter(state: &WorkflowState) -> u64 {
    state
        .metadata
        .get("counter")
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_end_to_end_session() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let mut fleet = workers(&backend, &dir, 2);
    let planner = fleet.pop().unwrap();
    let scorer = fleet.pop().unwrap();

    // No prior state.
    assert_eq!(scorer.get_status("abc-123").await, WorkflowStatus::NotStarted);

    scorer
        .update_state(
            "abc-123",
            StateUpdate::new().status(WorkflowStatus::RiskAnalyzing),
        )
        .await
        .expect("update should succeed");
    assert_eq!(
        planner.get_status("abc-123").await,
        WorkflowStatus::RiskAnalyzing
    );

    let receipt = scorer
        .mark_milestone_complete("abc-123", Milestone::AnalysisComplete)
        .await;
    assert!(receipt.persisted());
    assert!(receipt.marker_written);

    // The planning stage, on another worker, is allowed to proceed.
    let readiness = planner
        .require_milestone("abc-123", Milestone::AnalysisComplete)
        .await
        .expect("analysis should be ready");
    assert_eq!(readiness.source, Some(EvidenceSource::StateStore));
    assert_eq!(
        planner.get_status("abc-123").await,
        WorkflowStatus::RiskComplete
    );

    let state = planner.get_state("abc-123").await.unwrap();
    assert!(state.verify_checksum());
    assert_eq!(state.writer_id, "worker-0:0");
    assert_eq!(state.version, 2);
}

#[tokio::test]
async fn test_sequential_updates_equal_their_union() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let manager = workers(&backend, &dir, 1).remove(0);

    let a = StateUpdate::new()
        .status(WorkflowStatus::DataUploaded)
        .milestone(Milestone::CsvLoaded, true)
        .metadata("region", json!("north"));
    let b = StateUpdate::new()
        .milestone(Milestone::ShapefileLoaded, true)
        .metadata("region", json!("south"))
        .metadata("wards", json!(42));

    manager.update_state("twice", a.clone()).await.unwrap();
    let twice = manager.update_state("twice", b.clone()).await.unwrap();
    let once = manager.update_state("once", a.merge(b)).await.unwrap();

    assert_eq!(twice.status, once.status);
    assert_eq!(twice.completed_milestones(), once.completed_milestones());
    assert_eq!(twice.metadata, once.metadata);
    assert_eq!(twice.metadata["region"], json!("south"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_locked_updates_lose_nothing() {
    const WORKERS: usize = 16;
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();

    let handles: Vec<_> = workers(&backend, &dir, WORKERS)
        .into_iter()
        .map(|manager| {
            tokio::spawn(async move {
                manager
                    .update_with("contended", |state| {
                        let next = counter(state) + 1;
                        state.metadata.insert("counter".to_string(), json!(next));
                        Ok(())
                    })
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().expect("locked update should succeed");
    }

    let manager = workers(&backend, &dir, 1).remove(0);
    let state = manager.get_state("contended").await.unwrap();
    assert_eq!(counter(&state), WORKERS as u64);
    assert_eq!(state.version, WORKERS as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unlocked_get_then_set_loses_updates() {
    const WORKERS: usize = 8;
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let fleet = workers(&backend, &dir, WORKERS);

    let mut initial = WorkflowState::new("racy");
    initial.metadata.insert("counter".to_string(), json!(0));
    assert!(fleet[0].set_state(&mut initial).await);

    // Every worker reads before any worker writes: classic check-then-act.
    let barrier = Arc::new(Barrier::new(WORKERS));
    let handles: Vec<_> = fleet
        .into_iter()
        .map(|manager| {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                let mut state = manager.get_state("racy").await.unwrap();
                barrier.wait().await;
                let next = counter(&state) + 1;
                state.metadata.insert("counter".to_string(), json!(next));
                manager.set_state(&mut state).await
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap());
    }

    let manager = workers(&backend, &dir, 1).remove(0);
    let state = manager.get_state("racy").await.unwrap();
    assert!(
        counter(&state) < WORKERS as u64,
        "unlocked writers should have overwritten each other"
    );
}

#[tokio::test]
async fn test_lock_timeout_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let mut config = config_for(&dir, "w:1");
    config.lock.acquire_timeout_ms = 100;
    config.lock.retry_interval_ms = 10;
    let manager = WorkflowStateManager::with_backend(Arc::new(backend), &config);

    let held = manager.store().lock().acquire("busy").await.unwrap();

    let err = manager
        .update_state("busy", StateUpdate::new().status(WorkflowStatus::Complete))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::LockTimeout { .. }));
    assert!(err.is_retryable());
    assert!(manager.get_state("busy").await.is_none());

    assert!(held.release().await);
    assert!(manager
        .update_state("busy", StateUpdate::new().status(WorkflowStatus::Complete))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_local_cache_covers_failed_store_write() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FlakyBackend::default();
    let mut config = config_for(&dir, "w:1");
    // No marker, so only this worker's memory can vouch for the milestone.
    config.evidence.marker_milestones.clear();
    let manager = WorkflowStateManager::with_backend(Arc::new(backend.clone()), &config);

    backend.fail_writes(true);
    let receipt = manager
        .mark_milestone_complete("s1", Milestone::AnalysisComplete)
        .await;
    assert!(!receipt.persisted());
    assert!(!receipt.marker_written);

    let readiness = manager.readiness("s1", Milestone::AnalysisComplete).await;
    assert!(readiness.complete);
    assert_eq!(readiness.source, Some(EvidenceSource::LocalCache));
    assert!(!readiness.repaired);

    // A different worker has no such memory and must answer "not complete".
    let other = WorkflowStateManager::with_backend(Arc::new(backend.clone()), &config);
    assert!(!other
        .is_milestone_complete("s1", Milestone::AnalysisComplete)
        .await);

    // Once the store accepts writes again, the next check repairs it.
    backend.fail_writes(false);
    let readiness = manager.readiness("s1", Milestone::AnalysisComplete).await;
    assert!(readiness.repaired);
    assert!(other
        .is_milestone_complete("s1", Milestone::AnalysisComplete)
        .await);
}

#[tokio::test]
async fn test_unreadable_store_falls_through_to_marker_without_repair() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FlakyBackend::default();
    let manager =
        WorkflowStateManager::with_backend(Arc::new(backend.clone()), &config_for(&dir, "w:1"));
    manager
        .markers()
        .touch("s1", Milestone::AnalysisComplete)
        .await
        .unwrap();

    backend.fail_reads(true);
    let readiness = manager.readiness("s1", Milestone::AnalysisComplete).await;
    assert!(readiness.complete);
    assert_eq!(readiness.source, Some(EvidenceSource::DurableMarker));
    assert!(!readiness.repaired);

    // Nothing was written while the store could not be read.
    backend.fail_reads(false);
    assert!(manager.get_state("s1").await.is_none());
    assert!(!manager
        .is_milestone_complete("s1", Milestone::TprCompleted)
        .await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_readiness_does_not_resurrect_cleared_session() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FlakyBackend {
        delete_delay: Duration::from_millis(200),
        ..FlakyBackend::default()
    };
    let clearer =
        WorkflowStateManager::with_backend(Arc::new(backend.clone()), &config_for(&dir, "a:1"));
    let reader =
        WorkflowStateManager::with_backend(Arc::new(backend.clone()), &config_for(&dir, "b:2"));

    assert!(clearer
        .mark_milestone_complete("s1", Milestone::AnalysisComplete)
        .await
        .persisted());

    let clearing = {
        let clearer = clearer.clone();
        tokio::spawn(async move { clearer.clear_state("s1").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let concurrent = reader.readiness("s1", Milestone::AnalysisComplete).await;
    assert!(clearing.await.unwrap());

    // Whatever the concurrent check saw, it must not have written the
    // milestone back after the clear.
    assert!(!concurrent.repaired);
    assert!(clearer.get_state("s1").await.is_none());
    assert!(!reader
        .is_milestone_complete("s1", Milestone::AnalysisComplete)
        .await);
}

#[tokio::test]
async fn test_evicted_record_recovered_from_marker() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let mut fleet = workers(&backend, &dir, 2);
    let reader = fleet.pop().unwrap();
    let writer = fleet.pop().unwrap();

    writer
        .mark_milestone_complete("s1", Milestone::AnalysisComplete)
        .await;

    // Simulate TTL expiry of the record.
    assert!(backend.delete(&state_key("s1")).await.unwrap());
    assert!(reader.get_state("s1").await.is_none());

    let readiness = reader.readiness("s1", Milestone::AnalysisComplete).await;
    assert!(readiness.complete);
    assert_eq!(readiness.source, Some(EvidenceSource::DurableMarker));
    assert!(readiness.repaired);

    let repaired = reader.get_state("s1").await.unwrap();
    assert!(repaired.analysis_complete);
    assert_eq!(repaired.writer_id, "worker-1:1");
}

#[tokio::test]
async fn test_cleared_session_is_not_ready() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let manager = workers(&backend, &dir, 1).remove(0);

    manager
        .mark_milestone_complete("s1", Milestone::AnalysisComplete)
        .await;
    assert!(manager.clear_state("s1").await);

    assert!(manager.get_state("s1").await.is_none());
    assert!(!manager
        .is_milestone_complete("s1", Milestone::AnalysisComplete)
        .await);
    assert!(manager.list_active_sessions().await.is_empty());
}

#[tokio::test]
async fn test_leftover_artifacts_survive_clear() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let manager = workers(&backend, &dir, 1).remove(0);

    manager
        .mark_milestone_complete("s1", Milestone::AnalysisComplete)
        .await;
    let session_dir = dir.path().join("s1");
    std::fs::write(
        session_dir.join("analysis_vulnerability_rankings.csv"),
        "ward,rank\nA,1\n",
    )
    .unwrap();
    manager.clear_state("s1").await;

    // Outputs are not ours to delete, so they still count as evidence.
    let readiness = manager.readiness("s1", Milestone::AnalysisComplete).await;
    assert_eq!(readiness.source, Some(EvidenceSource::Artifacts));
}

#[tokio::test]
async fn test_subscriber_sees_state_and_event() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let mut fleet = workers(&backend, &dir, 2);
    let watcher = fleet.pop().unwrap();
    let writer = fleet.pop().unwrap();

    let mut sub = watcher.subscribe("s1");
    writer
        .mark_milestone_complete("s1", Milestone::TprCompleted)
        .await;

    match sub.recv().await.unwrap() {
        SessionNotification::State { state, .. } => {
            assert!(state.tpr_completed);
            assert_eq!(state.status, WorkflowStatus::TprComplete);
        }
        other => panic!("expected a state snapshot, got {other:?}"),
    }
    match sub.recv().await.unwrap() {
        SessionNotification::Event { event, .. } => {
            assert_eq!(event.session_id(), "s1");
            assert!(matches!(
                event,
                WorkflowEvent::MilestoneCompleted {
                    milestone: Milestone::TprCompleted,
                    ..
                }
            ));
        }
        other => panic!("expected an event, got {other:?}"),
    }

    // A worker that was not listening can catch up.
    let missed = watcher.replay("s1", 0).await.unwrap();
    assert_eq!(missed.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_idle_sessions_expire() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let mut config = config_for(&dir, "w:1");
    config.store.state_ttl_secs = 60;
    let manager = WorkflowStateManager::with_backend(Arc::new(backend), &config);

    manager
        .update_state("idle", StateUpdate::new().status(WorkflowStatus::DataUploaded))
        .await
        .unwrap();
    manager
        .update_state("busy", StateUpdate::new().status(WorkflowStatus::DataUploaded))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(45)).await;
    manager
        .update_state("busy", StateUpdate::new().status(WorkflowStatus::TprComplete))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(manager.list_active_sessions().await, vec!["busy"]);
    assert_eq!(manager.get_status("idle").await, WorkflowStatus::NotStarted);
}

#[tokio::test]
async fn test_strict_policy_through_manager() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(&dir, "w:1");
    config.transitions.policy = TransitionPolicy::Strict;
    let manager = WorkflowStateManager::with_backend(Arc::new(MemoryBackend::new()), &config);

    manager
        .mark_milestone_complete("s1", Milestone::AnalysisComplete)
        .await;
    let err = manager
        .update_fields("s1", json!({"status": "DATA_UPLOADED"}).as_object().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::IllegalTransition { .. }));

    // Clearing is the one way back.
    manager.clear_state("s1").await;
    assert!(manager
        .update_fields("s1", json!({"status": "DATA_UPLOADED"}).as_object().unwrap())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_session_report_flags_stale_without_repairing() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let manager = workers(&backend, &dir, 1).remove(0);

    manager
        .markers()
        .touch("s1", Milestone::AnalysisComplete)
        .await
        .unwrap();

    let report = manager.session_report("s1").await;
    let analysis = report
        .milestones
        .iter()
        .find(|m| m.milestone == Milestone::AnalysisComplete)
        .unwrap();
    assert!(analysis.readiness.complete);
    assert_eq!(analysis.readiness.source, Some(EvidenceSource::DurableMarker));
    assert!(!analysis.readiness.repaired);
    assert!(!report.stored);
    assert_eq!(report.status, WorkflowStatus::NotStarted);
    assert_eq!(report.stale_milestones(), vec![Milestone::AnalysisComplete]);
    assert!(manager.get_state("s1").await.is_none());

    // A gate check still repairs.
    assert!(manager.readiness("s1", Milestone::AnalysisComplete).await.repaired);
}

#[cfg(feature = "sqlite")]
mod shared_file {
    use super::*;
    use waypost::config::BackendChoice;
    use waypost::StateStore;

    fn sqlite_config(dir: &tempfile::TempDir, writer: &str) -> CoordinationConfig {
        let mut config = config_for(dir, writer);
        config.store.backend = BackendChoice::Sqlite;
        config.store.path = dir.path().join("waypost-state.db");
        config.store.busy_timeout_ms = 5_000;
        config.store.operation_timeout_ms = 10_000;
        config.lock.acquire_timeout_ms = 20_000;
        config.lock.ttl_ms = 30_000;
        config
    }

    #[tokio::test]
    async fn test_two_processes_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = WorkflowStateManager::new(&sqlite_config(&dir, "host-a:1")).await;
        let second = WorkflowStateManager::new(&sqlite_config(&dir, "host-b:2")).await;
        assert!(!first.is_degraded());
        assert!(!second.is_degraded());

        first
            .mark_milestone_complete("abc-123", Milestone::AnalysisComplete)
            .await;

        let state = second.get_state("abc-123").await.unwrap();
        assert!(state.analysis_complete);
        assert_eq!(state.writer_id, "host-a:1");
        assert!(second
            .is_milestone_complete("abc-123", Milestone::AnalysisComplete)
            .await);

        // The second handle never saw the publish live, but can replay it.
        let missed = second.replay("abc-123", 0).await.unwrap();
        assert!(missed
            .iter()
            .any(|m| matches!(m, SessionNotification::Event { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_locked_updates_serialize_across_handles() {
        const PER_HANDLE: usize = 5;
        let dir = tempfile::tempdir().unwrap();
        let handles = [
            WorkflowStateManager::new(&sqlite_config(&dir, "host-a:1")).await,
            WorkflowStateManager::new(&sqlite_config(&dir, "host-b:2")).await,
        ];

        let mut tasks = Vec::new();
        for manager in &handles {
            for _ in 0..PER_HANDLE {
                let manager = manager.clone();
                tasks.push(tokio::spawn(async move {
                    manager
                        .update_with("shared", |state| {
                            let next = counter(state) + 1;
                            state.metadata.insert("counter".to_string(), json!(next));
                            Ok(())
                        })
                        .await
                }));
            }
        }
        for task in tasks {
            task.await.unwrap().expect("locked update should succeed");
        }

        let state = handles[0].get_state("shared").await.unwrap();
        assert_eq!(counter(&state), (2 * PER_HANDLE) as u64);
    }

    #[tokio::test]
    async fn test_missing_directory_degrades_to_local() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sqlite_config(&dir, "w:1");
        config.store.path = dir.path().join("not-mounted").join("state.db");

        let store = StateStore::connect(&config).await;
        assert!(store.is_degraded());

        let manager = WorkflowStateManager::from_store(store, &config);
        manager
            .mark_milestone_complete("s1", Milestone::AnalysisComplete)
            .await;
        assert!(manager
            .is_milestone_complete("s1", Milestone::AnalysisComplete)
            .await);
    }
}
