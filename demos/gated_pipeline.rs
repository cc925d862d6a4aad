//! Two workers coordinating one session.
//!
//! This example demonstrates:
//! - Sharing a session between workers through one SQLite file
//! - Recording milestones and gating a downstream stage on them
//! - Recovering readiness after the shared record is lost
//! - Watching a session's notifications
//! - Printing a session report
//!
//! Run with: `cargo run --example gated_pipeline`
//! Set `WAYPOST_LOG=debug` to see the coordination logs.

use waypost::config::BackendChoice;
use waypost::telemetry::{self, LogFormat};
use waypost::{
    CoordinationConfig, Milestone, Result, SessionNotification, StateUpdate,
    WorkflowStateManager, WorkflowStatus,
};

const SESSION: &str = "abc-123";

fn worker_config(root: &std::path::Path, writer: &str) -> CoordinationConfig {
    let mut config = CoordinationConfig::default();
    config.store.backend = BackendChoice::Sqlite;
    config.store.path = root.join("waypost-state.db");
    config.evidence.session_root = root.join("sessions");
    config.writer_id = Some(writer.to_string());
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init(LogFormat::Pretty);

    let root = std::env::temp_dir().join(format!("waypost-demo-{}", std::process::id()));
    std::fs::create_dir_all(&root)?;

    let scorer = WorkflowStateManager::new(&worker_config(&root, "scorer:1")).await;
    let planner = WorkflowStateManager::new(&worker_config(&root, "planner:2")).await;
    println!("Shared store: {}", scorer.store().backend_kind());
    println!();

    let mut feed = scorer.subscribe(SESSION);

    // Worker 1 runs risk scoring.
    println!("📊 Scorer starts risk analysis for '{}'", SESSION);
    scorer
        .update_state(SESSION, StateUpdate::new().status(WorkflowStatus::RiskAnalyzing))
        .await?;

    // Worker 2 is asked to plan too early.
    match planner
        .require_milestone(SESSION, Milestone::AnalysisComplete)
        .await
    {
        Ok(_) => println!("   planner: unexpectedly ready"),
        Err(e) => println!("   ⛔ planner refused: {e}"),
    }

    let receipt = scorer
        .mark_milestone_complete(SESSION, Milestone::AnalysisComplete)
        .await;
    println!(
        "   ✓ analysis recorded (persisted: {}, marker: {}, event: {})",
        receipt.persisted(),
        receipt.marker_written,
        receipt.event_published
    );

    let readiness = planner
        .require_milestone(SESSION, Milestone::AnalysisComplete)
        .await?;
    println!(
        "🗺  Planner may proceed (evidence: {})",
        readiness.source.map(|s| s.as_str()).unwrap_or("-")
    );
    println!();

    // The shared record disappears, but the marker remains.
    println!("🧹 Shared record evicted");
    scorer.store().delete(SESSION).await;
    let readiness = planner
        .readiness(SESSION, Milestone::AnalysisComplete)
        .await;
    println!(
        "   still ready: {} (evidence: {}, repaired: {})",
        readiness.complete,
        readiness.source.map(|s| s.as_str()).unwrap_or("-"),
        readiness.repaired
    );
    println!();

    println!("📨 Notifications seen by the scorer:");
    while let Ok(Some(message)) =
        tokio::time::timeout(std::time::Duration::from_millis(50), feed.recv()).await
    {
        match message {
            SessionNotification::State { id, state } => {
                println!("   #{id} state -> {} (v{})", state.status, state.version)
            }
            SessionNotification::Event { id, event } => println!("   #{id} event: {event}"),
        }
    }
    println!();

    println!("{}", planner.session_report(SESSION).await);

    planner.clear_state(SESSION).await;
    std::fs::remove_dir_all(&root)?;
    Ok(())
}
