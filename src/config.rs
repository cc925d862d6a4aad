//! Layered configuration.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. `waypost.toml` in the working directory, or an explicit file
//! 3. Environment variables prefixed with `WAYPOST__`, nested with `__`
//!    (for example `WAYPOST__STORE__PATH=/srv/shared/state.db`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::evidence::ArtifactRule;
use crate::manager::TransitionPolicy;
use crate::{Milestone, Result};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "waypost.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "WAYPOST";

/// Top-level configuration for a worker's coordination stack.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Backing store settings.
    pub store: StoreConfig,
    /// Per-session lock settings.
    pub lock: LockConfig,
    /// Readiness evidence settings.
    pub evidence: EvidenceConfig,
    /// Pub/sub settings.
    pub notifications: NotificationConfig,
    /// Status transition checking.
    pub transitions: TransitionConfig,
    /// Overrides the `host:pid` writer identity.
    pub writer_id: Option<String>,
}

/// Which backend [`StateStore::connect`](crate::StateStore::connect) opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// The shared SQLite file.
    #[default]
    Sqlite,
    /// Process-local memory only.
    Memory,
}

/// Backing store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend to open.
    pub backend: BackendChoice,
    /// Path of the shared database file.
    pub path: PathBuf,
    /// Idle expiry of session records.
    pub state_ttl_secs: u64,
    /// Upper bound on any single store call.
    pub operation_timeout_ms: u64,
    /// Upper bound on opening the shared store.
    pub connect_timeout_ms: u64,
    /// SQLite busy timeout for cross-process contention.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Sqlite,
            path: PathBuf::from("waypost-state.db"),
            state_ttl_secs: 24 * 60 * 60,
            operation_timeout_ms: 2_000,
            connect_timeout_ms: 2_000,
            busy_timeout_ms: 1_000,
        }
    }
}

impl StoreConfig {
    /// Idle expiry of session records.
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    /// Upper bound on any single store call.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Upper bound on opening the shared store.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// SQLite busy timeout.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Per-session lock settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease length; a crashed holder blocks others for at most this long.
    pub ttl_ms: u64,
    /// How long `update` waits for the lock before failing closed.
    pub acquire_timeout_ms: u64,
    /// Pause between acquisition attempts.
    pub retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 10_000,
            acquire_timeout_ms: 5_000,
            retry_interval_ms: 25,
        }
    }
}

impl LockConfig {
    /// Lease length.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Acquisition timeout.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Pause between attempts.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }
}

/// Readiness evidence settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EvidenceConfig {
    /// Directory holding one subdirectory per session.
    pub session_root: PathBuf,
    /// Milestones that leave a durable marker when completed.
    pub marker_milestones: Vec<Milestone>,
    /// Known output artifacts per milestone.
    pub artifacts: Vec<ArtifactRule>,
    /// Rewrite the store when a weaker source proves it stale.
    pub read_repair: bool,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            session_root: PathBuf::from("sessions"),
            marker_milestones: vec![Milestone::AnalysisComplete],
            artifacts: ArtifactRule::defaults(),
            read_repair: true,
        }
    }
}

/// Pub/sub settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Buffer of the in-process broadcast channel.
    pub channel_capacity: usize,
    /// How long published messages stay available for replay.
    pub retention_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            retention_secs: 60 * 60,
        }
    }
}

impl NotificationConfig {
    /// Replay retention.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Status transition checking.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TransitionConfig {
    /// Policy applied to status writes.
    pub policy: TransitionPolicy,
}

impl CoordinationConfig {
    /// Loads defaults, then `waypost.toml` if present, then the environment.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::Config`](crate::CoordError::Config) if a source
    /// is malformed.
    pub fn load() -> Result<Self> {
        let default_file = Path::new(DEFAULT_CONFIG_FILE);
        let file = default_file.exists().then_some(default_file);
        Self::load_from(file)
    }

    /// Like [`load`](Self::load) but reads the given file instead of
    /// looking for `waypost.toml`.
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: CoordinationConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the timeouts fit together.
    ///
    /// A write can block for the SQLite busy timeout and is always waited on
    /// to completion, so both that and the operation timeout must stay below
    /// the lock TTL for the write to finish while its lock is still held.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::Config`](crate::CoordError::Config) naming the
    /// offending setting.
    pub fn validate(&self) -> Result<()> {
        let ttl = self.lock.ttl_ms;
        if self.store.busy_timeout_ms >= ttl {
            return Err(ConfigError::Message(format!(
                "store.busy_timeout_ms ({}) must be below lock.ttl_ms ({ttl})",
                self.store.busy_timeout_ms
            ))
            .into());
        }
        if self.store.operation_timeout_ms >= ttl {
            return Err(ConfigError::Message(format!(
                "store.operation_timeout_ms ({}) must be below lock.ttl_ms ({ttl})",
                self.store.operation_timeout_ms
            ))
            .into());
        }
        Ok(())
    }

    /// Loads a `.env` file into the process environment if one exists.
    pub fn load_env_file() {
        if Path::new(".env").exists() {
            match dotenvy::dotenv() {
                Ok(_) => tracing::info!("loaded environment variables from .env"),
                Err(e) => tracing::warn!(error = %e, "failed to read .env"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CoordinationConfig::default();
        assert_eq!(config.store.backend, BackendChoice::Sqlite);
        assert_eq!(config.store.state_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.lock.acquire_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.evidence.marker_milestones,
            vec![Milestone::AnalysisComplete]
        );
        assert!(config.evidence.read_repair);
        assert_eq!(config.transitions.policy, TransitionPolicy::Permissive);
    }

    #[test]
    fn test_retry_interval_never_zero() {
        let lock = LockConfig {
            retry_interval_ms: 0,
            ..LockConfig::default()
        };
        assert_eq!(lock.retry_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
writer_id = "worker-7"

[store]
backend = "memory"
state_ttl_secs = 60

[lock]
acquire_timeout_ms = 250

[evidence]
session_root = "/srv/sessions"
marker_milestones = ["analysis_complete", "itn_planning_complete"]

[transitions]
policy = "strict"
"#
        )
        .unwrap();

        let config = CoordinationConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.writer_id.as_deref(), Some("worker-7"));
        assert_eq!(config.store.backend, BackendChoice::Memory);
        assert_eq!(config.store.state_ttl_secs, 60);
        // Unspecified fields keep their defaults.
        assert_eq!(config.store.operation_timeout_ms, 2_000);
        assert_eq!(config.lock.acquire_timeout_ms, 250);
        assert_eq!(config.evidence.session_root, PathBuf::from("/srv/sessions"));
        assert_eq!(config.evidence.marker_milestones.len(), 2);
        assert_eq!(config.transitions.policy, TransitionPolicy::Strict);
    }

    #[test]
    fn test_validate_rejects_writes_outlasting_the_lock() {
        assert!(CoordinationConfig::default().validate().is_ok());

        let mut config = CoordinationConfig::default();
        config.store.busy_timeout_ms = config.lock.ttl_ms;
        assert!(matches!(
            config.validate(),
            Err(crate::CoordError::Config(_))
        ));

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[store]\noperation_timeout_ms = 20000").unwrap();
        assert!(CoordinationConfig::load_from(Some(file.path())).is_err());
    }

    #[test]
    fn test_load_from_rejects_bad_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[store]\nbackend = \"redis-cluster\"").unwrap();
        assert!(CoordinationConfig::load_from(Some(file.path())).is_err());
    }
}
