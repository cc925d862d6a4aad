//! SQLite-backed shared store.
//!
//! This module provides [`SqliteBackend`], a [`StateBackend`] over a
//! database file that every worker process opens. SQLite's file locking
//! gives atomic single-key writes across processes; the `locks` table gives
//! TTL'd mutual exclusion; the `notifications` table is an outbox other
//! workers can replay.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{broadcast, Mutex};

use super::{BackendKind, Notification, StateBackend};
use crate::config::{NotificationConfig, StoreConfig};
use crate::{CoordError, Result};

/// Schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

const CREATE_KV_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS kv (
        key TEXT NOT NULL PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    )
"#;

const CREATE_LOCKS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS locks (
        name TEXT NOT NULL PRIMARY KEY,
        token TEXT NOT NULL,
        expires_at_ms INTEGER NOT NULL,
        acquired_at_ms INTEGER NOT NULL
    )
"#;

const CREATE_NOTIFICATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        channel TEXT NOT NULL,
        payload TEXT NOT NULL,
        published_at_ms INTEGER NOT NULL
    )
"#;

const CREATE_SCHEMA_VERSION_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    )
"#;

const CREATE_NOTIFICATION_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_notifications_channel
    ON notifications (channel, id)
"#;

/// Takes a lease unless a different, unexpired holder has it.
const ACQUIRE_LOCK: &str = r#"
    INSERT INTO locks (name, token, expires_at_ms, acquired_at_ms)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(name) DO UPDATE SET
        token = excluded.token,
        expires_at_ms = excluded.expires_at_ms,
        acquired_at_ms = excluded.acquired_at_ms
    WHERE locks.token = excluded.token
       OR locks.expires_at_ms <= excluded.acquired_at_ms
"#;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn db_err(context: &str, e: impl std::fmt::Display) -> CoordError {
    CoordError::Database(format!("{context}: {e}"))
}

/// A SQLite implementation of [`StateBackend`] shared by all workers.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` and every statement runs on
/// `spawn_blocking`, so the backend is safe to share across async tasks.
/// Separate processes each open their own connection to the same file;
/// contention between them is absorbed by SQLite's busy timeout.
///
/// # Example
///
/// ```rust,ignore
/// use waypost::{SqliteBackend, config::{NotificationConfig, StoreConfig}};
///
/// let backend = SqliteBackend::open(
///     "/srv/shared/waypost-state.db",
///     &StoreConfig::default(),
///     &NotificationConfig::default(),
/// ).await?;
/// ```
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<Notification>,
    retention: Duration,
}

impl SqliteBackend {
    /// Opens (or creates) the database at `path`.
    ///
    /// The parent directory must already exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub async fn open(
        path: impl AsRef<Path>,
        store: &StoreConfig,
        notifications: &NotificationConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let busy_timeout = store.busy_timeout();

        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(busy_timeout)?;
            // journal_mode returns the resulting mode as a row.
            let _mode: String =
                conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            Ok(conn)
        })
        .await
        .map_err(|e| db_err("spawn_blocking failed", e))?
        .map_err(|e| db_err("failed to open database", e))?;

        Self::from_connection(conn, notifications).await
    }

    /// Opens a private in-memory database.
    ///
    /// Useful for testing; it still reports itself as shared.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(Connection::open_in_memory)
            .await
            .map_err(|e| db_err("spawn_blocking failed", e))?
            .map_err(|e| db_err("failed to open in-memory database", e))?;

        Self::from_connection(conn, &NotificationConfig::default()).await
    }

    async fn from_connection(conn: Connection, notifications: &NotificationConfig) -> Result<Self> {
        let (events, _) = broadcast::channel(notifications.channel_capacity.max(1));
        let backend = Self {
            conn: Arc::new(Mutex::new(conn)),
            events,
            retention: notifications.retention(),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Runs a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, context: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| db_err("spawn_blocking failed", e))?
        .map_err(|e| db_err(context, e))
    }

    /// Runs schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        self.with_conn("migration failed", |conn| {
            conn.execute(CREATE_SCHEMA_VERSION_TABLE, [])?;

            let version: Option<i32> = conn
                .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                    row.get(0)
                })
                .optional()?;

            if version.map_or(true, |v| v < SCHEMA_VERSION) {
                conn.execute(CREATE_KV_TABLE, [])?;
                conn.execute(CREATE_LOCKS_TABLE, [])?;
                conn.execute(CREATE_NOTIFICATIONS_TABLE, [])?;
                conn.execute(CREATE_NOTIFICATION_INDEX, [])?;

                conn.execute("DELETE FROM schema_version", [])?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Ok(())
        })
        .await
    }

    /// Checks if the required tables exist.
    ///
    /// Useful for testing that the schema was created correctly.
    pub async fn tables_exist(&self) -> Result<bool> {
        self.with_conn("table check failed", |conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type='table' \
                 AND name IN ('kv', 'locks', 'notifications', 'schema_version')",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let tables: Vec<String> = rows.filter_map(|r| r.ok()).collect();
            Ok(tables.len() == 4)
        })
        .await
    }
}

// Debug implementation that doesn't expose connection details
impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl StateBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Shared
    }

    async fn ping(&self) -> Result<()> {
        self.with_conn("ping failed", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn("query failed", move |conn| {
            conn.query_row(
                "SELECT value FROM kv WHERE key = ?1 AND expires_at_ms > ?2",
                params![key, now_ms()],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn("insert failed", move |conn| {
            let now = now_ms();
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, value, expires_at_ms, updated_at_ms) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, value, now.saturating_add(ttl_ms(ttl)), now],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_conn("delete failed", move |conn| {
            let live = conn.execute(
                "DELETE FROM kv WHERE key = ?1 AND expires_at_ms > ?2",
                params![key, now_ms()],
            )?;
            // Drop an expired leftover too, without reporting it.
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(live > 0)
        })
        .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.with_conn("query failed", move |conn| {
            let now = now_ms();
            conn.execute("DELETE FROM kv WHERE expires_at_ms <= ?1", params![now])?;

            let mut stmt = conn.prepare(
                "SELECT key FROM kv \
                 WHERE substr(key, 1, length(?1)) = ?1 AND expires_at_ms > ?2 \
                 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![prefix, now], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }

    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let name = name.to_string();
        let token = token.to_string();
        self.with_conn("lock failed", move |conn| {
            let now = now_ms();
            let changes = conn.execute(
                ACQUIRE_LOCK,
                params![name, token, now.saturating_add(ttl_ms(ttl)), now],
            )?;
            Ok(changes > 0)
        })
        .await
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool> {
        let name = name.to_string();
        let token = token.to_string();
        self.with_conn("unlock failed", move |conn| {
            let changes = conn.execute(
                "DELETE FROM locks WHERE name = ?1 AND token = ?2",
                params![name, token],
            )?;
            Ok(changes > 0)
        })
        .await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        let channel_owned = channel.to_string();
        let payload_owned = payload.to_string();
        let retention_ms = ttl_ms(self.retention);

        let (id, published_ms) = self
            .with_conn("publish failed", move |conn| {
                let now = now_ms();
                conn.execute(
                    "DELETE FROM notifications WHERE published_at_ms < ?1",
                    params![now.saturating_sub(retention_ms)],
                )?;
                conn.execute(
                    "INSERT INTO notifications (channel, payload, published_at_ms) \
                     VALUES (?1, ?2, ?3)",
                    params![channel_owned, payload_owned, now],
                )?;
                Ok((conn.last_insert_rowid(), now))
            })
            .await?;

        let id = u64::try_from(id).unwrap_or_default();
        // No subscribers is not an error.
        let _ = self.events.send(Notification {
            id,
            channel: channel.to_string(),
            payload: payload.to_string(),
            published_at: Utc
                .timestamp_millis_opt(published_ms)
                .single()
                .unwrap_or_else(Utc::now),
        });
        Ok(id)
    }

    async fn notifications_since(
        &self,
        channel: &str,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<Notification>> {
        let channel = channel.to_string();
        let after_id = i64::try_from(after_id).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_conn("query failed", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, channel, payload, published_at_ms FROM notifications \
                 WHERE channel = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![channel, after_id, limit], |row| {
                let id: i64 = row.get(0)?;
                let published_ms: i64 = row.get(3)?;
                Ok(Notification {
                    id: u64::try_from(id).unwrap_or_default(),
                    channel: row.get(1)?,
                    payload: row.get(2)?,
                    published_at: Utc
                        .timestamp_millis_opt(published_ms)
                        .single()
                        .unwrap_or_else(Utc::now),
                })
            })?;
            rows.collect()
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }
}
