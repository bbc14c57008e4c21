// SPDX-License-Identifier: MIT
//! Lock store — the single shared coordination substrate.
//!
//! One row per claimed agent in `{prefix}agent_locks`. The PRIMARY KEY on
//! `agent_name` is the load-bearing invariant: concurrent claim attempts from
//! independent processes race on `INSERT ... ON CONFLICT DO NOTHING` and
//! exactly one wins. There is no node-to-node RPC and no consensus protocol;
//! every cross-replica guarantee in this crate reduces to that constraint.
//!
//! Timestamps are unix epoch milliseconds so lock-age arithmetic stays in
//! plain integers on both sides of the SQL boundary.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use serde::Serialize;
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, SqlitePool};

/// Timeout for individual lock-table queries. A hung query must never stall
/// the tick loop indefinitely.
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Queries slower than this are logged at WARN.
const SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(200);

/// Lock-table failures, classified so the tick loop can treat all of them as
/// transient: abort the current tick, log, retry next cycle.
#[derive(Debug, thiserror::Error)]
pub enum LockStoreError {
    #[error("lock store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("lock store query timed out after {0:?}")]
    Timeout(Duration),
}

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, LockStoreError> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result.map_err(LockStoreError::from),
        Err(_) => Err(LockStoreError::Timeout(QUERY_TIMEOUT)),
    }
}

/// Current wall-clock time as unix epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// One time-bounded ownership claim.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct AgentLockRow {
    pub agent_name: String,
    pub owner_node_id: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct LockStore {
    pool: SqlitePool,
    table: String,
}

impl LockStore {
    /// Open (creating if missing) the lock database and ensure the schema.
    ///
    /// `table_prefix` namespaces the lock table so several installations can
    /// share one database.
    pub async fn open(db_path: &Path, table_prefix: &str) -> anyhow::Result<Self> {
        let table = table_name(table_prefix)?;
        if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                // Concurrent writers from independent processes are the point
                // of this table; wait out short write contention.
                .busy_timeout(Duration::from_secs(5))
                .create_if_missing(true)
                .log_slow_statements(log::LevelFilter::Warn, SLOW_QUERY_THRESHOLD);

        let pool = SqlitePool::connect_with(opts)
            .await
            .context("connecting to lock database")?;
        let store = Self { pool, table };
        store.init_schema().await.context("creating lock table")?;
        Ok(store)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn init_schema(&self) -> Result<(), LockStoreError> {
        let t = &self.table;
        with_timeout(async {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                     agent_name    TEXT PRIMARY KEY,
                     owner_node_id TEXT NOT NULL,
                     acquired_at   INTEGER NOT NULL,
                     expires_at    INTEGER NOT NULL
                 )"
            ))
            .execute(&self.pool)
            .await?;
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {t}_acquired_idx ON {t} (acquired_at)"
            ))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Attempt to claim `agent_name` for `owner`.
    ///
    /// Returns `true` when this call inserted the row, `false` when a row
    /// already exists — i.e. another node (or an earlier claim on this node)
    /// won the race. Losing is expected contention, not an error.
    pub async fn try_acquire(
        &self,
        agent_name: &str,
        owner: &str,
        now_ms: i64,
        expires_at_ms: i64,
    ) -> Result<bool, LockStoreError> {
        let result = with_timeout(
            sqlx::query(&format!(
                "INSERT INTO {} (agent_name, owner_node_id, acquired_at, expires_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(agent_name) DO NOTHING",
                self.table
            ))
            .bind(agent_name)
            .bind(owner)
            .bind(now_ms)
            .bind(expires_at_ms)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Release `agent_name`, but only if `owner` still holds it.
    ///
    /// The owner scope matters at lease boundaries: if this lock was already
    /// reclaimed as stale and re-claimed by another node, a late completion on
    /// this node must not delete the other node's claim.
    pub async fn release(&self, agent_name: &str, owner: &str) -> Result<bool, LockStoreError> {
        let result = with_timeout(
            sqlx::query(&format!(
                "DELETE FROM {} WHERE agent_name = ? AND owner_node_id = ?",
                self.table
            ))
            .bind(agent_name)
            .bind(owner)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Operator escape hatch: delete a lock regardless of owner.
    pub async fn force_release(&self, agent_name: &str) -> Result<bool, LockStoreError> {
        let result = with_timeout(
            sqlx::query(&format!(
                "DELETE FROM {} WHERE agent_name = ?",
                self.table
            ))
            .bind(agent_name)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every lock older than `threshold_ms`, regardless of owner.
    ///
    /// This is the sole crash-recovery mechanism: a node that died mid
    /// execution leaves a row behind, and any surviving node reclaims it here
    /// at the start of its own tick.
    pub async fn reclaim_stale(
        &self,
        now_ms: i64,
        threshold_ms: i64,
    ) -> Result<u64, LockStoreError> {
        let result = with_timeout(
            sqlx::query(&format!(
                "DELETE FROM {} WHERE acquired_at < ?",
                self.table
            ))
            .bind(now_ms - threshold_ms)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected())
    }

    /// Names of all agents holding a live (non-expired) lock.
    pub async fn live_locks(&self, now_ms: i64) -> Result<HashSet<String>, LockStoreError> {
        let names: Vec<(String,)> = with_timeout(
            sqlx::query_as(&format!(
                "SELECT agent_name FROM {} WHERE expires_at > ?",
                self.table
            ))
            .bind(now_ms)
            .fetch_all(&self.pool),
        )
        .await?;
        Ok(names.into_iter().map(|(n,)| n).collect())
    }

    /// All lock rows, oldest claim first. Operator/diagnostic surface.
    pub async fn list(&self) -> Result<Vec<AgentLockRow>, LockStoreError> {
        with_timeout(
            sqlx::query_as(&format!(
                "SELECT agent_name, owner_node_id, acquired_at, expires_at
                 FROM {} ORDER BY acquired_at ASC",
                self.table
            ))
            .fetch_all(&self.pool),
        )
        .await
    }
}

fn table_name(prefix: &str) -> anyhow::Result<String> {
    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        anyhow::bail!("table prefix may only contain [A-Za-z0-9_], got {prefix:?}");
    }
    Ok(format!("{prefix}agent_locks"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_applies_prefix() {
        assert_eq!(table_name("").unwrap(), "agent_locks");
        assert_eq!(table_name("prod_").unwrap(), "prod_agent_locks");
    }

    #[test]
    fn table_name_rejects_sql_metacharacters() {
        assert!(table_name("x; DROP TABLE y; --").is_err());
        assert!(table_name("pre fix").is_err());
    }

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000, "expected a current epoch value");
    }
}
