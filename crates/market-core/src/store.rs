use crate::error::Result;
use crate::models::{TaskStatus, WorkerScore};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration as StdDuration;

/// Handle on the coordinator database.
///
/// The pool is capped at one connection: SQLite has a single writer anyway,
/// and a serialized pool makes every read-modify-write transaction race-free
/// without row locks.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `url`, e.g.
    /// `sqlite://coordinator.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(StdDuration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply pending schema migrations. Safe to re-run.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Truncate everything, children before parents.
    pub async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM submissions")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tasks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM worker_scores")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workers").execute(&mut *tx).await?;
        tx.commit().await?;

        tracing::info!(event = "coordinator.store.reset", "database reset");
        Ok(())
    }

    /// Counts snapshot for the ops surface.
    pub async fn stats(&self, now: DateTime<Utc>, heartbeat_ttl: Duration) -> Result<DbStats> {
        let mut stats = DbStats::default();

        let rows = sqlx::query("SELECT status, count(*) AS cnt FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let cnt: i64 = row.try_get("cnt")?;
            stats.tasks_total += cnt;
            match TaskStatus::parse(&status)? {
                TaskStatus::Queued => stats.tasks_queued = cnt,
                TaskStatus::Assigned => stats.tasks_assigned = cnt,
                TaskStatus::Finalized => stats.tasks_finalized = cnt,
                TaskStatus::Failed => stats.tasks_failed = cnt,
            }
        }

        stats.submissions_total = sqlx::query_scalar("SELECT count(*) FROM submissions")
            .fetch_one(&self.pool)
            .await?;
        stats.workers_total = sqlx::query_scalar("SELECT count(*) FROM workers")
            .fetch_one(&self.pool)
            .await?;
        stats.workers_stale = sqlx::query_scalar("SELECT count(*) FROM workers WHERE last_seen < ?")
            .bind(now - heartbeat_ttl)
            .fetch_one(&self.pool)
            .await?;

        Ok(stats)
    }

    /// Reputation scores, best first. Worker id breaks ties so the order is
    /// stable.
    pub async fn leaderboard(&self) -> Result<Vec<WorkerScore>> {
        let rows = sqlx::query(
            "SELECT worker_id, points FROM worker_scores ORDER BY points DESC, worker_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scores = Vec::with_capacity(rows.len());
        for row in rows {
            scores.push(WorkerScore {
                worker_id: row.try_get("worker_id")?,
                points: row.try_get("points")?,
            });
        }
        Ok(scores)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DbStats {
    pub tasks_total: i64,
    pub tasks_queued: i64,
    pub tasks_assigned: i64,
    pub tasks_finalized: i64,
    pub tasks_failed: i64,
    pub submissions_total: i64,
    pub workers_total: i64,
    /// Workers whose last heartbeat is older than the TTL, by timestamp
    /// rather than by the marked status.
    pub workers_stale: i64,
}
