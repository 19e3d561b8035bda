use crate::clock::Clock;
use crate::error::Result;
use crate::store::Store;
use crate::workers;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub stale_workers: u64,
    pub requeued: u64,
    pub failed: u64,
}

impl SweepOutcome {
    /// Tasks touched by the requeue phase.
    pub fn tasks_touched(&self) -> u64 {
        self.requeued + self.failed
    }
}

/// One reaper iteration: mark stale workers, then reclaim abandoned leases.
///
/// Given no new claims in between, a second immediate sweep is a no-op.
pub async fn sweep(store: &Store, clock: &dyn Clock, heartbeat_ttl: Duration) -> Result<SweepOutcome> {
    let now = clock.now();
    let stale_workers = workers::mark_stale(store, now, heartbeat_ttl).await?;
    let (requeued, failed) = requeue_abandoned(store, now, heartbeat_ttl).await?;
    Ok(SweepOutcome {
        stale_workers,
        requeued,
        failed,
    })
}

/// The requeue phase alone, for the manual ops trigger. Returns the number
/// of tasks touched (requeued or failed).
pub async fn requeue_expired(store: &Store, clock: &dyn Clock, heartbeat_ttl: Duration) -> Result<u64> {
    let now = clock.now();
    let (requeued, failed) = requeue_abandoned(store, now, heartbeat_ttl).await?;
    Ok(requeued + failed)
}

/// Scan assigned tasks for expired leases or stale holders. Abandoned tasks
/// go back to `queued`, unless their attempt budget is spent, in which case
/// they retire to `failed`. Attempts are only ever incremented by claims,
/// never here.
async fn requeue_abandoned(
    store: &Store,
    now: DateTime<Utc>,
    heartbeat_ttl: Duration,
) -> Result<(u64, u64)> {
    let cutoff = now - heartbeat_ttl;

    let rows = sqlx::query(
        r#"
        SELECT t.id, t.lease_expires_at, t.attempts, t.max_attempts,
               w.worker_id AS holder_id, w.last_seen AS holder_last_seen,
               w.status AS holder_status
        FROM tasks t
        LEFT JOIN workers w ON w.worker_id = t.reserved_by
        WHERE t.status = 'assigned'
        "#,
    )
    .fetch_all(store.pool())
    .await?;

    let mut requeued = 0u64;
    let mut failed = 0u64;

    for row in rows {
        let id: String = row.try_get("id")?;
        let lease_expires_at: Option<DateTime<Utc>> = row.try_get("lease_expires_at")?;
        let attempts: i64 = row.try_get("attempts")?;
        let max_attempts: i64 = row.try_get("max_attempts")?;
        let holder_id: Option<String> = row.try_get("holder_id")?;
        let holder_last_seen: Option<DateTime<Utc>> = row.try_get("holder_last_seen")?;
        let holder_status: Option<String> = row.try_get("holder_status")?;

        let lease_expired = lease_expires_at.is_some_and(|t| t <= now);
        // An unknown reserved_by is not abandonment: after a store reset the
        // worker table may be empty while old leases are still winding down.
        let worker_stale = holder_id.is_some()
            && (holder_last_seen.is_none()
                || holder_last_seen.is_some_and(|t| t < cutoff)
                || holder_status.as_deref() == Some("stale"));

        if !lease_expired && !worker_stale {
            continue;
        }

        if attempts >= max_attempts {
            let res = sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'failed',
                    reserved_by = NULL,
                    lease_expires_at = NULL,
                    error_message = COALESCE(error_message, 'max attempts reached')
                WHERE id = ? AND status = 'assigned'
                "#,
            )
            .bind(&id)
            .execute(store.pool())
            .await?;

            if res.rows_affected() > 0 {
                failed += 1;
                tracing::warn!(
                    event = "coordinator.task.failed",
                    task_id = %id,
                    attempts = attempts,
                    "attempt budget exhausted"
                );
            }
        } else {
            let res = sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'queued',
                    reserved_by = NULL,
                    lease_expires_at = NULL
                WHERE id = ? AND status = 'assigned'
                "#,
            )
            .bind(&id)
            .execute(store.pool())
            .await?;

            if res.rows_affected() > 0 {
                requeued += 1;
                tracing::debug!(
                    event = "coordinator.task.requeued",
                    task_id = %id,
                    "lease reclaimed"
                );
            }
        }
    }

    Ok((requeued, failed))
}
