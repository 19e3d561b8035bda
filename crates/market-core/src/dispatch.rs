use crate::clock::Clock;
use crate::error::Result;
use crate::models::{self, TaskStatus};
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use std::collections::HashSet;

/// A task handed to a worker, with the payload it should classify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub task_id: String,
    pub text: String,
}

/// Select and atomically claim the next eligible task for `worker_id`.
///
/// Candidates are scanned FIFO by `(created_at, id)`. A candidate is skipped
/// when its type falls outside the worker's capability set, when a lease on
/// it is still live, when this worker already answered it, or when its
/// attempt budget is spent (the reaper retires those). The claim itself is a
/// conditional update re-checking the observed state; zero rows affected
/// means another claimant won and the scan moves on.
pub async fn next_task(
    store: &Store,
    clock: &dyn Clock,
    worker_id: &str,
    lease: Duration,
) -> Result<Option<ClaimedTask>> {
    let now = clock.now();

    let capabilities = worker_capabilities(store, worker_id).await?;
    let answered = answered_task_ids(store, worker_id).await?;

    let candidates = sqlx::query(
        r#"
        SELECT id, text, kind, status, lease_expires_at, attempts, max_attempts
        FROM tasks
        WHERE status IN ('queued', 'assigned')
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .fetch_all(store.pool())
    .await?;

    for row in candidates {
        let id: String = row.try_get("id")?;
        let text: String = row.try_get("text")?;
        let kind: Option<String> = row.try_get("kind")?;
        let status = TaskStatus::parse(&row.try_get::<String, _>("status")?)?;
        let lease_expires_at: Option<DateTime<Utc>> = row.try_get("lease_expires_at")?;
        let attempts: i64 = row.try_get("attempts")?;
        let max_attempts: i64 = row.try_get("max_attempts")?;

        if let (Some(kind), Some(caps)) = (kind.as_deref(), capabilities.as_ref()) {
            if !caps.iter().any(|cap| cap == kind) {
                continue;
            }
        }
        if status == TaskStatus::Assigned && lease_expires_at.is_some_and(|t| t > now) {
            continue;
        }
        if answered.contains(&id) {
            continue;
        }
        if attempts >= max_attempts {
            continue;
        }

        let claimed = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'assigned',
                reserved_by = ?,
                lease_expires_at = ?,
                attempts = attempts + 1
            WHERE id = ?
              AND status = ?
              AND (lease_expires_at IS NULL OR lease_expires_at <= ?)
              AND attempts < max_attempts
            "#,
        )
        .bind(worker_id)
        .bind(now + lease)
        .bind(&id)
        .bind(status.as_str())
        .bind(now)
        .execute(store.pool())
        .await?;

        if claimed.rows_affected() == 0 {
            // Lost the race to another claimant.
            continue;
        }

        tracing::debug!(
            event = "coordinator.task.claimed",
            task_id = %id,
            worker_id = %worker_id,
            "task claimed"
        );
        return Ok(Some(ClaimedTask { task_id: id, text }));
    }

    Ok(None)
}

/// Capability set of the requesting worker. An unregistered worker has no
/// known restrictions, same as a NULL capabilities column.
async fn worker_capabilities(store: &Store, worker_id: &str) -> Result<Option<Vec<String>>> {
    let row = sqlx::query("SELECT capabilities FROM workers WHERE worker_id = ?")
        .bind(worker_id)
        .fetch_optional(store.pool())
        .await?;

    match row {
        Some(row) => models::decode_capabilities(row.try_get("capabilities")?),
        None => Ok(None),
    }
}

/// Tasks this worker has already answered; never re-hand those.
async fn answered_task_ids(store: &Store, worker_id: &str) -> Result<HashSet<String>> {
    let rows = sqlx::query("SELECT task_id FROM submissions WHERE worker_id = ?")
        .bind(worker_id)
        .fetch_all(store.pool())
        .await?;

    let mut ids = HashSet::with_capacity(rows.len());
    for row in rows {
        ids.insert(row.try_get("task_id")?);
    }
    Ok(ids)
}
