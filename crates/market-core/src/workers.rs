use crate::clock::Clock;
use crate::error::Result;
use crate::models::{self, Worker, WorkerStatus};
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

/// Upsert a worker record: create as `active` with `last_seen = now`, or
/// revive an existing row. `capabilities` replaces the stored set only when
/// provided.
pub async fn register(
    store: &Store,
    clock: &dyn Clock,
    worker_id: &str,
    capabilities: Option<&[String]>,
) -> Result<()> {
    let now = clock.now();
    match capabilities {
        Some(caps) => {
            let caps_json = serde_json::json!(caps).to_string();
            sqlx::query(
                r#"
                INSERT INTO workers (worker_id, status, last_seen, created_at, capabilities)
                VALUES (?, 'active', ?, ?, ?)
                ON CONFLICT (worker_id) DO UPDATE SET
                  status = 'active',
                  last_seen = excluded.last_seen,
                  capabilities = excluded.capabilities
                "#,
            )
            .bind(worker_id)
            .bind(now)
            .bind(now)
            .bind(caps_json)
            .execute(store.pool())
            .await?;
        }
        None => {
            upsert_active(store, worker_id, now).await?;
        }
    }

    tracing::debug!(event = "coordinator.worker.registered", worker_id = %worker_id, "worker registered");
    Ok(())
}

/// Record a heartbeat (auto-registering unknown workers) and extend every
/// lease the worker currently holds. A healthy worker keeps its work.
pub async fn heartbeat(
    store: &Store,
    clock: &dyn Clock,
    worker_id: &str,
    lease: Duration,
) -> Result<DateTime<Utc>> {
    let now = clock.now();
    let mut tx = store.pool().begin().await?;

    sqlx::query(
        r#"
        INSERT INTO workers (worker_id, status, last_seen, created_at)
        VALUES (?, 'active', ?, ?)
        ON CONFLICT (worker_id) DO UPDATE SET
          status = 'active',
          last_seen = excluded.last_seen
        "#,
    )
    .bind(worker_id)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE tasks
        SET lease_expires_at = ?
        WHERE status = 'assigned'
          AND reserved_by = ?
        "#,
    )
    .bind(now + lease)
    .bind(worker_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(now)
}

/// Mark every worker silent for longer than `heartbeat_ttl` as stale.
/// Returns the number of workers transitioned.
pub async fn mark_stale(store: &Store, now: DateTime<Utc>, heartbeat_ttl: Duration) -> Result<u64> {
    let res = sqlx::query(
        r#"
        UPDATE workers
        SET status = 'stale'
        WHERE status <> 'stale'
          AND last_seen < ?
        "#,
    )
    .bind(now - heartbeat_ttl)
    .execute(store.pool())
    .await?;

    Ok(res.rows_affected())
}

/// Fetch one worker record, or `None` when unknown.
pub async fn get(store: &Store, worker_id: &str) -> Result<Option<Worker>> {
    let row = sqlx::query(
        r#"
        SELECT worker_id, status, last_seen, created_at, capabilities
        FROM workers
        WHERE worker_id = ?
        "#,
    )
    .bind(worker_id)
    .fetch_optional(store.pool())
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(Worker {
        worker_id: row.try_get("worker_id")?,
        status: WorkerStatus::parse(&row.try_get::<String, _>("status")?)?,
        last_seen: row.try_get("last_seen")?,
        created_at: row.try_get("created_at")?,
        capabilities: models::decode_capabilities(row.try_get("capabilities")?)?,
    }))
}

async fn upsert_active(store: &Store, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO workers (worker_id, status, last_seen, created_at)
        VALUES (?, 'active', ?, ?)
        ON CONFLICT (worker_id) DO UPDATE SET
          status = 'active',
          last_seen = excluded.last_seen
        "#,
    )
    .bind(worker_id)
    .bind(now)
    .bind(now)
    .execute(store.pool())
    .await?;
    Ok(())
}
