use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{Submission, Task, TaskStatus, TaskSummary};
use crate::store::Store;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite};
use uuid::Uuid;

/// Per-deployment defaults for optional task fields.
#[derive(Debug, Clone, Copy)]
pub struct TaskDefaults {
    pub required_submissions: i64,
    pub max_attempts: i64,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            required_submissions: 3,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub text: String,
    pub kind: Option<String>,
    pub required_submissions: Option<i64>,
    pub max_attempts: Option<i64>,
}

/// Persist a fresh `queued` task and return its id.
pub async fn create(
    store: &Store,
    clock: &dyn Clock,
    defaults: TaskDefaults,
    new: NewTask,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let required = new
        .required_submissions
        .unwrap_or(defaults.required_submissions);
    let max_attempts = new.max_attempts.unwrap_or(defaults.max_attempts);

    sqlx::query(
        r#"
        INSERT INTO tasks (id, text, kind, status, required_submissions, max_attempts, attempts, created_at)
        VALUES (?, ?, ?, 'queued', ?, ?, 0, ?)
        "#,
    )
    .bind(&id)
    .bind(&new.text)
    .bind(&new.kind)
    .bind(required)
    .bind(max_attempts)
    .bind(clock.now())
    .execute(store.pool())
    .await?;

    tracing::debug!(event = "coordinator.task.created", task_id = %id, "task created");
    Ok(id)
}

/// Task summaries, optionally filtered by status, FIFO by creation.
pub async fn list(store: &Store, status: Option<TaskStatus>) -> Result<Vec<TaskSummary>> {
    const COLUMNS: &str =
        "id, kind, status, final_label, required_submissions, attempts, created_at";

    let rows = match status {
        Some(status) => {
            sqlx::query(&format!(
                "SELECT {COLUMNS} FROM tasks WHERE status = ? ORDER BY created_at ASC, id ASC"
            ))
            .bind(status.as_str())
            .fetch_all(store.pool())
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {COLUMNS} FROM tasks ORDER BY created_at ASC, id ASC"
            ))
            .fetch_all(store.pool())
            .await?
        }
    };

    rows.into_iter().map(summary_from_row).collect()
}

/// Fetch one task with its submissions, oldest submission first.
pub async fn get(store: &Store, task_id: &str) -> Result<(Task, Vec<Submission>)> {
    let Some(task) = fetch_task(store.pool(), task_id).await? else {
        return Err(Error::TaskNotFound(task_id.to_string()));
    };
    let submissions = submissions_for(store.pool(), task_id).await?;
    Ok((task, submissions))
}

pub(crate) async fn fetch_task<'e, E>(executor: E, task_id: &str) -> Result<Option<Task>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        r#"
        SELECT id, text, kind, status, final_label, required_submissions, created_at,
               reserved_by, lease_expires_at, attempts, max_attempts, error_message
        FROM tasks
        WHERE id = ?
        "#,
    )
    .bind(task_id)
    .fetch_optional(executor)
    .await?;

    row.map(task_from_row).transpose()
}

pub(crate) async fn submissions_for<'e, E>(executor: E, task_id: &str) -> Result<Vec<Submission>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        SELECT id, task_id, worker_id, label, confidence, created_at
        FROM submissions
        WHERE task_id = ?
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(task_id)
    .fetch_all(executor)
    .await?;

    rows.into_iter().map(submission_from_row).collect()
}

fn task_from_row(row: SqliteRow) -> Result<Task> {
    Ok(Task {
        id: row.try_get("id")?,
        text: row.try_get("text")?,
        kind: row.try_get("kind")?,
        status: TaskStatus::parse(&row.try_get::<String, _>("status")?)?,
        final_label: row.try_get("final_label")?,
        required_submissions: row.try_get("required_submissions")?,
        created_at: row.try_get("created_at")?,
        reserved_by: row.try_get("reserved_by")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        error_message: row.try_get("error_message")?,
    })
}

fn summary_from_row(row: SqliteRow) -> Result<TaskSummary> {
    Ok(TaskSummary {
        id: row.try_get("id")?,
        kind: row.try_get("kind")?,
        status: TaskStatus::parse(&row.try_get::<String, _>("status")?)?,
        final_label: row.try_get("final_label")?,
        required_submissions: row.try_get("required_submissions")?,
        attempts: row.try_get("attempts")?,
        created_at: row.try_get("created_at")?,
    })
}

fn submission_from_row(row: SqliteRow) -> Result<Submission> {
    Ok(Submission {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        worker_id: row.try_get("worker_id")?,
        label: row.try_get("label")?,
        confidence: row.try_get("confidence")?,
        created_at: row.try_get("created_at")?,
    })
}
