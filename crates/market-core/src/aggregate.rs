use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{Submission, TaskStatus};
use crate::store::Store;
use crate::tasks;
use sqlx::{Sqlite, Transaction};
use std::collections::BTreeMap;

/// Result of recording a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Stored; `finalized` is true when this submission closed the quorum.
    Accepted { finalized: bool },
    /// The worker already answered this task; the original row stands.
    Duplicate,
}

/// Record one worker's answer and finalize the task if it reaches quorum.
///
/// Idempotent per `(task_id, worker_id)`: a repeat submission reports
/// `Duplicate` and leaves the first answer untouched. Finalization runs in
/// the same transaction as the insert, so scoring happens exactly once.
pub async fn submit(
    store: &Store,
    clock: &dyn Clock,
    worker_id: &str,
    task_id: &str,
    label: &str,
    confidence: f64,
) -> Result<SubmitOutcome> {
    let now = clock.now();
    let mut tx = store.pool().begin().await?;

    let Some(task) = tasks::fetch_task(&mut *tx, task_id).await? else {
        return Err(Error::TaskNotFound(task_id.to_string()));
    };

    let inserted = sqlx::query(
        r#"
        INSERT INTO submissions (task_id, worker_id, label, confidence, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (task_id, worker_id) DO NOTHING
        "#,
    )
    .bind(task_id)
    .bind(worker_id)
    .bind(label)
    .bind(confidence)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    if inserted.rows_affected() == 0 {
        return Ok(SubmitOutcome::Duplicate);
    }

    let submissions = tasks::submissions_for(&mut *tx, task_id).await?;
    let mut finalized = false;
    if submissions.len() as i64 >= task.required_submissions
        && task.final_label.is_none()
        && task.status != TaskStatus::Failed
    {
        finalize(&mut tx, task_id, &submissions).await?;
        finalized = true;
    }

    tx.commit().await?;
    Ok(SubmitOutcome::Accepted { finalized })
}

/// Pick the winning label: plurality vote, ties broken by higher mean
/// confidence, then by lexicographically smallest label.
pub fn consensus_label(submissions: &[Submission]) -> Option<String> {
    let mut tally: BTreeMap<&str, (i64, f64)> = BTreeMap::new();
    for sub in submissions {
        let entry = tally.entry(sub.label.as_str()).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += sub.confidence;
    }

    let mut best: Option<(&str, i64, f64)> = None;
    for (label, (count, total_confidence)) in tally {
        let mean = total_confidence / count as f64;
        let better = match best {
            None => true,
            Some((_, best_count, best_mean)) => {
                count > best_count || (count == best_count && mean > best_mean)
            }
        };
        // Labels arrive in ascending order, so an exact tie keeps the
        // lexicographically smallest one.
        if better {
            best = Some((label, count, mean));
        }
    }

    best.map(|(label, _, _)| label.to_string())
}

async fn finalize(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: &str,
    submissions: &[Submission],
) -> Result<()> {
    let Some(best_label) = consensus_label(submissions) else {
        return Ok(());
    };

    sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'finalized',
            final_label = ?,
            reserved_by = NULL,
            lease_expires_at = NULL
        WHERE id = ?
        "#,
    )
    .bind(&best_label)
    .bind(task_id)
    .execute(&mut **tx)
    .await?;

    // One point per distinct worker on the winning label; the unique
    // submission index means each worker appears at most once here.
    for sub in submissions.iter().filter(|s| s.label == best_label) {
        sqlx::query(
            r#"
            INSERT INTO worker_scores (worker_id, points)
            VALUES (?, 1)
            ON CONFLICT (worker_id) DO UPDATE SET points = points + 1
            "#,
        )
        .bind(&sub.worker_id)
        .execute(&mut **tx)
        .await?;
    }

    tracing::info!(
        event = "coordinator.task.finalized",
        task_id = %task_id,
        label = %best_label,
        submissions = submissions.len(),
        "quorum reached"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sub(worker: &str, label: &str, confidence: f64) -> Submission {
        Submission {
            id: 0,
            task_id: "t1".to_string(),
            worker_id: worker.to_string(),
            label: label.to_string(),
            confidence,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn plurality_wins() {
        let subs = vec![
            sub("w1", "positive", 0.9),
            sub("w2", "positive", 0.8),
            sub("w3", "negative", 0.95),
        ];
        assert_eq!(consensus_label(&subs).as_deref(), Some("positive"));
    }

    #[test]
    fn tie_broken_by_mean_confidence() {
        let subs = vec![sub("w1", "positive", 0.6), sub("w2", "negative", 0.9)];
        assert_eq!(consensus_label(&subs).as_deref(), Some("negative"));
    }

    #[test]
    fn exact_tie_prefers_smallest_label() {
        let subs = vec![sub("w1", "b", 0.5), sub("w2", "a", 0.5)];
        assert_eq!(consensus_label(&subs).as_deref(), Some("a"));
    }

    #[test]
    fn tie_mean_spans_all_submissions_for_a_label() {
        let subs = vec![
            sub("w1", "no", 0.4),
            sub("w2", "no", 0.6),
            sub("w3", "yes", 0.9),
            sub("w4", "yes", 0.5),
        ];
        // 2-2 tie; mean(yes) = 0.7 beats mean(no) = 0.5.
        assert_eq!(consensus_label(&subs).as_deref(), Some("yes"));
    }

    #[test]
    fn empty_has_no_consensus() {
        assert_eq!(consensus_label(&[]), None);
    }
}
