use chrono::{Duration, TimeZone, Utc};
use market_core::{
    aggregate::{self, SubmitOutcome},
    dispatch, reaper,
    tasks::{self, NewTask, TaskDefaults},
    workers, Clock, ManualClock, Store,
};
use market_core::models::TaskStatus;
use tempfile::TempDir;

fn lease() -> Duration {
    Duration::seconds(50)
}

fn heartbeat_ttl() -> Duration {
    Duration::seconds(75)
}

fn test_clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
}

async fn test_store() -> anyhow::Result<(TempDir, Store)> {
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}", dir.path().join("coordinator.db").display());
    let store = Store::connect(&url).await?;
    store.migrate().await?;
    Ok((dir, store))
}

async fn quick_task(
    store: &Store,
    clock: &ManualClock,
    kind: Option<&str>,
    required: i64,
    max_attempts: i64,
) -> anyhow::Result<String> {
    let id = tasks::create(
        store,
        clock,
        TaskDefaults::default(),
        NewTask {
            text: "the service was excellent".to_string(),
            kind: kind.map(str::to_string),
            required_submissions: Some(required),
            max_attempts: Some(max_attempts),
        },
    )
    .await?;
    Ok(id)
}

async fn claim_expecting(
    store: &Store,
    clock: &ManualClock,
    worker_id: &str,
    expected_task: &str,
) -> anyhow::Result<()> {
    let claimed = dispatch::next_task(store, clock, worker_id, lease()).await?;
    let claimed = claimed.ok_or_else(|| anyhow::anyhow!("expected {worker_id} to claim a task"))?;
    anyhow::ensure!(
        claimed.task_id == expected_task,
        "expected {worker_id} to claim {expected_task}, got {}",
        claimed.task_id
    );
    Ok(())
}

#[tokio::test]
async fn happy_path_quorum_awards_points() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();
    let task_id = quick_task(&store, &clock, None, 3, 5).await?;

    claim_expecting(&store, &clock, "w1", &task_id).await?;
    let outcome = aggregate::submit(&store, &clock, "w1", &task_id, "positive", 0.9).await?;
    anyhow::ensure!(outcome == SubmitOutcome::Accepted { finalized: false });

    clock.advance(lease() + Duration::seconds(1));
    claim_expecting(&store, &clock, "w2", &task_id).await?;
    aggregate::submit(&store, &clock, "w2", &task_id, "positive", 0.8).await?;

    clock.advance(lease() + Duration::seconds(1));
    claim_expecting(&store, &clock, "w3", &task_id).await?;
    let outcome = aggregate::submit(&store, &clock, "w3", &task_id, "negative", 0.95).await?;
    anyhow::ensure!(outcome == SubmitOutcome::Accepted { finalized: true });

    let (task, submissions) = tasks::get(&store, &task_id).await?;
    anyhow::ensure!(task.status == TaskStatus::Finalized, "status {:?}", task.status);
    anyhow::ensure!(task.final_label.as_deref() == Some("positive"));
    anyhow::ensure!(task.reserved_by.is_none() && task.lease_expires_at.is_none());
    anyhow::ensure!(submissions.len() == 3);
    // Submissions come back oldest-first.
    anyhow::ensure!(submissions[0].worker_id == "w1" && submissions[2].worker_id == "w3");

    let scores = store.leaderboard().await?;
    anyhow::ensure!(scores.len() == 2, "expected two scored workers, got {scores:?}");
    anyhow::ensure!(scores.iter().any(|s| s.worker_id == "w1" && s.points == 1));
    anyhow::ensure!(scores.iter().any(|s| s.worker_id == "w2" && s.points == 1));
    anyhow::ensure!(!scores.iter().any(|s| s.worker_id == "w3"));

    Ok(())
}

#[tokio::test]
async fn tie_broken_by_mean_confidence() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();
    let task_id = quick_task(&store, &clock, None, 2, 5).await?;

    claim_expecting(&store, &clock, "w1", &task_id).await?;
    aggregate::submit(&store, &clock, "w1", &task_id, "positive", 0.6).await?;

    clock.advance(lease() + Duration::seconds(1));
    claim_expecting(&store, &clock, "w2", &task_id).await?;
    aggregate::submit(&store, &clock, "w2", &task_id, "negative", 0.9).await?;

    let (task, _) = tasks::get(&store, &task_id).await?;
    anyhow::ensure!(task.status == TaskStatus::Finalized);
    anyhow::ensure!(task.final_label.as_deref() == Some("negative"));

    let scores = store.leaderboard().await?;
    anyhow::ensure!(scores.len() == 1 && scores[0].worker_id == "w2");
    Ok(())
}

#[tokio::test]
async fn exact_tie_falls_back_to_label_order() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();
    let task_id = quick_task(&store, &clock, None, 2, 5).await?;

    aggregate::submit(&store, &clock, "w1", &task_id, "b", 0.5).await?;
    aggregate::submit(&store, &clock, "w2", &task_id, "a", 0.5).await?;

    let (task, _) = tasks::get(&store, &task_id).await?;
    anyhow::ensure!(task.final_label.as_deref() == Some("a"));
    Ok(())
}

#[tokio::test]
async fn duplicate_submission_is_idempotent() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();
    let task_id = quick_task(&store, &clock, None, 3, 5).await?;

    let first = aggregate::submit(&store, &clock, "w1", &task_id, "positive", 0.9).await?;
    anyhow::ensure!(first == SubmitOutcome::Accepted { finalized: false });

    let second = aggregate::submit(&store, &clock, "w1", &task_id, "negative", 0.2).await?;
    anyhow::ensure!(second == SubmitOutcome::Duplicate);

    let (_, submissions) = tasks::get(&store, &task_id).await?;
    anyhow::ensure!(submissions.len() == 1);
    anyhow::ensure!(submissions[0].label == "positive");
    anyhow::ensure!((submissions[0].confidence - 0.9).abs() < f64::EPSILON);
    Ok(())
}

#[tokio::test]
async fn submitting_unknown_task_is_not_found() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();

    let err = aggregate::submit(&store, &clock, "w1", "no-such-task", "positive", 0.5)
        .await
        .expect_err("expected not-found");
    anyhow::ensure!(err.is_not_found(), "unexpected error: {err}");

    let err = tasks::get(&store, "no-such-task").await.expect_err("expected not-found");
    anyhow::ensure!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn capability_filter_skips_mismatched_worker() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();
    let task_id = quick_task(&store, &clock, Some("vision"), 3, 5).await?;

    workers::register(&store, &clock, "w1", Some(&["text".to_string()])).await?;
    workers::register(
        &store,
        &clock,
        "w2",
        Some(&["vision".to_string(), "text".to_string()]),
    )
    .await?;

    let claimed = dispatch::next_task(&store, &clock, "w1", lease()).await?;
    anyhow::ensure!(claimed.is_none(), "w1 lacks the vision capability");

    claim_expecting(&store, &clock, "w2", &task_id).await?;
    Ok(())
}

#[tokio::test]
async fn untyped_worker_takes_typed_tasks() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();
    let task_id = quick_task(&store, &clock, Some("vision"), 3, 5).await?;

    // Registered without capabilities = takes anything; unregistered workers
    // behave the same.
    workers::register(&store, &clock, "w1", None).await?;
    claim_expecting(&store, &clock, "w1", &task_id).await?;

    clock.advance(lease() + Duration::seconds(1));
    claim_expecting(&store, &clock, "w2", &task_id).await?;
    Ok(())
}

#[tokio::test]
async fn dispatch_is_fifo_by_creation() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();

    let first = quick_task(&store, &clock, None, 3, 5).await?;
    clock.advance(Duration::seconds(1));
    let second = quick_task(&store, &clock, None, 3, 5).await?;

    claim_expecting(&store, &clock, "w1", &first).await?;
    claim_expecting(&store, &clock, "w2", &second).await?;

    let idle = dispatch::next_task(&store, &clock, "w3", lease()).await?;
    anyhow::ensure!(idle.is_none(), "both tasks are leased");
    Ok(())
}

#[tokio::test]
async fn abandoned_worker_task_requeues_and_finalizes_elsewhere() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();
    let task_id = quick_task(&store, &clock, None, 3, 5).await?;

    workers::register(&store, &clock, "w1", None).await?;
    claim_expecting(&store, &clock, "w1", &task_id).await?;

    // w1 goes dark: no heartbeat past the TTL, lease long expired.
    clock.advance(heartbeat_ttl() + Duration::seconds(1));
    let outcome = reaper::sweep(&store, &clock, heartbeat_ttl()).await?;
    anyhow::ensure!(outcome.stale_workers == 1, "w1 should go stale");
    anyhow::ensure!(outcome.requeued == 1 && outcome.failed == 0);

    let (task, _) = tasks::get(&store, &task_id).await?;
    anyhow::ensure!(task.status == TaskStatus::Queued);
    anyhow::ensure!(task.reserved_by.is_none() && task.lease_expires_at.is_none());
    anyhow::ensure!(task.attempts == 1, "requeue must not touch attempts");

    claim_expecting(&store, &clock, "w2", &task_id).await?;
    let (task, _) = tasks::get(&store, &task_id).await?;
    anyhow::ensure!(task.attempts == 2, "re-claim increments attempts");

    aggregate::submit(&store, &clock, "w2", &task_id, "positive", 0.7).await?;
    aggregate::submit(&store, &clock, "w3", &task_id, "positive", 0.6).await?;
    let outcome = aggregate::submit(&store, &clock, "w4", &task_id, "negative", 0.9).await?;
    anyhow::ensure!(outcome == SubmitOutcome::Accepted { finalized: true });

    let (task, _) = tasks::get(&store, &task_id).await?;
    anyhow::ensure!(task.status == TaskStatus::Finalized);
    anyhow::ensure!(task.final_label.as_deref() == Some("positive"));
    Ok(())
}

#[tokio::test]
async fn attempt_exhaustion_fails_task() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();
    let task_id = quick_task(&store, &clock, None, 3, 2).await?;

    claim_expecting(&store, &clock, "w1", &task_id).await?;
    clock.advance(lease() + Duration::seconds(1));
    let touched = reaper::requeue_expired(&store, &clock, heartbeat_ttl()).await?;
    anyhow::ensure!(touched == 1);

    claim_expecting(&store, &clock, "w2", &task_id).await?;
    clock.advance(lease() + Duration::seconds(1));
    let outcome = reaper::sweep(&store, &clock, heartbeat_ttl()).await?;
    anyhow::ensure!(outcome.failed == 1 && outcome.requeued == 0);

    let (task, _) = tasks::get(&store, &task_id).await?;
    anyhow::ensure!(task.status == TaskStatus::Failed);
    anyhow::ensure!(task.error_message.as_deref() == Some("max attempts reached"));
    anyhow::ensure!(task.attempts == 2 && task.reserved_by.is_none());

    // A failed task is never dispatched again.
    let claimed = dispatch::next_task(&store, &clock, "w3", lease()).await?;
    anyhow::ensure!(claimed.is_none());
    Ok(())
}

#[tokio::test]
async fn exhausted_assigned_task_is_not_reclaimed() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();
    let task_id = quick_task(&store, &clock, None, 3, 1).await?;

    claim_expecting(&store, &clock, "w1", &task_id).await?;
    clock.advance(lease() + Duration::seconds(1));

    // Lease is expired and the budget is spent: the task must wait for the
    // reaper instead of handing out an attempt past the cap.
    let claimed = dispatch::next_task(&store, &clock, "w2", lease()).await?;
    anyhow::ensure!(claimed.is_none());

    let (task, _) = tasks::get(&store, &task_id).await?;
    anyhow::ensure!(task.attempts == 1 && task.max_attempts == 1);

    reaper::sweep(&store, &clock, heartbeat_ttl()).await?;
    let (task, _) = tasks::get(&store, &task_id).await?;
    anyhow::ensure!(task.status == TaskStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn heartbeat_extends_held_leases() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();
    let task_id = quick_task(&store, &clock, None, 3, 5).await?;

    workers::register(&store, &clock, "w1", None).await?;
    claim_expecting(&store, &clock, "w1", &task_id).await?;

    // Two heartbeats inside the lease window keep the task held well past
    // the original expiry.
    clock.advance(Duration::seconds(40));
    workers::heartbeat(&store, &clock, "w1", lease()).await?;
    clock.advance(Duration::seconds(40));
    let ts = workers::heartbeat(&store, &clock, "w1", lease()).await?;
    anyhow::ensure!(ts == clock.now());

    let outcome = reaper::sweep(&store, &clock, heartbeat_ttl()).await?;
    anyhow::ensure!(outcome == Default::default(), "nothing to reap: {outcome:?}");

    let (task, _) = tasks::get(&store, &task_id).await?;
    anyhow::ensure!(task.status == TaskStatus::Assigned);
    anyhow::ensure!(task.reserved_by.as_deref() == Some("w1"));
    anyhow::ensure!(task.lease_expires_at == Some(clock.now() + lease()));

    let other = dispatch::next_task(&store, &clock, "w2", lease()).await?;
    anyhow::ensure!(other.is_none(), "live lease must not be re-dispatched");
    Ok(())
}

#[tokio::test]
async fn heartbeat_auto_registers_and_is_monotone() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();

    let ts1 = workers::heartbeat(&store, &clock, "w1", lease()).await?;
    clock.advance(Duration::seconds(5));
    let ts2 = workers::heartbeat(&store, &clock, "w1", lease()).await?;
    anyhow::ensure!(ts2 > ts1, "last_seen never decreases");

    let worker = workers::get(&store, "w1").await?.expect("auto-registered");
    anyhow::ensure!(worker.last_seen == Some(ts2));
    anyhow::ensure!(worker.capabilities.is_none());

    // Register-then-heartbeat converges on the same state as heartbeat alone.
    workers::register(&store, &clock, "w2", None).await?;
    let ts = workers::heartbeat(&store, &clock, "w2", lease()).await?;
    let w2 = workers::get(&store, "w2").await?.expect("registered");
    anyhow::ensure!(w2.last_seen == Some(ts));
    anyhow::ensure!(w2.status == market_core::models::WorkerStatus::Active);
    Ok(())
}

#[tokio::test]
async fn heartbeat_revives_stale_worker() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();

    workers::register(&store, &clock, "w1", None).await?;
    clock.advance(heartbeat_ttl() + Duration::seconds(1));
    reaper::sweep(&store, &clock, heartbeat_ttl()).await?;

    let worker = workers::get(&store, "w1").await?.expect("registered");
    anyhow::ensure!(worker.status == market_core::models::WorkerStatus::Stale);

    workers::heartbeat(&store, &clock, "w1", lease()).await?;
    let worker = workers::get(&store, "w1").await?.expect("registered");
    anyhow::ensure!(worker.status == market_core::models::WorkerStatus::Active);
    Ok(())
}

#[tokio::test]
async fn unknown_reserved_by_is_not_abandoned() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();

    workers::register(&store, &clock, "known", None).await?;
    clock.advance(heartbeat_ttl() + Duration::seconds(5));

    // Both claims happen now, so both leases are live; only the known (and
    // by now silent) worker's task counts as abandoned.
    let ghost_task = quick_task(&store, &clock, None, 3, 5).await?;
    clock.advance(Duration::seconds(1));
    let known_task = quick_task(&store, &clock, None, 3, 5).await?;

    claim_expecting(&store, &clock, "ghost", &ghost_task).await?;
    claim_expecting(&store, &clock, "known", &known_task).await?;

    let outcome = reaper::sweep(&store, &clock, heartbeat_ttl()).await?;
    anyhow::ensure!(outcome.stale_workers == 1);
    anyhow::ensure!(outcome.requeued == 1 && outcome.failed == 0);

    let (ghost, _) = tasks::get(&store, &ghost_task).await?;
    anyhow::ensure!(ghost.status == TaskStatus::Assigned, "unknown holder is left alone");

    let (known, _) = tasks::get(&store, &known_task).await?;
    anyhow::ensure!(known.status == TaskStatus::Queued, "stale holder loses the task");
    Ok(())
}

#[tokio::test]
async fn sweep_is_idempotent_without_new_claims() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();
    let task_id = quick_task(&store, &clock, None, 3, 5).await?;

    workers::register(&store, &clock, "w1", None).await?;
    claim_expecting(&store, &clock, "w1", &task_id).await?;

    clock.advance(heartbeat_ttl() + Duration::seconds(1));
    let first = reaper::sweep(&store, &clock, heartbeat_ttl()).await?;
    anyhow::ensure!(first.tasks_touched() == 1);

    let second = reaper::sweep(&store, &clock, heartbeat_ttl()).await?;
    anyhow::ensure!(second == Default::default(), "second sweep changed {second:?}");
    Ok(())
}

#[tokio::test]
async fn late_submission_after_finalize_earns_nothing() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();
    let task_id = quick_task(&store, &clock, None, 2, 5).await?;

    aggregate::submit(&store, &clock, "w1", &task_id, "positive", 0.8).await?;
    let outcome = aggregate::submit(&store, &clock, "w2", &task_id, "positive", 0.7).await?;
    anyhow::ensure!(outcome == SubmitOutcome::Accepted { finalized: true });

    // A straggler on the winning label after finalization: recorded, never
    // scored, never re-finalizes.
    let outcome = aggregate::submit(&store, &clock, "w3", &task_id, "positive", 0.99).await?;
    anyhow::ensure!(outcome == SubmitOutcome::Accepted { finalized: false });

    let scores = store.leaderboard().await?;
    anyhow::ensure!(scores.len() == 2);
    anyhow::ensure!(scores.iter().all(|s| s.points == 1));
    anyhow::ensure!(!scores.iter().any(|s| s.worker_id == "w3"));

    let claimed = dispatch::next_task(&store, &clock, "w4", lease()).await?;
    anyhow::ensure!(claimed.is_none(), "finalized tasks never dispatch");
    Ok(())
}

#[tokio::test]
async fn dispatch_skips_tasks_already_answered() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();
    let task_id = quick_task(&store, &clock, None, 3, 5).await?;

    claim_expecting(&store, &clock, "w1", &task_id).await?;
    aggregate::submit(&store, &clock, "w1", &task_id, "positive", 0.9).await?;

    // The lease is gone but w1 already answered; only other workers see it.
    clock.advance(lease() + Duration::seconds(1));
    let again = dispatch::next_task(&store, &clock, "w1", lease()).await?;
    anyhow::ensure!(again.is_none());

    claim_expecting(&store, &clock, "w2", &task_id).await?;
    Ok(())
}

#[tokio::test]
async fn list_filters_by_status_and_reset_truncates() -> anyhow::Result<()> {
    let (_dir, store) = test_store().await?;
    let clock = test_clock();

    let first = quick_task(&store, &clock, None, 3, 5).await?;
    clock.advance(Duration::seconds(1));
    let second = quick_task(&store, &clock, None, 3, 5).await?;
    clock.advance(Duration::seconds(1));
    // Claims are FIFO, so this assigns the first task and leaves the second
    // queued.
    claim_expecting(&store, &clock, "w1", &first).await?;

    let all = tasks::list(&store, None).await?;
    anyhow::ensure!(all.len() == 2);

    let queued_only = tasks::list(&store, Some(TaskStatus::Queued)).await?;
    anyhow::ensure!(queued_only.len() == 1 && queued_only[0].id == second);

    let assigned_only = tasks::list(&store, Some(TaskStatus::Assigned)).await?;
    anyhow::ensure!(assigned_only.len() == 1 && assigned_only[0].id == first);

    aggregate::submit(&store, &clock, "w1", &first, "positive", 0.9).await?;
    let stats = store.stats(clock.now(), heartbeat_ttl()).await?;
    anyhow::ensure!(stats.tasks_total == 2);
    anyhow::ensure!(stats.tasks_assigned == 1 && stats.tasks_queued == 1);
    anyhow::ensure!(stats.submissions_total == 1);

    store.reset().await?;
    let stats = store.stats(clock.now(), heartbeat_ttl()).await?;
    anyhow::ensure!(stats.tasks_total == 0);
    anyhow::ensure!(stats.submissions_total == 0 && stats.workers_total == 0);
    anyhow::ensure!(store.leaderboard().await?.is_empty());
    Ok(())
}
