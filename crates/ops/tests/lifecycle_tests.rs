// Job lifecycle manager: whole-batch polling, bounded transient retries,
// and closeout bookkeeping.

mod common;

use common::*;
use nocturn_batch::{BatchJobStatus, JobSpec};
use nocturn_core::JobOutcome;
use nocturn_ops::{JobLifecycle, OpsError};
use nocturn_registry::repos::NewJob;
use std::sync::atomic::{AtomicBool, Ordering};
use time::macros::datetime;

fn lifecycle(ctx: &nocturn_ops::OpsContext) -> JobLifecycle {
    JobLifecycle::new(ctx.registry.clone(), ctx.batch.clone(), &ctx.config.batch)
}

fn new_job() -> NewJob {
    NewJob {
        ppid: 15,
        fid: Some(FID),
        expid: None,
        field: Some(TARGET_FIELD),
        rid: None,
        rfid: None,
        proc_date: PROC_DATE.to_string(),
        launched_at: datetime!(2028-09-08 01:00:00 UTC),
    }
}

#[tokio::test]
async fn test_three_job_batch_polls_until_all_terminal() {
    let (_dir, ctx, batch) = test_context().await;
    let lifecycle = lifecycle(&ctx);
    let cancel = AtomicBool::new(false);

    let mut jids = Vec::new();
    let mut external_ids = Vec::new();
    for i in 0..3 {
        let jid = lifecycle.create(&new_job()).await.unwrap();
        let external_id = lifecycle
            .submit(jid, &JobSpec::new(format!("job{i}"), "q", "d"))
            .await
            .unwrap();
        jids.push(jid);
        external_ids.push(external_id);
    }

    // Two succeed quickly; the third takes three extra sweeps and fails.
    // The call must not return before the slow job is terminal.
    batch.set_script(&external_ids[0], vec![BatchJobStatus::Succeeded]);
    batch.set_script(
        &external_ids[1],
        vec![BatchJobStatus::Running, BatchJobStatus::Succeeded],
    );
    batch.set_script(
        &external_ids[2],
        vec![
            BatchJobStatus::Runnable,
            BatchJobStatus::Starting,
            BatchJobStatus::Running,
            BatchJobStatus::Failed,
        ],
    );

    let finals = lifecycle.poll_until_terminal(&jids, &cancel).await.unwrap();
    assert_eq!(finals[&jids[0]], BatchJobStatus::Succeeded);
    assert_eq!(finals[&jids[1]], BatchJobStatus::Succeeded);
    assert_eq!(finals[&jids[2]], BatchJobStatus::Failed);

    // Closeout with each job's declared exit code (scenario: 0, 0, 70).
    for (jid, exit_code) in [(jids[0], 0), (jids[1], 0), (jids[2], 70)] {
        lifecycle
            .close_out(jid, exit_code, None, None, Some(datetime!(2028-09-08 02:00:00 UTC)))
            .await
            .unwrap();
    }

    for (jid, expected_exit, expected_outcome) in [
        (jids[0], 0, "succeeded"),
        (jids[1], 0, "succeeded"),
        (jids[2], 70, "failed"),
    ] {
        let job = ctx.registry.get_job(jid).await.unwrap().unwrap();
        assert_eq!(job.status, "closed_out");
        assert_eq!(job.exit_code, Some(expected_exit));
        assert_eq!(job.outcome.as_deref(), Some(expected_outcome));
    }
}

#[tokio::test]
async fn test_transient_describe_failures_are_retried() {
    let (_dir, ctx, batch) = test_context().await;
    let lifecycle = lifecycle(&ctx);
    let cancel = AtomicBool::new(false);

    let jid = lifecycle.create(&new_job()).await.unwrap();
    lifecycle
        .submit(jid, &JobSpec::new("job", "q", "d"))
        .await
        .unwrap();

    // Two failed sweeps, then the default Running -> Succeeded script.
    batch.fail_next_describes(2);

    let finals = lifecycle
        .poll_until_terminal(&[jid], &cancel)
        .await
        .unwrap();
    assert_eq!(finals[&jid], BatchJobStatus::Succeeded);
}

#[tokio::test]
async fn test_polling_gives_up_after_consecutive_failures() {
    let (_dir, ctx, batch) = test_context().await;
    let lifecycle = lifecycle(&ctx);
    let cancel = AtomicBool::new(false);

    let jid = lifecycle.create(&new_job()).await.unwrap();
    lifecycle
        .submit(jid, &JobSpec::new("job", "q", "d"))
        .await
        .unwrap();

    // More failures than the configured bound (4 in test_config).
    batch.fail_next_describes(10);

    let err = lifecycle
        .poll_until_terminal(&[jid], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, OpsError::PollingExhausted { .. }));
}

#[tokio::test]
async fn test_polling_observes_cancellation() {
    let (_dir, ctx, batch) = test_context().await;
    let lifecycle = lifecycle(&ctx);

    let jid = lifecycle.create(&new_job()).await.unwrap();
    let external_id = lifecycle
        .submit(jid, &JobSpec::new("job", "q", "d"))
        .await
        .unwrap();
    // A job that never terminates on its own.
    batch.set_script(&external_id, vec![BatchJobStatus::Running]);

    let cancel = AtomicBool::new(true);
    cancel.store(true, Ordering::SeqCst);
    let err = lifecycle
        .poll_until_terminal(&[jid], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, OpsError::Interrupted));
}

#[tokio::test]
async fn test_empty_batch_returns_immediately() {
    let (_dir, ctx, _batch) = test_context().await;
    let lifecycle = lifecycle(&ctx);
    let cancel = AtomicBool::new(false);

    let finals = lifecycle.poll_until_terminal(&[], &cancel).await.unwrap();
    assert!(finals.is_empty());
}

#[tokio::test]
async fn test_polled_statuses_are_recorded() {
    let (_dir, ctx, batch) = test_context().await;
    let lifecycle = lifecycle(&ctx);
    let cancel = AtomicBool::new(false);

    let jid = lifecycle.create(&new_job()).await.unwrap();
    let external_id = lifecycle
        .submit(jid, &JobSpec::new("job", "q", "d"))
        .await
        .unwrap();
    batch.set_script(
        &external_id,
        vec![BatchJobStatus::Running, BatchJobStatus::Succeeded],
    );

    lifecycle.poll_until_terminal(&[jid], &cancel).await.unwrap();

    let job = ctx.registry.get_job(jid).await.unwrap().unwrap();
    assert_eq!(job.status, "succeeded");

    let outcome = lifecycle.close_out(jid, 0, None, None, None).await.unwrap();
    assert_eq!(outcome, JobOutcome::Succeeded);
}
