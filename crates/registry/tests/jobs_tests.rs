// Job lifecycle bookkeeping: external-id immutability and idempotent
// closeout.

mod common;

use common::*;
use nocturn_core::JobOutcome;
use nocturn_registry::RegistryError;
use nocturn_registry::repos::JobRepo;
use time::macros::datetime;

const PPID: i32 = 15;

#[tokio::test]
async fn test_create_and_attach_external_id() {
    let (_dir, store) = sqlite_store().await;

    let jid = store.create_job(&sample_job(PPID, "20280908")).await.unwrap();
    let job = store.get_job(jid).await.unwrap().unwrap();
    assert_eq!(job.status, "created");
    assert!(job.external_id.is_none());

    store.attach_external_id(jid, "batch-aaaa-1111").await.unwrap();
    let job = store.get_job(jid).await.unwrap().unwrap();
    assert_eq!(job.status, "submitted");
    assert_eq!(job.external_id.as_deref(), Some("batch-aaaa-1111"));

    // Same value again: no-op.
    store.attach_external_id(jid, "batch-aaaa-1111").await.unwrap();

    // A different value is a conflict; the attached id is immutable.
    let err = store
        .attach_external_id(jid, "batch-bbbb-2222")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::ExternalIdConflict { .. }));
    let job = store.get_job(jid).await.unwrap().unwrap();
    assert_eq!(job.external_id.as_deref(), Some("batch-aaaa-1111"));
}

#[tokio::test]
async fn test_update_job_status_during_polling() {
    let (_dir, store) = sqlite_store().await;

    let jid = store.create_job(&sample_job(PPID, "20280908")).await.unwrap();
    store.attach_external_id(jid, "batch-cccc").await.unwrap();

    for status in ["runnable", "starting", "running"] {
        store.update_job_status(jid, status).await.unwrap();
        let job = store.get_job(jid).await.unwrap().unwrap();
        assert_eq!(job.status, status);
    }

    assert!(store.update_job_status(jid, "bogus").await.is_err());
}

#[tokio::test]
async fn test_close_out_records_outcome_per_exit_code() {
    let (_dir, store) = sqlite_store().await;
    let started = datetime!(2028-09-08 01:00:00 UTC);
    let ended = datetime!(2028-09-08 01:30:00 UTC);

    for (exit_code, expected, status) in [
        (0, JobOutcome::Succeeded, "succeeded"),
        (33, JobOutcome::NotEnoughInput, "not_enough_input"),
        (64, JobOutcome::Failed, "failed"),
        (70, JobOutcome::Failed, "failed"),
    ] {
        let jid = store.create_job(&sample_job(PPID, "20280908")).await.unwrap();
        store.attach_external_id(jid, &format!("batch-{jid}")).await.unwrap();

        let outcome = store
            .close_out_job(jid, exit_code, None, Some(started), Some(ended))
            .await
            .unwrap();
        assert_eq!(outcome, expected);

        let job = store.get_job(jid).await.unwrap().unwrap();
        assert_eq!(job.status, "closed_out");
        assert_eq!(job.outcome.as_deref(), Some(status));
        assert_eq!(job.exit_code, Some(exit_code));
        assert_eq!(job.started_at, Some(started));
        assert_eq!(job.ended_at, Some(ended));
    }
}

#[tokio::test]
async fn test_close_out_is_idempotent() {
    let (_dir, store) = sqlite_store().await;
    let ended = datetime!(2028-09-08 02:00:00 UTC);

    let jid = store.create_job(&sample_job(PPID, "20280908")).await.unwrap();
    store.attach_external_id(jid, "batch-dddd").await.unwrap();

    let first = store
        .close_out_job(jid, 0, Some("batch-dddd"), None, Some(ended))
        .await
        .unwrap();
    let second = store
        .close_out_job(jid, 0, Some("batch-dddd"), None, Some(ended))
        .await
        .unwrap();
    assert_eq!(first, JobOutcome::Succeeded);
    assert_eq!(second, JobOutcome::Succeeded);

    // The record is immutable after the first closeout.
    let job = store.get_job(jid).await.unwrap().unwrap();
    assert_eq!(job.exit_code, Some(0));
    assert_eq!(job.ended_at, Some(ended));

    // A closed-out job cannot regress to a polling state.
    let err = store.update_job_status(jid, "running").await.unwrap_err();
    assert!(matches!(err, RegistryError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn test_close_out_before_create_is_rejected() {
    let (_dir, store) = sqlite_store().await;
    let err = store
        .close_out_job(987654, 0, None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));
}

#[tokio::test]
async fn test_close_out_records_recovered_external_id() {
    let (_dir, store) = sqlite_store().await;

    // The job never got its external id attached (e.g. the submitter died
    // between submit and attach); closeout recovers it from the log
    // artifact so no closed job lacks one.
    let jid = store.create_job(&sample_job(PPID, "20280908")).await.unwrap();
    store
        .close_out_job(jid, 0, Some("batch-recovered"), None, None)
        .await
        .unwrap();

    let job = store.get_job(jid).await.unwrap().unwrap();
    assert_eq!(job.external_id.as_deref(), Some("batch-recovered"));

    // But a conflicting id is rejected when one is already attached.
    let jid2 = store.create_job(&sample_job(PPID, "20280908")).await.unwrap();
    store.attach_external_id(jid2, "batch-real").await.unwrap();
    let err = store
        .close_out_job(jid2, 0, Some("batch-other"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::ExternalIdConflict { .. }));
}

#[tokio::test]
async fn test_unclosed_jobs_sweep_scope() {
    let (_dir, store) = sqlite_store().await;

    let jid1 = store.create_job(&sample_job(PPID, "20280908")).await.unwrap();
    let jid2 = store.create_job(&sample_job(PPID, "20280908")).await.unwrap();
    let _other_date = store.create_job(&sample_job(PPID, "20280909")).await.unwrap();
    let _other_ppid = store.create_job(&sample_job(17, "20280908")).await.unwrap();

    store.close_out_job(jid1, 0, Some("batch-1"), None, None).await.unwrap();

    let unclosed = store
        .unclosed_jobs_for_proc_date(PPID, "20280908")
        .await
        .unwrap();
    assert_eq!(unclosed.len(), 1);
    assert_eq!(unclosed[0].jid, jid2);

    let all = store.jobs_for_proc_date(PPID, "20280908").await.unwrap();
    assert_eq!(all.len(), 2);
}
