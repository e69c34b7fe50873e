// End-to-end control-loop cycles over in-process fakes.

mod common;

use bytes::Bytes;
use common::*;
use nocturn_ops::artifacts::{log_key, products_key};
use nocturn_ops::{OpsError, PipelineCycle};

#[tokio::test]
async fn test_cycle_runs_science_then_postproc() {
    let (_dir, ctx, _batch) = test_context().await;

    seed_exposure(&ctx, 61000.0).await;
    seed_exposure(&ctx, 61000.1).await;

    let cycle = PipelineCycle::new(ctx.clone());
    let report = cycle.run_for_date(PROC_DATE, window()).await.unwrap();

    assert_eq!(report.science.launched, 2);
    assert_eq!(report.science.succeeded, 2);
    assert_eq!(report.science.failed, 0);

    // One postproc job for the single touched tile, launched only after
    // the science stage was fully terminal.
    assert_eq!(report.postproc.launched, 1);
    assert_eq!(report.postproc.succeeded, 1);

    // Every job of both stages ends closed out.
    for ppid in [
        ctx.config.cycle.science_pipeline_id,
        ctx.config.cycle.postproc_pipeline_id,
    ] {
        let unclosed = ctx
            .registry
            .unclosed_jobs_for_proc_date(ppid, PROC_DATE)
            .await
            .unwrap();
        assert!(unclosed.is_empty());
    }

    // Config artifacts were written for each science job.
    let configs = ctx
        .storage
        .list(&ctx.config.cycle.job_info_bucket, &format!("{PROC_DATE}/"))
        .await
        .unwrap();
    assert_eq!(configs.len(), 2);
}

#[tokio::test]
async fn test_cycle_registers_declared_reference_image() {
    let (_dir, ctx, _batch) = test_context().await;

    seed_exposure(&ctx, 61000.0).await;

    // Fresh store: the first science job gets jid 1 and, with no best
    // reference image yet, registers provisional rfid 1 version 1. The
    // "job" declares the finished coadd through its products manifest.
    let name = format!("science_pipeline_{PROC_DATE}_jid1");
    let manifest = serde_json::json!({
        "ref_image": {
            "rfid": 1,
            "version": 1,
            "filename": "refimage_f3_fid4.fits",
            "checksum": "0123456789abcdef0123456789abcdef",
            "nframes": 9,
            "mjdobsmin": 60990.0,
            "mjdobsmax": 60999.5,
            "cov5percent": 0.91,
            "fwhmmin": 1.7,
            "fwhmmedian": 2.0,
            "fwhmmax": 2.6
        }
    });
    ctx.storage
        .put(
            &ctx.config.cycle.job_logs_bucket,
            &products_key(PROC_DATE, &name),
            Bytes::from(manifest.to_string()),
        )
        .await
        .unwrap();

    let cycle = PipelineCycle::new(ctx.clone());
    let report = cycle.run_for_date(PROC_DATE, window()).await.unwrap();
    assert_eq!(report.science.succeeded, 1);

    // The provisional row was finalized, promoted, and is now the best
    // version with its quality sidecar attached.
    let best = ctx
        .registry
        .get_best_ref_image(ctx.config.cycle.refimage_pipeline_id, TARGET_FIELD, FID)
        .await
        .unwrap()
        .expect("declared reference image should be best");
    assert_eq!(best.rfid, 1);
    assert_eq!(best.version, 1);
    assert_eq!(best.status, 1);
    assert_eq!(best.checksum, "0123456789abcdef0123456789abcdef");

    let meta = ctx
        .registry
        .get_ref_image_meta(1)
        .await
        .unwrap()
        .expect("quality sidecar");
    assert_eq!(meta.nframes, 9);
    assert!((meta.cov5percent - 0.91).abs() < 1e-12);
}

#[tokio::test]
async fn test_soft_failure_is_counted_separately() {
    let (_dir, ctx, _batch) = test_context().await;

    seed_exposure(&ctx, 61000.0).await;

    // The job's log artifact declares the soft exit code: not enough
    // overlap inputs to build a reference image.
    let name = format!("science_pipeline_{PROC_DATE}_jid1");
    ctx.storage
        .put(
            &ctx.config.cycle.job_logs_bucket,
            &log_key(PROC_DATE, &name),
            Bytes::from_static(b"terminating_exitcode = 33\n"),
        )
        .await
        .unwrap();

    let cycle = PipelineCycle::new(ctx.clone());
    let report = cycle.run_for_date(PROC_DATE, window()).await.unwrap();

    assert_eq!(report.science.launched, 1);
    assert_eq!(report.science.not_enough_input, 1);
    assert_eq!(report.science.failed, 0);
    assert_eq!(report.science.succeeded, 0);

    let job = ctx.registry.get_job(1).await.unwrap().unwrap();
    assert_eq!(job.exit_code, Some(33));
    assert_eq!(job.outcome.as_deref(), Some("not_enough_input"));

    // Soft failures launch no post-processing.
    assert_eq!(report.postproc.launched, 0);
}

#[tokio::test]
async fn test_reused_best_reference_skips_provisional_registration() {
    let (_dir, ctx, _batch) = test_context().await;

    // A finalized, promoted reference image already exists for the tile.
    let new_ref = nocturn_registry::repos::NewRefImage {
        ppid: ctx.config.cycle.refimage_pipeline_id,
        field: TARGET_FIELD,
        fid: FID,
        infobits: 0,
        filename: "refimage_f3_fid4.fits".to_string(),
        checksum: "aaaa0000aaaa0000aaaa0000aaaa0000".to_string(),
    };
    let (rfid, version) = ctx.registry.register_ref_image(&new_ref).await.unwrap();
    ctx.registry
        .finalize_ref_image(rfid, version, &new_ref.filename, &new_ref.checksum, 1)
        .await
        .unwrap();
    ctx.registry
        .promote_best_ref_image(new_ref.ppid, TARGET_FIELD, FID, rfid)
        .await
        .unwrap();

    seed_exposure(&ctx, 61000.0).await;

    let cycle = PipelineCycle::new(ctx.clone());
    let report = cycle.run_for_date(PROC_DATE, window()).await.unwrap();
    assert_eq!(report.science.succeeded, 1);

    // No second version chain entry appeared: the existing best was
    // reused, and the job row references it.
    let best = ctx
        .registry
        .get_best_ref_image(new_ref.ppid, TARGET_FIELD, FID)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(best.rfid, rfid);
    assert_eq!(best.version, version);

    let job = ctx.registry.get_job(1).await.unwrap().unwrap();
    assert_eq!(job.rfid, Some(rfid));
}

#[tokio::test]
async fn test_run_loop_stops_between_iterations() {
    let (_dir, ctx, _batch) = test_context().await;

    // No eligible exposures: the cycle is empty, and the pre-set stop flag
    // ends the loop after the first full iteration with the documented
    // interrupt outcome.
    ctx.request_stop();
    let cycle = PipelineCycle::new(ctx.clone());
    let err = cycle.run_loop(window()).await.unwrap_err();
    assert!(matches!(err, OpsError::Interrupted));
    assert_eq!(err.exit_code(), 7);
}
