mod support;

use support::{Harness, drain, fast_config, run_id};
use useq_core::{
    PipelineError,
    pipeline::{
        ConversionFlags, PipelineEventPayload, RunRecord, RunStateStore,
        RunStatus, Stage,
    },
};

async fn cycle(runtime: &support::TestRuntime) -> useq_core::pipeline::CycleReport {
    let report = runtime.run_cycle().await.expect("cycle runs");
    runtime.settle().await;
    report
}

async fn status_of(h: &Harness, name: &str) -> RunRecord {
    h.store
        .get(&run_id(name))
        .await
        .expect("store readable")
        .expect("run tracked")
}

#[tokio::test]
async fn run_moves_through_every_stage_with_one_deferral() {
    let h = Harness::new().await;
    let mut rx = h.subscribe();
    let raw = h.make_run("R1", true);
    let runtime = h.runtime(fast_config());

    // T0: discovered and converted
    let report = cycle(&runtime).await;
    assert_eq!(report.registered, 1);
    assert_eq!(status_of(&h, "R1").await.status, RunStatus::Converted);

    // T0+15m: remote storage breached, transfer deferred across cycles
    h.breach_storage().await;
    for _ in 0..3 {
        let report = cycle(&runtime).await;
        assert_eq!(report.deferred, 1);
        assert_eq!(report.dispatched, 0);
    }
    let record = status_of(&h, "R1").await;
    assert_eq!(record.status, RunStatus::Converted);
    assert_eq!(record.retry_count, 0);

    // T0+20m: breach clears, remaining stages run one per cycle
    h.clear_storage().await;
    cycle(&runtime).await;
    assert_eq!(status_of(&h, "R1").await.status, RunStatus::Transferred);
    cycle(&runtime).await;
    assert_eq!(status_of(&h, "R1").await.status, RunStatus::Archiving);
    cycle(&runtime).await;

    let record = status_of(&h, "R1").await;
    assert_eq!(record.status, RunStatus::Archived);
    assert_eq!(record.path, h.layout.archive_for("R1"));
    assert!(!raw.exists());
    assert!(h.layout.archive_for("R1").join("RunInfo.xml").exists());
    assert!(
        h.layout
            .destination_for("R1")
            .join("Project_A/S1_L001_R1_001.fastq.gz")
            .exists()
    );
    assert!(h.layout.destination_dir.join("R1.sha256").exists());
    assert!(!h.layout.staging_for("R1").exists());

    let events = drain(&mut rx);
    assert_eq!(deferrals(&events), 1);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e.payload, PipelineEventPayload::Failed { .. }))
    );

    let transitions: Vec<(RunStatus, RunStatus)> = events
        .iter()
        .filter_map(|e| match e.payload {
            PipelineEventPayload::StageCompleted { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (RunStatus::Converting, RunStatus::Converted),
            (RunStatus::Transferring, RunStatus::Transferred),
            (RunStatus::CleaningUp, RunStatus::Archiving),
            (RunStatus::Archiving, RunStatus::Archived),
        ]
    );
    for (from, to) in transitions {
        assert_eq!(from.next(), Some(to));
    }

    // Archived runs are no longer active and nothing is re-registered.
    let report = cycle(&runtime).await;
    assert_eq!(report.registered, 0);
    assert_eq!(report.dispatched, 0);
}

fn deferrals(events: &[useq_core::pipeline::PipelineEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e.payload, PipelineEventPayload::TransferDeferred { .. }))
        .count()
}

#[tokio::test]
async fn breach_after_lease_keeps_run_converted_and_reports_once() {
    let h = Harness::new().await;
    let mut rx = h.subscribe();
    h.make_run("R1", true);
    let runtime = h.runtime(fast_config());
    cycle(&runtime).await;
    assert_eq!(status_of(&h, "R1").await.status, RunStatus::Converted);

    // The cycle hands the transfer to a worker; storage breaches before the
    // worker gets to run it.
    let report = runtime.run_cycle().await.expect("cycle runs");
    assert_eq!(report.dispatched, 1);
    h.breach_storage().await;
    runtime.settle().await;

    let record = status_of(&h, "R1").await;
    assert_eq!(record.status, RunStatus::Converted);
    assert_eq!(record.retry_count, 0);

    for _ in 0..3 {
        let report = cycle(&runtime).await;
        assert_eq!(report.deferred, 1);
        assert_eq!(report.dispatched, 0);
    }
    assert_eq!(status_of(&h, "R1").await.status, RunStatus::Converted);
    assert_eq!(deferrals(&drain(&mut rx)), 1);

    h.clear_storage().await;
    cycle(&runtime).await;
    assert_eq!(status_of(&h, "R1").await.status, RunStatus::Transferred);
}

#[tokio::test]
async fn resumed_transfer_is_held_while_storage_is_breached() {
    let mut h = Harness::new().await;
    let raw = h.make_run("R1", true);

    // Crash mid-transfer: Transferring persisted, converted output staged.
    let mut record =
        RunRecord::discovered(run_id("R1"), raw, ConversionFlags::default());
    assert!(record.begin_stage(Stage::Conversion).expect("eligible"));
    record.advance_to(RunStatus::Converted).expect("converted");
    assert!(record.begin_stage(Stage::Transfer).expect("eligible"));
    h.store.upsert(&record).await.expect("persist");
    let staged = h.layout.staging_for("R1").join("Project_A");
    std::fs::create_dir_all(&staged).expect("staging dir");
    std::fs::write(staged.join("S1_L001_R1_001.fastq.gz"), b"@r1\nACGT\n")
        .expect("staged fastq");

    h.reopen_store().await;
    h.breach_storage().await;
    let mut rx = h.subscribe();
    let runtime = h.runtime(fast_config());

    for _ in 0..2 {
        let report = cycle(&runtime).await;
        assert_eq!(report.deferred, 1);
        assert_eq!(report.dispatched, 0);
    }
    let record = status_of(&h, "R1").await;
    assert_eq!(record.status, RunStatus::Transferring);
    assert_eq!(record.retry_count, 0);
    assert!(!h.layout.destination_for("R1").exists());
    assert_eq!(deferrals(&drain(&mut rx)), 1);

    h.clear_storage().await;
    cycle(&runtime).await;
    assert_eq!(status_of(&h, "R1").await.status, RunStatus::Transferred);
    assert!(
        h.layout
            .destination_for("R1")
            .join("Project_A/S1_L001_R1_001.fastq.gz")
            .exists()
    );
}

#[tokio::test]
async fn restart_resumes_conversion_from_persisted_in_progress_status() {
    let mut h = Harness::new().await;
    let raw = h.make_run("R1", true);

    // Crash right after the in-progress status was persisted.
    let mut record =
        RunRecord::discovered(run_id("R1"), raw, ConversionFlags::default());
    assert!(record.begin_stage(Stage::Conversion).expect("eligible"));
    h.store.upsert(&record).await.expect("persist");
    assert!(!h.layout.staging_for("R1").exists());

    h.reopen_store().await;
    assert_eq!(status_of(&h, "R1").await.status, RunStatus::Converting);

    let mut rx = h.subscribe();
    let runtime = h.runtime(fast_config());
    let report = cycle(&runtime).await;
    assert_eq!(report.registered, 0);
    assert_eq!(report.dispatched, 1);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e.payload,
        PipelineEventPayload::StageStarted {
            stage: Stage::Conversion,
            ..
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e.payload,
        PipelineEventPayload::StageCompleted {
            from: RunStatus::Converting,
            to: RunStatus::Converted,
            ..
        }
    )));
    assert_eq!(status_of(&h, "R1").await.status, RunStatus::Converted);
}

#[tokio::test]
async fn missing_bcl_is_tolerated_only_when_flagged() {
    let h = Harness::new().await;
    h.make_run("TOLERANT", false);
    let tolerant = ConversionFlags {
        allow_missing_bcl: true,
        ..ConversionFlags::default()
    };
    h.scanner(tolerant).scan().await.expect("scan");
    h.make_run("STRICT", false);

    let mut config = fast_config();
    config.retry.max_attempts = 1;
    let runtime = h.runtime(config);
    cycle(&runtime).await;

    assert_eq!(status_of(&h, "TOLERANT").await.status, RunStatus::Converted);
    let strict = status_of(&h, "STRICT").await;
    assert_eq!(strict.status, RunStatus::Failed);
    assert!(
        strict
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("missing bcl"))
    );
}

#[tokio::test]
async fn malformed_run_fails_permanently_and_can_be_rearmed() {
    let h = Harness::new().await;
    let raw = h.make_run("R1", true);
    std::fs::remove_file(raw.join("RunInfo.xml")).expect("remove run info");
    let runtime = h.runtime(fast_config());

    cycle(&runtime).await;
    let failed = status_of(&h, "R1").await;
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.failed_from, Some(RunStatus::Converting));
    assert_eq!(failed.retry_count, 0, "permanent errors are not retried");

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].subject.contains("R1"));
    assert!(sent[0].body.contains("useq runs rearm R1"));

    // Failed is absorbing until an operator steps in.
    assert_eq!(cycle(&runtime).await.dispatched, 0);

    std::fs::write(raw.join("RunInfo.xml"), b"<RunInfo/>").expect("restore");
    let rearmed = runtime.rearm(&run_id("R1")).await.expect("rearm");
    assert_eq!(rearmed.status, RunStatus::Converting);
    assert_eq!(rearmed.last_error, None);

    cycle(&runtime).await;
    assert_eq!(status_of(&h, "R1").await.status, RunStatus::Converted);

    let err = runtime.rearm(&run_id("R1")).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn status_queries_read_the_store() {
    let h = Harness::new().await;
    h.make_run("R1", true);
    h.make_run("R2", false);
    let mut config = fast_config();
    config.retry.max_attempts = 1;
    let runtime = h.runtime(config);
    cycle(&runtime).await;

    assert_eq!(runtime.list(None).await.expect("list").len(), 2);
    let failed = runtime
        .list(Some(RunStatus::Failed))
        .await
        .expect("list failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].run_id, run_id("R2"));

    let missing = runtime.status(&run_id("NOPE")).await.unwrap_err();
    assert!(matches!(missing, PipelineError::NotFound(_)));
}
