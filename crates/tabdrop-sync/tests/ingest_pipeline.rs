use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tabdrop_core::{TypedRow, ValidationError};
use tabdrop_storage::MemoryBackend;
use tabdrop_sync::{IngestConfig, Ingestor, Outcome, Pipeline, Stage};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/drop")
        .join(name)
}

fn drop_dir_with(files: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for name in files {
        std::fs::copy(fixture(name), dir.path().join(name)).unwrap();
    }
    dir
}

fn pipeline(dir: &Path, backend: &MemoryBackend, concurrency: usize) -> Pipeline {
    let config = IngestConfig {
        directory: dir.to_path_buf(),
        connection_target: "memory://".into(),
        concurrency,
        settle_delay_ms: 50,
    };
    Pipeline::new(config, Arc::new(backend.clone()))
}

fn row(index: i32, country: &str, company: &str) -> TypedRow {
    TypedRow {
        index: Some(index),
        country: Some(country.into()),
        company: Some(company.into()),
    }
}

#[tokio::test]
async fn reconcile_loads_existing_file_into_new_table() {
    let dir = drop_dir_with(&["acme.csv"]);
    let backend = MemoryBackend::new();

    let summary = pipeline(dir.path(), &backend, 1).reconcile().await.unwrap();

    assert_eq!(summary.files(), 1);
    assert_eq!(summary.tally.synced, 1);
    assert_eq!(backend.table_names(), vec!["acme".to_string()]);
    assert_eq!(backend.tables_created(), 1);
    assert_eq!(
        backend.table("acme").unwrap(),
        vec![
            row(1, "New Zealand", "Kiwi Freight"),
            row(2, "Australia", "Outback Supply"),
        ]
    );
    let report = &summary.reports[0];
    assert_eq!(report.destination.as_deref(), Some("acme"));
    assert!(report.content_sha256.is_some());
    assert!(matches!(
        report.outcome,
        Outcome::Synced {
            rows_written: 2,
            created: true
        }
    ));
}

#[tokio::test]
async fn file_missing_a_column_is_rejected_without_touching_the_backend() {
    let dir = drop_dir_with(&["bad.csv"]);
    let backend = MemoryBackend::new();

    let summary = pipeline(dir.path(), &backend, 1).reconcile().await.unwrap();

    assert_eq!(summary.tally.rejected, 1);
    match &summary.reports[0].outcome {
        Outcome::Rejected {
            reason: ValidationError::MissingColumns(missing),
        } => assert_eq!(missing.missing, vec!["Company".to_string()]),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(backend.table_names().is_empty());
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test]
async fn reconciling_twice_appends_duplicate_rows() {
    let dir = drop_dir_with(&["acme.csv"]);
    let backend = MemoryBackend::new();
    let pipeline = pipeline(dir.path(), &backend, 1);

    pipeline.reconcile().await.unwrap();
    let second = pipeline.reconcile().await.unwrap();

    assert!(matches!(
        second.reports[0].outcome,
        Outcome::Synced { created: false, .. }
    ));
    assert_eq!(backend.table("acme").unwrap().len(), 4);
    assert_eq!(backend.tables_created(), 1);
}

#[tokio::test]
async fn unreachable_backend_fails_each_file_and_keeps_going() {
    let dir = drop_dir_with(&["acme.csv"]);
    std::fs::copy(fixture("acme.csv"), dir.path().join("beta.csv")).unwrap();
    let backend = MemoryBackend::new();
    backend.refuse_connections("database is down");

    let summary = pipeline(dir.path(), &backend, 1).reconcile().await.unwrap();

    assert_eq!(summary.files(), 2);
    assert_eq!(summary.tally.failed, 2);
    for report in &summary.reports {
        assert_eq!(report.stage(), Stage::Failed);
        assert!(matches!(
            report.outcome,
            Outcome::Failed {
                stage: Stage::Syncing,
                ..
            }
        ));
    }
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test]
async fn unparseable_file_fails_while_loading() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("ragged.csv"),
        "Index,Country,Company\n1,NZ,Kiwi,surplus\n",
    )
    .unwrap();
    let backend = MemoryBackend::new();

    let summary = pipeline(dir.path(), &backend, 1).reconcile().await.unwrap();

    assert!(matches!(
        summary.reports[0].outcome,
        Outcome::Failed {
            stage: Stage::Loading,
            ..
        }
    ));
    assert!(summary.reports[0].content_sha256.is_none());
    assert!(backend.table_names().is_empty());
}

#[tokio::test]
async fn file_name_that_cannot_become_a_table_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::copy(fixture("acme.csv"), dir.path().join("report.v2.csv")).unwrap();
    let backend = MemoryBackend::new();

    let summary = pipeline(dir.path(), &backend, 1).reconcile().await.unwrap();

    assert!(matches!(
        summary.reports[0].outcome,
        Outcome::Rejected {
            reason: ValidationError::InvalidTableName(_)
        }
    ));
    assert!(backend.table_names().is_empty());
}

#[tokio::test]
async fn reconcile_skips_subdirectories_and_other_extensions() {
    let dir = drop_dir_with(&["acme.csv"]);
    std::fs::create_dir(dir.path().join("archive.csv")).unwrap();
    std::fs::create_dir(dir.path().join("nested")).unwrap();
    std::fs::copy(fixture("acme.csv"), dir.path().join("nested/inner.csv")).unwrap();
    std::fs::write(dir.path().join("notes.txt"), "Index,Country,Company\n").unwrap();
    std::fs::copy(fixture("acme.csv"), dir.path().join("LOUD.CSV")).unwrap();
    let backend = MemoryBackend::new();

    let summary = pipeline(dir.path(), &backend, 1).reconcile().await.unwrap();

    assert_eq!(summary.files(), 2);
    assert_eq!(
        backend.table_names(),
        vec!["LOUD".to_string(), "acme".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn files_sharing_a_destination_create_the_table_once() {
    let dir = tempfile::tempdir().unwrap();
    let lower = dir.path().join("shared.csv");
    let upper = dir.path().join("shared.CSV");
    std::fs::copy(fixture("acme.csv"), &lower).unwrap();
    std::fs::copy(fixture("acme.csv"), &upper).unwrap();
    let backend = MemoryBackend::new();
    let ingestor = Ingestor::with_backend(Arc::new(backend.clone()));

    let (first, second) = tokio::join!(ingestor.ingest(&lower), ingestor.ingest(&upper));

    let created = [&first, &second]
        .iter()
        .filter(|report| matches!(report.outcome, Outcome::Synced { created: true, .. }))
        .count();
    assert_eq!(created, 1);
    assert_eq!(backend.tables_created(), 1);
    assert_eq!(backend.table("shared").unwrap().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_picks_up_files_created_after_startup() {
    let dir = drop_dir_with(&["acme.csv"]);
    let backend = MemoryBackend::new();
    let pipeline = pipeline(dir.path(), &backend, 2);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let running = tokio::spawn(async move {
        pipeline
            .run_until(async {
                let _ = stop_rx.await;
            })
            .await
    });

    // Give the watcher time to subscribe after reconciliation.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while backend.table("acme").is_none() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    std::fs::copy(fixture("acme.csv"), dir.path().join("late.csv")).unwrap();
    std::fs::write(dir.path().join("ignored.txt"), "not a table").unwrap();

    while backend.table("late").is_none() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    stop_tx.send(()).unwrap();
    let summary = running.await.unwrap().unwrap();

    assert_eq!(summary.reconciled.tally.synced, 1);
    assert_eq!(summary.live.synced, 1);
    assert_eq!(backend.table("late").unwrap().len(), 2);
    assert_eq!(backend.table_names(), vec!["acme".to_string(), "late".to_string()]);
}
