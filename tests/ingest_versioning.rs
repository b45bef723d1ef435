mod common;

use std::collections::BTreeSet;
use std::io::Cursor;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use imaging_records::{db, Error};
use imaging_records_core::models::{ChangeType, IngestAction, IngestRequest, Metadata};
use imaging_records_core::ErrorKind;
use tempfile::TempDir;

fn text(uid: &str, content: &str) -> IngestRequest {
    IngestRequest::new(uid, "Chest X-ray", content, "text")
}

#[tokio::test]
async fn create_dedupe_update_scenario() {
    let (_tmp, records) = common::open().await;

    let first = records.ingest.ingest(&text("r1", "hello")).await.unwrap();
    assert!(first.is_new);
    assert_eq!(first.action, IngestAction::Create);
    assert_eq!(first.report.version_number, 1);

    let earlier = first.report.created_at - Duration::hours(2);
    let second = records
        .ingest
        .ingest(&text("r1", "hello").verified_at(earlier))
        .await
        .unwrap();
    assert!(!second.is_new);
    assert_eq!(second.action, IngestAction::DeduplicateKeptExisting);
    assert_eq!(second.report.version_number, 1);

    let third = records
        .ingest
        .ingest(&text("r1", "hello world"))
        .await
        .unwrap();
    assert_eq!(third.action, IngestAction::Update);
    assert_eq!(third.report.version_number, 2);

    let history = records.ingest.get_report_history("r1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].version_number, 2);
    assert_eq!(history[0].change_type, ChangeType::Update);
    assert_eq!(history[0].content_raw, "hello world");
    assert_eq!(history[1].version_number, 1);
    assert_eq!(history[1].change_type, ChangeType::Create);
}

#[tokio::test]
async fn duplicate_with_older_or_equal_timestamp_changes_nothing() {
    let (_tmp, records) = common::open().await;
    let asserted = db::now() - Duration::days(1);

    let first = records
        .ingest
        .ingest(&text("r2", "IMPRESSION: normal").verified_at(asserted))
        .await
        .unwrap();

    for at in [asserted, asserted - Duration::minutes(5)] {
        let again = records
            .ingest
            .ingest(&text("r2", "IMPRESSION: normal").verified_at(at))
            .await
            .unwrap();
        assert_eq!(again.action, IngestAction::DeduplicateKeptExisting);
        assert_eq!(again.report, first.report);
    }

    let stored = records.reports.get_report("r2").await.unwrap();
    assert_eq!(stored.version_number, 1);
    assert_eq!(stored.content_raw, "IMPRESSION: normal");
    assert_eq!(stored.verified_at, Some(asserted));
    assert_eq!(stored.updated_at, first.report.updated_at);
}

#[tokio::test]
async fn duplicate_with_newer_timestamp_moves_only_timestamps() {
    let (_tmp, records) = common::open().await;
    let asserted = db::now() - Duration::hours(1);

    let first = records
        .ingest
        .ingest(&text("r3", "stable").verified_at(asserted))
        .await
        .unwrap();

    let refreshed = records.ingest.ingest(&text("r3", "stable")).await.unwrap();
    assert_eq!(refreshed.action, IngestAction::DeduplicateUpdatedTimestamp);
    assert!(!refreshed.is_new);
    assert_eq!(refreshed.report.version_number, 1);
    assert!(refreshed.report.verified_at.unwrap() > asserted);

    let stored = records.reports.get_report("r3").await.unwrap();
    assert_eq!(stored.verified_at, refreshed.report.verified_at);
    assert_eq!(stored.content_hash, first.report.content_hash);
    assert_eq!(stored.created_at, first.report.created_at);

    // No ledger row for a timestamp-only change.
    let history = records.ingest.get_report_history("r3").await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn distinct_contents_yield_contiguous_versions() {
    let (_tmp, records) = common::open().await;

    for n in 1..=6 {
        let outcome = records
            .ingest
            .ingest(&text("r4", &format!("revision {n}")))
            .await
            .unwrap();
        assert_eq!(outcome.report.version_number, n);
    }

    let history = records.ingest.get_report_history("r4").await.unwrap();
    let versions: Vec<i64> = history.iter().map(|v| v.version_number).collect();
    assert_eq!(versions, vec![6, 5, 4, 3, 2, 1]);
}

#[tokio::test]
async fn whitespace_only_change_is_a_new_version() {
    let (_tmp, records) = common::open().await;

    records.ingest.ingest(&text("r5", "no acute findings")).await.unwrap();
    let outcome = records
        .ingest
        .ingest(&text("r5", "no acute findings "))
        .await
        .unwrap();
    assert_eq!(outcome.action, IngestAction::Update);
    assert_eq!(outcome.report.version_number, 2);
}

#[tokio::test]
async fn update_keeps_unspecified_optional_fields() {
    let (_tmp, records) = common::open().await;

    let mut meta = Metadata::new();
    meta.insert("site".into(), serde_json::json!("north"));
    records
        .ingest
        .ingest(
            &text("r6", "v1")
                .report_id("RPT-6")
                .chr_no("C-100")
                .modality("CT")
                .report_date("2026-05-01")
                .metadata(meta.clone()),
        )
        .await
        .unwrap();

    let outcome = records.ingest.ingest(&text("r6", "v2")).await.unwrap();
    let report = outcome.report;
    assert_eq!(report.chr_no.as_deref(), Some("C-100"));
    assert_eq!(report.modality.as_deref(), Some("CT"));
    assert_eq!(report.report_date.as_deref(), Some("2026-05-01"));
    assert_eq!(report.metadata, meta);

    let found = records.reports.find_report("RPT-6").await.unwrap().unwrap();
    assert_eq!(found.uid, "r6");
    assert_eq!(found.version_number, 2);

    // History resolves through report_id as well.
    assert_eq!(records.ingest.get_report_history("RPT-6").await.unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_report_has_empty_history() {
    let (_tmp, records) = common::open().await;
    let history = records.ingest.get_report_history("missing").await.unwrap();
    assert!(history.is_empty());

    let err = records.reports.get_report("missing").await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotFound));
}

#[tokio::test]
async fn blank_uid_is_a_validation_error() {
    let (_tmp, records) = common::open().await;
    let err = records.ingest.ingest(&text("  ", "x")).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Validation));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn concurrent_distinct_contents_serialize_into_one_chain() {
    let (_tmp, records) = common::open().await;
    let writers = 8;

    let mut handles = Vec::new();
    for n in 0..writers {
        let engine = records.ingest.clone();
        handles.push(tokio::spawn(async move {
            engine.ingest(&text("hot", &format!("content {n}"))).await
        }));
    }

    let mut created = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.is_new {
            created += 1;
        }
    }
    assert_eq!(created, 1);

    let report = records.reports.get_report("hot").await.unwrap();
    assert_eq!(report.version_number, writers);

    let history = records.ingest.get_report_history("hot").await.unwrap();
    let versions: BTreeSet<i64> = history.iter().map(|v| v.version_number).collect();
    assert_eq!(versions, (1..=writers).collect::<BTreeSet<_>>());
    assert_eq!(history[0].content_hash, report.content_hash);
}

#[tokio::test]
async fn concurrent_identical_contents_create_once() {
    let (_tmp, records) = common::open().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = records.ingest.clone();
        handles.push(tokio::spawn(async move {
            engine.ingest(&text("same", "identical body")).await
        }));
    }

    let mut creates = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.report.version_number, 1);
        if outcome.action == IngestAction::Create {
            creates += 1;
        }
    }
    assert_eq!(creates, 1);
    assert_eq!(records.ingest.get_report_history("same").await.unwrap().len(), 1);
}

#[tokio::test]
async fn list_reports_pages_newest_first() {
    let (_tmp, records) = common::open().await;

    for uid in ["a", "b", "c"] {
        records.ingest.ingest(&text(uid, uid)).await.unwrap();
    }
    records
        .ingest
        .ingest(&IngestRequest::new("d", "Scan", "d", "scan"))
        .await
        .unwrap();
    // Touch "a" so it becomes the most recently updated.
    records.ingest.ingest(&text("a", "a2")).await.unwrap();

    let page = records.reports.list_reports(None, 1, 2).await.unwrap();
    assert_eq!(page.total, 4);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].uid, "a");
    assert!(page.has_next());

    let texts = records.reports.list_reports(Some("text"), 1, 10).await.unwrap();
    assert_eq!(texts.total, 3);
    assert!(texts.items.iter().all(|r| r.report_type == "text"));

    let err = records.reports.list_reports(None, 0, 10).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Validation));
}

#[tokio::test]
async fn import_tallies_each_action() {
    let (_tmp, records) = common::open().await;
    let old = db::now() - Duration::days(3);

    let requests = vec![
        text("i1", "one").verified_at(old),
        text("i2", "two"),
        text("i1", "one").verified_at(old),
        text("i1", "one"),
        text("i2", "two v2"),
        text("", "no uid"),
    ];
    let summary = records.ingest.import_reports(&requests).await;

    assert_eq!(summary.total, 6);
    assert_eq!(summary.created, 2);
    assert_eq!(summary.kept, 1);
    assert_eq!(summary.refreshed, 1);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].line, 6);
}

#[tokio::test]
async fn jsonl_import_reports_bad_lines() {
    let (_tmp, records) = common::open().await;
    let input = concat!(
        r#"{"uid":"j1","title":"CT","content":"a","report_type":"text","mod":"CT"}"#,
        "\n",
        "\n",
        "not json\n",
        r#"{"uid":"j1","title":"CT","content":"b","report_type":"text"}"#,
        "\n",
    );

    let summary = records
        .ingest
        .import_jsonl(Cursor::new(input))
        .await
        .unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.created, 1);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].line, 3);
    assert!(summary.failures[0].uid.is_none());

    let report = records.reports.get_report("j1").await.unwrap();
    assert_eq!(report.modality.as_deref(), Some("CT"));
}

#[tokio::test]
async fn sub_millisecond_verified_at_resubmission_is_kept() {
    let (_tmp, records) = common::open().await;
    let asserted: DateTime<Utc> = "2026-05-04T10:00:00.123456Z".parse().unwrap();

    let first = records
        .ingest
        .ingest(&text("r9", "stable").verified_at(asserted))
        .await
        .unwrap();
    let stored = records.reports.get_report("r9").await.unwrap();
    assert_eq!(first.report, stored);
    assert_eq!(
        stored.verified_at,
        Some("2026-05-04T10:00:00.123Z".parse().unwrap())
    );

    let again = records
        .ingest
        .ingest(&text("r9", "stable").verified_at(asserted))
        .await
        .unwrap();
    assert_eq!(again.action, IngestAction::DeduplicateKeptExisting);
    assert_eq!(again.report, stored);
    assert_eq!(
        records.reports.get_report("r9").await.unwrap().updated_at,
        stored.updated_at
    );
}

#[tokio::test]
async fn corrupt_stored_metadata_is_an_error_not_a_default() {
    let (_tmp, records) = common::open().await;
    let mut meta = Metadata::new();
    meta.insert("site".into(), serde_json::json!("north"));
    records
        .ingest
        .ingest(&text("r10", "v1").metadata(meta))
        .await
        .unwrap();

    sqlx::query("UPDATE reports SET metadata_json = '{broken' WHERE uid = ?")
        .bind("r10")
        .execute(&records.pool)
        .await
        .unwrap();

    let err = records.reports.get_report("r10").await.unwrap_err();
    assert!(matches!(err, Error::Decode { column: "metadata_json", .. }));

    let err = records.ingest.ingest(&text("r10", "v2")).await.unwrap_err();
    assert!(!err.is_transient());

    // The broken value is left for an operator, not overwritten with `{}`.
    let (version, metadata_json): (i64, String) =
        sqlx::query_as("SELECT version_number, metadata_json FROM reports WHERE uid = ?")
            .bind("r10")
            .fetch_one(&records.pool)
            .await
            .unwrap();
    assert_eq!(version, 1);
    assert_eq!(metadata_json, "{broken");
}

#[tokio::test]
async fn cancelled_ingest_leaves_no_partial_state() {
    let (_tmp, records) = common::open().await;
    records.ingest.ingest(&text("r11", "v1")).await.unwrap();

    // Hold the write lock so the next ingest blocks inside its transaction.
    let mut holder = records.pool.begin().await.unwrap();
    sqlx::query("UPDATE reports SET uid = uid WHERE uid = ?")
        .bind("r11")
        .execute(&mut *holder)
        .await
        .unwrap();

    let engine = records.ingest.clone();
    let handle = tokio::spawn(async move { engine.ingest(&text("r11", "v2")).await });
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());
    holder.rollback().await.unwrap();

    let report = records.reports.get_report("r11").await.unwrap();
    assert_eq!(report.version_number, 1);
    assert_eq!(report.content_raw, "v1");
    assert_eq!(records.ingest.get_report_history("r11").await.unwrap().len(), 1);

    // The abandoned attempt released its lock.
    let next = records.ingest.ingest(&text("r11", "v2")).await.unwrap();
    assert_eq!(next.report.version_number, 2);
}

#[tokio::test]
async fn failed_ledger_write_rolls_back_the_report_row() {
    let tmp = TempDir::new().unwrap();
    let mut config = common::test_config(&tmp);
    config.ingest.max_retries = 1;
    let (_tmp, records) = common::open_with(tmp, config).await;

    records.ingest.ingest(&text("r12", "v1")).await.unwrap();

    // Occupy the ledger slot the next version would take.
    sqlx::query(
        "INSERT INTO report_versions (report_uid, version_number, content_hash, content_raw, \
         changed_at, change_type) VALUES (?, 2, 'x', 'stray', 0, 'update')",
    )
    .bind("r12")
    .execute(&records.pool)
    .await
    .unwrap();

    let err = records.ingest.ingest(&text("r12", "v2")).await.unwrap_err();
    assert!(err.is_transient());

    let report = records.reports.get_report("r12").await.unwrap();
    assert_eq!(report.version_number, 1);
    assert_eq!(report.content_raw, "v1");
}

#[tokio::test]
async fn unreadable_jsonl_input_is_an_io_error() {
    let (_tmp, records) = common::open().await;
    let err = records
        .ingest
        .import_jsonl(Cursor::new(vec![0xff, 0xfe, b'\n']))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}
