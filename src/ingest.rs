//! Report ingestion with content deduplication and versioning.
//!
//! [`IngestEngine::ingest`] is the single write path for reports. Each
//! attempt runs in one transaction:
//!
//! 1. lock the report row (see [`crate::reports`])
//! 2. read the current state
//! 3. let [`imaging_records_core::versioning::decide`] pick the outcome
//! 4. write the report row and, for create and update, one ledger row
//! 5. commit
//!
//! Writes are additionally guarded on the version number that was read. A
//! guard miss or an insert race surfaces as [`Error::Contention`], and the
//! whole attempt is retried from step 1 under the configured
//! [`BackoffPolicy`]. Dropping the transaction on any error rolls it back,
//! so a failed or cancelled attempt leaves no partial state.
//!
//! For a fixed `uid`, committed states therefore form a single chain:
//! versions are contiguous from 1 and no two commits build on the same
//! predecessor.

use std::io::BufRead;
use std::path::Path;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use imaging_records_core::hash::{content_hash, short_hash};
use imaging_records_core::models::{IngestAction, IngestOutcome, IngestRequest, ReportVersion};
use imaging_records_core::versioning::{self, Decision};

use crate::config::Config;
use crate::db;
use crate::error::{Error, Result};
use crate::reports::{self, ReportStore};
use crate::retry::{retry_transient, BackoffPolicy};
use crate::service::Records;

#[derive(Clone)]
pub struct IngestEngine {
    pool: SqlitePool,
    backoff: BackoffPolicy,
}

/// Tally of a batch import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub kept: usize,
    pub refreshed: usize,
    pub failures: Vec<ImportFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportFailure {
    /// 1-based line number in the input.
    pub line: usize,
    pub uid: Option<String>,
    pub error: String,
}

impl ImportSummary {
    fn record(&mut self, action: IngestAction) {
        match action {
            IngestAction::Create => self.created += 1,
            IngestAction::Update => self.updated += 1,
            IngestAction::DeduplicateKeptExisting => self.kept += 1,
            IngestAction::DeduplicateUpdatedTimestamp => self.refreshed += 1,
        }
    }
}

impl IngestEngine {
    pub fn new(pool: SqlitePool, backoff: BackoffPolicy) -> Self {
        Self { pool, backoff }
    }

    /// Ingest one report.
    ///
    /// Returns the resulting report state, whether this call created it,
    /// and which of the four outcomes applied.
    pub async fn ingest(&self, req: &IngestRequest) -> Result<IngestOutcome> {
        req.validate()?;
        if let Some(ref metadata) = req.metadata {
            serde_json::to_string(metadata).map_err(|e| Error::encode("metadata", e))?;
        }

        // Decide and answer at stored precision.
        let mut req = req.clone();
        req.verified_at = req.verified_at.map(|at| db::from_millis(db::millis(at)));

        let incoming_hash = content_hash(req.content.as_bytes());
        retry_transient(&self.backoff, "ingest", || {
            self.ingest_once(&req, &incoming_hash)
        })
        .await
    }

    async fn ingest_once(&self, req: &IngestRequest, incoming_hash: &str) -> Result<IngestOutcome> {
        let mut tx = self.pool.begin().await?;

        reports::lock_report(&mut tx, &req.uid).await?;
        let existing = reports::fetch_report(&mut tx, &req.uid).await?;

        let now = db::now();
        let decision = versioning::decide(existing.as_ref(), incoming_hash, req.verified_at, now);

        let outcome = match (decision, existing) {
            (Decision::Create, _) | (_, None) => {
                let report = versioning::new_report(req, now);
                reports::insert_report(&mut tx, &report).await?;
                reports::append_version(&mut tx, &versioning::ledger_entry(&report, None)).await?;
                IngestOutcome {
                    report,
                    is_new: true,
                    action: IngestAction::Create,
                }
            }
            (Decision::KeepExisting, Some(report)) => IngestOutcome {
                report,
                is_new: false,
                action: IngestAction::DeduplicateKeptExisting,
            },
            (Decision::RefreshVerifiedAt(verified_at), Some(mut report)) => {
                let applied = reports::update_verified_at(
                    &mut tx,
                    &report.uid,
                    verified_at,
                    now,
                    report.version_number,
                )
                .await?;
                if !applied {
                    return Err(Error::Contention(format!("report {}", report.uid)));
                }
                report.verified_at = Some(verified_at);
                report.updated_at = now;
                IngestOutcome {
                    report,
                    is_new: false,
                    action: IngestAction::DeduplicateUpdatedTimestamp,
                }
            }
            (Decision::NewVersion { version_number }, Some(previous)) => {
                let report = versioning::next_report(&previous, req, version_number, now);
                let applied =
                    reports::update_report_content(&mut tx, &report, previous.version_number)
                        .await?;
                if !applied {
                    return Err(Error::Contention(format!("report {}", report.uid)));
                }
                let entry = versioning::ledger_entry(&report, Some(&previous.content_hash));
                reports::append_version(&mut tx, &entry).await?;
                IngestOutcome {
                    report,
                    is_new: false,
                    action: IngestAction::Update,
                }
            }
        };

        tx.commit().await?;

        match outcome.action {
            IngestAction::Create | IngestAction::Update => info!(
                uid = %outcome.report.uid,
                action = %outcome.action,
                version = outcome.report.version_number,
                hash = short_hash(&outcome.report.content_hash, 12),
                "report ingested"
            ),
            _ => debug!(
                uid = %outcome.report.uid,
                action = %outcome.action,
                version = outcome.report.version_number,
                "duplicate content"
            ),
        }

        Ok(outcome)
    }

    /// Ledger for a report identified by `uid` or `report_id`, newest
    /// first; empty when the report does not exist.
    pub async fn get_report_history(&self, identifier: &str) -> Result<Vec<ReportVersion>> {
        ReportStore::new(self.pool.clone())
            .report_history(identifier)
            .await
    }

    /// Ingest every request in order. Individual failures are collected,
    /// not propagated; storage failures that exhaust retries are reported
    /// per item as well.
    pub async fn import_reports(&self, requests: &[IngestRequest]) -> ImportSummary {
        let mut summary = ImportSummary::default();
        for (idx, req) in requests.iter().enumerate() {
            summary.total += 1;
            match self.ingest(req).await {
                Ok(outcome) => summary.record(outcome.action),
                Err(e) => {
                    warn!(uid = %req.uid, error = %e, "import item failed");
                    summary.failures.push(ImportFailure {
                        line: idx + 1,
                        uid: Some(req.uid.clone()),
                        error: e.to_string(),
                    });
                }
            }
        }
        summary
    }

    /// Import newline-delimited JSON requests. Blank lines are skipped;
    /// lines that do not parse are recorded as failures with their line
    /// number.
    pub async fn import_jsonl<R: BufRead>(&self, reader: R) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            summary.total += 1;
            let req: IngestRequest = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    summary.failures.push(ImportFailure {
                        line: idx + 1,
                        uid: None,
                        error: format!("invalid JSON: {}", e),
                    });
                    continue;
                }
            };
            match self.ingest(&req).await {
                Ok(outcome) => summary.record(outcome.action),
                Err(e) => {
                    warn!(line = idx + 1, uid = %req.uid, error = %e, "import line failed");
                    summary.failures.push(ImportFailure {
                        line: idx + 1,
                        uid: Some(req.uid),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(summary)
    }
}

// ─── CLI runners ────────────────────────────────────────────────────

/// `irec ingest`: read one JSON request from a file or stdin.
pub async fn run_ingest(config: &Config, file: Option<&Path>) -> anyhow::Result<()> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?,
        None => std::io::read_to_string(std::io::stdin())?,
    };
    let req: IngestRequest = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("Invalid ingest request: {}", e))?;

    let records = Records::connect(config).await?;
    let outcome = records.ingest.ingest(&req).await;
    records.close().await;

    println!("{}", serde_json::to_string_pretty(&outcome?.receipt())?);
    Ok(())
}

/// `irec import`: ingest a JSONL file and print a summary.
pub async fn run_import(config: &Config, path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", path.display(), e))?;

    let records = Records::connect(config).await?;
    let summary = records
        .ingest
        .import_jsonl(std::io::BufReader::new(file))
        .await;
    records.close().await;
    let summary = summary?;

    println!("import {}", path.display());
    println!("  total:     {}", summary.total);
    println!("  created:   {}", summary.created);
    println!("  updated:   {}", summary.updated);
    println!("  kept:      {}", summary.kept);
    println!("  refreshed: {}", summary.refreshed);
    println!("  failed:    {}", summary.failures.len());
    for f in &summary.failures {
        println!(
            "    line {}: {} ({})",
            f.line,
            f.error,
            f.uid.as_deref().unwrap_or("-")
        );
    }
    if summary.failures.is_empty() {
        println!("ok");
    }
    Ok(())
}
