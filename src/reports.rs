//! Report storage and retrieval.
//!
//! Reads go straight to the pool. The `pub(crate)` helpers that take a
//! `&mut SqliteConnection` are the building blocks the ingestion engine
//! composes inside a single transaction; none of them commit.
//!
//! # Row locking
//!
//! SQLite has no `SELECT ... FOR UPDATE`. [`lock_report`] issues a no-op
//! `UPDATE` on the report row as the first statement of a transaction,
//! which takes the database write lock before anything is read. A second
//! writer on any row waits on `busy_timeout` instead of reading a snapshot
//! that is about to go stale.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use imaging_records_core::models::{ChangeType, Report, ReportSummary, ReportVersion};
use imaging_records_core::page::{window, Page};
use imaging_records_core::RecordsError;

use crate::config::Config;
use crate::db::{decode_json, from_millis, millis, opt_from_millis};
use crate::error::{Error, Result};
use crate::service::Records;

const REPORT_COLUMNS: &str = "uid, report_id, title, report_type, content_raw, content_processed, \
     content_hash, version_number, is_latest, source_url, chr_no, modality, report_date, \
     verified_at, created_at, updated_at, metadata_json";

/// Read access to stored reports and their version ledger.
#[derive(Clone)]
pub struct ReportStore {
    pool: SqlitePool,
}

impl ReportStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Latest state of the report with this `uid`.
    pub async fn get_report(&self, uid: &str) -> Result<Report> {
        let mut conn = self.pool.acquire().await?;
        fetch_report(&mut conn, uid)
            .await?
            .ok_or_else(|| RecordsError::ReportNotFound(uid.to_string()).into())
    }

    /// Resolve an identifier as a `uid` first, then as an external
    /// `report_id`. When several reports share a `report_id`, the most
    /// recently updated one wins.
    pub async fn find_report(&self, identifier: &str) -> Result<Option<Report>> {
        let mut conn = self.pool.acquire().await?;
        if let Some(report) = fetch_report(&mut conn, identifier).await? {
            return Ok(Some(report));
        }

        let row = sqlx::query(&format!(
            "SELECT {REPORT_COLUMNS} FROM reports WHERE report_id = ? \
             ORDER BY updated_at DESC, uid ASC LIMIT 1"
        ))
        .bind(identifier)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(report_from_row).transpose()
    }

    /// Ledger entries for a report, newest first. Unknown identifiers yield
    /// an empty list.
    pub async fn report_history(&self, identifier: &str) -> Result<Vec<ReportVersion>> {
        let Some(report) = self.find_report(identifier).await? else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            "SELECT report_uid, version_number, content_hash, content_raw, changed_at, \
             verified_at, change_type, change_description \
             FROM report_versions WHERE report_uid = ? ORDER BY version_number DESC",
        )
        .bind(&report.uid)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(version_from_row).collect()
    }

    /// Paged summaries ordered by most recent update.
    pub async fn list_reports(
        &self,
        report_type: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<Page<ReportSummary>> {
        let (limit, offset) = window(page, page_size)?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM reports WHERE (?1 IS NULL OR report_type = ?1)",
        )
        .bind(report_type)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            "SELECT uid, report_id, title, report_type, version_number, verified_at, updated_at \
             FROM reports WHERE (?1 IS NULL OR report_type = ?1) \
             ORDER BY updated_at DESC, uid ASC LIMIT ?2 OFFSET ?3",
        )
        .bind(report_type)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .iter()
            .map(|row| ReportSummary {
                uid: row.get("uid"),
                report_id: row.get("report_id"),
                title: row.get("title"),
                report_type: row.get("report_type"),
                version_number: row.get("version_number"),
                verified_at: opt_from_millis(row.get("verified_at")),
                updated_at: from_millis(row.get("updated_at")),
            })
            .collect();

        Ok(Page::new(items, total.max(0) as u64, page, page_size))
    }
}

// ─── Transaction building blocks ────────────────────────────────────

/// Take the write lock through the report row. Returns whether the row
/// exists.
pub(crate) async fn lock_report(conn: &mut SqliteConnection, uid: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE reports SET uid = uid WHERE uid = ?")
        .bind(uid)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn fetch_report(conn: &mut SqliteConnection, uid: &str) -> Result<Option<Report>> {
    let row = sqlx::query(&format!("SELECT {REPORT_COLUMNS} FROM reports WHERE uid = ?"))
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(report_from_row).transpose()
}

/// Insert version 1. A unique violation means a concurrent writer created
/// the same `uid` first.
pub(crate) async fn insert_report(conn: &mut SqliteConnection, report: &Report) -> Result<()> {
    let metadata_json = serde_json::to_string(&report.metadata)
        .map_err(|e| Error::encode("metadata", e))?;

    sqlx::query(&format!(
        "INSERT INTO reports ({REPORT_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&report.uid)
    .bind(&report.report_id)
    .bind(&report.title)
    .bind(&report.report_type)
    .bind(&report.content_raw)
    .bind(&report.content_processed)
    .bind(&report.content_hash)
    .bind(report.version_number)
    .bind(report.is_latest)
    .bind(&report.source_url)
    .bind(&report.chr_no)
    .bind(&report.modality)
    .bind(&report.report_date)
    .bind(report.verified_at.map(millis))
    .bind(millis(report.created_at))
    .bind(millis(report.updated_at))
    .bind(metadata_json)
    .execute(&mut *conn)
    .await
    .map_err(|e| Error::from_insert_race(e, format!("report {}", report.uid)))?;

    Ok(())
}

/// Overwrite the content of a report, guarded on the version that was
/// read. Returns `false` when the guard did not match.
pub(crate) async fn update_report_content(
    conn: &mut SqliteConnection,
    report: &Report,
    expected_version: i64,
) -> Result<bool> {
    let metadata_json = serde_json::to_string(&report.metadata)
        .map_err(|e| Error::encode("metadata", e))?;

    let result = sqlx::query(
        r#"
        UPDATE reports SET
            report_id = ?, title = ?, report_type = ?, content_raw = ?,
            content_processed = ?, content_hash = ?, version_number = ?,
            is_latest = 1, source_url = ?, chr_no = ?, modality = ?,
            report_date = ?, verified_at = ?, updated_at = ?, metadata_json = ?
        WHERE uid = ? AND version_number = ?
        "#,
    )
    .bind(&report.report_id)
    .bind(&report.title)
    .bind(&report.report_type)
    .bind(&report.content_raw)
    .bind(&report.content_processed)
    .bind(&report.content_hash)
    .bind(report.version_number)
    .bind(&report.source_url)
    .bind(&report.chr_no)
    .bind(&report.modality)
    .bind(&report.report_date)
    .bind(report.verified_at.map(millis))
    .bind(millis(report.updated_at))
    .bind(metadata_json)
    .bind(&report.uid)
    .bind(expected_version)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Move only `verified_at` and `updated_at`.
pub(crate) async fn update_verified_at(
    conn: &mut SqliteConnection,
    uid: &str,
    verified_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expected_version: i64,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE reports SET verified_at = ?, updated_at = ? WHERE uid = ? AND version_number = ?",
    )
    .bind(millis(verified_at))
    .bind(millis(updated_at))
    .bind(uid)
    .bind(expected_version)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub(crate) async fn append_version(conn: &mut SqliteConnection, entry: &ReportVersion) -> Result<()> {
    sqlx::query(
        "INSERT INTO report_versions (report_uid, version_number, content_hash, content_raw, \
         changed_at, verified_at, change_type, change_description) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.report_uid)
    .bind(entry.version_number)
    .bind(&entry.content_hash)
    .bind(&entry.content_raw)
    .bind(millis(entry.changed_at))
    .bind(entry.verified_at.map(millis))
    .bind(entry.change_type.as_str())
    .bind(&entry.change_description)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        Error::from_insert_race(
            e,
            format!("report {} version {}", entry.report_uid, entry.version_number),
        )
    })?;

    Ok(())
}

fn report_from_row(row: &SqliteRow) -> Result<Report> {
    let metadata_json: String = row.get("metadata_json");
    Ok(Report {
        uid: row.get("uid"),
        report_id: row.get("report_id"),
        title: row.get("title"),
        report_type: row.get("report_type"),
        content_raw: row.get("content_raw"),
        content_processed: row.get("content_processed"),
        content_hash: row.get("content_hash"),
        version_number: row.get("version_number"),
        is_latest: row.get("is_latest"),
        source_url: row.get("source_url"),
        chr_no: row.get("chr_no"),
        modality: row.get("modality"),
        report_date: row.get("report_date"),
        verified_at: opt_from_millis(row.get("verified_at")),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
        metadata: decode_json("metadata_json", &metadata_json)?,
    })
}

fn version_from_row(row: &SqliteRow) -> Result<ReportVersion> {
    let change_type: String = row.get("change_type");
    Ok(ReportVersion {
        report_uid: row.get("report_uid"),
        version_number: row.get("version_number"),
        content_hash: row.get("content_hash"),
        content_raw: row.get("content_raw"),
        changed_at: from_millis(row.get("changed_at")),
        verified_at: opt_from_millis(row.get("verified_at")),
        change_type: change_type.parse::<ChangeType>()?,
        change_description: row.get("change_description"),
    })
}

fn format_ts(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn format_opt_ts(at: Option<DateTime<Utc>>) -> String {
    at.map(format_ts).unwrap_or_else(|| "-".to_string())
}

// ─── CLI runners ────────────────────────────────────────────────────

/// `irec get`: print the latest state of a report.
pub async fn run_get(config: &Config, identifier: &str, json: bool) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let report = records.reports.find_report(identifier).await?;
    records.close().await;

    let Some(report) = report else {
        anyhow::bail!("report not found: {}", identifier);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("--- Report ---");
    println!("uid:          {}", report.uid);
    if let Some(ref id) = report.report_id {
        println!("report_id:    {}", id);
    }
    println!("title:        {}", report.title);
    println!("type:         {}", report.report_type);
    println!("version:      {}", report.version_number);
    if let Some(ref m) = report.modality {
        println!("mod:          {}", m);
    }
    if let Some(ref chr) = report.chr_no {
        println!("chr_no:       {}", chr);
    }
    if let Some(ref url) = report.source_url {
        println!("source_url:   {}", url);
    }
    println!("verified_at:  {}", format_opt_ts(report.verified_at));
    println!("created_at:   {}", format_ts(report.created_at));
    println!("updated_at:   {}", format_ts(report.updated_at));
    println!("hash:         {}", report.content_hash);
    println!();
    println!("{}", report.content_raw);

    Ok(())
}

/// `irec history`: print the version ledger, newest first.
pub async fn run_history(config: &Config, identifier: &str, json: bool) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let history = records.reports.report_history(identifier).await?;
    records.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    if history.is_empty() {
        println!("No history for {}.", identifier);
        return Ok(());
    }

    println!(
        "{:<8} {:<12} {:<25} {:<25} DESCRIPTION",
        "VERSION", "CHANGE", "CHANGED_AT", "VERIFIED_AT"
    );
    for entry in &history {
        println!(
            "{:<8} {:<12} {:<25} {:<25} {}",
            entry.version_number,
            entry.change_type.as_str(),
            format_ts(entry.changed_at),
            format_opt_ts(entry.verified_at),
            entry.change_description
        );
    }

    Ok(())
}

/// `irec reports`: print one page of report summaries.
pub async fn run_list(
    config: &Config,
    report_type: Option<&str>,
    page: u32,
    page_size: u32,
) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let listing = records
        .reports
        .list_reports(report_type, page, page_size)
        .await?;
    records.close().await;

    if listing.items.is_empty() {
        println!("No reports.");
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:<4} {:<25} TITLE",
        "UID", "TYPE", "VER", "UPDATED_AT"
    );
    for r in &listing.items {
        println!(
            "{:<24} {:<10} {:<4} {:<25} {}",
            r.uid,
            r.report_type,
            r.version_number,
            format_ts(r.updated_at),
            r.title
        );
    }
    println!(
        "page {}/{} ({} reports)",
        listing.page,
        listing.total_pages(),
        listing.total
    );

    Ok(())
}
