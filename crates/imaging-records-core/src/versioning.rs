//! Report version decisions.
//!
//! Given the currently stored report (if any) and an inbound request, the
//! ingestion engine must choose exactly one of four outcomes. The choice is
//! made here, with no I/O, so the storage layer only has to apply it.
//!
//! # Algorithm
//!
//! 1. No stored report → [`Decision::Create`] at version 1.
//! 2. Stored hash equals the incoming hash (duplicate content):
//!    - `effective = verified_at or now`
//!    - `existing = stored.verified_at or stored.created_at`
//!    - `effective > existing` → [`Decision::RefreshVerifiedAt`]; only the
//!      timestamps move, no ledger row is written.
//!    - otherwise → [`Decision::KeepExisting`]; nothing is written.
//! 3. Hashes differ → [`Decision::NewVersion`] at `stored + 1`.
//!
//! The builders ([`new_report`], [`next_report`], [`ledger_entry`]) produce
//! the exact rows to persist for the create and update paths.

use chrono::{DateTime, Utc};

use crate::hash::{content_hash, process_content, short_hash};
use crate::models::{ChangeType, IngestAction, IngestRequest, Metadata, Report, ReportVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Create,
    KeepExisting,
    RefreshVerifiedAt(DateTime<Utc>),
    NewVersion { version_number: i64 },
}

impl Decision {
    pub fn action(&self) -> IngestAction {
        match self {
            Self::Create => IngestAction::Create,
            Self::KeepExisting => IngestAction::DeduplicateKeptExisting,
            Self::RefreshVerifiedAt(_) => IngestAction::DeduplicateUpdatedTimestamp,
            Self::NewVersion { .. } => IngestAction::Update,
        }
    }
}

/// Decide what an ingestion of content hashing to `incoming_hash` does.
pub fn decide(
    existing: Option<&Report>,
    incoming_hash: &str,
    verified_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Decision {
    let Some(existing) = existing else {
        return Decision::Create;
    };

    if existing.content_hash == incoming_hash {
        let effective = verified_at.unwrap_or(now);
        if effective > existing.effective_verified_at() {
            Decision::RefreshVerifiedAt(effective)
        } else {
            Decision::KeepExisting
        }
    } else {
        Decision::NewVersion {
            version_number: existing.version_number + 1,
        }
    }
}

/// Build version 1 of a report from a request.
pub fn new_report(req: &IngestRequest, now: DateTime<Utc>) -> Report {
    Report {
        uid: req.uid.clone(),
        report_id: req.report_id.clone(),
        title: req.title.clone(),
        report_type: req.report_type.clone(),
        content_raw: req.content.clone(),
        content_processed: process_content(&req.content),
        content_hash: content_hash(req.content.as_bytes()),
        version_number: 1,
        is_latest: true,
        source_url: req.source_url.clone(),
        chr_no: req.chr_no.clone(),
        modality: req.modality.clone(),
        report_date: req.report_date.clone(),
        verified_at: req.verified_at,
        created_at: now,
        updated_at: now,
        metadata: req.metadata.clone().unwrap_or_default(),
    }
}

/// Build the next version of `existing` carrying the request's content.
///
/// Content fields are overwritten. Optional descriptive fields (`report_id`,
/// `chr_no`, `mod`, `report_date`, `source_url`, `metadata`) are replaced
/// only when the request provides them. A content change without an
/// asserted `verified_at` is stamped as verified `now`.
pub fn next_report(
    existing: &Report,
    req: &IngestRequest,
    version_number: i64,
    now: DateTime<Utc>,
) -> Report {
    Report {
        uid: existing.uid.clone(),
        report_id: req.report_id.clone().or_else(|| existing.report_id.clone()),
        title: req.title.clone(),
        report_type: req.report_type.clone(),
        content_raw: req.content.clone(),
        content_processed: process_content(&req.content),
        content_hash: content_hash(req.content.as_bytes()),
        version_number,
        is_latest: true,
        source_url: req
            .source_url
            .clone()
            .or_else(|| existing.source_url.clone()),
        chr_no: req.chr_no.clone().or_else(|| existing.chr_no.clone()),
        modality: req.modality.clone().or_else(|| existing.modality.clone()),
        report_date: req
            .report_date
            .clone()
            .or_else(|| existing.report_date.clone()),
        verified_at: Some(req.verified_at.unwrap_or(now)),
        created_at: existing.created_at,
        updated_at: now,
        metadata: merge_metadata(&existing.metadata, req.metadata.as_ref()),
    }
}

fn merge_metadata(existing: &Metadata, incoming: Option<&Metadata>) -> Metadata {
    match incoming {
        Some(m) => m.clone(),
        None => existing.clone(),
    }
}

/// Ledger row recording that `report` reached its current version.
pub fn ledger_entry(report: &Report, previous_hash: Option<&str>) -> ReportVersion {
    let (change_type, change_description) = match previous_hash {
        None => (ChangeType::Create, "initial version".to_string()),
        Some(prev) => (
            ChangeType::Update,
            format!(
                "content changed ({} -> {})",
                short_hash(prev, 12),
                short_hash(&report.content_hash, 12)
            ),
        ),
    };
    ReportVersion {
        report_uid: report.uid.clone(),
        version_number: report.version_number,
        content_hash: report.content_hash.clone(),
        content_raw: report.content_raw.clone(),
        changed_at: report.updated_at,
        verified_at: report.verified_at,
        change_type,
        change_description,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, hour, 0, 0).unwrap()
    }

    fn stored(content: &str, verified_at: Option<DateTime<Utc>>) -> Report {
        let mut req = IngestRequest::new("r1", "Chest X-ray", content, "text");
        req.verified_at = verified_at;
        new_report(&req, t(8))
    }

    #[test]
    fn missing_report_is_created() {
        let d = decide(None, "abc", None, t(9));
        assert_eq!(d, Decision::Create);
        assert_eq!(d.action(), IngestAction::Create);
    }

    #[test]
    fn same_content_older_timestamp_keeps_existing() {
        let existing = stored("hello", None);
        let d = decide(
            Some(&existing),
            &existing.content_hash,
            Some(t(8) - Duration::hours(1)),
            t(9),
        );
        assert_eq!(d, Decision::KeepExisting);
    }

    #[test]
    fn same_content_equal_timestamp_keeps_existing() {
        let existing = stored("hello", Some(t(10)));
        let d = decide(Some(&existing), &existing.content_hash, Some(t(10)), t(11));
        assert_eq!(d, Decision::KeepExisting);
    }

    #[test]
    fn same_content_without_timestamp_refreshes_to_now() {
        let existing = stored("hello", None);
        let d = decide(Some(&existing), &existing.content_hash, None, t(9));
        assert_eq!(d, Decision::RefreshVerifiedAt(t(9)));
        assert_eq!(d.action(), IngestAction::DeduplicateUpdatedTimestamp);
    }

    #[test]
    fn same_content_newer_assertion_refreshes() {
        let existing = stored("hello", Some(t(10)));
        let d = decide(Some(&existing), &existing.content_hash, Some(t(12)), t(9));
        assert_eq!(d, Decision::RefreshVerifiedAt(t(12)));
    }

    #[test]
    fn different_content_bumps_version() {
        let existing = stored("hello", None);
        let incoming = content_hash(b"hello world");
        let d = decide(Some(&existing), &incoming, None, t(9));
        assert_eq!(d, Decision::NewVersion { version_number: 2 });
    }

    #[test]
    fn next_report_retains_unspecified_optional_fields() {
        let req = IngestRequest::new("r1", "CT head", "v1", "text")
            .chr_no("C-100")
            .modality("CT")
            .report_date("2026-05-01")
            .report_id("RPT-7");
        let first = new_report(&req, t(8));

        let update = IngestRequest::new("r1", "CT head (amended)", "v2", "text");
        let second = next_report(&first, &update, 2, t(9));

        assert_eq!(second.version_number, 2);
        assert_eq!(second.title, "CT head (amended)");
        assert_eq!(second.chr_no.as_deref(), Some("C-100"));
        assert_eq!(second.modality.as_deref(), Some("CT"));
        assert_eq!(second.report_date.as_deref(), Some("2026-05-01"));
        assert_eq!(second.report_id.as_deref(), Some("RPT-7"));
        assert_eq!(second.created_at, t(8));
        assert_eq!(second.updated_at, t(9));
        assert_eq!(second.verified_at, Some(t(9)));
        assert_ne!(second.content_hash, first.content_hash);
        assert_eq!(second.content_processed, "v2");
    }

    #[test]
    fn next_report_replaces_provided_fields() {
        let first = new_report(
            &IngestRequest::new("r1", "t", "v1", "text").modality("CR"),
            t(8),
        );
        let mut meta = Metadata::new();
        meta.insert("site".into(), serde_json::json!("north"));
        let update = IngestRequest::new("r1", "t", "v2", "scan")
            .modality("DX")
            .metadata(meta.clone())
            .verified_at(t(7));
        let second = next_report(&first, &update, 2, t(9));
        assert_eq!(second.modality.as_deref(), Some("DX"));
        assert_eq!(second.report_type, "scan");
        assert_eq!(second.metadata, meta);
        assert_eq!(second.verified_at, Some(t(7)));
    }

    #[test]
    fn ledger_entries_describe_the_transition() {
        let first = new_report(&IngestRequest::new("r1", "t", "v1", "text"), t(8));
        let entry = ledger_entry(&first, None);
        assert_eq!(entry.change_type, ChangeType::Create);
        assert_eq!(entry.version_number, 1);

        let second = next_report(&first, &IngestRequest::new("r1", "t", "v2", "text"), 2, t(9));
        let entry = ledger_entry(&second, Some(&first.content_hash));
        assert_eq!(entry.change_type, ChangeType::Update);
        assert_eq!(entry.version_number, 2);
        assert_eq!(entry.content_raw, "v2");
        assert!(entry.change_description.contains(short_hash(&first.content_hash, 12)));
    }
}
