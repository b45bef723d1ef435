//! Core data models used throughout Imaging Records.
//!
//! Reports and their version ledger, projects with role-based membership,
//! and study assignments. Timestamps are UTC; open key-value fields use
//! [`Metadata`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RecordsError;

/// Open string-keyed map with dynamically typed values.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ─── Reports ────────────────────────────────────────────────────────

/// Kind of transition recorded in the version ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Update,
    Verify,
    Deduplicate,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Verify => "verify",
            Self::Deduplicate => "deduplicate",
        }
    }
}

impl FromStr for ChangeType {
    type Err = RecordsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "verify" => Ok(Self::Verify),
            "deduplicate" => Ok(Self::Deduplicate),
            other => Err(RecordsError::validation(format!(
                "unknown change type '{other}'"
            ))),
        }
    }
}

/// What an ingestion call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestAction {
    Create,
    Update,
    DeduplicateKeptExisting,
    DeduplicateUpdatedTimestamp,
}

impl IngestAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::DeduplicateKeptExisting => "deduplicate_kept_existing",
            Self::DeduplicateUpdatedTimestamp => "deduplicate_updated_timestamp",
        }
    }
}

impl fmt::Display for IngestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest state of one logical report. Exactly one row per `uid`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub uid: String,
    pub report_id: Option<String>,
    pub title: String,
    pub report_type: String,
    pub content_raw: String,
    pub content_processed: String,
    pub content_hash: String,
    pub version_number: i64,
    pub is_latest: bool,
    pub source_url: Option<String>,
    pub chr_no: Option<String>,
    pub modality: Option<String>,
    pub report_date: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Metadata,
}

impl Report {
    /// The most authoritative time this content is known to be true:
    /// `verified_at` when asserted, otherwise `created_at`.
    pub fn effective_verified_at(&self) -> DateTime<Utc> {
        self.verified_at.unwrap_or(self.created_at)
    }
}

/// Lightweight listing row for paged report listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub uid: String,
    pub report_id: Option<String>,
    pub title: String,
    pub report_type: String,
    pub version_number: i64,
    pub verified_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable snapshot appended to the version ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportVersion {
    pub report_uid: String,
    pub version_number: i64,
    pub content_hash: String,
    pub content_raw: String,
    pub changed_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub change_type: ChangeType,
    pub change_description: String,
}

/// Inbound report content from an importer.
///
/// Deserializable so batch imports can be read line-by-line from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub uid: String,
    pub title: String,
    pub content: String,
    pub report_type: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub report_id: Option<String>,
    #[serde(default)]
    pub chr_no: Option<String>,
    #[serde(default, rename = "mod", alias = "modality")]
    pub modality: Option<String>,
    #[serde(default)]
    pub report_date: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl IngestRequest {
    pub fn new(
        uid: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        report_type: impl Into<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            title: title.into(),
            content: content.into(),
            report_type: report_type.into(),
            source_url: None,
            verified_at: None,
            report_id: None,
            chr_no: None,
            modality: None,
            report_date: None,
            metadata: None,
        }
    }

    pub fn verified_at(mut self, at: DateTime<Utc>) -> Self {
        self.verified_at = Some(at);
        self
    }

    pub fn source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn report_id(mut self, id: impl Into<String>) -> Self {
        self.report_id = Some(id.into());
        self
    }

    pub fn chr_no(mut self, chr_no: impl Into<String>) -> Self {
        self.chr_no = Some(chr_no.into());
        self
    }

    pub fn modality(mut self, modality: impl Into<String>) -> Self {
        self.modality = Some(modality.into());
        self
    }

    pub fn report_date(mut self, date: impl Into<String>) -> Self {
        self.report_date = Some(date.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Reject requests that cannot identify or describe a report.
    pub fn validate(&self) -> Result<(), RecordsError> {
        if self.uid.trim().is_empty() {
            return Err(RecordsError::validation("uid must not be empty"));
        }
        if self.report_type.trim().is_empty() {
            return Err(RecordsError::validation("report_type must not be empty"));
        }
        Ok(())
    }
}

/// Result of one ingestion call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub report: Report,
    pub is_new: bool,
    pub action: IngestAction,
}

/// Compact response shape for importers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReceipt {
    pub uid: String,
    pub report_id: Option<String>,
    pub is_new: bool,
    pub action: IngestAction,
    pub version_number: i64,
}

impl IngestOutcome {
    pub fn receipt(&self) -> IngestReceipt {
        IngestReceipt {
            uid: self.report.uid.clone(),
            report_id: self.report.report_id.clone(),
            is_new: self.is_new,
            action: self.action,
            version_number: self.report.version_number,
        }
    }
}

// ─── Projects ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Active,
    Archived,
    Completed,
    Draft,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Completed => "completed",
            Self::Draft => "draft",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = RecordsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            "completed" => Ok(Self::Completed),
            "draft" => Ok(Self::Draft),
            other => Err(RecordsError::validation(format!(
                "invalid project status '{other}': expected active, archived, completed, or draft"
            ))),
        }
    }
}

/// Membership role, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Editor,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Editor => "editor",
            Self::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = RecordsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Ok(Self::Owner),
            "admin" => Ok(Self::Admin),
            "editor" => Ok(Self::Editor),
            "viewer" => Ok(Self::Viewer),
            other => Err(RecordsError::validation(format!(
                "invalid role '{other}': expected owner, admin, editor, or viewer"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: ProjectStatus,
    pub tags: Vec<String>,
    /// Always equal to the number of assignment rows for this project.
    pub study_count: i64,
    pub created_by: String,
    pub settings: Metadata,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for project creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewProject {
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub status: Option<ProjectStatus>,
    pub settings: Option<Metadata>,
    pub metadata: Option<Metadata>,
}

impl NewProject {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Partial project edit; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
    pub tags: Option<Vec<String>>,
    pub settings: Option<Metadata>,
}

/// Trim, drop blanks, and drop repeats while keeping first-seen order.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let t = tag.trim();
        if !t.is_empty() && !out.iter().any(|seen| seen == t) {
            out.push(t.to_string());
        }
    }
    out
}

/// Validate and normalize a project name.
pub fn validate_project_name(name: &str) -> Result<String, RecordsError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(RecordsError::validation("project name must not be empty"));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectMember {
    pub project_id: String,
    pub user_id: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub permissions: Vec<String>,
}

/// Membership row joined with the resolved user record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberDetail {
    #[serde(flatten)]
    pub member: ProjectMember,
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub email: String,
}

// ─── Studies ────────────────────────────────────────────────────────

/// Exam record from the study registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Study {
    pub exam_id: String,
    pub patient_name: String,
    pub modality: Option<String>,
    pub order_datetime: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudyAssignment {
    pub project_id: String,
    pub exam_id: String,
    pub assigned_by: String,
    pub assigned_at: DateTime<Utc>,
    pub metadata: Metadata,
}

/// Assignment row joined with registry details, for project study listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignedStudy {
    #[serde(flatten)]
    pub assignment: StudyAssignment,
    pub patient_name: Option<String>,
    pub modality: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectStatistics {
    pub study_count: i64,
    pub member_count: i64,
    pub modality_distribution: BTreeMap<String, i64>,
    pub last_activity_at: Option<DateTime<Utc>>,
}
