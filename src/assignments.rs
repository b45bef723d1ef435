//! Study-to-project assignment with an exact study counter.
//!
//! `projects.study_count` is denormalized. It stays equal to the number of
//! assignment rows because every batch changes both inside one transaction
//! that holds the project row lock (see [`crate::projects::lock_project`]):
//!
//! - adds increment the counter by the number of rows actually inserted,
//!   and skip the counter write when nothing was inserted
//! - removes decrement it by the number of rows actually deleted
//!
//! Batches report per-item outcomes instead of failing as a whole; see
//! [`imaging_records_core::batch`] for the bucketing rules.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use imaging_records_core::batch::{
    self, AddStudiesOutcome, FailureReason, RemoveStudiesOutcome,
};
use imaging_records_core::models::{AssignedStudy, Metadata, ProjectStatistics, StudyAssignment};
use imaging_records_core::page::{window, Page};
use imaging_records_core::permissions::Permission;

use crate::config::Config;
use crate::db::{self, decode_json, from_millis, millis, opt_from_millis};
use crate::directory::StudyRegistry;
use crate::error::Result;
use crate::projects::{ensure_project, lock_project, require_permission};
use crate::retry::{retry_transient, BackoffPolicy};
use crate::service::Records;

const IN_CHUNK: usize = 500;

/// Bucket for studies the registry has no modality for.
pub const UNKNOWN_MODALITY: &str = "unknown";

#[derive(Clone)]
pub struct AssignmentEngine {
    pool: SqlitePool,
    studies: Arc<dyn StudyRegistry>,
    backoff: BackoffPolicy,
    max_batch_size: usize,
}

impl AssignmentEngine {
    pub fn new(
        pool: SqlitePool,
        studies: Arc<dyn StudyRegistry>,
        backoff: BackoffPolicy,
        max_batch_size: usize,
    ) -> Self {
        Self {
            pool,
            studies,
            backoff,
            max_batch_size,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Assign a batch of exams to a project. Requires `manage_studies`.
    pub async fn add_studies<S: AsRef<str>>(
        &self,
        project_id: &str,
        actor: &str,
        exam_ids: &[S],
    ) -> Result<AddStudiesOutcome> {
        let distinct = batch::distinct_ids(exam_ids);
        batch::check_batch_limit(distinct.len(), self.max_batch_size)?;

        let registered = self.studies.existing_exam_ids(&distinct).await?;

        let outcome = retry_transient(&self.backoff, "add_studies", || {
            self.add_studies_once(project_id, actor, &distinct, &registered)
        })
        .await?;

        info!(
            project = project_id,
            actor,
            requested = outcome.requested_count,
            added = outcome.added_count,
            skipped = outcome.skipped_count,
            not_found = outcome.failed_items.len() - outcome.skipped_count,
            "studies assigned"
        );
        Ok(outcome)
    }

    async fn add_studies_once(
        &self,
        project_id: &str,
        actor: &str,
        distinct: &[String],
        registered: &HashSet<String>,
    ) -> Result<AddStudiesOutcome> {
        let mut tx = self.pool.begin().await?;
        lock_project(&mut tx, project_id).await?;
        require_permission(&mut tx, project_id, actor, Permission::ManageStudies).await?;

        let candidates: Vec<String> = distinct
            .iter()
            .filter(|id| registered.contains(*id))
            .cloned()
            .collect();
        let assigned = assigned_among(&mut tx, project_id, &candidates).await?;
        let (missing, mut already, fresh) = batch::partition(distinct, registered, &assigned);

        let now = millis(db::now());
        let mut added = 0usize;
        for exam_id in &fresh {
            let result = sqlx::query(
                "INSERT INTO study_project_assignments \
                 (project_id, exam_id, assigned_by, assigned_at, metadata_json) \
                 VALUES (?, ?, ?, ?, '{}') ON CONFLICT(project_id, exam_id) DO NOTHING",
            )
            .bind(project_id)
            .bind(exam_id)
            .bind(actor)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 1 {
                added += 1;
            } else {
                already.push(exam_id.clone());
            }
        }

        if added > 0 {
            sqlx::query(
                "UPDATE projects SET study_count = study_count + ?, updated_at = ? WHERE id = ?",
            )
            .bind(added as i64)
            .bind(now)
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let missing: HashSet<String> = missing.into_iter().collect();
        let already: HashSet<String> = already.into_iter().collect();
        Ok(batch::summarize(
            distinct,
            &missing,
            &already,
            added,
            self.max_batch_size,
        ))
    }

    /// Unassign a batch of exams. Requires `manage_studies`. Ids that were
    /// never assigned are ignored.
    pub async fn remove_studies<S: AsRef<str>>(
        &self,
        project_id: &str,
        actor: &str,
        exam_ids: &[S],
    ) -> Result<RemoveStudiesOutcome> {
        let distinct = batch::distinct_ids(exam_ids);
        batch::check_batch_limit(distinct.len(), self.max_batch_size)?;

        let outcome = retry_transient(&self.backoff, "remove_studies", || {
            self.remove_studies_once(project_id, actor, &distinct)
        })
        .await?;

        info!(
            project = project_id,
            actor,
            requested = distinct.len(),
            removed = outcome.removed_count,
            "studies unassigned"
        );
        Ok(outcome)
    }

    async fn remove_studies_once(
        &self,
        project_id: &str,
        actor: &str,
        distinct: &[String],
    ) -> Result<RemoveStudiesOutcome> {
        let mut tx = self.pool.begin().await?;
        lock_project(&mut tx, project_id).await?;
        require_permission(&mut tx, project_id, actor, Permission::ManageStudies).await?;

        let mut removed: u64 = 0;
        for chunk in distinct.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM study_project_assignments WHERE project_id = ");
            qb.push_bind(project_id);
            qb.push(" AND exam_id IN (");
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id.as_str());
            }
            sep.push_unseparated(")");
            removed += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        if removed > 0 {
            sqlx::query(
                "UPDATE projects SET study_count = study_count - ?, updated_at = ? WHERE id = ?",
            )
            .bind(removed as i64)
            .bind(millis(db::now()))
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        } else {
            debug!(project = project_id, "nothing to unassign");
        }

        tx.commit().await?;
        Ok(RemoveStudiesOutcome {
            removed_count: removed as usize,
        })
    }

    /// Counter, membership size, modality breakdown and last assignment
    /// time, read from one snapshot.
    pub async fn get_statistics(&self, project_id: &str) -> Result<ProjectStatistics> {
        let mut tx = self.pool.begin().await?;

        let study_count: Option<i64> =
            sqlx::query_scalar("SELECT study_count FROM projects WHERE id = ?")
                .bind(project_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(study_count) = study_count else {
            return Err(
                imaging_records_core::RecordsError::ProjectNotFound(project_id.to_string()).into(),
            );
        };

        let member_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM project_members WHERE project_id = ?")
                .bind(project_id)
                .fetch_one(&mut *tx)
                .await?;

        let last_activity: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(assigned_at) FROM study_project_assignments WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&mut *tx)
        .await?;

        let exam_ids: Vec<String> =
            sqlx::query_scalar("SELECT exam_id FROM study_project_assignments WHERE project_id = ?")
                .bind(project_id)
                .fetch_all(&mut *tx)
                .await?;

        tx.commit().await?;

        let studies = self.studies.lookup_studies(&exam_ids).await?;
        let mut modality_distribution: BTreeMap<String, i64> = BTreeMap::new();
        for exam_id in &exam_ids {
            let modality = studies
                .get(exam_id)
                .and_then(|s| s.modality.as_deref())
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(UNKNOWN_MODALITY);
            *modality_distribution.entry(modality.to_string()).or_insert(0) += 1;
        }

        Ok(ProjectStatistics {
            study_count,
            member_count,
            modality_distribution,
            last_activity_at: opt_from_millis(last_activity),
        })
    }

    /// Assigned studies, newest assignment first.
    pub async fn list_project_studies(
        &self,
        project_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Page<AssignedStudy>> {
        let (limit, offset) = window(page, page_size)?;
        let mut conn = self.pool.acquire().await?;
        ensure_project(&mut conn, project_id).await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM study_project_assignments WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&mut *conn)
        .await?;

        let rows = sqlx::query(
            "SELECT project_id, exam_id, assigned_by, assigned_at, metadata_json \
             FROM study_project_assignments WHERE project_id = ? \
             ORDER BY assigned_at DESC, exam_id ASC LIMIT ? OFFSET ?",
        )
        .bind(project_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?;
        drop(conn);

        let assignments: Vec<StudyAssignment> = rows
            .iter()
            .map(|row| {
                let metadata_json: String = row.get("metadata_json");
                Ok(StudyAssignment {
                    project_id: row.get("project_id"),
                    exam_id: row.get("exam_id"),
                    assigned_by: row.get("assigned_by"),
                    assigned_at: from_millis(row.get("assigned_at")),
                    metadata: decode_json::<Metadata>("metadata_json", &metadata_json)?,
                })
            })
            .collect::<Result<_>>()?;

        let ids: Vec<String> = assignments.iter().map(|a| a.exam_id.clone()).collect();
        let studies = self.studies.lookup_studies(&ids).await?;

        let items = assignments
            .into_iter()
            .map(|assignment| {
                let study = studies.get(&assignment.exam_id);
                AssignedStudy {
                    patient_name: study.map(|s| s.patient_name.clone()),
                    modality: study.and_then(|s| s.modality.clone()),
                    assignment,
                }
            })
            .collect();

        Ok(Page::new(items, total.max(0) as u64, page, page_size))
    }
}

/// The subset of `exam_ids` already assigned to the project.
async fn assigned_among(
    conn: &mut SqliteConnection,
    project_id: &str,
    exam_ids: &[String],
) -> Result<HashSet<String>> {
    let mut found = HashSet::with_capacity(exam_ids.len());
    for chunk in exam_ids.chunks(IN_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT exam_id FROM study_project_assignments WHERE project_id = ",
        );
        qb.push_bind(project_id);
        qb.push(" AND exam_id IN (");
        let mut sep = qb.separated(", ");
        for id in chunk {
            sep.push_bind(id.as_str());
        }
        sep.push_unseparated(")");

        for row in qb.build().fetch_all(&mut *conn).await? {
            found.insert(row.get::<String, _>("exam_id"));
        }
    }
    Ok(found)
}

// ─── CLI runners ────────────────────────────────────────────────────

/// `irec studies add`
pub async fn run_studies_add(
    config: &Config,
    project_id: &str,
    actor: &str,
    exam_ids: &[String],
) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let outcome = records
        .assignments
        .add_studies(project_id, actor, exam_ids)
        .await;
    records.close().await;
    let outcome = outcome?;

    println!("studies add {}", project_id);
    println!(
        "  requested: {} (max {})",
        outcome.requested_count, outcome.max_batch_size
    );
    println!("  added:     {}", outcome.added_count);
    println!("  skipped:   {}", outcome.skipped_count);
    for item in &outcome.failed_items {
        let reason = match item.reason {
            FailureReason::NotFound => "not_found",
            FailureReason::AlreadyAssigned => "already_assigned",
        };
        println!("    {}: {}", item.exam_id, reason);
    }
    Ok(())
}

/// `irec studies remove`
pub async fn run_studies_remove(
    config: &Config,
    project_id: &str,
    actor: &str,
    exam_ids: &[String],
) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let outcome = records
        .assignments
        .remove_studies(project_id, actor, exam_ids)
        .await;
    records.close().await;
    println!("removed: {}", outcome?.removed_count);
    Ok(())
}

/// `irec studies list`
pub async fn run_studies_list(
    config: &Config,
    project_id: &str,
    page: u32,
    page_size: u32,
) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let listing = records
        .assignments
        .list_project_studies(project_id, page, page_size)
        .await;
    records.close().await;
    let listing = listing?;

    if listing.items.is_empty() {
        println!("No studies assigned.");
        return Ok(());
    }

    println!(
        "{:<20} {:<8} {:<24} {:<16} ASSIGNED_AT",
        "EXAM_ID", "MOD", "PATIENT", "ASSIGNED_BY"
    );
    for s in &listing.items {
        println!(
            "{:<20} {:<8} {:<24} {:<16} {}",
            s.assignment.exam_id,
            s.modality.as_deref().unwrap_or(UNKNOWN_MODALITY),
            s.patient_name.as_deref().unwrap_or("-"),
            s.assignment.assigned_by,
            s.assignment.assigned_at.to_rfc3339()
        );
    }
    println!(
        "page {}/{} ({} studies)",
        listing.page,
        listing.total_pages(),
        listing.total
    );
    Ok(())
}

/// `irec studies stats`
pub async fn run_studies_stats(config: &Config, project_id: &str) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let stats = records.assignments.get_statistics(project_id).await;
    records.close().await;
    let stats = stats?;

    println!("studies:        {}", stats.study_count);
    println!("members:        {}", stats.member_count);
    println!(
        "last activity:  {}",
        stats
            .last_activity_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    if !stats.modality_distribution.is_empty() {
        println!("by modality:");
        for (modality, count) in &stats.modality_distribution {
            println!("  {:<10} {}", modality, count);
        }
    }
    Ok(())
}
