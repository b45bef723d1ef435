//! Database schema migrations.
//!
//! All statements are idempotent (`IF NOT EXISTS`), so `irec init` can run
//! any number of times.
//!
//! # Tables
//!
//! | Table | Key | Notes |
//! |-------|-----|-------|
//! | `reports` | `uid` | latest state only, mutated in place |
//! | `report_versions` | `(report_uid, version_number)` | append-only, enforced by triggers |
//! | `users` | `user_id` | built-in identity directory |
//! | `studies` | `exam_id` | built-in study registry |
//! | `projects` | `id` | carries the denormalized `study_count` |
//! | `project_members` | `(project_id, user_id)` | role per member |
//! | `study_project_assignments` | `(project_id, exam_id)` | |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS reports (
        uid TEXT PRIMARY KEY,
        report_id TEXT,
        title TEXT NOT NULL,
        report_type TEXT NOT NULL,
        content_raw TEXT NOT NULL,
        content_processed TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        version_number INTEGER NOT NULL CHECK (version_number >= 1),
        is_latest INTEGER NOT NULL DEFAULT 1,
        source_url TEXT,
        chr_no TEXT,
        modality TEXT,
        report_date TEXT,
        verified_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS report_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        report_uid TEXT NOT NULL REFERENCES reports(uid),
        version_number INTEGER NOT NULL,
        content_hash TEXT NOT NULL,
        content_raw TEXT NOT NULL,
        changed_at INTEGER NOT NULL,
        verified_at INTEGER,
        change_type TEXT NOT NULL,
        change_description TEXT NOT NULL DEFAULT '',
        UNIQUE(report_uid, version_number)
    )
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS report_versions_no_update
    BEFORE UPDATE ON report_versions
    BEGIN
        SELECT RAISE(ABORT, 'report_versions is append-only');
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS report_versions_no_delete
    BEFORE DELETE ON report_versions
    BEGIN
        SELECT RAISE(ABORT, 'report_versions is append-only');
    END
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        user_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS studies (
        exam_id TEXT PRIMARY KEY,
        patient_name TEXT NOT NULL,
        modality TEXT,
        order_datetime INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'active',
        tags_json TEXT NOT NULL DEFAULT '[]',
        study_count INTEGER NOT NULL DEFAULT 0 CHECK (study_count >= 0),
        created_by TEXT NOT NULL,
        settings_json TEXT NOT NULL DEFAULT '{}',
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS project_members (
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL,
        role TEXT NOT NULL,
        joined_at INTEGER NOT NULL,
        permissions_json TEXT NOT NULL DEFAULT '[]',
        PRIMARY KEY (project_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS study_project_assignments (
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        exam_id TEXT NOT NULL,
        assigned_by TEXT NOT NULL,
        assigned_at INTEGER NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (project_id, exam_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_reports_report_id ON reports(report_id)",
    "CREATE INDEX IF NOT EXISTS idx_reports_updated_at ON reports(updated_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_members_user_id ON project_members(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_assignments_assigned_at ON study_project_assignments(project_id, assigned_at DESC)",
];

/// Apply the schema to an open pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Connect, apply the schema, and close.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}
