//! Database statistics and health overview.
//!
//! Row counts per table plus the on-disk size. Used by `irec stats` to
//! confirm that imports and assignments are landing where expected.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::error::Result;
use crate::service::Records;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub reports: i64,
    pub versions: i64,
    pub users: i64,
    pub studies: i64,
    pub projects: i64,
    pub members: i64,
    pub assignments: i64,
}

/// Per-report-type breakdown.
struct TypeStats {
    report_type: String,
    count: i64,
    max_version: i64,
}

pub async fn database_stats(pool: &SqlitePool) -> Result<DatabaseStats> {
    let row = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM reports) AS reports,
            (SELECT COUNT(*) FROM report_versions) AS versions,
            (SELECT COUNT(*) FROM users) AS users,
            (SELECT COUNT(*) FROM studies) AS studies,
            (SELECT COUNT(*) FROM projects) AS projects,
            (SELECT COUNT(*) FROM project_members) AS members,
            (SELECT COUNT(*) FROM study_project_assignments) AS assignments
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(DatabaseStats {
        reports: row.get("reports"),
        versions: row.get("versions"),
        users: row.get("users"),
        studies: row.get("studies"),
        projects: row.get("projects"),
        members: row.get("members"),
        assignments: row.get("assignments"),
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let stats = database_stats(&records.pool).await?;

    let type_rows = sqlx::query(
        "SELECT report_type, COUNT(*) AS count, MAX(version_number) AS max_version \
         FROM reports GROUP BY report_type ORDER BY count DESC, report_type ASC",
    )
    .fetch_all(&records.pool)
    .await?;
    records.close().await;

    let by_type: Vec<TypeStats> = type_rows
        .iter()
        .map(|row| TypeStats {
            report_type: row.get("report_type"),
            count: row.get("count"),
            max_version: row.get("max_version"),
        })
        .collect();

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Imaging Records — Database Stats");
    println!("================================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!("  Reports:      {}", stats.reports);
    println!("  Versions:     {}", stats.versions);
    println!("  Users:        {}", stats.users);
    println!("  Studies:      {}", stats.studies);
    println!("  Projects:     {}", stats.projects);
    println!("  Members:      {}", stats.members);
    println!("  Assignments:  {}", stats.assignments);

    if !by_type.is_empty() {
        println!();
        println!("  By report type:");
        println!("  {:<16} {:>8} {:>12}", "TYPE", "REPORTS", "MAX VERSION");
        for t in &by_type {
            println!("  {:<16} {:>8} {:>12}", t.report_type, t.count, t.max_version);
        }
    }

    Ok(())
}

/// Format a byte count as a human-readable string (e.g. `"1.2 MB"`).
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
