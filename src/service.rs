//! One handle over every engine, sharing a single pool.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use crate::assignments::AssignmentEngine;
use crate::config::Config;
use crate::db;
use crate::directory::SqliteDirectory;
use crate::ingest::IngestEngine;
use crate::migrate;
use crate::projects::ProjectEngine;
use crate::reports::ReportStore;

/// The engines wired to the built-in [`SqliteDirectory`].
///
/// ```rust,no_run
/// # async fn demo() -> anyhow::Result<()> {
/// use imaging_records::config::Config;
/// use imaging_records::service::Records;
/// use imaging_records_core::models::IngestRequest;
///
/// let records = Records::connect(&Config::with_db_path("./data/irec.sqlite")).await?;
/// let outcome = records
///     .ingest
///     .ingest(&IngestRequest::new("r1", "CT chest", "no acute findings", "text"))
///     .await?;
/// println!("{} v{}", outcome.action, outcome.report.version_number);
/// records.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Records {
    pub pool: SqlitePool,
    pub directory: Arc<SqliteDirectory>,
    pub reports: ReportStore,
    pub ingest: IngestEngine,
    pub projects: ProjectEngine,
    pub assignments: AssignmentEngine,
}

impl Records {
    /// Open the configured database and make sure the schema exists.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        Ok(Self::from_pool(pool, config))
    }

    pub fn from_pool(pool: SqlitePool, config: &Config) -> Self {
        let backoff = config.ingest.backoff();
        let directory = Arc::new(SqliteDirectory::new(pool.clone()));

        Self {
            reports: ReportStore::new(pool.clone()),
            ingest: IngestEngine::new(pool.clone(), backoff),
            projects: ProjectEngine::new(pool.clone(), directory.clone(), backoff),
            assignments: AssignmentEngine::new(
                pool.clone(),
                directory.clone(),
                backoff,
                config.projects.max_batch_size,
            ),
            directory,
            pool,
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
