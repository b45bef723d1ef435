//! Identity directory and study registry.
//!
//! The project and assignment engines do not own users or studies; they
//! resolve them through these two traits. [`SqliteDirectory`] is the
//! built-in implementation backed by the `users` and `studies` tables.
//! Tests and embedders can substitute their own.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use imaging_records::directory::UserDirectory;
//! use imaging_records::error::Result;
//! use imaging_records_core::models::User;
//!
//! struct Ldap;
//!
//! #[async_trait]
//! impl UserDirectory for Ldap {
//!     async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
//!         // ... look the user up
//!         Ok(None)
//!     }
//! }
//! ```

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use imaging_records_core::models::{Study, User};
use imaging_records_core::RecordsError;

use crate::config::Config;
use crate::db::{self, millis, opt_from_millis};
use crate::error::Result;
use crate::service::Records;

/// SQLite's default limit on bound parameters is well above this.
const IN_CHUNK: usize = 500;

/// Resolves user references.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>>;

    /// Resolve many users at once. Unknown ids are absent from the map.
    async fn find_users(&self, user_ids: &[String]) -> Result<HashMap<String, User>> {
        let mut found = HashMap::with_capacity(user_ids.len());
        for id in user_ids {
            if let Some(user) = self.find_user(id).await? {
                found.insert(id.clone(), user);
            }
        }
        Ok(found)
    }
}

/// Answers "does this exam exist?" and supplies study details.
#[async_trait]
pub trait StudyRegistry: Send + Sync {
    /// The subset of `exam_ids` known to the registry.
    async fn existing_exam_ids(&self, exam_ids: &[String]) -> Result<HashSet<String>>;

    async fn lookup_studies(&self, exam_ids: &[String]) -> Result<HashMap<String, Study>>;
}

#[derive(Clone)]
pub struct SqliteDirectory {
    pool: SqlitePool,
}

impl SqliteDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update a user record.
    pub async fn register_user(&self, user_id: &str, name: &str, email: &str) -> Result<User> {
        if user_id.trim().is_empty() {
            return Err(RecordsError::validation("user_id must not be empty").into());
        }
        sqlx::query(
            "INSERT INTO users (user_id, name, email, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET name = excluded.name, email = excluded.email",
        )
        .bind(user_id)
        .bind(name)
        .bind(email)
        .bind(millis(db::now()))
        .execute(&self.pool)
        .await?;

        Ok(User {
            user_id: user_id.to_string(),
            name: name.to_string(),
            email: email.to_string(),
        })
    }

    /// Insert or update a study record.
    pub async fn register_study(&self, study: &Study) -> Result<()> {
        if study.exam_id.trim().is_empty() {
            return Err(RecordsError::validation("exam_id must not be empty").into());
        }
        sqlx::query(
            "INSERT INTO studies (exam_id, patient_name, modality, order_datetime) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(exam_id) DO UPDATE SET patient_name = excluded.patient_name, \
             modality = excluded.modality, order_datetime = excluded.order_datetime",
        )
        .bind(&study.exam_id)
        .bind(&study.patient_name)
        .bind(&study.modality)
        .bind(study.order_datetime.map(millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for SqliteDirectory {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT user_id, name, email FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| User {
            user_id: row.get("user_id"),
            name: row.get("name"),
            email: row.get("email"),
        }))
    }

    async fn find_users(&self, user_ids: &[String]) -> Result<HashMap<String, User>> {
        let mut found = HashMap::with_capacity(user_ids.len());
        for chunk in user_ids.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT user_id, name, email FROM users WHERE user_id IN (");
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id.as_str());
            }
            sep.push_unseparated(")");

            for row in qb.build().fetch_all(&self.pool).await? {
                let user = User {
                    user_id: row.get("user_id"),
                    name: row.get("name"),
                    email: row.get("email"),
                };
                found.insert(user.user_id.clone(), user);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl StudyRegistry for SqliteDirectory {
    async fn existing_exam_ids(&self, exam_ids: &[String]) -> Result<HashSet<String>> {
        let mut found = HashSet::with_capacity(exam_ids.len());
        for chunk in exam_ids.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT exam_id FROM studies WHERE exam_id IN (");
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id.as_str());
            }
            sep.push_unseparated(")");

            for row in qb.build().fetch_all(&self.pool).await? {
                found.insert(row.get::<String, _>("exam_id"));
            }
        }
        Ok(found)
    }

    async fn lookup_studies(&self, exam_ids: &[String]) -> Result<HashMap<String, Study>> {
        let mut found = HashMap::with_capacity(exam_ids.len());
        for chunk in exam_ids.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT exam_id, patient_name, modality, order_datetime FROM studies WHERE exam_id IN (",
            );
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id.as_str());
            }
            sep.push_unseparated(")");

            for row in qb.build().fetch_all(&self.pool).await? {
                let study = Study {
                    exam_id: row.get("exam_id"),
                    patient_name: row.get("patient_name"),
                    modality: row.get("modality"),
                    order_datetime: opt_from_millis(row.get("order_datetime")),
                };
                found.insert(study.exam_id.clone(), study);
            }
        }
        Ok(found)
    }
}

// ─── CLI runners ────────────────────────────────────────────────────

/// `irec user add`
pub async fn run_user_add(
    config: &Config,
    user_id: &str,
    name: &str,
    email: &str,
) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let user = records.directory.register_user(user_id, name, email).await;
    records.close().await;
    let user = user?;
    println!("user {} ({} <{}>)", user.user_id, user.name, user.email);
    Ok(())
}

/// `irec study add`
pub async fn run_study_add(config: &Config, study: &Study) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let result = records.directory.register_study(study).await;
    records.close().await;
    result?;
    println!(
        "study {} ({}, {})",
        study.exam_id,
        study.patient_name,
        study.modality.as_deref().unwrap_or("unknown")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_schema;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn registered_users_resolve() {
        let dir = SqliteDirectory::new(memory_pool().await);
        dir.register_user("u1", "Ada", "ada@example.org").await.unwrap();

        let user = dir.find_user("u1").await.unwrap().unwrap();
        assert_eq!(user.name, "Ada");
        assert!(dir.find_user("u2").await.unwrap().is_none());

        let many = dir
            .find_users(&["u1".to_string(), "u2".to_string()])
            .await
            .unwrap();
        assert_eq!(many.len(), 1);
        assert!(many.contains_key("u1"));
    }

    #[tokio::test]
    async fn registry_reports_only_known_exams() {
        let dir = SqliteDirectory::new(memory_pool().await);
        dir.register_study(&Study {
            exam_id: "E1".into(),
            patient_name: "Doe".into(),
            modality: Some("CT".into()),
            order_datetime: None,
        })
        .await
        .unwrap();

        let ids = vec!["E1".to_string(), "E2".to_string()];
        let known = dir.existing_exam_ids(&ids).await.unwrap();
        assert_eq!(known.len(), 1);
        assert!(known.contains("E1"));

        let studies = dir.lookup_studies(&ids).await.unwrap();
        assert_eq!(studies["E1"].modality.as_deref(), Some("CT"));
    }

    #[tokio::test]
    async fn blank_user_id_is_rejected() {
        let dir = SqliteDirectory::new(memory_pool().await);
        assert!(dir.register_user(" ", "x", "y").await.is_err());
    }
}
