#![allow(dead_code)]

use imaging_records::config::Config;
use imaging_records::Records;
use imaging_records_core::models::{NewProject, Project, Study};
use tempfile::TempDir;

pub fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::with_db_path(tmp.path().join("data").join("irec.sqlite"));
    config.ingest.max_retries = 10;
    config.ingest.base_delay_ms = 5;
    config.ingest.max_delay_ms = 200;
    config
}

pub async fn open() -> (TempDir, Records) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    open_with(tmp, config).await
}

pub async fn open_with(tmp: TempDir, config: Config) -> (TempDir, Records) {
    let records = Records::connect(&config).await.unwrap();
    (tmp, records)
}

pub async fn seed_users(records: &Records, ids: &[&str]) {
    for id in ids {
        records
            .directory
            .register_user(id, &format!("User {id}"), &format!("{id}@example.org"))
            .await
            .unwrap();
    }
}

pub async fn seed_study(records: &Records, exam_id: &str, modality: Option<&str>) {
    records
        .directory
        .register_study(&Study {
            exam_id: exam_id.to_string(),
            patient_name: format!("Patient {exam_id}"),
            modality: modality.map(str::to_string),
            order_datetime: None,
        })
        .await
        .unwrap();
}

/// A project owned by `owner`, with the owner registered.
pub async fn project_owned_by(records: &Records, owner: &str) -> Project {
    seed_users(records, &[owner]).await;
    records
        .projects
        .create_project(&NewProject::named("Lung nodules"), owner)
        .await
        .unwrap()
}

pub async fn assignment_rows(records: &Records, project_id: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM study_project_assignments WHERE project_id = ?")
        .bind(project_id)
        .fetch_one(&records.pool)
        .await
        .unwrap()
}
