//! Projects and role-based membership.
//!
//! Every mutation runs in one transaction whose first statement locks the
//! project row ([`lock_project`]), then checks the acting user's
//! capability ([`require_permission`]) before touching anything. The
//! capability table itself lives in
//! [`imaging_records_core::permissions`].
//!
//! Ownership is fixed at creation: there is exactly one owner member per
//! project, it cannot be removed, and no role change can move a member
//! into or out of `owner`.

use std::collections::BTreeSet;
use std::sync::Arc;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;
use uuid::Uuid;

use imaging_records_core::models::{
    normalize_tags, validate_project_name, MemberDetail, Metadata, NewProject, Project,
    ProjectMember, ProjectStatus, ProjectUpdate, Role,
};
use imaging_records_core::permissions::{self, Permission};
use imaging_records_core::RecordsError;

use crate::config::Config;
use crate::db::{self, decode_json, from_millis, millis};
use crate::directory::UserDirectory;
use crate::error::{Error, Result};
use crate::retry::{retry_transient, BackoffPolicy};
use crate::service::Records;

const PROJECT_COLUMNS: &str = "id, name, description, status, tags_json, study_count, created_by, \
     settings_json, metadata_json, created_at, updated_at";

#[derive(Clone)]
pub struct ProjectEngine {
    pool: SqlitePool,
    users: Arc<dyn UserDirectory>,
    backoff: BackoffPolicy,
}

impl ProjectEngine {
    pub fn new(pool: SqlitePool, users: Arc<dyn UserDirectory>, backoff: BackoffPolicy) -> Self {
        Self {
            pool,
            users,
            backoff,
        }
    }

    /// Create a project and its owner membership atomically.
    pub async fn create_project(&self, new: &NewProject, owner_id: &str) -> Result<Project> {
        let name = validate_project_name(&new.name)?;
        if self.users.find_user(owner_id).await?.is_none() {
            return Err(RecordsError::UserNotFound(owner_id.to_string()).into());
        }

        let now = db::now();
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name,
            description: new.description.clone().unwrap_or_default(),
            status: new.status.unwrap_or_default(),
            tags: normalize_tags(&new.tags),
            study_count: 0,
            created_by: owner_id.to_string(),
            settings: new.settings.clone().unwrap_or_default(),
            metadata: new.metadata.clone().unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };

        retry_transient(&self.backoff, "create_project", || {
            self.create_project_once(&project)
        })
        .await?;

        info!(project = %project.id, owner = owner_id, name = %project.name, "project created");
        Ok(project)
    }

    async fn create_project_once(&self, project: &Project) -> Result<()> {
        let tags_json = encode_json("tags", &project.tags)?;
        let settings_json = encode_json("settings", &project.settings)?;
        let metadata_json = encode_json("metadata", &project.metadata)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO projects ({PROJECT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.status.as_str())
        .bind(tags_json)
        .bind(project.study_count)
        .bind(&project.created_by)
        .bind(settings_json)
        .bind(metadata_json)
        .bind(millis(project.created_at))
        .bind(millis(project.updated_at))
        .execute(&mut *tx)
        .await?;

        insert_member(&mut tx, &project.id, &project.created_by, Role::Owner, project.created_at)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Project> {
        let mut conn = self.pool.acquire().await?;
        fetch_project(&mut conn, project_id)
            .await?
            .ok_or_else(|| RecordsError::ProjectNotFound(project_id.to_string()).into())
    }

    /// Projects the user is a member of, most recently updated first.
    pub async fn list_projects_for_user(&self, user_id: &str) -> Result<Vec<(Project, Role)>> {
        let rows = sqlx::query(
            "SELECT p.id, p.name, p.description, p.status, p.tags_json, p.study_count, \
             p.created_by, p.settings_json, p.metadata_json, p.created_at, p.updated_at, m.role \
             FROM projects p JOIN project_members m ON m.project_id = p.id \
             WHERE m.user_id = ? ORDER BY p.updated_at DESC, p.id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let role: String = row.get("role");
                Ok((project_from_row(row)?, role.parse::<Role>()?))
            })
            .collect()
    }

    /// Apply a partial edit. Requires `edit`.
    pub async fn update_project(
        &self,
        project_id: &str,
        actor: &str,
        update: &ProjectUpdate,
    ) -> Result<Project> {
        if let Some(ref name) = update.name {
            validate_project_name(name)?;
        }
        retry_transient(&self.backoff, "update_project", || {
            self.update_project_once(project_id, actor, update)
        })
        .await
    }

    async fn update_project_once(
        &self,
        project_id: &str,
        actor: &str,
        update: &ProjectUpdate,
    ) -> Result<Project> {
        let mut tx = self.pool.begin().await?;
        lock_project(&mut tx, project_id).await?;
        require_permission(&mut tx, project_id, actor, Permission::Edit).await?;

        let mut project = fetch_project(&mut tx, project_id)
            .await?
            .ok_or_else(|| RecordsError::ProjectNotFound(project_id.to_string()))?;

        if let Some(ref name) = update.name {
            project.name = validate_project_name(name)?;
        }
        if let Some(ref description) = update.description {
            project.description = description.clone();
        }
        if let Some(status) = update.status {
            project.status = status;
        }
        if let Some(ref tags) = update.tags {
            project.tags = normalize_tags(tags);
        }
        if let Some(ref settings) = update.settings {
            project.settings = settings.clone();
        }
        project.updated_at = db::now();

        sqlx::query(
            "UPDATE projects SET name = ?, description = ?, status = ?, tags_json = ?, \
             settings_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.status.as_str())
        .bind(encode_json("tags", &project.tags)?)
        .bind(encode_json("settings", &project.settings)?)
        .bind(millis(project.updated_at))
        .bind(project_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(project = project_id, actor, "project updated");
        Ok(project)
    }

    /// Delete a project with its memberships and assignments. Requires
    /// `delete`.
    pub async fn delete_project(&self, project_id: &str, actor: &str) -> Result<()> {
        retry_transient(&self.backoff, "delete_project", || {
            self.delete_project_once(project_id, actor)
        })
        .await
    }

    async fn delete_project_once(&self, project_id: &str, actor: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        lock_project(&mut tx, project_id).await?;
        require_permission(&mut tx, project_id, actor, Permission::Delete).await?;

        sqlx::query("DELETE FROM study_project_assignments WHERE project_id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM project_members WHERE project_id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(project = project_id, actor, "project deleted");
        Ok(())
    }

    /// Add `user_id` with `role`. Requires `manage_members`; `owner` cannot
    /// be granted this way.
    pub async fn add_member(
        &self,
        project_id: &str,
        actor: &str,
        user_id: &str,
        role: Role,
    ) -> Result<ProjectMember> {
        if role == Role::Owner {
            return Err(RecordsError::validation(
                "the owner role is assigned at project creation and cannot be granted",
            )
            .into());
        }
        if self.users.find_user(user_id).await?.is_none() {
            return Err(RecordsError::UserNotFound(user_id.to_string()).into());
        }

        retry_transient(&self.backoff, "add_member", || {
            self.add_member_once(project_id, actor, user_id, role)
        })
        .await
    }

    async fn add_member_once(
        &self,
        project_id: &str,
        actor: &str,
        user_id: &str,
        role: Role,
    ) -> Result<ProjectMember> {
        let mut tx = self.pool.begin().await?;
        lock_project(&mut tx, project_id).await?;
        require_permission(&mut tx, project_id, actor, Permission::ManageMembers).await?;

        if member_role_in(&mut tx, project_id, user_id).await?.is_some() {
            return Err(duplicate(project_id, user_id));
        }

        let member = insert_member(&mut tx, project_id, user_id, role, db::now()).await?;
        tx.commit().await?;

        info!(project = project_id, user = user_id, role = %role, actor, "member added");
        Ok(member)
    }

    /// Remove a member. Members may always remove themselves; removing
    /// someone else requires `manage_members`. The owner is never removed.
    pub async fn remove_member(&self, project_id: &str, actor: &str, user_id: &str) -> Result<()> {
        retry_transient(&self.backoff, "remove_member", || {
            self.remove_member_once(project_id, actor, user_id)
        })
        .await
    }

    async fn remove_member_once(&self, project_id: &str, actor: &str, user_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        lock_project(&mut tx, project_id).await?;
        if actor != user_id {
            require_permission(&mut tx, project_id, actor, Permission::ManageMembers).await?;
        }

        match member_role_in(&mut tx, project_id, user_id).await? {
            None => {
                return Err(RecordsError::MemberNotFound {
                    project_id: project_id.to_string(),
                    user_id: user_id.to_string(),
                }
                .into())
            }
            Some(Role::Owner) => {
                return Err(RecordsError::OwnerRemoval {
                    project_id: project_id.to_string(),
                }
                .into())
            }
            Some(_) => {}
        }

        sqlx::query("DELETE FROM project_members WHERE project_id = ? AND user_id = ?")
            .bind(project_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(project = project_id, user = user_id, actor, "member removed");
        Ok(())
    }

    /// Change a non-owner member's role. Only the owner may call this.
    pub async fn update_member_role(
        &self,
        project_id: &str,
        actor: &str,
        user_id: &str,
        new_role: Role,
    ) -> Result<ProjectMember> {
        retry_transient(&self.backoff, "update_member_role", || {
            self.update_member_role_once(project_id, actor, user_id, new_role)
        })
        .await
    }

    async fn update_member_role_once(
        &self,
        project_id: &str,
        actor: &str,
        user_id: &str,
        new_role: Role,
    ) -> Result<ProjectMember> {
        let mut tx = self.pool.begin().await?;
        lock_project(&mut tx, project_id).await?;

        if member_role_in(&mut tx, project_id, actor).await? != Some(Role::Owner) {
            return Err(RecordsError::OwnerRequired {
                project_id: project_id.to_string(),
                user_id: actor.to_string(),
            }
            .into());
        }

        let Some(current) = member_role_in(&mut tx, project_id, user_id).await? else {
            return Err(RecordsError::MemberNotFound {
                project_id: project_id.to_string(),
                user_id: user_id.to_string(),
            }
            .into());
        };
        if current == Role::Owner || new_role == Role::Owner {
            return Err(RecordsError::OwnerRoleChange {
                from: current,
                to: new_role,
            }
            .into());
        }

        sqlx::query(
            "UPDATE project_members SET role = ?, permissions_json = ? \
             WHERE project_id = ? AND user_id = ?",
        )
        .bind(new_role.as_str())
        .bind(permissions_json(new_role)?)
        .bind(project_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let member = fetch_member(&mut tx, project_id, user_id)
            .await?
            .ok_or_else(|| RecordsError::MemberNotFound {
                project_id: project_id.to_string(),
                user_id: user_id.to_string(),
            })?;

        tx.commit().await?;
        info!(project = project_id, user = user_id, from = %current, to = %new_role, "member role changed");
        Ok(member)
    }

    /// Capabilities of `user_id` on the project; empty for non-members.
    pub async fn get_user_permissions(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<BTreeSet<Permission>> {
        Ok(permissions::permissions_for(
            self.member_role(project_id, user_id).await?,
        ))
    }

    /// Role of `user_id`, or `None` for non-members. Fails when the project
    /// does not exist.
    pub async fn member_role(&self, project_id: &str, user_id: &str) -> Result<Option<Role>> {
        let mut conn = self.pool.acquire().await?;
        ensure_project(&mut conn, project_id).await?;
        member_role_in(&mut conn, project_id, user_id).await
    }

    /// Members with resolved user details, owner first, then by join time.
    pub async fn list_members(&self, project_id: &str) -> Result<Vec<MemberDetail>> {
        let mut conn = self.pool.acquire().await?;
        ensure_project(&mut conn, project_id).await?;

        let rows = sqlx::query(
            "SELECT project_id, user_id, role, joined_at, permissions_json \
             FROM project_members WHERE project_id = ? \
             ORDER BY CASE role WHEN 'owner' THEN 0 ELSE 1 END, joined_at ASC, user_id ASC",
        )
        .bind(project_id)
        .fetch_all(&mut *conn)
        .await?;
        drop(conn);

        let members: Vec<ProjectMember> = rows.iter().map(member_from_row).collect::<Result<_>>()?;
        let ids: Vec<String> = members.iter().map(|m| m.user_id.clone()).collect();
        let users = self.users.find_users(&ids).await?;

        Ok(members
            .into_iter()
            .map(|member| {
                let user = users.get(&member.user_id);
                MemberDetail {
                    name: user.map(|u| u.name.clone()),
                    email: user.map(|u| u.email.clone()),
                    member,
                }
            })
            .collect())
    }
}

// ─── Transaction building blocks ────────────────────────────────────

/// Take the write lock through the project row.
pub(crate) async fn lock_project(conn: &mut SqliteConnection, project_id: &str) -> Result<()> {
    let result = sqlx::query("UPDATE projects SET id = id WHERE id = ?")
        .bind(project_id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(RecordsError::ProjectNotFound(project_id.to_string()).into());
    }
    Ok(())
}

/// Fail with `PermissionDenied` unless `user_id`'s role grants
/// `permission`. Returns the role on success.
pub(crate) async fn require_permission(
    conn: &mut SqliteConnection,
    project_id: &str,
    user_id: &str,
    permission: Permission,
) -> Result<Role> {
    match member_role_in(conn, project_id, user_id).await? {
        Some(role) if permissions::allows(Some(role), permission) => Ok(role),
        _ => Err(RecordsError::PermissionDenied {
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            permission,
        }
        .into()),
    }
}

pub(crate) async fn ensure_project(conn: &mut SqliteConnection, project_id: &str) -> Result<()> {
    let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM projects WHERE id = ?")
        .bind(project_id)
        .fetch_optional(&mut *conn)
        .await?;
    if exists.is_none() {
        return Err(RecordsError::ProjectNotFound(project_id.to_string()).into());
    }
    Ok(())
}

async fn member_role_in(
    conn: &mut SqliteConnection,
    project_id: &str,
    user_id: &str,
) -> Result<Option<Role>> {
    let role: Option<String> =
        sqlx::query_scalar("SELECT role FROM project_members WHERE project_id = ? AND user_id = ?")
            .bind(project_id)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;
    role.map(|r| r.parse::<Role>().map_err(Error::from)).transpose()
}

async fn insert_member(
    conn: &mut SqliteConnection,
    project_id: &str,
    user_id: &str,
    role: Role,
    joined_at: chrono::DateTime<chrono::Utc>,
) -> Result<ProjectMember> {
    sqlx::query(
        "INSERT INTO project_members (project_id, user_id, role, joined_at, permissions_json) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(project_id)
    .bind(user_id)
    .bind(role.as_str())
    .bind(millis(joined_at))
    .bind(permissions_json(role)?)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if crate::error::is_unique_violation(&e) {
            duplicate(project_id, user_id)
        } else {
            Error::from(e)
        }
    })?;

    Ok(ProjectMember {
        project_id: project_id.to_string(),
        user_id: user_id.to_string(),
        role,
        joined_at,
        permissions: role_permission_names(role),
    })
}

async fn fetch_member(
    conn: &mut SqliteConnection,
    project_id: &str,
    user_id: &str,
) -> Result<Option<ProjectMember>> {
    let row = sqlx::query(
        "SELECT project_id, user_id, role, joined_at, permissions_json \
         FROM project_members WHERE project_id = ? AND user_id = ?",
    )
    .bind(project_id)
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(member_from_row).transpose()
}

pub(crate) async fn fetch_project(
    conn: &mut SqliteConnection,
    project_id: &str,
) -> Result<Option<Project>> {
    let row = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?"))
        .bind(project_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(project_from_row).transpose()
}

fn duplicate(project_id: &str, user_id: &str) -> Error {
    RecordsError::DuplicateMember {
        project_id: project_id.to_string(),
        user_id: user_id.to_string(),
    }
    .into()
}

fn role_permission_names(role: Role) -> Vec<String> {
    permissions::role_permissions(role)
        .iter()
        .map(|p| p.as_str().to_string())
        .collect()
}

fn permissions_json(role: Role) -> Result<String> {
    encode_json("permissions", &role_permission_names(role))
}

fn encode_json<T: serde::Serialize + ?Sized>(field: &'static str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::encode(field, e))
}

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    let status: String = row.get("status");
    let tags_json: String = row.get("tags_json");
    let settings_json: String = row.get("settings_json");
    let metadata_json: String = row.get("metadata_json");

    Ok(Project {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        status: status.parse::<ProjectStatus>()?,
        tags: decode_json("tags_json", &tags_json)?,
        study_count: row.get("study_count"),
        created_by: row.get("created_by"),
        settings: decode_json::<Metadata>("settings_json", &settings_json)?,
        metadata: decode_json::<Metadata>("metadata_json", &metadata_json)?,
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    })
}

fn member_from_row(row: &SqliteRow) -> Result<ProjectMember> {
    let role: String = row.get("role");
    let permissions_json: String = row.get("permissions_json");
    Ok(ProjectMember {
        project_id: row.get("project_id"),
        user_id: row.get("user_id"),
        role: role.parse::<Role>()?,
        joined_at: from_millis(row.get("joined_at")),
        permissions: decode_json("permissions_json", &permissions_json)?,
    })
}

// ─── CLI runners ────────────────────────────────────────────────────

fn print_project(project: &Project) {
    println!("--- Project ---");
    println!("id:           {}", project.id);
    println!("name:         {}", project.name);
    if !project.description.is_empty() {
        println!("description:  {}", project.description);
    }
    println!("status:       {}", project.status.as_str());
    if !project.tags.is_empty() {
        println!("tags:         {}", project.tags.join(", "));
    }
    println!("studies:      {}", project.study_count);
    println!("created_by:   {}", project.created_by);
    println!("created_at:   {}", project.created_at.to_rfc3339());
    println!("updated_at:   {}", project.updated_at.to_rfc3339());
}

/// `irec project create`
pub async fn run_project_create(
    config: &Config,
    owner: &str,
    new: &NewProject,
) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let project = records.projects.create_project(new, owner).await;
    records.close().await;
    print_project(&project?);
    Ok(())
}

/// `irec project show`
pub async fn run_project_show(config: &Config, project_id: &str) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let project = records.projects.get_project(project_id).await;
    records.close().await;
    print_project(&project?);
    Ok(())
}

/// `irec project list`
pub async fn run_project_list(config: &Config, user_id: &str) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let projects = records.projects.list_projects_for_user(user_id).await;
    records.close().await;
    let projects = projects?;

    if projects.is_empty() {
        println!("No projects for {}.", user_id);
        return Ok(());
    }

    println!("{:<38} {:<8} {:<10} {:<8} NAME", "ID", "ROLE", "STATUS", "STUDIES");
    for (p, role) in &projects {
        println!(
            "{:<38} {:<8} {:<10} {:<8} {}",
            p.id,
            role.as_str(),
            p.status.as_str(),
            p.study_count,
            p.name
        );
    }
    Ok(())
}

/// `irec project delete`
pub async fn run_project_delete(config: &Config, project_id: &str, actor: &str) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let result = records.projects.delete_project(project_id, actor).await;
    records.close().await;
    result?;
    println!("deleted project {}", project_id);
    Ok(())
}

/// `irec member add`
pub async fn run_member_add(
    config: &Config,
    project_id: &str,
    actor: &str,
    user_id: &str,
    role: Role,
) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let member = records
        .projects
        .add_member(project_id, actor, user_id, role)
        .await;
    records.close().await;
    let member = member?;
    println!(
        "added {} to {} as {} ({})",
        member.user_id,
        member.project_id,
        member.role,
        member.permissions.join(", ")
    );
    Ok(())
}

/// `irec member remove`
pub async fn run_member_remove(
    config: &Config,
    project_id: &str,
    actor: &str,
    user_id: &str,
) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let result = records
        .projects
        .remove_member(project_id, actor, user_id)
        .await;
    records.close().await;
    result?;
    println!("removed {} from {}", user_id, project_id);
    Ok(())
}

/// `irec member role`
pub async fn run_member_role(
    config: &Config,
    project_id: &str,
    actor: &str,
    user_id: &str,
    role: Role,
) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let member = records
        .projects
        .update_member_role(project_id, actor, user_id, role)
        .await;
    records.close().await;
    let member = member?;
    println!("{} is now {} on {}", member.user_id, member.role, member.project_id);
    Ok(())
}

/// `irec member list`
pub async fn run_member_list(config: &Config, project_id: &str) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let members = records.projects.list_members(project_id).await;
    records.close().await;
    let members = members?;

    println!("{:<20} {:<8} {:<24} EMAIL", "USER", "ROLE", "NAME");
    for m in &members {
        println!(
            "{:<20} {:<8} {:<24} {}",
            m.member.user_id,
            m.member.role.as_str(),
            m.name.as_deref().unwrap_or("-"),
            m.email.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// `irec perms`
pub async fn run_perms(config: &Config, project_id: &str, user_id: &str) -> anyhow::Result<()> {
    let records = Records::connect(config).await?;
    let perms = records
        .projects
        .get_user_permissions(project_id, user_id)
        .await;
    records.close().await;
    let perms = perms?;

    if perms.is_empty() {
        println!("{} has no permissions on {}", user_id, project_id);
    } else {
        let names: Vec<&str> = perms.iter().map(|p| p.as_str()).collect();
        println!("{}", names.join(" "));
    }
    Ok(())
}
