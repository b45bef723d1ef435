//! Domain error taxonomy.
//!
//! [`RecordsError`] covers every failure the engines can decide on their
//! own, without touching storage. Storage failures (lock timeouts, lost
//! connections) are classified by the native crate, which wraps this type.

use serde::Serialize;
use thiserror::Error;

use crate::models::Role;
use crate::permissions::Permission;

/// Coarse error category surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    PermissionDenied,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordsError {
    /// Malformed input: empty name, unknown role or status, bad page size.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("batch of {requested} exam ids exceeds the maximum of {max}")]
    BatchLimitExceeded { requested: usize, max: usize },

    #[error("report not found: {0}")]
    ReportNotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("user {user_id} is not a member of project {project_id}")]
    MemberNotFound { project_id: String, user_id: String },

    #[error("user {user_id} is already a member of project {project_id}")]
    DuplicateMember { project_id: String, user_id: String },

    #[error("the owner of project {project_id} cannot be removed")]
    OwnerRemoval { project_id: String },

    #[error("owner role cannot be changed through membership updates ({from} -> {to})")]
    OwnerRoleChange { from: Role, to: Role },

    #[error("only the owner of project {project_id} may change member roles (caller {user_id})")]
    OwnerRequired { project_id: String, user_id: String },

    #[error("user {user_id} lacks the {permission} permission on project {project_id}")]
    PermissionDenied {
        project_id: String,
        user_id: String,
        permission: Permission,
    },
}

impl RecordsError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::BatchLimitExceeded { .. } => ErrorKind::Validation,
            Self::ReportNotFound(_)
            | Self::ProjectNotFound(_)
            | Self::UserNotFound(_)
            | Self::MemberNotFound { .. } => ErrorKind::NotFound,
            Self::DuplicateMember { .. }
            | Self::OwnerRemoval { .. }
            | Self::OwnerRoleChange { .. } => ErrorKind::Conflict,
            Self::PermissionDenied { .. } | Self::OwnerRequired { .. } => {
                ErrorKind::PermissionDenied
            }
        }
    }
}
