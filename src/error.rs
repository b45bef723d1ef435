//! Error type for the storage-backed engines.
//!
//! Wraps the domain taxonomy from [`imaging_records_core::RecordsError`]
//! and classifies `sqlx` failures:
//!
//! | Variant | Cause | Retried |
//! |---------|-------|---------|
//! | [`Error::Records`] | validation, not found, conflict, permission | no |
//! | [`Error::Transient`] | `SQLITE_BUSY`/`SQLITE_LOCKED` (any extended code), pool timeout | yes |
//! | [`Error::Contention`] | lost optimistic guard or insert race on a hot row | yes |
//! | [`Error::Storage`] | anything else from the database | no |
//! | [`Error::Serialization`] | open map could not be encoded | no |
//! | [`Error::Decode`] | stored JSON column could not be decoded | no |
//! | [`Error::Io`] | import input could not be read | no |

use imaging_records_core::{ErrorKind, RecordsError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Records(#[from] RecordsError),

    #[error("transient storage failure: {0}")]
    Transient(#[source] sqlx::Error),

    #[error("concurrent write on {0}; retry the operation")]
    Contention(String),

    #[error("storage failure: {0}")]
    Storage(#[source] sqlx::Error),

    #[error("failed to encode {field}: {source}")]
    Serialization {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt {column} in stored row: {source}")]
    Decode {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether re-running the whole operation from scratch may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Contention(_))
    }

    /// Domain category, if this is a domain error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Records(e) => Some(e.kind()),
            _ => None,
        }
    }

    /// The wrapped domain error, if any.
    pub fn records(&self) -> Option<&RecordsError> {
        match self {
            Self::Records(e) => Some(e),
            _ => None,
        }
    }

    /// Map a failed insert on a hot row: a unique violation means another
    /// writer got there first.
    pub(crate) fn from_insert_race(err: sqlx::Error, what: impl Into<String>) -> Self {
        if is_unique_violation(&err) {
            Self::Contention(what.into())
        } else {
            Self::from(err)
        }
    }

    pub(crate) fn encode(field: &'static str, source: serde_json::Error) -> Self {
        Self::Serialization { field, source }
    }

    pub(crate) fn decode(column: &'static str, source: serde_json::Error) -> Self {
        Self::Decode { column, source }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if is_transient_sqlx(&err) {
            Self::Transient(err)
        } else {
            Self::Storage(err)
        }
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| {
                // Primary result code lives in the low byte.
                matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)
            }),
        _ => false,
    }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
