//! # Imaging Records Core
//!
//! Storage-free logic for Imaging Records: data models, content hashing,
//! the report version decision function, the role→permission table, and
//! batch study-assignment bookkeeping.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! runtime dependencies. Every function here is deterministic given its
//! inputs (callers pass `now` explicitly), which keeps the hard decisions
//! of the ingestion and assignment engines unit-testable without a
//! database.

pub mod batch;
pub mod error;
pub mod hash;
pub mod models;
pub mod page;
pub mod permissions;
pub mod versioning;

pub use error::{ErrorKind, RecordsError};
pub use page::Page;
