//! # Imaging Records
//!
//! Records backend for medical imaging: versioned report ingestion with
//! content deduplication, projects with role-based membership, and batch
//! study assignment.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐
//! │  Importers  │──▶│ IngestEngine │──▶│    SQLite     │
//! │ (JSON/JSONL)│   │ hash+version │   │ reports+ledger│
//! └─────────────┘   └──────────────┘   └───────┬───────┘
//!                                              │
//!             ┌────────────────┬───────────────┤
//!             ▼                ▼               ▼
//!      ┌─────────────┐  ┌─────────────┐  ┌──────────┐
//!      │ProjectEngine│  │ Assignment  │  │   CLI    │
//!      │ roles/perms │  │   Engine    │  │  (irec)  │
//!      └─────────────┘  └─────────────┘  └──────────┘
//! ```
//!
//! Pure decision logic (hashing, version decisions, the permission table,
//! batch bucketing) lives in the storage-free `imaging-records-core` crate.
//! This crate applies those decisions inside SQLite transactions.
//!
//! ## Quick Start
//!
//! ```bash
//! irec init
//! irec ingest --file report.json
//! irec import reports.jsonl
//! irec history r1
//! irec project create "Lung nodules" --owner u1
//! irec studies add <project-id> --actor u1 E1 E2 E3
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Connection pool and time encoding |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Error type and transient/fatal classification |
//! | [`retry`] | Bounded exponential backoff |
//! | [`reports`] | Report store and version ledger reads |
//! | [`ingest`] | Deduplicating, versioning ingestion |
//! | [`directory`] | User directory and study registry seams |
//! | [`projects`] | Projects and membership |
//! | [`assignments`] | Study assignment and statistics |
//! | [`stats`] | Database overview |
//! | [`service`] | All engines behind one handle |
//! | [`logging`] | Tracing subscriber setup |

pub mod assignments;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod projects;
pub mod reports;
pub mod retry;
pub mod service;
pub mod stats;

pub use error::{Error, Result};
pub use service::Records;
