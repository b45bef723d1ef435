//! # Imaging Records CLI (`irec`)
//!
//! The `irec` binary drives every engine: database setup, report ingestion
//! and history, projects and membership, and study assignment.
//!
//! ## Usage
//!
//! ```bash
//! irec --config ./config/irec.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `irec init` | Create the SQLite database and run schema migrations |
//! | `irec ingest` | Ingest one report (JSON from `--file` or stdin) |
//! | `irec import <jsonl>` | Ingest one report per line |
//! | `irec get <id>` | Show the latest state of a report |
//! | `irec history <id>` | Show a report's version ledger |
//! | `irec reports` | List reports, most recently updated first |
//! | `irec stats` | Row counts and database size |
//! | `irec user add` / `irec study add` | Seed the built-in directory |
//! | `irec project ...` | Create, show, list, delete projects |
//! | `irec member ...` | Add, remove, re-role, list members |
//! | `irec perms <project> <user>` | Show a user's capabilities |
//! | `irec studies ...` | Assign, unassign, list studies; statistics |
//! | `irec completions <shell>` | Print shell completions |

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use imaging_records::{
    assignments, config, directory, ingest, logging, migrate, projects, reports, stats,
};
use imaging_records_core::models::{NewProject, ProjectStatus, Role, Study};

/// Imaging Records CLI: versioned report ingestion, projects, and study
/// assignment.
///
/// All commands except `completions` read a TOML configuration file given
/// by `--config`.
#[derive(Parser)]
#[command(
    name = "irec",
    about = "Imaging Records — versioned report ingestion, projects, and study assignment",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/irec.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Ingest one report.
    ///
    /// Reads a JSON object with `uid`, `title`, `content`, `report_type`
    /// and optional `source_url`, `verified_at`, `report_id`, `chr_no`,
    /// `mod`, `report_date`, `metadata`. Prints the ingestion receipt.
    Ingest {
        /// Read the request from this file instead of stdin.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Ingest newline-delimited JSON reports.
    Import {
        /// Path to a JSONL file, one ingest request per line.
        path: PathBuf,
    },

    /// Show a report by uid or report_id.
    Get {
        id: String,
        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show a report's version history, newest first.
    History {
        id: String,
        #[arg(long)]
        json: bool,
    },

    /// List reports, most recently updated first.
    Reports {
        /// Only reports of this type.
        #[arg(long = "type")]
        report_type: Option<String>,
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "25")]
        page_size: u32,
    },

    /// Show database statistics.
    Stats,

    /// Manage users in the built-in directory.
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Manage studies in the built-in registry.
    Study {
        #[command(subcommand)]
        action: StudyAction,
    },

    /// Create, inspect, and delete projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Manage project membership.
    Member {
        #[command(subcommand)]
        action: MemberAction,
    },

    /// Print the capabilities a user holds on a project.
    Perms { project: String, user: String },

    /// Assign studies to projects.
    Studies {
        #[command(subcommand)]
        action: StudiesAction,
    },

    /// Print shell completions to stdout.
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum UserAction {
    /// Register or update a user.
    Add {
        user_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },
}

#[derive(Subcommand)]
enum StudyAction {
    /// Register or update a study.
    Add {
        exam_id: String,
        #[arg(long)]
        patient: String,
        /// Imaging modality (CT, MR, CR, ...).
        #[arg(long = "mod")]
        modality: Option<String>,
        /// Order time, RFC 3339.
        #[arg(long)]
        ordered: Option<DateTime<Utc>>,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project owned by `--owner`.
    Create {
        name: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        description: Option<String>,
        /// Repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        status: Option<ProjectStatus>,
    },
    Show {
        id: String,
    },
    /// List the projects a user belongs to.
    List {
        #[arg(long)]
        user: String,
    },
    /// Delete a project (owner only).
    Delete {
        id: String,
        #[arg(long)]
        actor: String,
    },
}

#[derive(Subcommand)]
enum MemberAction {
    Add {
        project: String,
        user: String,
        #[arg(long, default_value = "viewer")]
        role: Role,
        #[arg(long)]
        actor: String,
    },
    Remove {
        project: String,
        user: String,
        #[arg(long)]
        actor: String,
    },
    /// Change a member's role (owner only).
    Role {
        project: String,
        user: String,
        role: Role,
        #[arg(long)]
        actor: String,
    },
    List {
        project: String,
    },
}

#[derive(Subcommand)]
enum StudiesAction {
    Add {
        project: String,
        #[arg(long)]
        actor: String,
        #[arg(required = true)]
        exam_ids: Vec<String>,
    },
    Remove {
        project: String,
        #[arg(long)]
        actor: String,
        #[arg(required = true)]
        exam_ids: Vec<String>,
    },
    List {
        project: String,
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "25")]
        page_size: u32,
    },
    Stats {
        project: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "irec", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file } => {
            ingest::run_ingest(&cfg, file.as_deref()).await?;
        }
        Commands::Import { path } => {
            ingest::run_import(&cfg, &path).await?;
        }
        Commands::Get { id, json } => {
            reports::run_get(&cfg, &id, json).await?;
        }
        Commands::History { id, json } => {
            reports::run_history(&cfg, &id, json).await?;
        }
        Commands::Reports {
            report_type,
            page,
            page_size,
        } => {
            reports::run_list(&cfg, report_type.as_deref(), page, page_size).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::User { action } => match action {
            UserAction::Add {
                user_id,
                name,
                email,
            } => {
                directory::run_user_add(&cfg, &user_id, &name, &email).await?;
            }
        },
        Commands::Study { action } => match action {
            StudyAction::Add {
                exam_id,
                patient,
                modality,
                ordered,
            } => {
                let study = Study {
                    exam_id,
                    patient_name: patient,
                    modality,
                    order_datetime: ordered,
                };
                directory::run_study_add(&cfg, &study).await?;
            }
        },
        Commands::Project { action } => match action {
            ProjectAction::Create {
                name,
                owner,
                description,
                tags,
                status,
            } => {
                let new = NewProject {
                    description,
                    tags,
                    status,
                    ..NewProject::named(name)
                };
                projects::run_project_create(&cfg, &owner, &new).await?;
            }
            ProjectAction::Show { id } => {
                projects::run_project_show(&cfg, &id).await?;
            }
            ProjectAction::List { user } => {
                projects::run_project_list(&cfg, &user).await?;
            }
            ProjectAction::Delete { id, actor } => {
                projects::run_project_delete(&cfg, &id, &actor).await?;
            }
        },
        Commands::Member { action } => match action {
            MemberAction::Add {
                project,
                user,
                role,
                actor,
            } => {
                projects::run_member_add(&cfg, &project, &actor, &user, role).await?;
            }
            MemberAction::Remove {
                project,
                user,
                actor,
            } => {
                projects::run_member_remove(&cfg, &project, &actor, &user).await?;
            }
            MemberAction::Role {
                project,
                user,
                role,
                actor,
            } => {
                projects::run_member_role(&cfg, &project, &actor, &user, role).await?;
            }
            MemberAction::List { project } => {
                projects::run_member_list(&cfg, &project).await?;
            }
        },
        Commands::Perms { project, user } => {
            projects::run_perms(&cfg, &project, &user).await?;
        }
        Commands::Studies { action } => match action {
            StudiesAction::Add {
                project,
                actor,
                exam_ids,
            } => {
                assignments::run_studies_add(&cfg, &project, &actor, &exam_ids).await?;
            }
            StudiesAction::Remove {
                project,
                actor,
                exam_ids,
            } => {
                assignments::run_studies_remove(&cfg, &project, &actor, &exam_ids).await?;
            }
            StudiesAction::List {
                project,
                page,
                page_size,
            } => {
                assignments::run_studies_list(&cfg, &project, page, page_size).await?;
            }
            StudiesAction::Stats { project } => {
                assignments::run_studies_stats(&cfg, &project).await?;
            }
        },
        Commands::Completions { .. } => {}
    }

    Ok(())
}
