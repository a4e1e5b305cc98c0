//! Tandem: a shared work queue for a human and an autonomous agent.
//!
//! One SQLite store, one strict permission model. The human steers; the
//! agent proposes and executes within the autonomy it was granted.
//!
//! # Core Rules
//!
//! - **No self-approval**: agent-authored tasks always enter `proposed` and
//!   need a human confirm before they are live.
//! - **One-way trust**: a task's autonomy level is fixed at creation and can
//!   only move down (to `collab`), automatically, after three failures.
//! - **Acyclic blocking**: a task may wait on another; the blocking graph
//!   can never contain a cycle, and completing a task unblocks its
//!   dependents in the same transaction.
//! - **Sanitized at the boundary**: no raw untrusted text is ever persisted.
//! - **Audited**: every mutation lands in the append-only audit log (or its
//!   in-store fallback table when the log is unreachable).
//!
//! # Architecture
//!
//! - [`core`]: store handle, connection bootstrap, schemas, errors,
//!   sanitizer, identifier generator, config/advisory locks, audit queue.
//! - [`plugins`]: the task store itself and the inbox readiness engine.
//!
//! # Examples
//!
//! ```bash
//! # Initialize a store in the current directory
//! tandem init
//!
//! # Add a task as the human (live immediately)
//! tandem task add "Ship the release notes" --urgency now
//!
//! # Agent proposes work (enters review)
//! tandem task add "Refactor the parser" --actor agent --autonomy auto
//!
//! # See what is actionable
//! tandem inbox
//! ```

pub mod core;
pub mod plugins;

use crate::core::{config, db, error::TandemError, store::Store, time};
use crate::plugins::{inbox, tasks};

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(
    name = "tandem",
    version = env!("CARGO_PKG_VERSION"),
    about = "A local-first work queue shared by a human and an autonomous agent."
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a tandem store under the current (or given) directory.
    Init(InitCli),
    /// Manage work items.
    Task(tasks::TaskCli),
    /// Partition live tasks into actionable buckets.
    Inbox(inbox::InboxCli),
    /// Read or write store configuration keys.
    Config(ConfigCli),
    /// Acquire or release a named advisory lock.
    Lock(LockCli),
    /// Print version.
    Version,
}

#[derive(clap::Args, Debug)]
struct InitCli {
    /// Directory to initialize (defaults to current working directory).
    #[clap(short, long)]
    dir: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct ConfigCli {
    #[clap(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print a config value.
    Get {
        #[clap(value_name = "KEY")]
        key: String,
    },
    /// Set a config value.
    Set {
        #[clap(value_name = "KEY")]
        key: String,
        #[clap(value_name = "VALUE")]
        value: String,
    },
}

#[derive(clap::Args, Debug)]
struct LockCli {
    #[clap(subcommand)]
    command: LockCommand,
}

#[derive(Subcommand, Debug)]
enum LockCommand {
    /// Try to take a named lock; fails if another holder has it.
    Acquire {
        #[clap(value_name = "NAME")]
        name: String,
        #[clap(long)]
        holder: String,
    },
    /// Release a named lock held by --holder.
    Release {
        #[clap(value_name = "NAME")]
        name: String,
        #[clap(long)]
        holder: String,
    },
}

/// Store data directory relative to a project root.
fn store_data_dir(base: &Path) -> PathBuf {
    base.join(".tandem").join("data")
}

/// Walk upward from `start` looking for an existing store.
fn find_store_root(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(path) = current {
        let candidate = store_data_dir(path);
        if candidate.exists() {
            return Some(candidate);
        }
        current = path.parent();
    }
    None
}

fn open_existing_store() -> Result<Store, TandemError> {
    let cwd = std::env::current_dir()?;
    let root = find_store_root(&cwd).ok_or_else(|| {
        TandemError::Validation(
            "no tandem store found in this directory or any parent; run `tandem init` first"
                .to_string(),
        )
    })?;
    Store::open(root)
}

pub fn run() -> Result<(), TandemError> {
    let cli = Cli::parse();
    match cli.command {
        Command::Version => {
            println!("v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Init(args) => {
            let base = match args.dir {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            let root = store_data_dir(&base);
            let store = Store::open(&root)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&time::command_envelope(
                    "init",
                    "ok",
                    serde_json::json!({ "root": store.root.to_string_lossy() }),
                ))
                .unwrap_or_default()
            );
            Ok(())
        }
        Command::Task(task_cli) => {
            let store = open_existing_store()?;
            tasks::run_task_cli(&store, task_cli)
        }
        Command::Inbox(inbox_cli) => {
            let store = open_existing_store()?;
            inbox::run_inbox_cli(&store, inbox_cli)
        }
        Command::Config(config_cli) => {
            let store = open_existing_store()?;
            let conn = db::db_connect(&store.tasks_db_path().to_string_lossy())?;
            match config_cli.command {
                ConfigCommand::Get { key } => {
                    match config::get(&conn, &key)? {
                        Some(value) => println!("{value}"),
                        None => println!(),
                    }
                    Ok(())
                }
                ConfigCommand::Set { key, value } => {
                    config::set(&conn, &key, &value)?;
                    store.submit_audit(
                        "config.set",
                        "human",
                        None,
                        serde_json::json!({ "key": key }),
                    );
                    Ok(())
                }
            }
        }
        Command::Lock(lock_cli) => {
            let store = open_existing_store()?;
            let conn = db::db_connect(&store.tasks_db_path().to_string_lossy())?;
            match lock_cli.command {
                LockCommand::Acquire { name, holder } => {
                    if config::acquire_lock(&conn, &name, &holder)? {
                        println!("acquired '{name}'");
                        Ok(())
                    } else {
                        let current = config::lock_holder(&conn, &name)?;
                        Err(TandemError::Validation(format!(
                            "lock '{name}' is held by '{}'",
                            current.unwrap_or_default()
                        )))
                    }
                }
                LockCommand::Release { name, holder } => {
                    if config::release_lock(&conn, &name, &holder)? {
                        println!("released '{name}'");
                        Ok(())
                    } else {
                        Err(TandemError::Validation(format!(
                            "lock '{name}' is not held by '{holder}'"
                        )))
                    }
                }
            }
        }
    }
}
