//! The task store: state machine, permission model, blocking graph, rate
//! limiting, and the filtered read surface.
//!
//! Every mutating operation runs inside one IMMEDIATE transaction, appends a
//! history row, and (after commit) submits an audit record. All validation
//! happens before the first write; a rejected operation leaves no partial
//! rows behind.

use crate::core::config;
use crate::core::db;
use crate::core::error::{self, TandemError};
use crate::core::ident;
use crate::core::sanitize;
use crate::core::store::Store;
use crate::core::time::{date_stamp, new_event_id, now_epoch_z, now_unix_secs, parse_epoch_z};
use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, types::ToSql};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;

pub const STATUS_PROPOSED: &str = "proposed";
pub const STATUS_TODO: &str = "todo";
pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_DONE: &str = "done";
pub const STATUS_ARCHIVED: &str = "archived";

pub const AUTONOMY_AUTO: &str = "auto";
pub const AUTONOMY_AUTO_NOTIFY: &str = "auto-notify";
pub const AUTONOMY_COLLAB: &str = "collab";

/// Attempts at which autonomy is demoted and retries stop.
pub const MAX_ATTEMPTS: i64 = 3;
/// A failed task may not be retried again within this window.
pub const RETRY_COOLDOWN_SECS: u64 = 3600;
/// At most this many agent-authored tasks may sit in `proposed` at once.
pub const PROPOSAL_CAP: i64 = 5;
/// Minimum spacing between agent proposal creations, tracked globally.
pub const PROPOSAL_WINDOW_SECS: u64 = 60;
pub const LAST_AGENT_PROPOSAL_KEY: &str = "last_agent_proposal_at";

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Who performed an operation; recorded in history and audit rows, and the
/// deciding input for a new task's initial status.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Human,
    Agent,
}

impl Actor {
    pub fn as_str(self) -> &'static str {
        match self {
            Actor::Human => "human",
            Actor::Agent => "agent",
        }
    }
}

#[derive(Parser, Debug)]
#[clap(name = "task", about = "Manage work items in the tandem queue.")]
pub struct TaskCli {
    /// Output format for this command group.
    #[clap(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
    #[clap(subcommand)]
    command: TaskCommand,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    /// Add a new task.
    Add {
        /// Task text (positional argument)
        #[clap(value_name = "TEXT")]
        text: String,
        #[clap(long, value_enum, default_value = "human")]
        actor: Actor,
        #[clap(long, default_value = "collab", value_parser = validate_autonomy)]
        autonomy: String,
        #[clap(long, default_value = "whenever", value_parser = validate_urgency)]
        urgency: String,
        /// Project tag (+name)
        #[clap(long)]
        project: Option<String>,
        /// Context tag (@name)
        #[clap(long)]
        context: Option<String>,
        /// Due date (YYYY-MM-DD)
        #[clap(long)]
        due: Option<String>,
        /// Id (or unique prefix) of a task this one must wait on.
        #[clap(long)]
        blocked_by: Option<String>,
        /// Accepted for compatibility and ignored: agent-authored tasks
        /// always enter review as 'proposed'.
        #[clap(long)]
        confirmed: bool,
    },
    /// List tasks.
    List {
        #[clap(long)]
        status: Option<String>,
        #[clap(long)]
        autonomy: Option<String>,
        #[clap(long)]
        urgency: Option<String>,
        #[clap(long)]
        project: Option<String>,
        #[clap(long)]
        added_by: Option<String>,
        /// Only tasks waiting on an unfinished blocker.
        #[clap(long)]
        blocked: bool,
        /// Only unblocked tasks in 'todo'.
        #[clap(long)]
        ready: bool,
    },
    /// Get a task by id or unique prefix.
    Get {
        #[clap(long)]
        id: String,
    },
    /// Start a task (todo -> in_progress).
    Start {
        #[clap(long)]
        id: String,
        #[clap(long, value_enum, default_value = "human")]
        actor: Actor,
    },
    /// Complete a task; anything it was blocking becomes unblocked.
    Done {
        #[clap(long)]
        id: String,
        #[clap(long, value_enum, default_value = "human")]
        actor: Actor,
    },
    /// Record a failed attempt; the task returns to 'todo'.
    Fail {
        #[clap(long)]
        id: String,
        #[clap(long, value_enum, default_value = "agent")]
        actor: Actor,
        #[clap(long)]
        reason: Option<String>,
    },
    /// Atomically check retry eligibility and reserve the task.
    Retry {
        #[clap(long)]
        id: String,
        #[clap(long, value_enum, default_value = "agent")]
        actor: Actor,
    },
    /// Confirm a proposal (proposed -> todo).
    Confirm {
        #[clap(long)]
        id: String,
        #[clap(long, value_enum, default_value = "human")]
        actor: Actor,
    },
    /// Reject a proposal (proposed -> archived).
    Reject {
        #[clap(long)]
        id: String,
        #[clap(long, value_enum, default_value = "human")]
        actor: Actor,
        #[clap(long)]
        reason: Option<String>,
    },
    /// Archive a task.
    Archive {
        #[clap(long)]
        id: String,
        #[clap(long, value_enum, default_value = "human")]
        actor: Actor,
    },
    /// Bring an archived task back to 'todo'.
    Unarchive {
        #[clap(long)]
        id: String,
        #[clap(long, value_enum, default_value = "human")]
        actor: Actor,
    },
    /// Block a task on another task.
    Block {
        #[clap(long)]
        id: String,
        /// The task to wait on.
        #[clap(long)]
        on: String,
        #[clap(long, value_enum, default_value = "human")]
        actor: Actor,
    },
    /// Clear a task's blocker.
    Unblock {
        #[clap(long)]
        id: String,
        #[clap(long, value_enum, default_value = "human")]
        actor: Actor,
    },
    /// Append a date-stamped note to a task.
    Note {
        #[clap(long)]
        id: String,
        #[clap(value_name = "NOTE")]
        note: String,
        #[clap(long, value_enum, default_value = "human")]
        actor: Actor,
    },
    /// Edit allowlisted fields (text, urgency, project, context, due).
    Edit {
        #[clap(long)]
        id: String,
        /// Field update, repeatable: --set urgency=now --set due=2026-09-01
        #[clap(long = "set", value_name = "KEY=VALUE", required = true)]
        set: Vec<String>,
        #[clap(long, value_enum, default_value = "human")]
        actor: Actor,
    },
    /// Show a task's history, oldest first.
    History {
        #[clap(long)]
        id: String,
    },
    /// Complete every eligible task matching the filter, in one transaction.
    CompleteAll {
        #[clap(long)]
        status: Option<String>,
        #[clap(long)]
        urgency: Option<String>,
        #[clap(long)]
        project: Option<String>,
        #[clap(long, value_enum, default_value = "human")]
        actor: Actor,
    },
    /// Archive every eligible task matching the filter, in one transaction.
    ArchiveAll {
        #[clap(long)]
        status: Option<String>,
        #[clap(long)]
        urgency: Option<String>,
        #[clap(long)]
        project: Option<String>,
        #[clap(long, value_enum, default_value = "human")]
        actor: Actor,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Task {
    pub id: String,
    pub text: String,
    pub status: String,
    pub autonomy: String,
    pub urgency: String,
    pub project: Option<String>,
    pub context: Option<String>,
    pub due_date: Option<String>,
    pub blocked_by: Option<String>,
    pub added_by: String,
    pub notes: String,
    pub attempts: i64,
    pub last_attempt_at: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HistoryEntry {
    pub id: String,
    pub task_id: String,
    pub action: String,
    pub actor: String,
    pub ts: String,
    pub note: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Parameters for [`create_task`]. `confirmed` is accepted and deliberately
/// ignored: an agent cannot approve its own proposal.
#[derive(Debug, Clone)]
pub struct CreateTask {
    pub text: String,
    pub autonomy: String,
    pub urgency: String,
    pub project: Option<String>,
    pub context: Option<String>,
    pub due_date: Option<String>,
    pub blocked_by: Option<String>,
    pub confirmed: bool,
}

impl Default for CreateTask {
    fn default() -> Self {
        Self {
            text: String::new(),
            autonomy: AUTONOMY_COLLAB.to_string(),
            urgency: "whenever".to_string(),
            project: None,
            context: None,
            due_date: None,
            blocked_by: None,
            confirmed: false,
        }
    }
}

/// Filter set for [`list_tasks`] and the bulk operations.
#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub status: Option<String>,
    pub autonomy: Option<String>,
    pub urgency: Option<String>,
    pub project: Option<String>,
    pub added_by: Option<String>,
    pub blocked: Option<bool>,
    pub ready: Option<bool>,
}

fn validate_autonomy(s: &str) -> Result<String, String> {
    match s {
        AUTONOMY_AUTO | AUTONOMY_AUTO_NOTIFY | AUTONOMY_COLLAB => Ok(s.to_string()),
        _ => Err(format!(
            "autonomy must be one of: {AUTONOMY_AUTO}, {AUTONOMY_AUTO_NOTIFY}, {AUTONOMY_COLLAB}"
        )),
    }
}

fn validate_urgency(s: &str) -> Result<String, String> {
    match s {
        "now" | "soon" | "whenever" | "someday" => Ok(s.to_string()),
        _ => Err("urgency must be one of: now, soon, whenever, someday".to_string()),
    }
}

fn connect(store: &Store) -> Result<Connection, TandemError> {
    db::db_connect(&store.tasks_db_path().to_string_lossy())
}

const TASK_COLUMNS: &str = "id, text, status, autonomy, urgency, project, context, due_date, \
     blocked_by, added_by, notes, attempts, last_attempt_at, created_at, started_at, completed_at";

fn task_from_row(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        text: row.get(1)?,
        status: row.get(2)?,
        autonomy: row.get(3)?,
        urgency: row.get(4)?,
        project: row.get(5)?,
        context: row.get(6)?,
        due_date: row.get(7)?,
        blocked_by: row.get(8)?,
        added_by: row.get(9)?,
        notes: row.get(10)?,
        attempts: row.get(11)?,
        last_attempt_at: row.get(12)?,
        created_at: row.get(13)?,
        started_at: row.get(14)?,
        completed_at: row.get(15)?,
    })
}

fn load_task(conn: &Connection, id: &str) -> Result<Option<Task>, TandemError> {
    let mut stmt =
        conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
    stmt.query_row(params![id], task_from_row)
        .optional()
        .map_err(TandemError::Sqlite)
}

/// Resolve a full id or a unique prefix to the canonical task id.
fn resolve_id(conn: &Connection, needle: &str) -> Result<String, TandemError> {
    if !ident::is_valid_id_prefix(needle) {
        return Err(TandemError::Validation(format!(
            "'{needle}' is not a valid task id or prefix"
        )));
    }
    let exact: Option<String> = conn
        .query_row("SELECT id FROM tasks WHERE id = ?1", params![needle], |row| {
            row.get(0)
        })
        .optional()?;
    if let Some(id) = exact {
        return Ok(id);
    }
    let mut stmt = conn.prepare("SELECT id FROM tasks WHERE id LIKE ?1 || '%' ORDER BY id")?;
    let matches: Vec<String> = stmt
        .query_map(params![needle], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    match matches.len() {
        0 => Err(TandemError::NotFound(needle.to_string())),
        1 => Ok(matches.into_iter().next().unwrap_or_default()),
        _ => Err(TandemError::Ambiguous {
            prefix: needle.to_string(),
            matches,
        }),
    }
}

fn require_task(conn: &Connection, needle: &str) -> Result<Task, TandemError> {
    let id = resolve_id(conn, needle)?;
    load_task(conn, &id)?.ok_or(TandemError::NotFound(id))
}

/// Generate an id that is not already taken. Collisions are astronomically
/// rare at 36^8 but ids are the primary key, so they are checked anyway.
fn unique_task_id(conn: &Connection) -> Result<String, TandemError> {
    for _ in 0..64 {
        let id = ident::random_task_id();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(id);
        }
    }
    Err(TandemError::Validation(
        "could not generate a unique task id".to_string(),
    ))
}

/// Walk the `blocked_by` chain upward from `candidate_blocker`. Reaching
/// `task_id` means the new edge closes a cycle; a repeat visit means an
/// existing loop that does not involve the new edge, so the walk stops.
fn would_create_cycle(
    conn: &Connection,
    task_id: &str,
    candidate_blocker: &str,
) -> Result<bool, TandemError> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut cursor = Some(candidate_blocker.to_string());
    while let Some(current) = cursor {
        if current == task_id {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            return Ok(false);
        }
        cursor = conn
            .query_row(
                "SELECT blocked_by FROM tasks WHERE id = ?1",
                params![current],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
    }
    Ok(false)
}

/// Returns the blocker id when the task is waiting on a task that is not
/// `done` or `archived`. A dangling blocker reference counts as unresolved.
fn unresolved_blocker(conn: &Connection, task: &Task) -> Result<Option<String>, TandemError> {
    let Some(blocker_id) = &task.blocked_by else {
        return Ok(None);
    };
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM tasks WHERE id = ?1",
            params![blocker_id],
            |row| row.get(0),
        )
        .optional()?;
    match status.as_deref() {
        Some(STATUS_DONE) | Some(STATUS_ARCHIVED) => Ok(None),
        _ => Ok(Some(blocker_id.clone())),
    }
}

fn insert_history(
    conn: &Connection,
    task_id: &str,
    action: &str,
    actor: &str,
    note: Option<&str>,
    old_value: Option<&str>,
    new_value: Option<&str>,
) -> Result<(), TandemError> {
    conn.execute(
        "INSERT INTO history(id, task_id, action, actor, ts, note, old_value, new_value)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            new_event_id(),
            task_id,
            action,
            actor,
            now_epoch_z(),
            note,
            old_value,
            new_value
        ],
    )?;
    Ok(())
}

/// Both agent-proposal limits, checked before any row is written: the cap on
/// concurrently proposed tasks, and the rolling creation window tracked by a
/// single global config timestamp.
fn enforce_proposal_limits(conn: &Connection) -> Result<(), TandemError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE status = 'proposed' AND added_by = 'agent'",
        [],
        |row| row.get(0),
    )?;
    if count >= PROPOSAL_CAP {
        return Err(TandemError::ProposalCapReached {
            count,
            cap: PROPOSAL_CAP,
        });
    }
    if let Some(last) = config::get(conn, LAST_AGENT_PROPOSAL_KEY)? {
        if let Some(last_secs) = parse_epoch_z(&last) {
            let elapsed = now_unix_secs().saturating_sub(last_secs);
            if elapsed < PROPOSAL_WINDOW_SECS {
                return Err(TandemError::RateLimited {
                    retry_after_secs: PROPOSAL_WINDOW_SECS - elapsed,
                });
            }
        }
    }
    Ok(())
}

pub fn create_task(store: &Store, actor: Actor, req: &CreateTask) -> Result<Task, TandemError> {
    let text = sanitize::validate_task_text(&req.text)?;
    let autonomy = validate_autonomy(&req.autonomy).map_err(TandemError::Validation)?;
    let urgency = validate_urgency(&req.urgency).map_err(TandemError::Validation)?;
    let project = req
        .project
        .as_deref()
        .map(|t| sanitize::validate_tag(t, '+'))
        .transpose()?;
    let context = req
        .context
        .as_deref()
        .map(|t| sanitize::validate_tag(t, '@'))
        .transpose()?;
    let due_date = req
        .due_date
        .as_deref()
        .map(sanitize::validate_due_date)
        .transpose()?;

    // The caller's `confirmed` flag is ignored: agent-authored tasks always
    // enter review, human-authored tasks are live immediately.
    let status = match actor {
        Actor::Agent => STATUS_PROPOSED,
        Actor::Human => STATUS_TODO,
    };

    let mut conn = connect(store)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if actor == Actor::Agent {
        enforce_proposal_limits(&tx)?;
    }

    let blocker = match req.blocked_by.as_deref() {
        Some(needle) => Some(resolve_id(&tx, needle).map_err(|err| match err {
            TandemError::NotFound(id) => TandemError::BlockerNotFound(id),
            other => other,
        })?),
        None => None,
    };

    let id = unique_task_id(&tx)?;
    if let Some(blocker_id) = &blocker {
        if would_create_cycle(&tx, &id, blocker_id)? {
            return Err(TandemError::CircularDependency {
                task: id,
                blocker: blocker_id.clone(),
            });
        }
    }

    let ts = now_epoch_z();
    tx.execute(
        "INSERT INTO tasks(id, text, status, autonomy, urgency, project, context, due_date,
                           blocked_by, added_by, notes, attempts, last_attempt_at, created_at,
                           started_at, completed_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, '', 0, NULL, ?11, NULL, NULL)",
        params![
            id,
            text,
            status,
            autonomy,
            urgency,
            project,
            context,
            due_date,
            blocker,
            actor.as_str(),
            ts
        ],
    )
    .map_err(error::translate_constraint)?;

    insert_history(&tx, &id, "create", actor.as_str(), None, None, Some(status))?;
    if actor == Actor::Agent {
        config::set(&tx, LAST_AGENT_PROPOSAL_KEY, &ts)?;
    }
    tx.commit()?;

    store.submit_audit(
        "task.create",
        actor.as_str(),
        Some(id.as_str()),
        serde_json::json!({ "status": status, "autonomy": autonomy, "urgency": urgency }),
    );

    load_task(&conn, &id)?.ok_or(TandemError::NotFound(id))
}

pub fn get_task(store: &Store, id: &str) -> Result<Task, TandemError> {
    let conn = connect(store)?;
    require_task(&conn, id)
}

pub fn start_task(store: &Store, id: &str, actor: Actor) -> Result<Task, TandemError> {
    let mut conn = connect(store)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, id)?;

    match task.status.as_str() {
        STATUS_IN_PROGRESS => return Err(TandemError::AlreadyInProgress(task.id)),
        STATUS_TODO => {}
        other => {
            return Err(TandemError::InvalidTransition {
                from: other.to_string(),
                to: STATUS_IN_PROGRESS.to_string(),
            });
        }
    }
    if let Some(blocker) = unresolved_blocker(&tx, &task)? {
        return Err(TandemError::Blocked {
            task: task.id,
            blocker,
        });
    }

    // Precondition and mutation in one conditional write; a racing starter
    // sees zero changed rows instead of clobbering the state.
    let ts = now_epoch_z();
    let changed = tx.execute(
        "UPDATE tasks SET status = 'in_progress', started_at = ?1
         WHERE id = ?2 AND status = 'todo'",
        params![ts, task.id],
    )?;
    if changed == 0 {
        return Err(TandemError::AlreadyInProgress(task.id));
    }

    insert_history(
        &tx,
        &task.id,
        "start",
        actor.as_str(),
        None,
        Some(STATUS_TODO),
        Some(STATUS_IN_PROGRESS),
    )?;
    tx.commit()?;
    store.submit_audit("task.start", actor.as_str(), Some(task.id.as_str()), serde_json::json!({}));

    load_task(&conn, &task.id)?.ok_or(TandemError::NotFound(task.id))
}

/// Shared completion path: enforces the transition rules, marks the task
/// done, and clears `blocked_by` on every dependent in the same transaction.
/// Returns the ids that became unblocked.
fn complete_in_tx(
    tx: &rusqlite::Transaction,
    task: &Task,
    actor: Actor,
) -> Result<Vec<String>, TandemError> {
    match task.status.as_str() {
        STATUS_PROPOSED => return Err(TandemError::NotConfirmed(task.id.clone())),
        STATUS_DONE => return Err(TandemError::AlreadyDone(task.id.clone())),
        STATUS_ARCHIVED => return Err(TandemError::AlreadyArchived(task.id.clone())),
        STATUS_TODO | STATUS_IN_PROGRESS => {}
        other => {
            return Err(TandemError::InvalidTransition {
                from: other.to_string(),
                to: STATUS_DONE.to_string(),
            });
        }
    }
    if let Some(blocker) = unresolved_blocker(tx, task)? {
        return Err(TandemError::Blocked {
            task: task.id.clone(),
            blocker,
        });
    }

    let ts = now_epoch_z();
    let changed = tx.execute(
        "UPDATE tasks SET status = 'done', completed_at = ?1
         WHERE id = ?2 AND status IN ('todo', 'in_progress')",
        params![ts, task.id],
    )?;
    if changed == 0 {
        return Err(TandemError::AlreadyDone(task.id.clone()));
    }

    // Cascading unblock is part of the same transaction: a completed task
    // must never leave dependents pointing at it.
    let mut stmt = tx.prepare("SELECT id FROM tasks WHERE blocked_by = ?1")?;
    let dependents: Vec<String> = stmt
        .query_map(params![task.id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    drop(stmt);
    tx.execute(
        "UPDATE tasks SET blocked_by = NULL WHERE blocked_by = ?1",
        params![task.id],
    )?;
    let unblock_note = format!("blocker {} completed", task.id);
    for dependent in &dependents {
        insert_history(
            tx,
            dependent,
            "unblock",
            actor.as_str(),
            Some(unblock_note.as_str()),
            Some(task.id.as_str()),
            None,
        )?;
    }

    insert_history(
        tx,
        &task.id,
        "complete",
        actor.as_str(),
        None,
        Some(task.status.as_str()),
        Some(STATUS_DONE),
    )?;
    Ok(dependents)
}

pub fn complete_task(store: &Store, id: &str, actor: Actor) -> Result<Task, TandemError> {
    let mut conn = connect(store)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, id)?;
    let unblocked = complete_in_tx(&tx, &task, actor)?;
    tx.commit()?;
    store.submit_audit(
        "task.complete",
        actor.as_str(),
        Some(task.id.as_str()),
        serde_json::json!({ "unblocked": unblocked }),
    );
    load_task(&conn, &task.id)?.ok_or(TandemError::NotFound(task.id))
}

pub fn fail_task(
    store: &Store,
    id: &str,
    actor: Actor,
    reason: Option<&str>,
) -> Result<Task, TandemError> {
    let mut conn = connect(store)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, id)?;

    match task.status.as_str() {
        STATUS_TODO | STATUS_IN_PROGRESS => {}
        other => {
            return Err(TandemError::InvalidTransition {
                from: other.to_string(),
                to: STATUS_TODO.to_string(),
            });
        }
    }

    let attempts = task.attempts + 1;
    let ts = now_epoch_z();
    let demoted = attempts >= MAX_ATTEMPTS && task.autonomy != AUTONOMY_COLLAB;
    let reason_note = reason
        .map(sanitize::clean_text)
        .map(|r| sanitize::truncate_with_marker(r.trim(), 500));

    if demoted {
        let demotion_note = format!(
            "[{}] autonomy demoted to collab after {} failed attempts",
            date_stamp(),
            attempts
        );
        let notes = append_note_text(&task.notes, &demotion_note);
        tx.execute(
            "UPDATE tasks SET status = 'todo', attempts = ?1, last_attempt_at = ?2,
                              autonomy = 'collab', notes = ?3
             WHERE id = ?4",
            params![attempts, ts, notes, task.id],
        )?;
        insert_history(
            &tx,
            &task.id,
            "demote",
            actor.as_str(),
            Some(demotion_note.as_str()),
            Some(task.autonomy.as_str()),
            Some(AUTONOMY_COLLAB),
        )?;
    } else {
        tx.execute(
            "UPDATE tasks SET status = 'todo', attempts = ?1, last_attempt_at = ?2 WHERE id = ?3",
            params![attempts, ts, task.id],
        )?;
    }

    insert_history(
        &tx,
        &task.id,
        "fail",
        actor.as_str(),
        reason_note.as_deref(),
        Some(task.status.as_str()),
        Some(STATUS_TODO),
    )?;
    tx.commit()?;
    store.submit_audit(
        "task.fail",
        actor.as_str(),
        Some(task.id.as_str()),
        serde_json::json!({ "attempts": attempts, "demoted": demoted }),
    );

    load_task(&conn, &task.id)?.ok_or(TandemError::NotFound(task.id))
}

/// Check-and-reserve retry eligibility in a single conditional update:
/// status, attempt budget, and cooldown are all evaluated by the same
/// statement that flips the task to `in_progress`, so two concurrent
/// callers cannot both win.
pub fn reserve_retry(store: &Store, id: &str, actor: Actor) -> Result<bool, TandemError> {
    let mut conn = connect(store)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, id)?;

    if unresolved_blocker(&tx, &task)?.is_some() {
        return Ok(false);
    }

    let cutoff = now_unix_secs().saturating_sub(RETRY_COOLDOWN_SECS);
    let ts = now_epoch_z();
    let changed = tx.execute(
        "UPDATE tasks SET status = 'in_progress', started_at = ?1
         WHERE id = ?2 AND status = 'todo' AND attempts < ?3
           AND (last_attempt_at IS NULL
                OR CAST(rtrim(last_attempt_at, 'Z') AS INTEGER) <= ?4)",
        params![ts, task.id, MAX_ATTEMPTS, cutoff as i64],
    )?;
    if changed == 0 {
        return Ok(false);
    }

    insert_history(
        &tx,
        &task.id,
        "retry",
        actor.as_str(),
        None,
        Some(STATUS_TODO),
        Some(STATUS_IN_PROGRESS),
    )?;
    tx.commit()?;
    store.submit_audit(
        "task.retry",
        actor.as_str(),
        Some(task.id.as_str()),
        serde_json::json!({ "attempts": task.attempts }),
    );
    Ok(true)
}

pub fn confirm_task(store: &Store, id: &str, actor: Actor) -> Result<Task, TandemError> {
    transition_from_proposed(store, id, actor, STATUS_TODO, "confirm", None)
}

pub fn reject_task(
    store: &Store,
    id: &str,
    actor: Actor,
    reason: Option<&str>,
) -> Result<Task, TandemError> {
    let reason_note = reason
        .map(sanitize::clean_text)
        .map(|r| sanitize::truncate_with_marker(r.trim(), 500));
    transition_from_proposed(
        store,
        id,
        actor,
        STATUS_ARCHIVED,
        "reject",
        reason_note.as_deref(),
    )
}

fn transition_from_proposed(
    store: &Store,
    id: &str,
    actor: Actor,
    to: &str,
    action: &str,
    note: Option<&str>,
) -> Result<Task, TandemError> {
    let mut conn = connect(store)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, id)?;
    if task.status != STATUS_PROPOSED {
        return Err(TandemError::InvalidTransition {
            from: task.status,
            to: to.to_string(),
        });
    }
    let changed = tx.execute(
        "UPDATE tasks SET status = ?1 WHERE id = ?2 AND status = 'proposed'",
        params![to, task.id],
    )?;
    if changed == 0 {
        return Err(TandemError::InvalidTransition {
            from: STATUS_PROPOSED.to_string(),
            to: to.to_string(),
        });
    }
    insert_history(
        &tx,
        &task.id,
        action,
        actor.as_str(),
        note,
        Some(STATUS_PROPOSED),
        Some(to),
    )?;
    tx.commit()?;
    store.submit_audit(
        &format!("task.{action}"),
        actor.as_str(),
        Some(task.id.as_str()),
        serde_json::json!({}),
    );
    load_task(&conn, &task.id)?.ok_or(TandemError::NotFound(task.id))
}

fn archive_in_tx(
    tx: &rusqlite::Transaction,
    task: &Task,
    actor: Actor,
) -> Result<(), TandemError> {
    match task.status.as_str() {
        STATUS_PROPOSED | STATUS_TODO | STATUS_IN_PROGRESS => {}
        STATUS_ARCHIVED => return Err(TandemError::AlreadyArchived(task.id.clone())),
        other => {
            return Err(TandemError::InvalidTransition {
                from: other.to_string(),
                to: STATUS_ARCHIVED.to_string(),
            });
        }
    }
    tx.execute(
        "UPDATE tasks SET status = 'archived' WHERE id = ?1",
        params![task.id],
    )?;
    insert_history(
        tx,
        &task.id,
        "archive",
        actor.as_str(),
        None,
        Some(task.status.as_str()),
        Some(STATUS_ARCHIVED),
    )?;
    Ok(())
}

pub fn archive_task(store: &Store, id: &str, actor: Actor) -> Result<Task, TandemError> {
    let mut conn = connect(store)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, id)?;
    archive_in_tx(&tx, &task, actor)?;
    tx.commit()?;
    store.submit_audit("task.archive", actor.as_str(), Some(task.id.as_str()), serde_json::json!({}));
    load_task(&conn, &task.id)?.ok_or(TandemError::NotFound(task.id))
}

pub fn unarchive_task(store: &Store, id: &str, actor: Actor) -> Result<Task, TandemError> {
    let mut conn = connect(store)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, id)?;
    if task.status != STATUS_ARCHIVED {
        return Err(TandemError::InvalidTransition {
            from: task.status,
            to: STATUS_TODO.to_string(),
        });
    }
    tx.execute(
        "UPDATE tasks SET status = 'todo' WHERE id = ?1 AND status = 'archived'",
        params![task.id],
    )?;
    insert_history(
        &tx,
        &task.id,
        "unarchive",
        actor.as_str(),
        None,
        Some(STATUS_ARCHIVED),
        Some(STATUS_TODO),
    )?;
    tx.commit()?;
    store.submit_audit("task.unarchive", actor.as_str(), Some(task.id.as_str()), serde_json::json!({}));
    load_task(&conn, &task.id)?.ok_or(TandemError::NotFound(task.id))
}

pub fn block_task(
    store: &Store,
    id: &str,
    blocker: &str,
    actor: Actor,
) -> Result<Task, TandemError> {
    let mut conn = connect(store)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, id)?;
    let blocker_id = resolve_id(&tx, blocker).map_err(|err| match err {
        TandemError::NotFound(id) => TandemError::BlockerNotFound(id),
        other => other,
    })?;
    let blocker_task =
        load_task(&tx, &blocker_id)?.ok_or(TandemError::BlockerNotFound(blocker_id.clone()))?;

    if matches!(blocker_task.status.as_str(), STATUS_DONE | STATUS_ARCHIVED) {
        return Err(TandemError::BlockerFinished(blocker_id));
    }
    if blocker_id == task.id || would_create_cycle(&tx, &task.id, &blocker_id)? {
        return Err(TandemError::CircularDependency {
            task: task.id,
            blocker: blocker_id,
        });
    }

    tx.execute(
        "UPDATE tasks SET blocked_by = ?1 WHERE id = ?2",
        params![blocker_id, task.id],
    )?;
    insert_history(
        &tx,
        &task.id,
        "block",
        actor.as_str(),
        None,
        task.blocked_by.as_deref(),
        Some(blocker_id.as_str()),
    )?;
    tx.commit()?;
    store.submit_audit(
        "task.block",
        actor.as_str(),
        Some(task.id.as_str()),
        serde_json::json!({ "blocker": blocker_id }),
    );
    load_task(&conn, &task.id)?.ok_or(TandemError::NotFound(task.id))
}

pub fn unblock_task(store: &Store, id: &str, actor: Actor) -> Result<Task, TandemError> {
    let mut conn = connect(store)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, id)?;
    if task.blocked_by.is_some() {
        tx.execute(
            "UPDATE tasks SET blocked_by = NULL WHERE id = ?1",
            params![task.id],
        )?;
        insert_history(
            &tx,
            &task.id,
            "unblock",
            actor.as_str(),
            None,
            task.blocked_by.as_deref(),
            None,
        )?;
    }
    tx.commit()?;
    store.submit_audit("task.unblock", actor.as_str(), Some(task.id.as_str()), serde_json::json!({}));
    load_task(&conn, &task.id)?.ok_or(TandemError::NotFound(task.id))
}

fn append_note_text(existing: &str, stamped: &str) -> String {
    if existing.is_empty() {
        stamped.to_string()
    } else {
        format!("{existing}\n{stamped}")
    }
}

/// Append a date-stamped note. The whole operation is rejected when the
/// combined notes would exceed the limit; there is no partial append.
pub fn note_task(store: &Store, id: &str, actor: Actor, note: &str) -> Result<Task, TandemError> {
    let cleaned = sanitize::clean_note(note)?;
    let mut conn = connect(store)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, id)?;

    let stamped = format!("[{}] {}", date_stamp(), cleaned);
    let combined = append_note_text(&task.notes, &stamped);
    let combined_len = combined.chars().count();
    if combined_len > sanitize::MAX_NOTES_LEN {
        return Err(TandemError::Validation(format!(
            "notes would reach {combined_len} characters; the limit is {}",
            sanitize::MAX_NOTES_LEN
        )));
    }

    tx.execute(
        "UPDATE tasks SET notes = ?1 WHERE id = ?2",
        params![combined, task.id],
    )?;
    insert_history(&tx, &task.id, "note", actor.as_str(), Some(stamped.as_str()), None, None)?;
    tx.commit()?;
    store.submit_audit("task.note", actor.as_str(), Some(task.id.as_str()), serde_json::json!({}));
    load_task(&conn, &task.id)?.ok_or(TandemError::NotFound(task.id))
}

fn current_value(task: &Task, column: &str) -> Option<String> {
    match column {
        "text" => Some(task.text.clone()),
        "urgency" => Some(task.urgency.clone()),
        "project" => task.project.clone(),
        "context" => task.context.clone(),
        "due_date" => task.due_date.clone(),
        _ => None,
    }
}

/// Generic field update over an explicit allowlist. External keys map to
/// columns here and nowhere else; anything not listed is rejected, and
/// `autonomy` is refused outright - its only mutation path is the failure
/// demotion in [`fail_task`].
pub fn edit_task(
    store: &Store,
    id: &str,
    actor: Actor,
    updates: &[(String, String)],
) -> Result<Task, TandemError> {
    if updates.is_empty() {
        return Err(TandemError::Validation("no fields to edit".to_string()));
    }

    let mut conn = connect(store)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = require_task(&tx, id)?;

    // Validate every field before writing any of them.
    let mut changes: Vec<(&'static str, Option<String>)> = Vec::new();
    for (key, raw) in updates {
        let change = match key.as_str() {
            "text" => ("text", Some(sanitize::validate_task_text(raw)?)),
            "urgency" => (
                "urgency",
                Some(validate_urgency(raw).map_err(TandemError::Validation)?),
            ),
            "project" => (
                "project",
                if raw.trim().is_empty() {
                    None
                } else {
                    Some(sanitize::validate_tag(raw, '+')?)
                },
            ),
            "context" => (
                "context",
                if raw.trim().is_empty() {
                    None
                } else {
                    Some(sanitize::validate_tag(raw, '@')?)
                },
            ),
            "due" => (
                "due_date",
                if raw.trim().is_empty() {
                    None
                } else {
                    Some(sanitize::validate_due_date(raw)?)
                },
            ),
            "autonomy" => {
                return Err(TandemError::PermissionDenied {
                    field: "autonomy".to_string(),
                    current: task.autonomy.clone(),
                });
            }
            "status" => {
                return Err(TandemError::Validation(
                    "status is not editable; use the lifecycle commands (start, done, confirm, ...)"
                        .to_string(),
                ));
            }
            other => {
                return Err(TandemError::Validation(format!(
                    "field '{other}' is not editable; allowed fields: text, urgency, project, context, due"
                )));
            }
        };
        changes.push(change);
    }

    for (column, value) in &changes {
        let old = current_value(&task, column);
        tx.execute(
            &format!("UPDATE tasks SET {column} = ?1 WHERE id = ?2"),
            params![value, task.id],
        )
        .map_err(error::translate_constraint)?;
        insert_history(
            &tx,
            &task.id,
            &format!("edit:{column}"),
            actor.as_str(),
            None,
            old.as_deref(),
            value.as_deref(),
        )?;
    }
    tx.commit()?;
    store.submit_audit(
        "task.edit",
        actor.as_str(),
        Some(task.id.as_str()),
        serde_json::json!({ "fields": changes.iter().map(|(c, _)| *c).collect::<Vec<_>>() }),
    );
    load_task(&conn, &task.id)?.ok_or(TandemError::NotFound(task.id))
}

const BLOCKED_PREDICATE: &str = "(blocked_by IS NOT NULL AND NOT EXISTS (
        SELECT 1 FROM tasks b WHERE b.id = tasks.blocked_by AND b.status IN ('done','archived')))";

const ORDER_CLAUSE: &str = " ORDER BY CASE urgency
        WHEN 'now' THEN 0 WHEN 'soon' THEN 1 WHEN 'whenever' THEN 2 ELSE 3 END,
        created_at, rowid";

fn filter_clause(filter: &TaskFilter) -> (String, Vec<Box<dyn ToSql>>) {
    let mut clause = String::new();
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();
    if let Some(s) = &filter.status {
        clause.push_str(" AND status = ?");
        params.push(Box::new(s.clone()));
    }
    if let Some(a) = &filter.autonomy {
        clause.push_str(" AND autonomy = ?");
        params.push(Box::new(a.clone()));
    }
    if let Some(u) = &filter.urgency {
        clause.push_str(" AND urgency = ?");
        params.push(Box::new(u.clone()));
    }
    if let Some(p) = &filter.project {
        clause.push_str(" AND project = ?");
        params.push(Box::new(p.clone()));
    }
    if let Some(a) = &filter.added_by {
        clause.push_str(" AND added_by = ?");
        params.push(Box::new(a.clone()));
    }
    if let Some(blocked) = filter.blocked {
        if blocked {
            clause.push_str(&format!(" AND {BLOCKED_PREDICATE}"));
        } else {
            clause.push_str(&format!(" AND NOT {BLOCKED_PREDICATE}"));
        }
    }
    if let Some(ready) = filter.ready {
        if ready {
            clause.push_str(&format!(" AND status = 'todo' AND NOT {BLOCKED_PREDICATE}"));
        } else {
            clause.push_str(&format!(
                " AND NOT (status = 'todo' AND NOT {BLOCKED_PREDICATE})"
            ));
        }
    }
    (clause, params)
}

fn select_tasks(conn: &Connection, filter: &TaskFilter) -> Result<Vec<Task>, TandemError> {
    let (clause, params) = filter_clause(filter);
    let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1{clause}{ORDER_CLAUSE}");
    let mut stmt = conn.prepare(&query)?;
    let params_as_dyn: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(rusqlite::params_from_iter(params_as_dyn.iter().copied()), task_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Filtered listing, ordered by urgency rank, then creation time, then
/// insertion order.
pub fn list_tasks(store: &Store, filter: &TaskFilter) -> Result<Vec<Task>, TandemError> {
    let conn = connect(store)?;
    select_tasks(&conn, filter)
}

pub fn list_history(store: &Store, id: &str) -> Result<Vec<HistoryEntry>, TandemError> {
    let conn = connect(store)?;
    let task_id = resolve_id(&conn, id)?;
    let mut stmt = conn.prepare(
        "SELECT id, task_id, action, actor, ts, note, old_value, new_value
         FROM history WHERE task_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt.query_map(params![task_id], |row| {
        Ok(HistoryEntry {
            id: row.get(0)?,
            task_id: row.get(1)?,
            action: row.get(2)?,
            actor: row.get(3)?,
            ts: row.get(4)?,
            note: row.get(5)?,
            old_value: row.get(6)?,
            new_value: row.get(7)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Complete every currently-eligible task matching the filter in one
/// transaction. Tasks the per-task rules reject are skipped, not errors.
pub fn bulk_complete(
    store: &Store,
    actor: Actor,
    filter: &TaskFilter,
) -> Result<Vec<String>, TandemError> {
    let mut conn = connect(store)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let candidates = select_tasks(&tx, filter)?;
    let mut completed = Vec::new();
    for candidate in &candidates {
        // Re-read: an earlier completion in this batch may have unblocked
        // or already mutated this row.
        let Some(task) = load_task(&tx, &candidate.id)? else {
            continue;
        };
        if !matches!(task.status.as_str(), STATUS_TODO | STATUS_IN_PROGRESS) {
            continue;
        }
        if unresolved_blocker(&tx, &task)?.is_some() {
            continue;
        }
        complete_in_tx(&tx, &task, actor)?;
        completed.push(task.id);
    }
    tx.commit()?;
    store.submit_audit(
        "task.bulk_complete",
        actor.as_str(),
        None,
        serde_json::json!({ "count": completed.len(), "ids": completed }),
    );
    Ok(completed)
}

/// Archive every currently-eligible task matching the filter in one
/// transaction, skipping tasks the per-task rules reject.
pub fn bulk_archive(
    store: &Store,
    actor: Actor,
    filter: &TaskFilter,
) -> Result<Vec<String>, TandemError> {
    let mut conn = connect(store)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let candidates = select_tasks(&tx, filter)?;
    let mut archived = Vec::new();
    for candidate in &candidates {
        let Some(task) = load_task(&tx, &candidate.id)? else {
            continue;
        };
        if !matches!(
            task.status.as_str(),
            STATUS_PROPOSED | STATUS_TODO | STATUS_IN_PROGRESS
        ) {
            continue;
        }
        archive_in_tx(&tx, &task, actor)?;
        archived.push(task.id);
    }
    tx.commit()?;
    store.submit_audit(
        "task.bulk_archive",
        actor.as_str(),
        None,
        serde_json::json!({ "count": archived.len(), "ids": archived }),
    );
    Ok(archived)
}

fn parse_set_args(sets: &[String]) -> Result<Vec<(String, String)>, TandemError> {
    sets.iter()
        .map(|s| {
            s.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .ok_or_else(|| {
                    TandemError::Validation(format!("--set expects KEY=VALUE, got '{s}'"))
                })
        })
        .collect()
}

fn task_line(task: &Task) -> String {
    let mut line = format!(
        "{}  {:<12} {:<9} {}",
        task.id,
        task.status,
        task.urgency,
        crate::core::output::compact_line(&task.text, 64)
    );
    if let Some(blocker) = &task.blocked_by {
        line.push_str(&format!("  [blocked by {blocker}]"));
    }
    line
}

fn emit(format: OutputFormat, envelope: &JsonValue) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(envelope).unwrap_or_default()
            );
        }
        OutputFormat::Text => {
            let cmd = envelope["cmd"].as_str().unwrap_or("?");
            let status = envelope["status"].as_str().unwrap_or("?");
            if let Some(items) = envelope["items"].as_array() {
                for item in items {
                    if let Ok(task) = serde_json::from_value::<Task>(item.clone()) {
                        println!("{}", task_line(&task));
                    } else if let Ok(entry) = serde_json::from_value::<HistoryEntry>(item.clone())
                    {
                        println!(
                            "{}  {:<10} {:<6} {}",
                            entry.ts,
                            entry.action,
                            entry.actor,
                            entry.note.as_deref().unwrap_or("")
                        );
                    }
                }
                println!("{} item(s)", items.len());
            } else if let Ok(task) = serde_json::from_value::<Task>(envelope["item"].clone()) {
                println!("{}", task_line(&task));
                if !task.notes.is_empty() {
                    println!("{}", task.notes);
                }
            } else if let Some(id) = envelope["id"].as_str() {
                println!("{cmd}: {status} ({id})");
            } else {
                println!("{cmd}: {status}");
            }
        }
    }
}

pub fn run_task_cli(store: &Store, cli: TaskCli) -> Result<(), TandemError> {
    let out = match &cli.command {
        TaskCommand::Add {
            text,
            actor,
            autonomy,
            urgency,
            project,
            context,
            due,
            blocked_by,
            confirmed,
        } => {
            let req = CreateTask {
                text: text.clone(),
                autonomy: autonomy.clone(),
                urgency: urgency.clone(),
                project: project.clone(),
                context: context.clone(),
                due_date: due.clone(),
                blocked_by: blocked_by.clone(),
                confirmed: *confirmed,
            };
            let task = create_task(store, *actor, &req)?;
            crate::core::time::command_envelope(
                "task.add",
                "ok",
                serde_json::json!({ "id": task.id, "task_status": task.status }),
            )
        }
        TaskCommand::List {
            status,
            autonomy,
            urgency,
            project,
            added_by,
            blocked,
            ready,
        } => {
            let filter = TaskFilter {
                status: status.clone(),
                autonomy: autonomy.clone(),
                urgency: urgency.clone(),
                project: project.clone(),
                added_by: added_by.clone(),
                blocked: blocked.then_some(true),
                ready: ready.then_some(true),
            };
            let items = list_tasks(store, &filter)?;
            crate::core::time::command_envelope(
                "task.list",
                "ok",
                serde_json::json!({ "items": items }),
            )
        }
        TaskCommand::Get { id } => {
            let task = get_task(store, id)?;
            crate::core::time::command_envelope(
                "task.get",
                "ok",
                serde_json::json!({ "id": task.id.clone(), "item": task }),
            )
        }
        TaskCommand::Start { id, actor } => {
            let task = start_task(store, id, *actor)?;
            crate::core::time::command_envelope(
                "task.start",
                "ok",
                serde_json::json!({ "id": task.id }),
            )
        }
        TaskCommand::Done { id, actor } => {
            let task = complete_task(store, id, *actor)?;
            crate::core::time::command_envelope(
                "task.done",
                "ok",
                serde_json::json!({ "id": task.id }),
            )
        }
        TaskCommand::Fail { id, actor, reason } => {
            let task = fail_task(store, id, *actor, reason.as_deref())?;
            crate::core::time::command_envelope(
                "task.fail",
                "ok",
                serde_json::json!({ "id": task.id, "attempts": task.attempts, "autonomy": task.autonomy }),
            )
        }
        TaskCommand::Retry { id, actor } => {
            let reserved = reserve_retry(store, id, *actor)?;
            crate::core::time::command_envelope(
                "task.retry",
                if reserved { "ok" } else { "ineligible" },
                serde_json::json!({ "reserved": reserved }),
            )
        }
        TaskCommand::Confirm { id, actor } => {
            let task = confirm_task(store, id, *actor)?;
            crate::core::time::command_envelope(
                "task.confirm",
                "ok",
                serde_json::json!({ "id": task.id }),
            )
        }
        TaskCommand::Reject { id, actor, reason } => {
            let task = reject_task(store, id, *actor, reason.as_deref())?;
            crate::core::time::command_envelope(
                "task.reject",
                "ok",
                serde_json::json!({ "id": task.id }),
            )
        }
        TaskCommand::Archive { id, actor } => {
            let task = archive_task(store, id, *actor)?;
            crate::core::time::command_envelope(
                "task.archive",
                "ok",
                serde_json::json!({ "id": task.id }),
            )
        }
        TaskCommand::Unarchive { id, actor } => {
            let task = unarchive_task(store, id, *actor)?;
            crate::core::time::command_envelope(
                "task.unarchive",
                "ok",
                serde_json::json!({ "id": task.id }),
            )
        }
        TaskCommand::Block { id, on, actor } => {
            let task = block_task(store, id, on, *actor)?;
            crate::core::time::command_envelope(
                "task.block",
                "ok",
                serde_json::json!({ "id": task.id, "blocked_by": task.blocked_by }),
            )
        }
        TaskCommand::Unblock { id, actor } => {
            let task = unblock_task(store, id, *actor)?;
            crate::core::time::command_envelope(
                "task.unblock",
                "ok",
                serde_json::json!({ "id": task.id }),
            )
        }
        TaskCommand::Note { id, note, actor } => {
            let task = note_task(store, id, *actor, note)?;
            crate::core::time::command_envelope(
                "task.note",
                "ok",
                serde_json::json!({ "id": task.id }),
            )
        }
        TaskCommand::Edit { id, set, actor } => {
            let updates = parse_set_args(set)?;
            let task = edit_task(store, id, *actor, &updates)?;
            crate::core::time::command_envelope(
                "task.edit",
                "ok",
                serde_json::json!({ "id": task.id, "item": task }),
            )
        }
        TaskCommand::History { id } => {
            let entries = list_history(store, id)?;
            crate::core::time::command_envelope(
                "task.history",
                "ok",
                serde_json::json!({ "items": entries }),
            )
        }
        TaskCommand::CompleteAll {
            status,
            urgency,
            project,
            actor,
        } => {
            let filter = TaskFilter {
                status: status.clone(),
                urgency: urgency.clone(),
                project: project.clone(),
                ..TaskFilter::default()
            };
            let ids = bulk_complete(store, *actor, &filter)?;
            crate::core::time::command_envelope(
                "task.complete_all",
                "ok",
                serde_json::json!({ "count": ids.len(), "ids": ids }),
            )
        }
        TaskCommand::ArchiveAll {
            status,
            urgency,
            project,
            actor,
        } => {
            let filter = TaskFilter {
                status: status.clone(),
                urgency: urgency.clone(),
                project: project.clone(),
                ..TaskFilter::default()
            };
            let ids = bulk_archive(store, *actor, &filter)?;
            crate::core::time::command_envelope(
                "task.archive_all",
                "ok",
                serde_json::json!({ "count": ids.len(), "ids": ids }),
            )
        }
    };
    emit(cli.format, &out);
    Ok(())
}
