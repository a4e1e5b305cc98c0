use rusqlite;
use std::io;
use thiserror::Error;

/// Every failure the store can surface, categorized by stable kind rather
/// than message text. Callers (and the CLI error envelope) branch on
/// [`TandemError::kind`]; messages are for humans.
#[derive(Error, Debug)]
pub enum TandemError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("no task matches '{0}'")]
    NotFound(String),
    #[error("'{prefix}' matches more than one task: {}", .matches.join(", "))]
    Ambiguous { prefix: String, matches: Vec<String> },
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("task {0} is already in progress")]
    AlreadyInProgress(String),
    #[error("task {0} is already done")]
    AlreadyDone(String),
    #[error("task {0} is archived")]
    AlreadyArchived(String),
    #[error("task {0} is still a proposal; run `tandem task confirm {0}` before completing it")]
    NotConfirmed(String),
    #[error("field '{field}' cannot be edited directly (current value: {current})")]
    PermissionDenied { field: String, current: String },
    #[error("task {task} is blocked by {blocker}, which is not finished")]
    Blocked { task: String, blocker: String },
    #[error("blocker task '{0}' does not exist")]
    BlockerNotFound(String),
    #[error("task {0} is already finished; there is nothing to wait on")]
    BlockerFinished(String),
    #[error("blocking {task} on {blocker} would create a dependency cycle")]
    CircularDependency { task: String, blocker: String },
    #[error("agent proposal rate limit: retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("agent proposal cap reached: {count} of {cap} proposals awaiting review")]
    ProposalCapReached { count: i64, cap: i64 },
    #[error("validation error: {0}")]
    Validation(String),
}

impl TandemError {
    /// Stable machine-readable kind, independent of message wording.
    pub fn kind(&self) -> &'static str {
        match self {
            TandemError::Sqlite(_) => "storage",
            TandemError::Io(_) => "io",
            TandemError::NotFound(_) => "not_found",
            TandemError::Ambiguous { .. } => "ambiguous_id",
            TandemError::InvalidTransition { .. } => "invalid_transition",
            TandemError::AlreadyInProgress(_) => "already_in_progress",
            TandemError::AlreadyDone(_) => "already_done",
            TandemError::AlreadyArchived(_) => "already_archived",
            TandemError::NotConfirmed(_) => "not_confirmed",
            TandemError::PermissionDenied { .. } => "permission_denied",
            TandemError::Blocked { .. } => "blocked",
            TandemError::BlockerNotFound(_) => "blocker_not_found",
            TandemError::BlockerFinished(_) => "blocker_finished",
            TandemError::CircularDependency { .. } => "circular_dependency",
            TandemError::RateLimited { .. } => "rate_limited",
            TandemError::ProposalCapReached { .. } => "proposal_cap_reached",
            TandemError::Validation(_) => "validation",
        }
    }
}

/// Translate a constraint violation raised by the store itself (a write that
/// bypassed the state machine) into a structured validation error instead of
/// leaking raw SQLite text through a `storage` kind.
pub fn translate_constraint(err: rusqlite::Error) -> TandemError {
    if let rusqlite::Error::SqliteFailure(failure, Some(msg)) = &err {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            return TandemError::Validation(format!("store constraint rejected the write: {msg}"));
        }
    }
    TandemError::Sqlite(err)
}
