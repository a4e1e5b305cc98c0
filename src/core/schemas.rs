//! Single source of truth for every persisted schema in the store.
//!
//! All DDL lives here as named constants so `db::ensure_schema` stays a flat,
//! reviewable list of statements. Status and permission domains are enforced
//! twice: by CHECK constraints here, and by the state machine in
//! `plugins::tasks`. A write that sneaks past the state machine still cannot
//! persist an out-of-domain value.

pub const TASKS_DB_NAME: &str = "tasks.db";
pub const AUDIT_LOG_NAME: &str = "audit.jsonl";
pub const SCHEMA_VERSION: u32 = 1;

// --- 1. Meta ---

pub const SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

// --- 2. Tasks ---

pub const SCHEMA_TASKS: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        text TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'todo'
            CHECK(status IN ('proposed','todo','in_progress','done','archived')),
        autonomy TEXT NOT NULL DEFAULT 'collab'
            CHECK(autonomy IN ('auto','auto-notify','collab')),
        urgency TEXT NOT NULL DEFAULT 'whenever'
            CHECK(urgency IN ('now','soon','whenever','someday')),
        project TEXT,
        context TEXT,
        due_date TEXT,
        blocked_by TEXT REFERENCES tasks(id),
        added_by TEXT NOT NULL DEFAULT 'human'
            CHECK(added_by IN ('human','agent')),
        notes TEXT NOT NULL DEFAULT '',
        attempts INTEGER NOT NULL DEFAULT 0,
        last_attempt_at TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT
    )
";

pub const SCHEMA_INDEX_TASKS_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)";
pub const SCHEMA_INDEX_TASKS_BLOCKED_BY: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_blocked_by ON tasks(blocked_by)";
pub const SCHEMA_INDEX_TASKS_ADDED_BY: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_added_by ON tasks(added_by)";

// --- 3. History (append-only; one row per state transition) ---

pub const SCHEMA_HISTORY: &str = "
    CREATE TABLE IF NOT EXISTS history (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        action TEXT NOT NULL,
        actor TEXT NOT NULL,
        ts TEXT NOT NULL,
        note TEXT,
        old_value TEXT,
        new_value TEXT
    )
";

pub const SCHEMA_INDEX_HISTORY_TASK: &str =
    "CREATE INDEX IF NOT EXISTS idx_history_task ON history(task_id)";

// --- 4. Config (flat key/value: toggles, rate-limit slot, advisory locks) ---

pub const SCHEMA_CONFIG: &str = "
    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

// --- 5. Audit fallback (records that failed to reach audit.jsonl) ---

pub const SCHEMA_AUDIT_FALLBACK: &str = "
    CREATE TABLE IF NOT EXISTS audit_fallback (
        event_id TEXT PRIMARY KEY,
        ts TEXT NOT NULL,
        action TEXT NOT NULL,
        actor TEXT NOT NULL,
        task_id TEXT,
        details TEXT NOT NULL
    )
";
