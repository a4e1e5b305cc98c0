use crate::core::error::TandemError;
use crate::core::schemas;
use rusqlite::{Connection, OptionalExtension};

/// Open a connection with the store's required pragmas: WAL for one writer
/// plus concurrent readers, a busy timeout so short lock contention waits
/// instead of failing, and enforced foreign keys.
pub fn db_connect(db_path: &str) -> Result<Connection, TandemError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(TandemError::Sqlite)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(TandemError::Sqlite)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(TandemError::Sqlite)?;
    Ok(conn)
}

/// Create or migrate the schema, gated by the `schema_version` row in `meta`.
pub fn ensure_schema(conn: &Connection) -> Result<(), TandemError> {
    conn.execute(schemas::SCHEMA_META, [])?;

    let current: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(TandemError::Sqlite)?;

    let current_version: u32 = current
        .as_deref()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);

    if current_version >= schemas::SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute(schemas::SCHEMA_TASKS, [])?;
    conn.execute(schemas::SCHEMA_INDEX_TASKS_STATUS, [])?;
    conn.execute(schemas::SCHEMA_INDEX_TASKS_BLOCKED_BY, [])?;
    conn.execute(schemas::SCHEMA_INDEX_TASKS_ADDED_BY, [])?;
    conn.execute(schemas::SCHEMA_HISTORY, [])?;
    conn.execute(schemas::SCHEMA_INDEX_HISTORY_TASK, [])?;
    conn.execute(schemas::SCHEMA_CONFIG, [])?;
    conn.execute(schemas::SCHEMA_AUDIT_FALLBACK, [])?;

    conn.execute(
        "INSERT INTO meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [schemas::SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}
