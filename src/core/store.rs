//! Store handle: one directory holding the task database and the audit log.
//!
//! A `Store` owns the audit queue for its lifetime; dropping the handle
//! flushes any queued audit records synchronously. Several handles may be
//! opened over the same backing directory (they serialize through SQLite's
//! WAL writer lock), which is how the advisory lock is exercised in tests.

use crate::core::audit::{self, AuditLog, AuditRecord};
use crate::core::db;
use crate::core::error::TandemError;
use crate::core::schemas;
use serde_json::Value as JsonValue;
use std::fs;
use std::path::{Path, PathBuf};

pub struct Store {
    /// Absolute path to the store's data directory.
    pub root: PathBuf,
    audit: AuditLog,
}

impl Store {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, TandemError> {
        let root: PathBuf = root.into();
        fs::create_dir_all(&root)?;
        let db_path = root.join(schemas::TASKS_DB_NAME);
        let conn = db::db_connect(&db_path.to_string_lossy())?;
        db::ensure_schema(&conn)?;
        harden_permissions(&db_path);
        let audit = AuditLog::open(&root);
        Ok(Self { root, audit })
    }

    pub fn tasks_db_path(&self) -> PathBuf {
        self.root.join(schemas::TASKS_DB_NAME)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        audit::audit_log_path(&self.root)
    }

    /// Queue an audit record for the flush worker. Fire-and-forget by
    /// design: the caller's transaction has already committed.
    pub fn submit_audit(
        &self,
        action: &str,
        actor: &str,
        task_id: Option<&str>,
        details: JsonValue,
    ) {
        self.audit
            .record(AuditRecord::new(action, actor, task_id, details));
    }
}

/// Restrict the database file to its owner. Failure is a warning, not an
/// error: the store works either way.
#[cfg(unix)]
fn harden_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        if let Err(err) = fs::set_permissions(path, perms) {
            eprintln!(
                "warning: could not restrict permissions on {}: {}",
                path.display(),
                err
            );
        }
    }
}

#[cfg(not(unix))]
fn harden_permissions(_path: &Path) {}
