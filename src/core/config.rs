//! Flat key/value configuration plus the advisory-lock primitive.
//!
//! Both live in the `config` table so they are scoped to a store instance,
//! not to the process: two `Store` handles over the same backing file see the
//! same keys and contend for the same lock slots. Locks are cooperative; they
//! only protect callers that honor them.

use crate::core::error::TandemError;
use rusqlite::{Connection, OptionalExtension, params};

pub fn get(conn: &Connection, key: &str) -> Result<Option<String>, TandemError> {
    conn.query_row("SELECT value FROM config WHERE key = ?1", [key], |row| {
        row.get(0)
    })
    .optional()
    .map_err(TandemError::Sqlite)
}

pub fn set(conn: &Connection, key: &str, value: &str) -> Result<(), TandemError> {
    conn.execute(
        "INSERT INTO config(key, value) VALUES(?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn lock_key(name: &str) -> String {
    format!("lock:{name}")
}

/// Acquire a named advisory lock for `holder`. A single conditional upsert:
/// the insert wins an unused slot, the guarded update wins a released one,
/// and a held slot changes nothing. Returns whether the lock was taken.
pub fn acquire_lock(conn: &Connection, name: &str, holder: &str) -> Result<bool, TandemError> {
    if holder.trim().is_empty() {
        return Err(TandemError::Validation(
            "lock holder must not be empty".to_string(),
        ));
    }
    let changed = conn.execute(
        "INSERT INTO config(key, value) VALUES(?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value WHERE config.value = ''",
        params![lock_key(name), holder],
    )?;
    Ok(changed > 0)
}

/// Release a lock held by `holder`. Returns false when the slot is free or
/// held by someone else; releasing another holder's lock is not possible.
pub fn release_lock(conn: &Connection, name: &str, holder: &str) -> Result<bool, TandemError> {
    let changed = conn.execute(
        "UPDATE config SET value = '' WHERE key = ?1 AND value = ?2",
        params![lock_key(name), holder],
    )?;
    Ok(changed > 0)
}

pub fn lock_holder(conn: &Connection, name: &str) -> Result<Option<String>, TandemError> {
    Ok(get(conn, &lock_key(name))?.filter(|v| !v.is_empty()))
}
