//! Durable, append-only audit trail, decoupled from the transaction
//! boundary.
//!
//! Mutating operations submit records to a bounded in-memory queue; a worker
//! thread flushes the queue to `audit.jsonl` once it holds
//! [`FLUSH_BATCH`] records or [`FLUSH_DEBOUNCE_MS`] after the first queued
//! record, whichever comes first. A flush that cannot reach the file
//! persists each record into the `audit_fallback` table inside the
//! transactional store instead, so no record is silently dropped. Dropping
//! the handle closes the channel and joins the worker, which flushes
//! whatever is still queued.
//!
//! A slow or failing audit sink never fails the caller's operation.

use crate::core::db;
use crate::core::error::TandemError;
use crate::core::schemas;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const FLUSH_BATCH: usize = 16;
pub const FLUSH_DEBOUNCE_MS: u64 = 250;
const QUEUE_BOUND: usize = 1024;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuditRecord {
    pub ts: String,
    pub event_id: String,
    pub action: String,
    pub actor: String,
    pub task_id: Option<String>,
    pub details: JsonValue,
}

impl AuditRecord {
    pub fn new(action: &str, actor: &str, task_id: Option<&str>, details: JsonValue) -> Self {
        Self {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            action: action.to_string(),
            actor: actor.to_string(),
            task_id: task_id.map(|s| s.to_string()),
            details,
        }
    }
}

pub fn audit_log_path(root: &Path) -> PathBuf {
    root.join(schemas::AUDIT_LOG_NAME)
}

pub struct AuditLog {
    tx: Option<SyncSender<AuditRecord>>,
    worker: Option<JoinHandle<()>>,
    db_path: PathBuf,
}

impl AuditLog {
    /// Spawn the flush worker for the store rooted at `root`.
    pub fn open(root: &Path) -> Self {
        let log_path = audit_log_path(root);
        let db_path = root.join(schemas::TASKS_DB_NAME);
        let worker_db_path = db_path.clone();
        let (tx, rx) = mpsc::sync_channel(QUEUE_BOUND);
        let worker = std::thread::spawn(move || worker_loop(rx, log_path, worker_db_path));
        Self {
            tx: Some(tx),
            worker: Some(worker),
            db_path,
        }
    }

    /// Submit a record. Blocks only when the queue is full (backpressure).
    /// If the worker is gone the record goes straight to the fallback table.
    pub fn record(&self, record: AuditRecord) {
        let Some(tx) = &self.tx else { return };
        if let Err(mpsc::SendError(record)) = tx.send(record) {
            if let Err(err) = persist_fallback(&self.db_path, std::slice::from_ref(&record)) {
                eprintln!(
                    "warning: audit worker is gone and fallback write failed ({err}); record {} lost",
                    record.event_id
                );
            }
        }
    }

    /// Read every record in an audit log file, oldest first.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>, TandemError> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)
                .map_err(|e| TandemError::Validation(format!("corrupt audit line: {e}")))?;
            records.push(record);
        }
        Ok(records)
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        // Closing the channel wakes the worker, which drains and flushes
        // before exiting; joining makes the final flush synchronous.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(rx: Receiver<AuditRecord>, log_path: PathBuf, db_path: PathBuf) {
    let debounce = Duration::from_millis(FLUSH_DEBOUNCE_MS);
    let mut queue: Vec<AuditRecord> = Vec::new();
    loop {
        match rx.recv() {
            Ok(first) => {
                queue.push(first);
                let deadline = Instant::now() + debounce;
                while queue.len() < FLUSH_BATCH {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    match rx.recv_timeout(deadline - now) {
                        Ok(record) => queue.push(record),
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                flush(&log_path, &db_path, &mut queue);
            }
            Err(_) => break,
        }
    }
}

fn flush(log_path: &Path, db_path: &Path, queue: &mut Vec<AuditRecord>) {
    if queue.is_empty() {
        return;
    }
    if let Err(err) = append_jsonl(log_path, queue) {
        eprintln!(
            "warning: audit log write failed ({err}); diverting {} record(s) to the fallback table",
            queue.len()
        );
        if let Err(err) = persist_fallback(db_path, queue) {
            eprintln!(
                "warning: audit fallback write failed ({err}); {} record(s) lost",
                queue.len()
            );
        }
    }
    queue.clear();
}

fn append_jsonl(path: &Path, records: &[AuditRecord]) -> Result<(), TandemError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    for record in records {
        let json = serde_json::to_string(record)
            .map_err(|e| TandemError::Validation(format!("unserializable audit record: {e}")))?;
        writeln!(writer, "{json}")?;
    }
    writer.flush()?;
    Ok(())
}

fn persist_fallback(db_path: &Path, records: &[AuditRecord]) -> Result<(), TandemError> {
    let mut conn = db::db_connect(&db_path.to_string_lossy())?;
    let tx = conn.transaction()?;
    for record in records {
        tx.execute(
            "INSERT OR IGNORE INTO audit_fallback(event_id, ts, action, actor, task_id, details)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.event_id,
                record.ts,
                record.action,
                record.actor,
                record.task_id,
                record.details.to_string()
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}
