#![forbid(unsafe_code)]

mod error;
mod jobs;
mod requests;
mod streams;

pub use error::StoreError;
pub use requests::{
    EnqueueRequest, JobRow, LogRow, LogStream, MetricOutcome, MetricRow, MetricSample, StateCount,
    StatusSummary,
};

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE_NAME: &str = "queue.db";

pub const CONFIG_MAX_RETRIES: &str = "max_retries";
pub const CONFIG_BACKOFF_BASE: &str = "backoff_base";
pub const CONFIG_JOB_TIMEOUT: &str = "job_timeout";

pub const MAX_LIST_LIMIT: usize = 200;
pub const MAX_LOG_LIMIT: usize = 1_000;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);
const JOB_ID_COUNTER: &str = "job_seq";

const CONFIG_DEFAULTS: &[(&str, &str)] = &[
    (CONFIG_MAX_RETRIES, "3"),
    (CONFIG_BACKOFF_BASE, "2"),
    (CONFIG_JOB_TIMEOUT, "60"),
];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    state TEXT NOT NULL CHECK (state IN (
        'pending','waiting','scheduled','processing','failed','completed','dead'
    )),
    attempts INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    priority INTEGER NOT NULL DEFAULT 100,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    run_at_ms INTEGER,
    next_run_at_ms INTEGER,
    last_error TEXT,
    worker_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_claim
    ON jobs(state, next_run_at_ms, created_at_ms);

CREATE TABLE IF NOT EXISTS job_logs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    ts_ms INTEGER NOT NULL,
    stream TEXT NOT NULL CHECK (stream IN (
        'started','stdout','stderr','timeout','exit','error'
    )),
    message TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id, seq);

CREATE TABLE IF NOT EXISTS job_metrics (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    command TEXT NOT NULL,
    state TEXT NOT NULL CHECK (state IN ('completed','failed','timeout')),
    duration_s REAL NOT NULL,
    worker_id TEXT NOT NULL,
    completed_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_metrics_job ON job_metrics(job_id, seq);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

/// Durable job/config store backed by a single SQLite file.
///
/// A `SqliteStore` owns one connection and is not `Sync`; concurrent
/// claimants each open their own store over the same directory and rely
/// on the conditional-UPDATE claim protocol for mutual exclusion.
pub struct SqliteStore {
    conn: Connection,
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(DB_FILE_NAME);
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        let store = Self { conn, db_path };
        store.install_schema()?;
        store.seed_config_defaults()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn install_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn seed_config_defaults(&self) -> Result<(), StoreError> {
        for (key, value) in CONFIG_DEFAULTS {
            self.conn.execute(
                "INSERT OR IGNORE INTO config(key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        Ok(())
    }

    pub fn set_config(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(StoreError::InvalidInput("config key must not be empty"));
        }
        self.conn.execute(
            "INSERT INTO config(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Typed config read; unset or unparsable values fall back.
    pub fn config_i64(&self, key: &str, fallback: i64) -> Result<i64, StoreError> {
        let value = self.get_config(key)?;
        Ok(value
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(fallback))
    }

    pub fn config_f64(&self, key: &str, fallback: f64) -> Result<f64, StoreError> {
        let value = self.get_config(key)?;
        Ok(value
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .unwrap_or(fallback))
    }
}

fn next_counter_tx(tx: &Transaction<'_>, name: &str) -> Result<i64, StoreError> {
    tx.execute(
        "INSERT INTO counters(name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1",
        params![name],
    )?;
    let value = tx.query_row(
        "SELECT value FROM counters WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(value)
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

pub(crate) fn clip(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    value.chars().take(max_len).collect()
}
