#![forbid(unsafe_code)]

use super::{
    CONFIG_MAX_RETRIES, JOB_ID_COUNTER, MAX_LIST_LIMIT, SqliteStore, StoreError, clip,
    next_counter_tx, now_ms,
};
use crate::store::requests::{EnqueueRequest, JobRow, StateCount, StatusSummary};
use pq_core::ids::{validate_job_id, validate_worker_id};
use pq_core::retry;
use pq_core::state::JobState;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

const MAX_COMMAND_LEN: usize = 10_000;
const MAX_ERROR_LEN: usize = 4_000;
const DEFAULT_PRIORITY: i64 = 100;
const FALLBACK_MAX_RETRIES: i64 = 3;

const SELECT_JOB: &str = "SELECT id, command, state, attempts, max_retries, priority, \
     created_at_ms, updated_at_ms, run_at_ms, next_run_at_ms, last_error, worker_id \
     FROM jobs WHERE id = ?1";

impl SqliteStore {
    /// Inserts a new job. State is `scheduled` when `run_at_ms` lies in
    /// the future, `waiting` when the deferred flag is set, `pending`
    /// otherwise. A waiting job keeps an optional wake time in
    /// `next_run_at_ms` so the sweep can promote it later.
    pub fn enqueue(&mut self, request: EnqueueRequest) -> Result<JobRow, StoreError> {
        let command = request.command.trim().to_string();
        if command.is_empty() {
            return Err(StoreError::InvalidInput("command must not be empty"));
        }
        if command.len() > MAX_COMMAND_LEN {
            return Err(StoreError::InvalidInput("command is too long"));
        }
        let max_retries = match request.max_retries {
            Some(value) if value >= 0 => value,
            Some(_) => {
                return Err(StoreError::InvalidInput("max_retries must be non-negative"));
            }
            None => self.config_i64(CONFIG_MAX_RETRIES, FALLBACK_MAX_RETRIES)?,
        };
        let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);
        let now = now_ms();
        let state = if request.waiting {
            JobState::Waiting
        } else if request.run_at_ms.is_some_and(|at| at > now) {
            JobState::Scheduled
        } else {
            JobState::Pending
        };
        let wake_ms = if request.waiting {
            request.run_at_ms
        } else {
            None
        };

        let tx = self.conn.transaction()?;
        let id = match request.id.as_deref() {
            Some(raw) => validate_job_id(raw)?.to_string(),
            None => format!("JOB-{}", next_counter_tx(&tx, JOB_ID_COUNTER)?),
        };
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO jobs(
                 id, command, state, attempts, max_retries, priority,
                 created_at_ms, updated_at_ms, run_at_ms, next_run_at_ms
             ) VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?6, ?7, ?8)",
            params![
                id,
                command,
                state.as_str(),
                max_retries,
                priority,
                now,
                request.run_at_ms,
                wake_ms
            ],
        )?;
        if inserted != 1 {
            return Err(StoreError::JobExists(id));
        }
        let job = get_job_conn(&tx, &id)?.ok_or_else(|| StoreError::UnknownJob(id.clone()))?;
        tx.commit()?;
        Ok(job)
    }

    /// Atomic claim. Selects the oldest eligible job, then flips it to
    /// `processing` with a conditional UPDATE that re-checks the same
    /// eligibility predicate. Losing the race to another claimant is a
    /// defined outcome (`Ok(None)`), never an error.
    pub fn claim_next(&mut self, worker_id: &str) -> Result<Option<JobRow>, StoreError> {
        let worker_id = validate_worker_id(worker_id)?.to_string();
        let now = now_ms();
        // Immediate, not deferred: the select-then-update pair must take
        // the write lock up front so concurrent claimants queue on the
        // busy timeout instead of failing their snapshot upgrade.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs
                 WHERE state IN ('pending','failed')
                   AND (next_run_at_ms IS NULL OR next_run_at_ms <= ?1)
                 ORDER BY created_at_ms ASC, priority ASC, id ASC
                 LIMIT 1",
                params![now],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = candidate else {
            return Ok(None);
        };
        let changed = tx.execute(
            "UPDATE jobs SET state = 'processing', worker_id = ?1, updated_at_ms = ?2
             WHERE id = ?3
               AND state IN ('pending','failed')
               AND (next_run_at_ms IS NULL OR next_run_at_ms <= ?2)",
            params![worker_id, now, id],
        )?;
        if changed != 1 {
            return Ok(None);
        }
        let job = get_job_conn(&tx, &id)?;
        tx.commit()?;
        Ok(job)
    }

    pub fn mark_completed(&mut self, id: &str) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE jobs SET state = 'completed', worker_id = NULL,
                 next_run_at_ms = NULL, updated_at_ms = ?1
             WHERE id = ?2",
            params![now_ms(), id],
        )?;
        if changed != 1 {
            return Err(StoreError::UnknownJob(id.to_string()));
        }
        Ok(())
    }

    /// Records a failed attempt. `attempts > max_retries` sends the job
    /// to the dead-letter state; otherwise it becomes `failed` with a
    /// wake time `backoff_seconds` from now.
    pub fn mark_failed(
        &mut self,
        id: &str,
        error: &str,
        attempts: i64,
        max_retries: i64,
        backoff_seconds: f64,
    ) -> Result<JobRow, StoreError> {
        let error = clip(error, MAX_ERROR_LEN);
        let now = now_ms();
        let tx = self.conn.transaction()?;
        let changed = if attempts > max_retries {
            tx.execute(
                "UPDATE jobs SET state = 'dead', attempts = ?1, last_error = ?2,
                     worker_id = NULL, next_run_at_ms = NULL, updated_at_ms = ?3
                 WHERE id = ?4",
                params![attempts, error, now, id],
            )?
        } else {
            let wake = retry::next_run_at_ms(now, backoff_seconds);
            tx.execute(
                "UPDATE jobs SET state = 'failed', attempts = ?1, last_error = ?2,
                     worker_id = NULL, next_run_at_ms = ?3, updated_at_ms = ?4
                 WHERE id = ?5",
                params![attempts, error, wake, now, id],
            )?
        };
        if changed != 1 {
            return Err(StoreError::UnknownJob(id.to_string()));
        }
        let job = get_job_conn(&tx, id)?.ok_or_else(|| StoreError::UnknownJob(id.to_string()))?;
        tx.commit()?;
        Ok(job)
    }

    /// Scheduled jobs whose start time has arrived become pending.
    pub fn promote_scheduled(&mut self, now_ms: i64) -> Result<usize, StoreError> {
        let changed = self.conn.execute(
            "UPDATE jobs SET state = 'pending', updated_at_ms = ?1
             WHERE state = 'scheduled' AND run_at_ms IS NOT NULL AND run_at_ms <= ?1",
            params![now_ms],
        )?;
        Ok(changed)
    }

    /// Waiting jobs with an elapsed wake time become pending.
    pub fn reactivate_waiting(&mut self, now_ms: i64) -> Result<usize, StoreError> {
        let changed = self.conn.execute(
            "UPDATE jobs SET state = 'pending', next_run_at_ms = NULL, updated_at_ms = ?1
             WHERE state = 'waiting'
               AND next_run_at_ms IS NOT NULL AND next_run_at_ms <= ?1",
            params![now_ms],
        )?;
        Ok(changed)
    }

    /// Promotes one waiting job explicitly, regardless of wake time.
    pub fn release_waiting(&mut self, id: &str) -> Result<JobRow, StoreError> {
        let now = now_ms();
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE jobs SET state = 'pending', next_run_at_ms = NULL, updated_at_ms = ?1
             WHERE id = ?2 AND state = 'waiting'",
            params![now, id],
        )?;
        if changed != 1 {
            return Err(job_state_mismatch(&tx, id, |state| {
                StoreError::JobNotWaiting {
                    job_id: id.to_string(),
                    state,
                }
            })?);
        }
        let job = get_job_conn(&tx, id)?.ok_or_else(|| StoreError::UnknownJob(id.to_string()))?;
        tx.commit()?;
        Ok(job)
    }

    /// Safety net for rows carrying a stale wake time in a state the
    /// claim predicate never reaches.
    pub fn recover_stalled(&mut self, now_ms: i64) -> Result<usize, StoreError> {
        let changed = self.conn.execute(
            "UPDATE jobs SET state = 'pending', next_run_at_ms = NULL, updated_at_ms = ?1
             WHERE state IN ('scheduled','waiting')
               AND next_run_at_ms IS NOT NULL AND next_run_at_ms <= ?1",
            params![now_ms],
        )?;
        Ok(changed)
    }

    /// Startup crash recovery: jobs a dead process left in `processing`
    /// go back to pending.
    pub fn reset_stuck_processing(&mut self) -> Result<usize, StoreError> {
        let changed = self.conn.execute(
            "UPDATE jobs SET state = 'pending', worker_id = NULL, updated_at_ms = ?1
             WHERE state = 'processing'",
            params![now_ms()],
        )?;
        Ok(changed)
    }

    /// Manual dead-letter retry. Guarded on `state = 'dead'`; any other
    /// state fails without mutating the row.
    pub fn dlq_retry(&mut self, id: &str) -> Result<JobRow, StoreError> {
        let now = now_ms();
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE jobs SET state = 'pending', attempts = 0, last_error = NULL,
                 next_run_at_ms = NULL, worker_id = NULL, updated_at_ms = ?1
             WHERE id = ?2 AND state = 'dead'",
            params![now, id],
        )?;
        if changed != 1 {
            return Err(job_state_mismatch(&tx, id, |state| StoreError::JobNotDead {
                job_id: id.to_string(),
                state,
            })?);
        }
        let job = get_job_conn(&tx, id)?.ok_or_else(|| StoreError::UnknownJob(id.to_string()))?;
        tx.commit()?;
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRow>, StoreError> {
        get_job_conn(&self.conn, id)
    }

    pub fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<JobRow>, StoreError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT) as i64;
        let mut jobs = Vec::new();
        match state {
            Some(state) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, command, state, attempts, max_retries, priority,
                         created_at_ms, updated_at_ms, run_at_ms, next_run_at_ms,
                         last_error, worker_id
                     FROM jobs WHERE state = ?1
                     ORDER BY created_at_ms DESC, id DESC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![state.as_str(), limit], read_job_row)?;
                for row in rows {
                    jobs.push(row?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, command, state, attempts, max_retries, priority,
                         created_at_ms, updated_at_ms, run_at_ms, next_run_at_ms,
                         last_error, worker_id
                     FROM jobs
                     ORDER BY created_at_ms DESC, id DESC
                     LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], read_job_row)?;
                for row in rows {
                    jobs.push(row?);
                }
            }
        }
        Ok(jobs)
    }

    pub fn list_dead(&self, limit: usize) -> Result<Vec<JobRow>, StoreError> {
        self.list_jobs(Some(JobState::Dead), limit)
    }

    pub fn status_summary(&self) -> Result<StatusSummary, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state ORDER BY state")?;
        let rows = stmt.query_map([], |row| {
            let state: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((state, count))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            let (state, count) = row?;
            let state = JobState::parse(&state)
                .map_err(|_| StoreError::InvalidInput("unexpected state in jobs table"))?;
            counts.push(StateCount { state, count });
        }
        let ready_pending: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM jobs
             WHERE state = 'pending'
               AND (next_run_at_ms IS NULL OR next_run_at_ms <= ?1)",
            params![now_ms()],
            |row| row.get(0),
        )?;
        Ok(StatusSummary {
            counts,
            ready_pending,
        })
    }

    /// Deletes a job; its log and metric rows cascade with it.
    pub fn delete_job(&mut self, id: &str) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Deletes every job (logs and metrics cascade). Counters stay so
    /// generated ids remain unique across resets.
    pub fn reset_all(&mut self) -> Result<usize, StoreError> {
        let changed = self.conn.execute("DELETE FROM jobs", [])?;
        Ok(changed)
    }
}

fn get_job_conn(conn: &Connection, id: &str) -> Result<Option<JobRow>, StoreError> {
    let job = conn
        .query_row(SELECT_JOB, params![id], read_job_row)
        .optional()?;
    Ok(job)
}

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    let state: String = row.get(2)?;
    let state = JobState::parse(&state).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(JobRow {
        id: row.get(0)?,
        command: row.get(1)?,
        state,
        attempts: row.get(3)?,
        max_retries: row.get(4)?,
        priority: row.get(5)?,
        created_at_ms: row.get(6)?,
        updated_at_ms: row.get(7)?,
        run_at_ms: row.get(8)?,
        next_run_at_ms: row.get(9)?,
        last_error: row.get(10)?,
        worker_id: row.get(11)?,
    })
}

fn job_state_mismatch(
    conn: &Connection,
    id: &str,
    wrong_state: impl FnOnce(String) -> StoreError,
) -> Result<StoreError, StoreError> {
    let state: Option<String> = conn
        .query_row("SELECT state FROM jobs WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(match state {
        Some(state) => wrong_state(state),
        None => StoreError::UnknownJob(id.to_string()),
    })
}
