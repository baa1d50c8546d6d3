#![forbid(unsafe_code)]

use super::{MAX_LOG_LIMIT, SqliteStore, StoreError, clip, now_ms};
use crate::store::requests::{LogRow, LogStream, MetricOutcome, MetricRow, MetricSample};
use rusqlite::params;

const MAX_LOG_MESSAGE_LEN: usize = 8_192;

impl SqliteStore {
    /// Appends one log line for a job. Single statement; callers treat
    /// failures as best-effort and never let them abort a transition.
    pub fn append_log(
        &mut self,
        job_id: &str,
        stream: LogStream,
        message: &str,
    ) -> Result<i64, StoreError> {
        let message = clip(message, MAX_LOG_MESSAGE_LEN);
        self.conn.execute(
            "INSERT INTO job_logs(job_id, ts_ms, stream, message) VALUES (?1, ?2, ?3, ?4)",
            params![job_id, now_ms(), stream.as_str(), message],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Records one terminal execution attempt. Best-effort, like
    /// `append_log`.
    pub fn record_metric(&mut self, sample: &MetricSample) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO job_metrics(
                 job_id, command, state, duration_s, worker_id, completed_at_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sample.job_id,
                sample.command,
                sample.outcome.as_str(),
                sample.duration_s,
                sample.worker_id,
                now_ms()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn job_logs(&self, job_id: &str, limit: usize) -> Result<Vec<LogRow>, StoreError> {
        let limit = limit.clamp(1, MAX_LOG_LIMIT) as i64;
        let mut stmt = self.conn.prepare(
            "SELECT seq, job_id, ts_ms, stream, message
             FROM job_logs WHERE job_id = ?1
             ORDER BY seq ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![job_id, limit], |row| {
            let stream: String = row.get(3)?;
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                stream,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut logs = Vec::new();
        for row in rows {
            let (seq, job_id, ts_ms, stream, message) = row?;
            let stream = LogStream::parse(&stream)
                .ok_or(StoreError::InvalidInput("unexpected stream in job_logs"))?;
            logs.push(LogRow {
                seq,
                job_id,
                ts_ms,
                stream,
                message,
            });
        }
        Ok(logs)
    }

    pub fn job_metrics(&self, job_id: &str, limit: usize) -> Result<Vec<MetricRow>, StoreError> {
        let limit = limit.clamp(1, MAX_LOG_LIMIT) as i64;
        let mut stmt = self.conn.prepare(
            "SELECT seq, job_id, command, state, duration_s, worker_id, completed_at_ms
             FROM job_metrics WHERE job_id = ?1
             ORDER BY seq ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![job_id, limit], |row| {
            let outcome: String = row.get(3)?;
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                outcome,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;
        let mut metrics = Vec::new();
        for row in rows {
            let (seq, job_id, command, outcome, duration_s, worker_id, completed_at_ms) = row?;
            let outcome = MetricOutcome::parse(&outcome)
                .ok_or(StoreError::InvalidInput("unexpected state in job_metrics"))?;
            metrics.push(MetricRow {
                seq,
                job_id,
                command,
                outcome,
                duration_s,
                worker_id,
                completed_at_ms,
            });
        }
        Ok(metrics)
    }
}
