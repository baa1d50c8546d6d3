#![forbid(unsafe_code)]

use pq_core::state::JobState;

/// Parameters for a new job. Everything except the command is optional;
/// unset fields fall back to durable config or schema defaults.
#[derive(Clone, Debug, Default)]
pub struct EnqueueRequest {
    pub id: Option<String>,
    pub command: String,
    pub priority: Option<i64>,
    pub run_at_ms: Option<i64>,
    pub max_retries: Option<i64>,
    pub waiting: bool,
}

/// One row of the `jobs` table.
#[derive(Clone, Debug, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub priority: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub run_at_ms: Option<i64>,
    pub next_run_at_ms: Option<i64>,
    pub last_error: Option<String>,
    pub worker_id: Option<String>,
}

/// Source tag for an append-only job log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogStream {
    Started,
    Stdout,
    Stderr,
    Timeout,
    Exit,
    Error,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Timeout => "timeout",
            Self::Exit => "exit",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "started" => Some(Self::Started),
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            "timeout" => Some(Self::Timeout),
            "exit" => Some(Self::Exit),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogRow {
    pub seq: i64,
    pub job_id: String,
    pub ts_ms: i64,
    pub stream: LogStream,
    pub message: String,
}

/// How an execution attempt ended. `Timeout` is distinct from `Failed`
/// even when the killed process reports a zero exit status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricOutcome {
    Completed,
    Failed,
    Timeout,
}

impl MetricOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for MetricOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One terminal execution attempt, as recorded by a worker.
#[derive(Clone, Debug)]
pub struct MetricSample {
    pub job_id: String,
    pub command: String,
    pub outcome: MetricOutcome,
    pub duration_s: f64,
    pub worker_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricRow {
    pub seq: i64,
    pub job_id: String,
    pub command: String,
    pub outcome: MetricOutcome,
    pub duration_s: f64,
    pub worker_id: String,
    pub completed_at_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateCount {
    pub state: JobState,
    pub count: i64,
}

/// Queue snapshot: per-state counts plus how many pending jobs are due
/// right now. Failed jobs awaiting a retry are not counted even once
/// their backoff elapses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusSummary {
    pub counts: Vec<StateCount>,
    pub ready_pending: i64,
}
