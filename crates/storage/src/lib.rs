#![forbid(unsafe_code)]

mod store;

pub use store::{
    CONFIG_BACKOFF_BASE, CONFIG_JOB_TIMEOUT, CONFIG_MAX_RETRIES, DB_FILE_NAME, EnqueueRequest,
    JobRow, LogRow, LogStream, MAX_LIST_LIMIT, MAX_LOG_LIMIT, MetricOutcome, MetricRow,
    MetricSample, SqliteStore, StateCount, StatusSummary, StoreError,
};
