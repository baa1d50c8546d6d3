#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

/// Runtime tuning for a worker pool. Intervals are configuration, not
/// constants, so tests can shrink them.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub storage_dir: PathBuf,
    /// Idle sleep between claim attempts.
    pub poll_interval: Duration,
    /// How long a timed-out child gets between the terminate request
    /// and the forced kill.
    pub kill_grace: Duration,
    /// Sleep after an unexpected store error before the loop resumes.
    pub error_backoff: Duration,
}

impl WorkerConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            poll_interval: Duration::from_secs(1),
            kill_grace: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }
}
