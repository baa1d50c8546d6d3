#![forbid(unsafe_code)]

pub mod state {
    /// Lifecycle state of a job row.
    ///
    /// `Completed` is terminal and immutable. `Dead` is terminal except for
    /// the explicit manual-retry escape hatch. Claimable states are the ones
    /// a worker may transition to `Processing` through the atomic claim.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum JobState {
        Pending,
        Waiting,
        Scheduled,
        Processing,
        Failed,
        Completed,
        Dead,
    }

    impl JobState {
        pub fn as_str(self) -> &'static str {
            match self {
                Self::Pending => "pending",
                Self::Waiting => "waiting",
                Self::Scheduled => "scheduled",
                Self::Processing => "processing",
                Self::Failed => "failed",
                Self::Completed => "completed",
                Self::Dead => "dead",
            }
        }

        pub fn parse(value: &str) -> Result<Self, JobStateError> {
            match value.trim() {
                "pending" => Ok(Self::Pending),
                "waiting" => Ok(Self::Waiting),
                "scheduled" => Ok(Self::Scheduled),
                "processing" => Ok(Self::Processing),
                "failed" => Ok(Self::Failed),
                "completed" => Ok(Self::Completed),
                "dead" => Ok(Self::Dead),
                other => Err(JobStateError::Unknown(other.to_string())),
            }
        }

        pub fn is_terminal(self) -> bool {
            matches!(self, Self::Completed | Self::Dead)
        }

        pub fn is_claimable(self) -> bool {
            matches!(self, Self::Pending | Self::Failed)
        }
    }

    impl std::fmt::Display for JobState {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum JobStateError {
        Unknown(String),
    }

    impl std::fmt::Display for JobStateError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Unknown(value) => write!(f, "unknown job state: {value}"),
            }
        }
    }

    impl std::error::Error for JobStateError {}
}

pub mod ids {
    pub const MAX_JOB_ID_LEN: usize = 128;
    pub const MAX_WORKER_ID_LEN: usize = 128;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum IdError {
        Empty,
        TooLong,
        InvalidChar { ch: char, index: usize },
    }

    impl std::fmt::Display for IdError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Empty => write!(f, "id must not be empty"),
                Self::TooLong => write!(f, "id is too long"),
                Self::InvalidChar { ch, index } => {
                    write!(f, "id contains invalid char {ch:?} at index {index}")
                }
            }
        }
    }

    impl std::error::Error for IdError {}

    /// Client-supplied job ids are kept, generated ones look like `JOB-7`.
    /// Either way the id must be printable and bounded.
    pub fn validate_job_id(value: &str) -> Result<&str, IdError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(IdError::Empty);
        }
        if value.len() > MAX_JOB_ID_LEN {
            return Err(IdError::TooLong);
        }
        for (index, ch) in value.chars().enumerate() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | ':') {
                continue;
            }
            return Err(IdError::InvalidChar { ch, index });
        }
        Ok(value)
    }

    pub fn validate_worker_id(value: &str) -> Result<&str, IdError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(IdError::Empty);
        }
        if value.len() > MAX_WORKER_ID_LEN {
            return Err(IdError::TooLong);
        }
        Ok(value)
    }
}

pub mod retry {
    /// Delay before a failed job becomes eligible again: `base ^ attempts`.
    ///
    /// Pure exponential, no jitter, no cap; callers converting to an absolute
    /// timestamp must saturate rather than overflow.
    pub fn retry_delay_seconds(base: f64, attempts: i64) -> f64 {
        let exp = attempts.clamp(0, i32::MAX as i64) as i32;
        base.powi(exp)
    }

    /// Absolute wake-up time in epoch milliseconds, saturating on overflow.
    pub fn next_run_at_ms(now_ms: i64, delay_seconds: f64) -> i64 {
        let delay_ms = (delay_seconds * 1000.0).clamp(0.0, i64::MAX as f64) as i64;
        now_ms.saturating_add(delay_ms)
    }
}
