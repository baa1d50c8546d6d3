#![forbid(unsafe_code)]

use pq_core::ids::IdError;
use std::fmt;

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    InvalidInput(&'static str),
    InvalidId(IdError),
    UnknownJob(String),
    JobExists(String),
    JobNotDead { job_id: String, state: String },
    JobNotWaiting { job_id: String, state: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Sql(err) => write!(f, "sqlite error: {err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::InvalidId(err) => write!(f, "invalid id: {err}"),
            Self::UnknownJob(job_id) => write!(f, "unknown job: {job_id}"),
            Self::JobExists(job_id) => write!(f, "job already exists: {job_id}"),
            Self::JobNotDead { job_id, state } => {
                write!(f, "job {job_id} is not dead (state: {state})")
            }
            Self::JobNotWaiting { job_id, state } => {
                write!(f, "job {job_id} is not waiting (state: {state})")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Sql(err) => Some(err),
            Self::InvalidId(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sql(err)
    }
}

impl From<IdError> for StoreError {
    fn from(err: IdError) -> Self {
        Self::InvalidId(err)
    }
}
