#![forbid(unsafe_code)]

mod config;
mod executor;
mod manager;
mod worker;

pub use config::WorkerConfig;
pub use manager::WorkerManager;
pub use worker::Worker;

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
