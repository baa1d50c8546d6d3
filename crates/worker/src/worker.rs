#![forbid(unsafe_code)]

use crate::config::WorkerConfig;
use crate::executor;
use crate::now_ms;
use pq_storage::{SqliteStore, StoreError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One claim loop over its own store connection. Workers never talk to
/// each other; the conditional claim update is the only coordination.
pub struct Worker {
    id: String,
    store: SqliteStore,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        id: String,
        config: WorkerConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, StoreError> {
        let store = SqliteStore::open(&config.storage_dir)?;
        Ok(Self {
            id,
            store,
            config,
            shutdown,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cycle: sweep, stop check, claim, execute. A claimed job always
    /// runs to a terminal state before the loop advances, so a stop
    /// request never abandons work in flight.
    pub fn run(mut self) {
        loop {
            if let Err(err) = self.sweep() {
                eprintln!("[worker {}] sweep failed: {err}", self.id);
                std::thread::sleep(self.config.error_backoff);
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match self.store.claim_next(&self.id) {
                Ok(Some(job)) => {
                    executor::execute(&mut self.store, &self.config, &self.id, &job);
                }
                Ok(None) => std::thread::sleep(self.config.poll_interval),
                Err(err) => {
                    eprintln!("[worker {}] claim failed: {err}", self.id);
                    std::thread::sleep(self.config.error_backoff);
                }
            }
        }
    }

    // Idempotent, so it is fine that every worker runs it every cycle.
    fn sweep(&mut self) -> Result<(), StoreError> {
        let now = now_ms();
        self.store.promote_scheduled(now)?;
        self.store.reactivate_waiting(now)?;
        self.store.recover_stalled(now)?;
        Ok(())
    }
}
