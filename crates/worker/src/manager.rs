#![forbid(unsafe_code)]

use crate::config::WorkerConfig;
use crate::now_ms;
use crate::worker::Worker;
use pq_storage::{SqliteStore, StoreError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// Owns a pool of worker threads over one storage directory.
pub struct WorkerManager {
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerManager {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    /// Requeues jobs a previous process left in `processing`, then
    /// spawns `count` workers. Exited workers are not replaced.
    pub fn start(&mut self, count: usize) -> Result<(), StoreError> {
        let mut store = SqliteStore::open(&self.config.storage_dir)?;
        let requeued = store.reset_stuck_processing()?;
        if requeued > 0 {
            eprintln!("[manager] requeued {requeued} jobs stuck in processing");
        }
        drop(store);

        self.shutdown.store(false, Ordering::SeqCst);
        for index in 0..count {
            let id = worker_id(index);
            let worker = Worker::new(id.clone(), self.config.clone(), Arc::clone(&self.shutdown))?;
            let handle = std::thread::Builder::new()
                .name(id)
                .spawn(move || worker.run())?;
            self.handles.push(handle);
        }
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.handles
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Blocks until every worker has finished its in-flight job and
    /// exited its loop.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                eprintln!("[manager] worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_id(index: usize) -> String {
    format!("worker-{}-{}-{index}", now_ms(), std::process::id())
}
