#![cfg(unix)]

use pq_core::state::JobState;
use pq_storage::{EnqueueRequest, LogStream, MetricOutcome, SqliteStore};
use pq_worker::{WorkerConfig, WorkerManager};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn temp_dir(name: &str) -> PathBuf {
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("pq-{name}-{}-{nonce}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn fast_config(dir: &Path) -> WorkerConfig {
    let mut config = WorkerConfig::new(dir);
    config.poll_interval = Duration::from_millis(50);
    config.kill_grace = Duration::from_millis(500);
    config.error_backoff = Duration::from_millis(50);
    config
}

fn wait_for_state(store: &SqliteStore, id: &str, wanted: JobState, deadline: Duration) -> JobState {
    let started = Instant::now();
    loop {
        let job = store.get_job(id).expect("get job").expect("job exists");
        if job.state == wanted || started.elapsed() > deadline {
            return job.state;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn successful_job_completes_and_streams_output() {
    let dir = temp_dir("exec-ok");
    let mut store = SqliteStore::open(&dir).expect("open store");
    let job = store
        .enqueue(EnqueueRequest {
            command: "echo hello; echo oops >&2".to_string(),
            ..Default::default()
        })
        .expect("enqueue");

    let mut manager = WorkerManager::new(fast_config(&dir));
    manager.start(1).expect("start");
    let state = wait_for_state(&store, &job.id, JobState::Completed, Duration::from_secs(10));
    manager.stop();
    assert_eq!(state, JobState::Completed);

    let logs = store.job_logs(&job.id, 100).expect("logs");
    assert!(
        logs.iter()
            .any(|row| row.stream == LogStream::Stdout && row.message == "hello")
    );
    assert!(
        logs.iter()
            .any(|row| row.stream == LogStream::Stderr && row.message == "oops")
    );
    assert!(logs.iter().any(|row| row.stream == LogStream::Exit));

    let metrics = store.job_metrics(&job.id, 100).expect("metrics");
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].outcome, MetricOutcome::Completed);
    assert!(metrics[0].duration_s >= 0.0);
}

#[test]
fn attempt_counter_is_visible_to_the_child() {
    let dir = temp_dir("exec-attempt");
    let mut store = SqliteStore::open(&dir).expect("open store");
    let job = store
        .enqueue(EnqueueRequest {
            command: "echo attempt=$ATTEMPT".to_string(),
            ..Default::default()
        })
        .expect("enqueue");

    let mut manager = WorkerManager::new(fast_config(&dir));
    manager.start(1).expect("start");
    wait_for_state(&store, &job.id, JobState::Completed, Duration::from_secs(10));
    manager.stop();

    // The stored attempt count is what the child sees, so the first
    // run observes zero.
    let logs = store.job_logs(&job.id, 100).expect("logs");
    assert!(
        logs.iter()
            .any(|row| row.stream == LogStream::Stdout && row.message == "attempt=0")
    );
}

#[test]
fn absurd_timeout_config_falls_back_instead_of_killing_the_worker() {
    let dir = temp_dir("exec-timeout-overflow");
    let mut store = SqliteStore::open(&dir).expect("open store");
    // Too large for a Duration; the executor must fall back, not panic.
    store.set_config("job_timeout", "1e20").expect("set timeout");
    let job = store
        .enqueue(EnqueueRequest {
            command: "echo hi".to_string(),
            ..Default::default()
        })
        .expect("enqueue");

    let mut manager = WorkerManager::new(fast_config(&dir));
    manager.start(1).expect("start");
    let state = wait_for_state(&store, &job.id, JobState::Completed, Duration::from_secs(10));
    assert_eq!(state, JobState::Completed);
    assert_eq!(manager.active_count(), 1, "worker survived the bad config");
    manager.stop();
}

#[test]
fn failing_job_exhausts_retries_and_goes_dead() {
    let dir = temp_dir("exec-dead");
    let mut store = SqliteStore::open(&dir).expect("open store");
    let job = store
        .enqueue(EnqueueRequest {
            command: "exit 3".to_string(),
            max_retries: Some(0),
            ..Default::default()
        })
        .expect("enqueue");

    let mut manager = WorkerManager::new(fast_config(&dir));
    manager.start(1).expect("start");
    let state = wait_for_state(&store, &job.id, JobState::Dead, Duration::from_secs(10));
    manager.stop();
    assert_eq!(state, JobState::Dead);

    let job = store.get_job(&job.id).expect("get").expect("exists");
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.expect("error recorded").contains("3"));
    let metrics = store.job_metrics(&job.id, 100).expect("metrics");
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].outcome, MetricOutcome::Failed);
}

#[test]
fn timeout_kills_the_child_and_is_its_own_outcome() {
    let dir = temp_dir("exec-timeout");
    let mut store = SqliteStore::open(&dir).expect("open store");
    store.set_config("job_timeout", "1").expect("set timeout");
    let job = store
        .enqueue(EnqueueRequest {
            command: "sleep 30".to_string(),
            max_retries: Some(0),
            ..Default::default()
        })
        .expect("enqueue");

    let started = Instant::now();
    let mut manager = WorkerManager::new(fast_config(&dir));
    manager.start(1).expect("start");
    let state = wait_for_state(&store, &job.id, JobState::Dead, Duration::from_secs(20));
    manager.stop();
    assert_eq!(state, JobState::Dead);
    // Far sooner than the 30s the command asked for.
    assert!(started.elapsed() < Duration::from_secs(15));

    let logs = store.job_logs(&job.id, 100).expect("logs");
    assert!(logs.iter().any(|row| row.stream == LogStream::Timeout));
    let metrics = store.job_metrics(&job.id, 100).expect("metrics");
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].outcome, MetricOutcome::Timeout);
    let job = store.get_job(&job.id).expect("get").expect("exists");
    assert!(job.last_error.expect("error recorded").contains("timeout"));
}

#[test]
fn stop_waits_for_the_inflight_job() {
    let dir = temp_dir("exec-stop");
    let mut store = SqliteStore::open(&dir).expect("open store");
    let job = store
        .enqueue(EnqueueRequest {
            command: "sleep 1; echo done".to_string(),
            ..Default::default()
        })
        .expect("enqueue");

    let mut manager = WorkerManager::new(fast_config(&dir));
    manager.start(1).expect("start");
    let state = wait_for_state(&store, &job.id, JobState::Processing, Duration::from_secs(10));
    assert_eq!(state, JobState::Processing);

    manager.stop();
    // stop() blocked until the worker finished the job.
    let job = store.get_job(&job.id).expect("get").expect("exists");
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(manager.active_count(), 0);
}

#[test]
fn start_requeues_jobs_stuck_in_processing() {
    let dir = temp_dir("exec-recover");
    let mut store = SqliteStore::open(&dir).expect("open store");
    let job = store
        .enqueue(EnqueueRequest {
            command: "echo recovered".to_string(),
            ..Default::default()
        })
        .expect("enqueue");
    // Simulate a crashed process that never finished its claim.
    store.claim_next("worker-gone").expect("claim").expect("some");

    let mut manager = WorkerManager::new(fast_config(&dir));
    manager.start(1).expect("start");
    let state = wait_for_state(&store, &job.id, JobState::Completed, Duration::from_secs(10));
    manager.stop();
    assert_eq!(state, JobState::Completed);
}

#[test]
fn pool_drains_a_batch_across_workers() {
    let dir = temp_dir("exec-pool");
    let mut store = SqliteStore::open(&dir).expect("open store");
    let mut ids = Vec::new();
    for index in 0..6 {
        ids.push(
            store
                .enqueue(EnqueueRequest {
                    command: format!("echo job-{index}"),
                    ..Default::default()
                })
                .expect("enqueue")
                .id,
        );
    }

    let mut manager = WorkerManager::new(fast_config(&dir));
    manager.start(3).expect("start");
    assert_eq!(manager.active_count(), 3);
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let done = ids
            .iter()
            .filter(|id| {
                store
                    .get_job(id)
                    .expect("get")
                    .is_some_and(|job| job.state == JobState::Completed)
            })
            .count();
        if done == ids.len() || Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    manager.stop();
    for id in &ids {
        let job = store.get_job(id).expect("get").expect("exists");
        assert_eq!(job.state, JobState::Completed, "job {id}");
    }
}
