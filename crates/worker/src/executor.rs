#![forbid(unsafe_code)]

use crate::config::WorkerConfig;
use pq_core::retry;
use pq_storage::{
    CONFIG_BACKOFF_BASE, CONFIG_JOB_TIMEOUT, JobRow, LogStream, MetricOutcome, MetricSample,
    SqliteStore,
};
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const SUPERVISE_POLL: Duration = Duration::from_millis(50);
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(60);
const FALLBACK_BACKOFF_BASE: f64 = 2.0;

/// Runs one claimed job to a terminal state.
///
/// Log and metric writes are best-effort throughout; only the final
/// state transition is allowed to surface an error, and that is logged
/// rather than propagated because the worker loop must keep going.
pub(crate) fn execute(
    store: &mut SqliteStore,
    config: &WorkerConfig,
    worker_id: &str,
    job: &JobRow,
) {
    let started = Instant::now();
    let attempts = job.attempts + 1;
    let _ = store.append_log(
        &job.id,
        LogStream::Started,
        &format!("attempt {attempts} on {worker_id}"),
    );

    // Read fresh per execution so config changes apply to the next run.
    let timeout = job_timeout(store);
    let backoff_base = store
        .config_f64(CONFIG_BACKOFF_BASE, FALLBACK_BACKOFF_BASE)
        .unwrap_or(FALLBACK_BACKOFF_BASE);
    let backoff_seconds = retry::retry_delay_seconds(backoff_base, attempts);

    // The child sees the stored attempt count: zero on the first run.
    let mut child = match spawn_shell(&job.command, job.attempts) {
        Ok(child) => child,
        Err(err) => {
            let message = format!("spawn failed: {err}");
            let _ = store.append_log(&job.id, LogStream::Error, &message);
            settle_failure(store, job, attempts, backoff_seconds, &message);
            emit_metric(
                store,
                job,
                worker_id,
                MetricOutcome::Failed,
                started.elapsed(),
            );
            return;
        }
    };

    let (line_tx, line_rx) = mpsc::channel::<(LogStream, String)>();
    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(LogStream::Stdout, stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(LogStream::Stderr, stderr, line_tx.clone()));
    }
    drop(line_tx);

    let mut timed_out = false;
    let mut kill_at: Option<Instant> = None;
    let exit_status: Option<ExitStatus> = loop {
        drain_lines(store, &job.id, &line_rx);
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(err) => {
                let _ = store.append_log(&job.id, LogStream::Error, &format!("wait failed: {err}"));
                let _ = child.kill();
                break child.wait().ok();
            }
        }
        if !timed_out && started.elapsed() >= timeout {
            timed_out = true;
            let _ = store.append_log(
                &job.id,
                LogStream::Timeout,
                &format!("timed out after {}s, terminating", timeout.as_secs()),
            );
            request_terminate(&mut child);
            kill_at = Some(Instant::now() + config.kill_grace);
        }
        if kill_at.is_some_and(|at| Instant::now() >= at) {
            let _ = child.kill();
            kill_at = None;
        }
        std::thread::sleep(SUPERVISE_POLL);
    };
    for reader in readers {
        let _ = reader.join();
    }
    drain_lines(store, &job.id, &line_rx);

    let duration = started.elapsed();
    // Timeout is its own terminal reason and wins over whatever status
    // the killed process managed to report.
    if timed_out {
        let message = format!("timeout after {}s", timeout.as_secs());
        settle_failure(store, job, attempts, backoff_seconds, &message);
        emit_metric(store, job, worker_id, MetricOutcome::Timeout, duration);
        return;
    }
    match exit_status {
        Some(status) if status.success() => {
            let _ = store.append_log(&job.id, LogStream::Exit, "exit status 0");
            if let Err(err) = store.mark_completed(&job.id) {
                eprintln!("[worker {worker_id}] mark_completed {} failed: {err}", job.id);
            }
            emit_metric(store, job, worker_id, MetricOutcome::Completed, duration);
        }
        Some(status) => {
            let message = status.to_string();
            let _ = store.append_log(&job.id, LogStream::Exit, &message);
            settle_failure(store, job, attempts, backoff_seconds, &message);
            emit_metric(store, job, worker_id, MetricOutcome::Failed, duration);
        }
        None => {
            let message = "process could not be awaited".to_string();
            settle_failure(store, job, attempts, backoff_seconds, &message);
            emit_metric(store, job, worker_id, MetricOutcome::Failed, duration);
        }
    }
}

fn settle_failure(
    store: &mut SqliteStore,
    job: &JobRow,
    attempts: i64,
    backoff_seconds: f64,
    message: &str,
) {
    if let Err(err) = store.mark_failed(&job.id, message, attempts, job.max_retries, backoff_seconds)
    {
        eprintln!("[worker] mark_failed {} failed: {err}", job.id);
    }
}

fn emit_metric(
    store: &mut SqliteStore,
    job: &JobRow,
    worker_id: &str,
    outcome: MetricOutcome,
    duration: Duration,
) {
    let _ = store.record_metric(&MetricSample {
        job_id: job.id.clone(),
        command: job.command.clone(),
        outcome,
        duration_s: duration.as_secs_f64(),
        worker_id: worker_id.to_string(),
    });
}

fn job_timeout(store: &SqliteStore) -> Duration {
    let seconds = store
        .config_f64(CONFIG_JOB_TIMEOUT, FALLBACK_TIMEOUT.as_secs_f64())
        .unwrap_or(FALLBACK_TIMEOUT.as_secs_f64());
    // try_from rejects NaN, negatives, and values too large for a
    // Duration; a bad config value must never panic the worker thread.
    if seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).unwrap_or(FALLBACK_TIMEOUT)
    } else {
        FALLBACK_TIMEOUT
    }
}

fn spawn_shell(command: &str, attempt: i64) -> std::io::Result<Child> {
    let mut shell = shell_command(command);
    shell
        .env("ATTEMPT", attempt.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> Command {
    let mut shell = Command::new("/bin/sh");
    shell.arg("-c").arg(command);
    shell
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut shell = Command::new("cmd.exe");
    shell.arg("/C").arg(command);
    shell
}

#[cfg(unix)]
fn request_terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child) {
    let _ = child.kill();
}

fn spawn_reader(
    stream: LogStream,
    source: impl Read + Send + 'static,
    line_tx: mpsc::Sender<(LogStream, String)>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let reader = BufReader::new(source);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if line_tx.send((stream, line)).is_err() {
                break;
            }
        }
    })
}

fn drain_lines(
    store: &mut SqliteStore,
    job_id: &str,
    line_rx: &mpsc::Receiver<(LogStream, String)>,
) {
    for (stream, line) in line_rx.try_iter() {
        let _ = store.append_log(job_id, stream, &line);
    }
}
