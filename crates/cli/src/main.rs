#![forbid(unsafe_code)]

use pq_core::state::JobState;
use pq_storage::{EnqueueRequest, SqliteStore, StoreError};
use pq_worker::{WorkerConfig, WorkerManager};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_STORAGE_DIR: &str = "pq-data";
const DEFAULT_LIST_LIMIT: usize = 50;

fn usage() {
    eprintln!("usage: pq [--storage-dir DIR] <command>");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  enqueue <json>                      add a job ({{\"command\": ...}})");
    eprintln!("  worker start [--count N]            run a worker pool");
    eprintln!("         [--run-for-s S] [--poll-ms MS] [--kill-grace-ms MS]");
    eprintln!("  status                              per-state counts");
    eprintln!("  list [state] [--limit N]            newest jobs first");
    eprintln!("  dlq list                            dead jobs");
    eprintln!("  dlq retry <id>                      requeue a dead job");
    eprintln!("  logs <id>                           job log lines");
    eprintln!("  metrics <id>                        job execution metrics");
    eprintln!("  delete <id>                         remove a job and its streams");
    eprintln!("  reset --yes                         remove every job");
    eprintln!("  config get <key> | set <key> <val>  durable configuration");
    eprintln!();
    eprintln!("storage dir: --storage-dir, else PQ_STORAGE_DIR, else ./{DEFAULT_STORAGE_DIR}");
}

#[derive(Debug)]
enum CliError {
    Usage(String),
    Failed(String),
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        Self::Failed(err.to_string())
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(args) {
        Ok(()) => {}
        Err(CliError::Usage(message)) => {
            eprintln!("pq: {message}");
            eprintln!();
            usage();
            std::process::exit(2);
        }
        Err(CliError::Failed(message)) => {
            eprintln!("pq: {message}");
            std::process::exit(1);
        }
    }
}

fn run(args: Vec<String>) -> Result<(), CliError> {
    let (dir_flag, rest) = split_storage_dir(args)?;
    let storage_dir = resolve_storage_dir(dir_flag, std::env::var("PQ_STORAGE_DIR").ok());
    let Some((command, rest)) = rest.split_first() else {
        return Err(CliError::Usage("missing command".to_string()));
    };
    match command.as_str() {
        "enqueue" => cmd_enqueue(&storage_dir, rest),
        "worker" => cmd_worker(&storage_dir, rest),
        "status" => cmd_status(&storage_dir, rest),
        "list" => cmd_list(&storage_dir, rest),
        "dlq" => cmd_dlq(&storage_dir, rest),
        "logs" => cmd_logs(&storage_dir, rest),
        "metrics" => cmd_metrics(&storage_dir, rest),
        "delete" => cmd_delete(&storage_dir, rest),
        "reset" => cmd_reset(&storage_dir, rest),
        "config" => cmd_config(&storage_dir, rest),
        other => Err(CliError::Usage(format!("unknown command: {other}"))),
    }
}

fn split_storage_dir(args: Vec<String>) -> Result<(Option<PathBuf>, Vec<String>), CliError> {
    let mut dir = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--storage-dir" {
            let value = iter
                .next()
                .ok_or_else(|| CliError::Usage("--storage-dir requires a value".to_string()))?;
            dir = Some(PathBuf::from(value));
        } else {
            rest.push(arg);
        }
    }
    Ok((dir, rest))
}

fn resolve_storage_dir(flag: Option<PathBuf>, env: Option<String>) -> PathBuf {
    flag.or_else(|| env.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EnqueuePayload {
    id: Option<String>,
    command: String,
    priority: Option<i64>,
    run_at_ms: Option<i64>,
    max_retries: Option<i64>,
    #[serde(default)]
    waiting: bool,
}

fn cmd_enqueue(storage_dir: &Path, rest: &[String]) -> Result<(), CliError> {
    let [payload] = rest else {
        return Err(CliError::Usage("enqueue takes exactly one JSON argument".to_string()));
    };
    let payload: EnqueuePayload = serde_json::from_str(payload)
        .map_err(|err| CliError::Usage(format!("bad enqueue payload: {err}")))?;
    let mut store = SqliteStore::open(storage_dir)?;
    let job = store.enqueue(EnqueueRequest {
        id: payload.id,
        command: payload.command,
        priority: payload.priority,
        run_at_ms: payload.run_at_ms,
        max_retries: payload.max_retries,
        waiting: payload.waiting,
    })?;
    println!("enqueued {} state={}", job.id, job.state);
    Ok(())
}

fn cmd_worker(storage_dir: &Path, rest: &[String]) -> Result<(), CliError> {
    let Some((action, flags)) = rest.split_first() else {
        return Err(CliError::Usage("worker needs an action (start)".to_string()));
    };
    if action != "start" {
        return Err(CliError::Usage(format!("unknown worker action: {action}")));
    }
    let mut count: usize = 1;
    let mut run_for_s: Option<u64> = None;
    let mut config = WorkerConfig::new(storage_dir);
    let mut index = 0;
    while index < flags.len() {
        match flags[index].as_str() {
            "--count" => count = parse_flag(flags, &mut index, "--count")?,
            "--run-for-s" => run_for_s = Some(parse_flag(flags, &mut index, "--run-for-s")?),
            "--poll-ms" => {
                config.poll_interval =
                    Duration::from_millis(parse_flag(flags, &mut index, "--poll-ms")?);
            }
            "--kill-grace-ms" => {
                config.kill_grace =
                    Duration::from_millis(parse_flag(flags, &mut index, "--kill-grace-ms")?);
            }
            other => return Err(CliError::Usage(format!("unknown flag: {other}"))),
        }
        index += 1;
    }
    if count == 0 {
        return Err(CliError::Usage("--count must be at least 1".to_string()));
    }

    let mut manager = WorkerManager::new(config);
    manager.start(count)?;
    eprintln!("[manager] started {count} workers in {}", storage_dir.display());
    match run_for_s {
        Some(seconds) => {
            std::thread::sleep(Duration::from_secs(seconds));
            eprintln!("[manager] stopping");
            manager.stop();
        }
        None => loop {
            std::thread::sleep(Duration::from_secs(60));
        },
    }
    Ok(())
}

fn parse_flag<T: std::str::FromStr>(
    flags: &[String],
    index: &mut usize,
    flag: &str,
) -> Result<T, CliError> {
    *index += 1;
    let value = flags
        .get(*index)
        .ok_or_else(|| CliError::Usage(format!("{flag} requires a value")))?;
    value
        .parse()
        .map_err(|_| CliError::Usage(format!("{flag} got an invalid value: {value}")))
}

fn cmd_status(storage_dir: &Path, rest: &[String]) -> Result<(), CliError> {
    expect_no_args("status", rest)?;
    let store = SqliteStore::open(storage_dir)?;
    let summary = store.status_summary()?;
    if summary.counts.is_empty() {
        println!("queue is empty");
        return Ok(());
    }
    for entry in &summary.counts {
        println!("{:<12} {}", entry.state, entry.count);
    }
    println!("ready to claim: {}", summary.ready_pending);
    Ok(())
}

fn cmd_list(storage_dir: &Path, rest: &[String]) -> Result<(), CliError> {
    let mut state: Option<JobState> = None;
    let mut limit = DEFAULT_LIST_LIMIT;
    let mut index = 0;
    while index < rest.len() {
        match rest[index].as_str() {
            "--limit" => limit = parse_flag(rest, &mut index, "--limit")?,
            raw if state.is_none() && !raw.starts_with("--") => {
                state = Some(
                    JobState::parse(raw)
                        .map_err(|err| CliError::Usage(err.to_string()))?,
                );
            }
            other => return Err(CliError::Usage(format!("unexpected argument: {other}"))),
        }
        index += 1;
    }
    let store = SqliteStore::open(storage_dir)?;
    print_jobs(&store.list_jobs(state, limit)?);
    Ok(())
}

fn cmd_dlq(storage_dir: &Path, rest: &[String]) -> Result<(), CliError> {
    match rest {
        [action] if action == "list" => {
            let store = SqliteStore::open(storage_dir)?;
            print_jobs(&store.list_dead(DEFAULT_LIST_LIMIT)?);
            Ok(())
        }
        [action, id] if action == "retry" => {
            let mut store = SqliteStore::open(storage_dir)?;
            let job = store.dlq_retry(id)?;
            println!("requeued {} state={}", job.id, job.state);
            Ok(())
        }
        _ => Err(CliError::Usage("dlq takes `list` or `retry <id>`".to_string())),
    }
}

fn cmd_logs(storage_dir: &Path, rest: &[String]) -> Result<(), CliError> {
    let id = single_id("logs", rest)?;
    let store = SqliteStore::open(storage_dir)?;
    if store.get_job(id)?.is_none() {
        return Err(CliError::Failed(format!("unknown job: {id}")));
    }
    for row in store.job_logs(id, pq_storage::MAX_LOG_LIMIT)? {
        println!("{} [{}] {}", row.ts_ms, row.stream, row.message);
    }
    Ok(())
}

fn cmd_metrics(storage_dir: &Path, rest: &[String]) -> Result<(), CliError> {
    let id = single_id("metrics", rest)?;
    let store = SqliteStore::open(storage_dir)?;
    if store.get_job(id)?.is_none() {
        return Err(CliError::Failed(format!("unknown job: {id}")));
    }
    for row in store.job_metrics(id, pq_storage::MAX_LOG_LIMIT)? {
        println!(
            "{} {} {:.3}s worker={}",
            row.completed_at_ms, row.outcome, row.duration_s, row.worker_id
        );
    }
    Ok(())
}

fn cmd_delete(storage_dir: &Path, rest: &[String]) -> Result<(), CliError> {
    let id = single_id("delete", rest)?;
    let mut store = SqliteStore::open(storage_dir)?;
    if !store.delete_job(id)? {
        return Err(CliError::Failed(format!("unknown job: {id}")));
    }
    println!("deleted {id}");
    Ok(())
}

fn cmd_reset(storage_dir: &Path, rest: &[String]) -> Result<(), CliError> {
    match rest {
        [flag] if flag == "--yes" => {}
        _ => {
            return Err(CliError::Usage(
                "reset deletes every job; pass --yes to confirm".to_string(),
            ));
        }
    }
    let mut store = SqliteStore::open(storage_dir)?;
    let deleted = store.reset_all()?;
    println!("deleted {deleted} jobs");
    Ok(())
}

fn cmd_config(storage_dir: &Path, rest: &[String]) -> Result<(), CliError> {
    match rest {
        [action, key] if action == "get" => {
            let store = SqliteStore::open(storage_dir)?;
            match store.get_config(key)? {
                Some(value) => println!("{value}"),
                None => return Err(CliError::Failed(format!("config key not set: {key}"))),
            }
            Ok(())
        }
        [action, key, value] if action == "set" => {
            let mut store = SqliteStore::open(storage_dir)?;
            store.set_config(key, value)?;
            println!("{key}={value}");
            Ok(())
        }
        _ => Err(CliError::Usage(
            "config takes `get <key>` or `set <key> <value>`".to_string(),
        )),
    }
}

fn single_id<'a>(command: &str, rest: &'a [String]) -> Result<&'a str, CliError> {
    match rest {
        [id] => Ok(id.as_str()),
        _ => Err(CliError::Usage(format!("{command} takes exactly one job id"))),
    }
}

fn expect_no_args(command: &str, rest: &[String]) -> Result<(), CliError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(CliError::Usage(format!("{command} takes no arguments")))
    }
}

fn print_jobs(jobs: &[pq_storage::JobRow]) {
    if jobs.is_empty() {
        println!("no jobs");
        return;
    }
    for job in jobs {
        let error = job
            .last_error
            .as_deref()
            .map(|err| format!("  err={err}"))
            .unwrap_or_default();
        println!(
            "{:<12} {:<10} attempts={}/{}  {}{error}",
            job.id, job.state, job.attempts, job.max_retries, job.command
        );
    }
}
