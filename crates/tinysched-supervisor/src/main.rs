//! Per-task supervisor. Launched by the scheduler, one process per task.
//!
//! Owns the task's lease from creation to deletion: writes it on startup,
//! keeps the heartbeat fresh while the worker runs, reports the outcome to
//! the task service, and deletes the lease as its final act. If this process
//! dies instead, the lease stays behind and the next reconciliation pass
//! reclaims it.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tinysched_core::client::{HttpTaskService, TaskService};
use tinysched_core::lease::LeaseStore;
use tinysched_core::models::{Lease, LeaseState, StateUpdate};
use tinysched_core::{ident, CoreError};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// Exit code when another supervisor already holds the lease.
const EXIT_LEASE_CONFLICT: u8 = 3;

/// How long a worker gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Supervise one task's worker process", long_about = None)]
struct Args {
    /// Task to supervise
    #[arg(long)]
    task_id: String,

    /// Agent (worker role) this task runs as
    #[arg(long)]
    agent: String,

    /// Directory holding lease files
    #[arg(long)]
    lease_dir: PathBuf,

    /// Directory for worker output logs
    #[arg(long)]
    log_dir: PathBuf,

    /// Resolved recipe path handed to the worker
    #[arg(long)]
    recipe: PathBuf,

    /// Task service endpoint
    #[arg(long)]
    endpoint: String,

    /// Seconds between lease heartbeat updates
    #[arg(long, default_value_t = 15)]
    heartbeat_interval: u64,

    /// Identifier of this host
    #[arg(long)]
    host: String,

    /// Worker executable to run
    #[arg(long)]
    worker: PathBuf,

    /// Per-request timeout for task service calls, in seconds
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();
    let _guard = init_logging(&args.log_dir);

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("supervisor failed: {e:#}");
            1
        }
    };
    std::process::ExitCode::from(code)
}

fn init_logging(log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::fs::create_dir_all(log_dir).is_ok() {
        let appender = tracing_appender::rolling::daily(log_dir, "supervisor.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

async fn run(args: Args) -> Result<u8> {
    validate_args(&args)?;

    let store = LeaseStore::open(&args.lease_dir).context("failed to open lease store")?;
    let service = HttpTaskService::new(&args.endpoint, Duration::from_secs(args.request_timeout))?;

    let now = OffsetDateTime::now_utc();
    let lease = Lease {
        task_id: args.task_id.clone(),
        agent: args.agent.clone(),
        pid: std::process::id(),
        recipe: recipe_file_name(&args.recipe),
        started_at: now,
        heartbeat: now,
        host: args.host.clone(),
        state: LeaseState::Running,
    };

    match store.create(&lease) {
        Ok(()) => {}
        Err(CoreError::LeaseConflict(task_id)) => {
            // someone else owns this task; leave their lease alone
            warn!(%task_id, "lease already exists, exiting");
            return Ok(EXIT_LEASE_CONFLICT);
        }
        Err(e) => return Err(e).context("failed to create lease"),
    }

    info!(
        task_id = %args.task_id,
        agent = %args.agent,
        recipe = %args.recipe.display(),
        "lease created, starting worker"
    );

    // Advisory: the task is now in flight. A refusal here does not stop the
    // worker from running.
    service
        .update_state(
            &args.task_id,
            StateUpdate::Working,
            serde_json::json!({ "host": args.host, "pid": std::process::id() }),
        )
        .await;

    let started = Instant::now();
    let mut child = match spawn_worker(&args) {
        Ok(child) => child,
        Err(e) => {
            error!(error = %e, "failed to spawn worker");
            service
                .update_state(
                    &args.task_id,
                    StateUpdate::Failed,
                    serde_json::json!({ "error": e.to_string(), "host": args.host }),
                )
                .await;
            store.delete(&args.task_id)?;
            return Ok(1);
        }
    };

    let heartbeat = spawn_heartbeat(
        store.clone(),
        lease.clone(),
        Duration::from_secs(args.heartbeat_interval),
    );

    let status = wait_with_signals(&mut child).await?;

    // Stop heartbeats before the terminal write so the two never interleave.
    heartbeat.abort();
    let _ = heartbeat.await;

    let outcome = if status.success() {
        LeaseState::Completed
    } else {
        LeaseState::Failed
    };
    let mut final_lease = lease;
    final_lease.state = outcome;
    final_lease.heartbeat = OffsetDateTime::now_utc();
    if let Err(e) = store.update(&final_lease) {
        warn!(error = %e, "failed to record terminal lease state");
    }

    let update = if status.success() {
        StateUpdate::Completed
    } else {
        StateUpdate::Failed
    };
    let metadata = serde_json::json!({
        "exit_code": status.code(),
        "duration_s": started.elapsed().as_secs(),
        "host": args.host,
    });
    if !service.update_state(&args.task_id, update, metadata).await {
        warn!(task_id = %args.task_id, "task service did not accept the outcome report");
    }

    // Releasing the task: must happen last.
    store.delete(&args.task_id)?;

    info!(
        task_id = %args.task_id,
        outcome = %update,
        exit_code = ?status.code(),
        "worker finished, lease released"
    );
    Ok(0)
}

/// Defense-in-depth: the reconciler validated these already, but they crossed
/// a process boundary to get here.
fn validate_args(args: &Args) -> Result<()> {
    ident::validate_ident("task_id", &args.task_id)?;
    ident::validate_ident("agent", &args.agent)?;
    ident::validate_host(&args.host)?;
    let extension_ok = matches!(
        args.recipe.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    anyhow::ensure!(
        extension_ok && args.recipe.is_file(),
        "recipe {} is not a readable .yaml/.yml file",
        args.recipe.display()
    );
    Ok(())
}

fn recipe_file_name(recipe: &Path) -> String {
    recipe
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn spawn_worker(args: &Args) -> std::io::Result<Child> {
    let log_path = args.log_dir.join(format!("task_{}.log", args.task_id));
    std::fs::create_dir_all(&args.log_dir)?;
    let stdout = std::fs::File::create(&log_path)?;
    let stderr = stdout.try_clone()?;

    Command::new(&args.worker)
        .arg("--task-id")
        .arg(&args.task_id)
        .arg("--agent")
        .arg(&args.agent)
        .arg("--recipe")
        .arg(&args.recipe)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
}

fn spawn_heartbeat(
    store: LeaseStore,
    mut lease: Lease,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick fires immediately; the lease was just written
        ticker.tick().await;
        loop {
            ticker.tick().await;
            lease.heartbeat = OffsetDateTime::now_utc();
            if let Err(e) = store.update(&lease) {
                warn!(task_id = %lease.task_id, error = %e, "heartbeat update failed");
            }
        }
    })
}

async fn wait_with_signals(child: &mut Child) -> Result<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            status = child.wait() => Ok(status?),
            _ = sigterm.recv() => terminate_child(child).await,
            _ = sigint.recv() => terminate_child(child).await,
        }
    }
    #[cfg(not(unix))]
    {
        Ok(child.wait().await?)
    }
}

/// Forward SIGTERM, wait out the grace period, escalate to SIGKILL.
#[cfg(unix)]
async fn terminate_child(child: &mut Child) -> Result<std::process::ExitStatus> {
    if let Some(pid) = child.id() {
        info!(pid, "forwarding termination to worker");
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            if let Some(pid) = child.id() {
                warn!(pid, "worker ignored SIGTERM, sending SIGKILL");
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
            }
            Ok(child.wait().await?)
        }
    }
}
