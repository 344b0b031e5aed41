use crate::lock::{self, LockOutcome};
use crate::reconciler::{ProcessLauncher, Reconciler};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tinysched_core::client::HttpTaskService;
use tinysched_core::config::Config;
use tinysched_core::lease::LeaseStore;
use tinysched_core::registry::AgentRegistry;
use tracing::{error, info, warn};

pub struct RunArgs {
    pub daemon: bool,
    pub dry_run: bool,
    pub loop_interval: Option<u64>,
}

pub async fn run(args: RunArgs) -> Result<()> {
    let mut config = Config::from_env()?;
    if args.dry_run {
        config.dry_run = true;
    }
    if let Some(secs) = args.loop_interval {
        config.loop_interval = Duration::from_secs(secs);
    }
    config.ensure_valid()?;

    let _log_guard = init_logging(&config.log_dir);

    let registry = AgentRegistry::load(&config.agent_control_file)
        .context("failed to load agent control file")?;
    if registry.is_empty() {
        info!("agent registry is empty, running in legacy mode");
    } else {
        info!(agents = registry.len(), "agent registry loaded");
    }

    let store = LeaseStore::open(&config.lease_dir).context("failed to open lease store")?;
    let service = Arc::new(HttpTaskService::new(&config.endpoint, config.request_timeout)?);
    let launcher = Arc::new(ProcessLauncher::new(&config));
    let reconciler = Reconciler::new(config.clone(), store, registry, service, launcher);

    // One lock for the whole invocation: a single pass or the daemon's life.
    let lock = match lock::try_acquire(&config.lock_path())? {
        LockOutcome::Acquired(lock) => lock,
        LockOutcome::Held => {
            warn!(
                lock = %config.lock_path().display(),
                "another scheduler holds the lock, skipping"
            );
            return Ok(());
        }
    };

    let result = if args.daemon {
        run_daemon(&reconciler, &config).await
    } else {
        reconciler.run_pass().await.map(|_| ())
    };
    drop(lock);
    result
}

async fn run_daemon(reconciler: &Reconciler, config: &Config) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let notify = Arc::new(tokio::sync::Notify::new());
    spawn_signal_listener(shutdown.clone(), notify.clone());

    let mut interval = tokio::time::interval(config.loop_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(
        interval_s = config.loop_interval.as_secs(),
        dry_run = config.dry_run,
        "scheduler daemon started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = notify.notified() => break,
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        // passes run to completion; a signal only takes effect between them
        if let Err(e) = reconciler.run_pass().await {
            error!(error = %e, "reconciliation pass aborted");
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
    }

    info!("scheduler daemon stopped");
    Ok(())
}

fn spawn_signal_listener(shutdown: Arc<AtomicBool>, notify: Arc<tokio::sync::Notify>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("termination signal received, finishing current pass");
        shutdown.store(true, Ordering::SeqCst);
        notify.notify_waiters();
    });
}

fn init_logging(log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(log_dir, "scheduler.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            warn!(log_dir = %log_dir.display(), error = %e, "log directory unavailable");
            None
        }
    }
}
