use anyhow::{Context, Result};
use time::OffsetDateTime;
use tinysched_core::config::Config;
use tinysched_core::lease::{classify, LeaseStore};

/// Print every lease with its classification and heartbeat age. Read-only.
pub async fn run() -> Result<()> {
    let config = Config::from_env()?;
    let store = LeaseStore::open(&config.lease_dir).context("failed to open lease store")?;
    let leases = store.list()?;

    println!("Host: {}", config.host);
    println!("Lease dir: {}", config.lease_dir.display());

    if leases.is_empty() {
        println!("No leases.");
        return Ok(());
    }

    let now = OffsetDateTime::now_utc();
    println!(
        "{:<20} {:<14} {:>8} {:<18} {:>12}",
        "TASK", "AGENT", "PID", "HEALTH", "HEARTBEAT"
    );
    for lease in leases {
        let health = classify(
            &lease,
            now,
            config.heartbeat_interval,
            config.max_runtime,
            &config.host,
        );
        let age = (now - lease.heartbeat).whole_seconds();
        println!(
            "{:<20} {:<14} {:>8} {:<18} {:>10}s ago",
            lease.task_id,
            lease.agent,
            lease.pid,
            health.as_str(),
            age
        );
    }
    Ok(())
}
