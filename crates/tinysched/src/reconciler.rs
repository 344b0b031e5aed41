//! The reconciliation engine: one idempotent pass over the world.
//!
//! A pass re-derives everything from the lease store and the task service:
//! scan and reclaim stale leases first, then match ready tasks to free agent
//! slots and launch one supervisor per match. Nothing here waits on a
//! supervisor; launches are fire-and-forget and the next pass observes their
//! leases.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use time::OffsetDateTime;
use tinysched_core::client::TaskService;
use tinysched_core::config::Config;
use tinysched_core::lease::{classify, LeaseHealth, LeaseStore};
use tinysched_core::models::{Lease, StateUpdate, Task};
use tinysched_core::registry::AgentRegistry;
use tinysched_core::{ident, policy, CoreError};
use tracing::{error, info, warn};

/// Per-pass counters, emitted as one structured summary line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub leases_scanned: u64,
    pub leases_reclaimed: u64,
    pub tasks_spawned: u64,
    pub assigned_spawned: u64,
    pub unassigned_matched: u64,
    pub tasks_blocked: u64,
    pub errors: u64,
}

/// Everything a supervisor launch needs beyond the static configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub task_id: String,
    pub agent: String,
    pub recipe: PathBuf,
}

/// Seam between the scheduling decision and the OS. Tests record launches;
/// production spawns detached supervisor processes.
pub trait SupervisorLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<(), CoreError>;
}

pub struct Reconciler {
    config: Config,
    store: LeaseStore,
    registry: AgentRegistry,
    service: Arc<dyn TaskService>,
    launcher: Arc<dyn SupervisorLauncher>,
}

impl Reconciler {
    pub fn new(
        config: Config,
        store: LeaseStore,
        registry: AgentRegistry,
        service: Arc<dyn TaskService>,
        launcher: Arc<dyn SupervisorLauncher>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            service,
            launcher,
        }
    }

    /// One reconciliation pass. Reclamation strictly precedes any spawn
    /// decision, so a spawn never races a reclaim for the same task.
    pub async fn run_pass(&self) -> Result<PassStats> {
        let mut stats = PassStats::default();
        // launches from this pass have not written their leases yet, so the
        // store undercounts; track them here to keep limits honest
        let mut launched: BTreeMap<String, u32> = BTreeMap::new();

        self.scan_and_reclaim(&mut stats).await?;

        if !self.registry.is_empty() {
            self.dispatch_unassigned(&mut stats, &mut launched).await?;
            let agents: Vec<(String, u32)> = self
                .registry
                .agents()
                .map(|a| (a.to_string(), self.limit_for(a)))
                .collect();
            self.dispatch_assigned(&agents, &mut stats, &mut launched)
                .await?;
        } else {
            let agents: Vec<(String, u32)> = self
                .config
                .agent_limits
                .iter()
                .map(|(a, &limit)| (a.clone(), limit))
                .collect();
            self.dispatch_assigned(&agents, &mut stats, &mut launched)
                .await?;
        }

        info!(
            leases_scanned = stats.leases_scanned,
            leases_reclaimed = stats.leases_reclaimed,
            tasks_spawned = stats.tasks_spawned,
            assigned_spawned = stats.assigned_spawned,
            unassigned_matched = stats.unassigned_matched,
            tasks_blocked = stats.tasks_blocked,
            errors = stats.errors,
            dry_run = self.config.dry_run,
            "reconciliation pass complete"
        );
        Ok(stats)
    }

    fn limit_for(&self, agent: &str) -> u32 {
        self.config.agent_limits.get(agent).copied().unwrap_or(1)
    }

    async fn scan_and_reclaim(&self, stats: &mut PassStats) -> Result<()> {
        let leases = self.store.list()?;
        let now = OffsetDateTime::now_utc();

        for lease in leases {
            stats.leases_scanned += 1;
            let health = classify(
                &lease,
                now,
                self.config.heartbeat_interval,
                self.config.max_runtime,
                &self.config.host,
            );
            if health == LeaseHealth::Healthy {
                continue;
            }
            if self.config.dry_run {
                info!(
                    task_id = %lease.task_id,
                    agent = %lease.agent,
                    health = health.as_str(),
                    "dry-run: would reclaim lease"
                );
                stats.leases_reclaimed += 1;
                continue;
            }
            match self.reclaim(&lease, health).await {
                Ok(()) => stats.leases_reclaimed += 1,
                Err(e) => {
                    warn!(task_id = %lease.task_id, error = %e, "failed to reclaim lease");
                    stats.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Delete first, then requeue: a half-finished reclaim leaves the task
    /// unowned rather than doubly-owned. Overruns report `failed`; dead or
    /// silent supervisors requeue as `idle`.
    async fn reclaim(&self, lease: &Lease, health: LeaseHealth) -> Result<(), CoreError> {
        info!(
            task_id = %lease.task_id,
            agent = %lease.agent,
            pid = lease.pid,
            health = health.as_str(),
            "reclaiming lease"
        );
        self.store.delete(&lease.task_id)?;

        let update = match health {
            LeaseHealth::OverMaxRuntime => StateUpdate::Failed,
            _ => StateUpdate::Idle,
        };
        let metadata = serde_json::json!({
            "reason": health.as_str(),
            "pid": lease.pid,
            "host": lease.host,
        });
        if !self
            .service
            .update_state(&lease.task_id, update, metadata)
            .await
        {
            warn!(task_id = %lease.task_id, "task service did not accept reclaim update");
        }
        Ok(())
    }

    /// Queue mode step one: pull unassigned tasks per queue and hand each to
    /// the agent with the most free slots.
    async fn dispatch_unassigned(
        &self,
        stats: &mut PassStats,
        launched: &mut BTreeMap<String, u32>,
    ) -> Result<()> {
        for queue in self.registry.queues() {
            let mut free: BTreeMap<String, u32> = BTreeMap::new();
            for agent in self.registry.agents_in_queue(queue) {
                let held =
                    self.store.count_by_agent(agent)? + *launched.get(agent).unwrap_or(&0) as usize;
                free.insert(agent.clone(), policy::free_slots(self.limit_for(agent), held));
            }
            let total: u32 = free.values().sum();
            if total == 0 {
                continue;
            }

            let fetched = self
                .service
                .get_unassigned_in_queue(queue, total as usize)
                .await;
            let (candidates, blocked) =
                policy::order_candidates(fetched, self.config.disable_blocking);
            stats.tasks_blocked += blocked;

            for task in candidates {
                let Some((best, slots)) = policy::pick_agent(&free) else {
                    break;
                };
                if slots == 0 {
                    break;
                }
                let agent = best.to_string();

                if let Err(e) = ident::validate_ident("task_id", &task.id) {
                    warn!(error = %e, "task service returned an invalid task id, skipping");
                    continue;
                }
                let Some(recipe) = self.resolve_recipe(&task, &agent) else {
                    continue;
                };

                if self.config.dry_run {
                    info!(
                        task_id = %task.id,
                        agent = %agent,
                        queue,
                        "dry-run: would assign and spawn supervisor"
                    );
                    stats.unassigned_matched += 1;
                    stats.tasks_spawned += 1;
                    if let Some(slot) = free.get_mut(&agent) {
                        *slot -= 1;
                    }
                    *launched.entry(agent).or_default() += 1;
                    continue;
                }

                if !self.service.assign(&task.id, &agent).await {
                    warn!(task_id = %task.id, agent = %agent, "assignment rejected, skipping");
                    continue;
                }
                stats.unassigned_matched += 1;

                let spec = LaunchSpec {
                    task_id: task.id.clone(),
                    agent: agent.clone(),
                    recipe,
                };
                match self.launcher.launch(&spec) {
                    Ok(()) => {
                        stats.tasks_spawned += 1;
                        if let Some(slot) = free.get_mut(&agent) {
                            *slot -= 1;
                        }
                        *launched.entry(agent).or_default() += 1;
                    }
                    Err(e) => {
                        error!(task_id = %task.id, error = %e, "supervisor launch failed");
                        stats.errors += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Spawn supervisors for tasks the service already assigned to an agent.
    /// Also the whole of legacy mode, where the agent list comes from the
    /// limits map instead of the registry.
    async fn dispatch_assigned(
        &self,
        agents: &[(String, u32)],
        stats: &mut PassStats,
        launched: &mut BTreeMap<String, u32>,
    ) -> Result<()> {
        for (agent, limit) in agents {
            let held =
                self.store.count_by_agent(agent)? + *launched.get(agent).unwrap_or(&0) as usize;
            let free = policy::free_slots(*limit, held);
            if free == 0 {
                continue;
            }

            let fetched = self.service.list_idle_tasks(agent, free as usize).await;
            let (candidates, blocked) =
                policy::order_candidates(fetched, self.config.disable_blocking);
            stats.tasks_blocked += blocked;

            let mut remaining = free;
            for task in candidates {
                if remaining == 0 {
                    break;
                }
                if let Err(e) = ident::validate_ident("task_id", &task.id) {
                    warn!(error = %e, "task service returned an invalid task id, skipping");
                    continue;
                }
                let Some(recipe) = self.resolve_recipe(&task, agent) else {
                    continue;
                };

                if self.config.dry_run {
                    info!(
                        task_id = %task.id,
                        agent = %agent,
                        "dry-run: would spawn supervisor"
                    );
                    stats.tasks_spawned += 1;
                    stats.assigned_spawned += 1;
                    remaining -= 1;
                    *launched.entry(agent.clone()).or_default() += 1;
                    continue;
                }

                let spec = LaunchSpec {
                    task_id: task.id.clone(),
                    agent: agent.clone(),
                    recipe,
                };
                match self.launcher.launch(&spec) {
                    Ok(()) => {
                        stats.tasks_spawned += 1;
                        stats.assigned_spawned += 1;
                        remaining -= 1;
                        *launched.entry(agent.clone()).or_default() += 1;
                    }
                    Err(e) => {
                        error!(task_id = %task.id, error = %e, "supervisor launch failed");
                        stats.errors += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// `task.recipe` if present, else `<agent>.yaml`; rejected names skip the
    /// task with a warning rather than counting as an error.
    fn resolve_recipe(&self, task: &Task, agent: &str) -> Option<PathBuf> {
        let name = task
            .recipe
            .clone()
            .unwrap_or_else(|| format!("{agent}.yaml"));
        match ident::resolve_recipe(&self.config.recipes_dir, &name) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    recipe = %name,
                    error = %e,
                    "recipe rejected, skipping task"
                );
                None
            }
        }
    }
}

/// Spawns real `tinysched-supervisor` processes, detached into their own
/// process group so they outlive the scheduler.
pub struct ProcessLauncher {
    config: Config,
    supervisor_bin: PathBuf,
}

impl ProcessLauncher {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            supervisor_bin: find_supervisor_binary(),
        }
    }
}

fn find_supervisor_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join("tinysched-supervisor");
            if candidate.exists() {
                return candidate;
            }
        }
    }
    // fall back to PATH lookup
    PathBuf::from("tinysched-supervisor")
}

impl SupervisorLauncher for ProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<(), CoreError> {
        let mut command = std::process::Command::new(&self.supervisor_bin);
        command
            .arg("--task-id")
            .arg(&spec.task_id)
            .arg("--agent")
            .arg(&spec.agent)
            .arg("--lease-dir")
            .arg(&self.config.lease_dir)
            .arg("--log-dir")
            .arg(&self.config.log_dir)
            .arg("--recipe")
            .arg(&spec.recipe)
            .arg("--endpoint")
            .arg(&self.config.endpoint)
            .arg("--heartbeat-interval")
            .arg(self.config.heartbeat_interval.as_secs().to_string())
            .arg("--host")
            .arg(&self.config.host)
            .arg("--worker")
            .arg(&self.config.worker_bin)
            .arg("--request-timeout")
            .arg(self.config.request_timeout.as_secs().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        match command.spawn() {
            Ok(child) => {
                info!(
                    task_id = %spec.task_id,
                    agent = %spec.agent,
                    pid = child.id(),
                    "supervisor launched"
                );
                Ok(())
            }
            Err(source) => Err(CoreError::Spawn {
                what: format!("supervisor for task {}", spec.task_id),
                source,
            }),
        }
    }
}
