//! Shared fixtures: an in-memory task service, a launcher that records
//! instead of spawning, and a tempdir-backed scheduler harness.

// not every test binary uses every helper
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use time::OffsetDateTime;
use tinysched::reconciler::{LaunchSpec, Reconciler, SupervisorLauncher};
use tinysched_core::client::TaskService;
use tinysched_core::config::Config;
use tinysched_core::lease::LeaseStore;
use tinysched_core::models::{Lease, LeaseState, StateUpdate, Task, TaskStatus};
use tinysched_core::registry::AgentRegistry;
use tinysched_core::CoreError;

#[derive(Default)]
pub struct MockTaskService {
    unassigned: Mutex<BTreeMap<String, Vec<Task>>>,
    idle: Mutex<BTreeMap<String, Vec<Task>>>,
    pub assigns: Mutex<Vec<(String, String)>>,
    pub updates: Mutex<Vec<(String, StateUpdate, serde_json::Value)>>,
    pub reject_assigns: AtomicBool,
}

impl MockTaskService {
    pub fn seed_unassigned(&self, queue: &str, tasks: Vec<Task>) {
        self.unassigned
            .lock()
            .unwrap()
            .insert(queue.to_string(), tasks);
    }

    pub fn seed_idle(&self, agent: &str, tasks: Vec<Task>) {
        self.idle.lock().unwrap().insert(agent.to_string(), tasks);
    }

    pub fn assigned_pairs(&self) -> Vec<(String, String)> {
        self.assigns.lock().unwrap().clone()
    }

    pub fn state_updates(&self) -> Vec<(String, StateUpdate)> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|(id, state, _)| (id.clone(), *state))
            .collect()
    }
}

#[async_trait]
impl TaskService for MockTaskService {
    async fn list_idle_tasks(&self, agent: &str, _limit: usize) -> Vec<Task> {
        self.idle
            .lock()
            .unwrap()
            .get(agent)
            .cloned()
            .unwrap_or_default()
    }

    // The service is free to return fewer or more than `limit`; the
    // reconciler's slot accounting must not depend on it.
    async fn get_unassigned_in_queue(&self, queue: &str, _limit: usize) -> Vec<Task> {
        self.unassigned
            .lock()
            .unwrap()
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    async fn assign(&self, task_id: &str, agent: &str) -> bool {
        if self.reject_assigns.load(Ordering::SeqCst) {
            return false;
        }
        self.assigns
            .lock()
            .unwrap()
            .push((task_id.to_string(), agent.to_string()));
        for tasks in self.unassigned.lock().unwrap().values_mut() {
            tasks.retain(|t| t.id != task_id);
        }
        true
    }

    async fn update_state(
        &self,
        task_id: &str,
        state: StateUpdate,
        metadata: serde_json::Value,
    ) -> bool {
        self.updates
            .lock()
            .unwrap()
            .push((task_id.to_string(), state, metadata));
        true
    }
}

#[derive(Default)]
pub struct RecordingLauncher {
    pub launches: Mutex<Vec<LaunchSpec>>,
    pub fail: AtomicBool,
}

impl RecordingLauncher {
    pub fn launched(&self) -> Vec<(String, String)> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .map(|spec| (spec.task_id.clone(), spec.agent.clone()))
            .collect()
    }
}

impl SupervisorLauncher for RecordingLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<(), CoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreError::Spawn {
                what: format!("supervisor for task {}", spec.task_id),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "test launcher"),
            });
        }
        self.launches.lock().unwrap().push(spec.clone());
        Ok(())
    }
}

pub struct Harness {
    pub _dir: TempDir,
    pub config: Config,
    pub store: LeaseStore,
    pub service: Arc<MockTaskService>,
    pub launcher: Arc<RecordingLauncher>,
}

impl Harness {
    /// `registry_json`: the agent control file contents, or `None` for
    /// legacy mode.
    pub fn new(limits: &[(&str, u32)], registry_json: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();

        let config = Config {
            base_dir: base.clone(),
            lease_dir: base.join("state").join("running"),
            log_dir: base.join("state").join("logs"),
            recipes_dir: base.join("recipes"),
            worker_bin: PathBuf::from("/bin/true"),
            endpoint: "http://localhost:9".to_string(),
            agent_limits: limits
                .iter()
                .map(|(agent, limit)| (agent.to_string(), *limit))
                .collect(),
            loop_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            max_runtime: Duration::from_secs(7200),
            request_timeout: Duration::from_secs(1),
            dry_run: false,
            disable_blocking: false,
            agent_control_file: base.join("agents.json"),
            host: "test-host".to_string(),
        };

        std::fs::create_dir_all(&config.recipes_dir).unwrap();
        if let Some(json) = registry_json {
            std::fs::write(&config.agent_control_file, json).unwrap();
        }
        let store = LeaseStore::open(&config.lease_dir).unwrap();

        Self {
            _dir: dir,
            config,
            store,
            service: Arc::new(MockTaskService::default()),
            launcher: Arc::new(RecordingLauncher::default()),
        }
    }

    pub fn add_recipe(&self, name: &str) {
        std::fs::write(self.config.recipes_dir.join(name), "role: test\n").unwrap();
    }

    pub fn reconciler(&self) -> Reconciler {
        let registry = AgentRegistry::load(&self.config.agent_control_file).unwrap();
        Reconciler::new(
            self.config.clone(),
            self.store.clone(),
            registry,
            self.service.clone(),
            self.launcher.clone(),
        )
    }

    /// Insert a running lease with the given ages, owned by this host.
    pub fn insert_lease(&self, task_id: &str, agent: &str, pid: u32, heartbeat_age_secs: i64) {
        let now = OffsetDateTime::now_utc();
        let lease = Lease {
            task_id: task_id.to_string(),
            agent: agent.to_string(),
            pid,
            recipe: format!("{agent}.yaml"),
            started_at: now - time::Duration::seconds(heartbeat_age_secs.max(60)),
            heartbeat: now - time::Duration::seconds(heartbeat_age_secs),
            host: self.config.host.clone(),
            state: LeaseState::Running,
        };
        self.store.create(&lease).unwrap();
    }
}

pub fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        assigned_to: None,
        queue_name: None,
        status: TaskStatus::Idle,
        recipe: None,
        created_at: None,
        priority: 0,
        blocked_by_task_id: None,
        is_currently_blocked: false,
    }
}

/// A pid that is guaranteed dead: a reaped child of this process.
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

pub const DEV_REGISTRY: &str = r#"[
    {"agentName":"vaela","agentType":"dev"},
    {"agentName":"damien","agentType":"dev"}
]"#;
