use crate::error::CoreError;
use crate::ident;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LOOP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_MAX_RUNTIME_SECS: u64 = 7200;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Process-wide configuration, immutable after startup. Loaded from
/// `TINYSCHED_*` environment variables; the CLI overlays its flags on top
/// before validation.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
    pub lease_dir: PathBuf,
    pub log_dir: PathBuf,
    pub recipes_dir: PathBuf,
    pub worker_bin: PathBuf,
    pub endpoint: String,
    pub agent_limits: BTreeMap<String, u32>,
    pub loop_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_runtime: Duration,
    pub request_timeout: Duration,
    pub dry_run: bool,
    pub disable_blocking: bool,
    pub agent_control_file: PathBuf,
    pub host: String,
}

impl Config {
    /// Read configuration from the environment. Unparseable values are
    /// configuration errors; missing required settings are reported later by
    /// [`Config::problems`] so `validate-config` can list all of them at once.
    pub fn from_env() -> Result<Self, CoreError> {
        let base_dir = env::var("TINYSCHED_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_base_dir());

        let lease_dir = env_path("TINYSCHED_LEASE_DIR")
            .unwrap_or_else(|| base_dir.join("state").join("running"));
        let log_dir =
            env_path("TINYSCHED_LOG_DIR").unwrap_or_else(|| base_dir.join("state").join("logs"));
        let recipes_dir =
            env_path("TINYSCHED_RECIPES_DIR").unwrap_or_else(|| base_dir.join("recipes"));
        let agent_control_file =
            env_path("TINYSCHED_AGENT_CONTROL_FILE").unwrap_or_else(|| base_dir.join("agents.json"));

        let host = match env::var("TINYSCHED_HOST") {
            Ok(h) => h,
            Err(_) => hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string()),
        };

        Ok(Self {
            lease_dir,
            log_dir,
            recipes_dir,
            agent_control_file,
            worker_bin: env_path("TINYSCHED_WORKER_BIN").unwrap_or_default(),
            endpoint: env::var("TINYSCHED_ENDPOINT").unwrap_or_default(),
            agent_limits: parse_limits(env::var("TINYSCHED_AGENT_LIMITS").ok().as_deref())?,
            loop_interval: env_duration("TINYSCHED_LOOP_INTERVAL", DEFAULT_LOOP_INTERVAL_SECS)?,
            heartbeat_interval: env_duration(
                "TINYSCHED_HEARTBEAT_INTERVAL",
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            )?,
            max_runtime: env_duration("TINYSCHED_MAX_RUNTIME", DEFAULT_MAX_RUNTIME_SECS)?,
            request_timeout: env_duration(
                "TINYSCHED_REQUEST_TIMEOUT",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?,
            dry_run: env_bool("TINYSCHED_DRY_RUN")?,
            disable_blocking: env_bool("TINYSCHED_DISABLE_BLOCKING")?,
            host,
            base_dir,
        })
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join("state").join("tinysched.lock")
    }

    /// Every problem that would make a reconciliation pass unsafe to run.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.worker_bin.as_os_str().is_empty() {
            problems.push("worker executable not set (TINYSCHED_WORKER_BIN)".to_string());
        }
        if self.endpoint.is_empty() {
            problems.push("task service endpoint not set (TINYSCHED_ENDPOINT)".to_string());
        } else if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            problems.push(format!("endpoint is not an http(s) url: {}", self.endpoint));
        }
        if self.loop_interval.is_zero() {
            problems.push("loop interval must be positive".to_string());
        }
        if self.heartbeat_interval.is_zero() {
            problems.push("heartbeat interval must be positive".to_string());
        }
        if self.max_runtime.is_zero() {
            problems.push("max runtime must be positive".to_string());
        }
        if let Err(e) = ident::validate_host(&self.host) {
            problems.push(e.to_string());
        }
        for agent in self.agent_limits.keys() {
            if !ident::is_valid_ident(agent) {
                problems.push(format!("invalid agent name in limits map: {agent:?}"));
            }
        }

        problems
    }

    pub fn ensure_valid(&self) -> Result<(), CoreError> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Config(problems.join("; ")))
        }
    }
}

fn default_base_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|d| d.home_dir().join(".tinysched"))
        .unwrap_or_else(|| PathBuf::from(".tinysched"))
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key).ok().map(PathBuf::from)
}

fn env_duration(key: &str, default_secs: u64) -> Result<Duration, CoreError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| CoreError::Config(format!("{key} is not a number of seconds: {raw:?}"))),
        Err(_) => Ok(Duration::from_secs(default_secs)),
    }
}

fn env_bool(key: &str) -> Result<bool, CoreError> {
    match env::var(key) {
        Ok(raw) => match raw.trim() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            other => Err(CoreError::Config(format!("{key} is not a boolean: {other:?}"))),
        },
        Err(_) => Ok(false),
    }
}

fn parse_limits(raw: Option<&str>) -> Result<BTreeMap<String, u32>, CoreError> {
    match raw {
        None | Some("") => Ok(BTreeMap::new()),
        Some(json) => serde_json::from_str(json)
            .map_err(|e| CoreError::Config(format!("TINYSCHED_AGENT_LIMITS is not a JSON map of agent to limit: {e}"))),
    }
}
