//! Container runtime seam
//!
//! The lifecycle manager only talks to the runtime through [`ContainerRuntime`],
//! so the same calling code drives Docker in production and [`MemoryRuntime`]
//! in tests. Sandboxes are named `{prefix}-app-{app_id}-instance-{ordinal}`,
//! which is what lets every lookup go to the runtime instead of process memory.

use crate::config::{PullPolicy, SandboxConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;

/// Label carrying the owning application id
pub const LABEL_APP_ID: &str = "flotilla.app_id";
/// Label carrying the instance ordinal
pub const LABEL_ORDINAL: &str = "flotilla.ordinal";

/// Errors reported by a container runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime daemon cannot be reached at all
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("container '{0}' not found")]
    NotFound(String),
    #[error("container name '{0}' is already in use")]
    Conflict(String),
    #[error("{0}")]
    Failed(String),
}

/// Point-in-time view of one sandbox as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    pub ports: String,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Security and resource ceilings applied to every sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityProfile {
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub nofile: i64,
    pub nproc: i64,
    pub pids_limit: i64,
    pub read_only_rootfs: bool,
    /// Mount point -> tmpfs options
    pub tmpfs: BTreeMap<String, String>,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub no_new_privileges: bool,
}

impl SecurityProfile {
    pub fn from_config(config: &SandboxConfig) -> anyhow::Result<Self> {
        let tmpfs = config
            .tmpfs
            .iter()
            .map(|m| (m.path.clone(), format!("rw,noexec,nosuid,size={}", m.size)))
            .collect();

        Ok(Self {
            memory_bytes: parse_memory_limit(&config.memory)?,
            nano_cpus: parse_cpu_limit(&config.cpus)?,
            nofile: config.nofile,
            nproc: config.nproc,
            pids_limit: config.pids_limit,
            read_only_rootfs: true,
            tmpfs,
            cap_drop: vec!["ALL".to_string()],
            cap_add: config.cap_add.clone(),
            no_new_privileges: true,
        })
    }

    /// Docker `--security-opt` values for this profile
    pub fn security_opts(&self) -> Vec<String> {
        if self.no_new_privileges {
            vec!["no-new-privileges".to_string()]
        } else {
            Vec::new()
        }
    }
}

impl Default for SecurityProfile {
    fn default() -> Self {
        // SandboxConfig defaults always parse
        Self::from_config(&SandboxConfig::default()).unwrap_or_else(|_| Self {
            memory_bytes: 256 * 1024 * 1024,
            nano_cpus: 500_000_000,
            nofile: 1024,
            nproc: 100,
            pids_limit: 256,
            read_only_rootfs: true,
            tmpfs: BTreeMap::new(),
            cap_drop: vec!["ALL".to_string()],
            cap_add: Vec::new(),
            no_new_privileges: true,
        })
    }
}

/// Everything the runtime needs to create and start one sandbox
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    /// Overrides the image entrypoint command; `None` runs the image as-is
    pub command: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub network: String,
    /// DNS alias on the shared network
    pub alias: String,
    pub labels: BTreeMap<String, String>,
    pub profile: SecurityProfile,
    pub pull_policy: PullPolicy,
}

/// Narrow interface over a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create the network if it does not exist yet
    async fn ensure_network(&self, name: &str, internal: bool) -> Result<(), RuntimeError>;

    /// Create and start a sandbox, returning its runtime id
    async fn spawn(&self, spec: &SandboxSpec) -> Result<String, RuntimeError>;

    async fn inspect(&self, name_or_id: &str) -> Result<ContainerInfo, RuntimeError>;

    /// All sandboxes (running or not) whose name starts with `name_prefix`
    async fn list(&self, name_prefix: &str) -> Result<Vec<ContainerInfo>, RuntimeError>;

    async fn stop(&self, name_or_id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    async fn remove(&self, name_or_id: &str) -> Result<(), RuntimeError>;
}

/// Name prefix shared by every sandbox of an application
pub fn instance_prefix(prefix: &str, app_id: i64) -> String {
    format!("{}-app-{}-instance-", prefix, app_id)
}

/// Runtime-level sandbox name for `(app_id, ordinal)`
pub fn instance_name(prefix: &str, app_id: i64, ordinal: u32) -> String {
    format!("{}{}", instance_prefix(prefix, app_id), ordinal)
}

/// Short instance id used in log lines, e.g. `app-42-instance-0`
pub fn instance_id(app_id: i64, ordinal: u32) -> String {
    format!("app-{}-instance-{}", app_id, ordinal)
}

/// Recover the ordinal from a sandbox name belonging to `app_id`
pub fn parse_ordinal(prefix: &str, app_id: i64, name: &str) -> Option<u32> {
    let name = name.trim_start_matches('/');
    name.strip_prefix(&instance_prefix(prefix, app_id))?
        .parse()
        .ok()
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
pub fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with("g") || limit.ends_with("gb") {
        let num = limit.trim_end_matches("gb").trim_end_matches("g");
        (num, 1024 * 1024 * 1024i64)
    } else if limit.ends_with("m") || limit.ends_with("mb") {
        let num = limit.trim_end_matches("mb").trim_end_matches("m");
        (num, 1024 * 1024i64)
    } else if limit.ends_with("k") || limit.ends_with("kb") {
        let num = limit.trim_end_matches("kb").trim_end_matches("k");
        (num, 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", limit))?;

    Ok((num * multiplier as f64) as i64)
}

/// Parse a CPU count (e.g., "0.5") to Docker NanoCPUs
pub fn parse_cpu_limit(cpus: &str) -> anyhow::Result<i64> {
    let cpu_count: f64 = cpus
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid CPU limit: {}", cpus))?;
    if cpu_count <= 0.0 {
        anyhow::bail!("Invalid CPU limit: {}", cpus);
    }
    Ok((cpu_count * 1_000_000_000.0) as i64)
}

#[derive(Debug, Clone)]
struct MemoryContainer {
    id: String,
    name: String,
    status: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    containers: BTreeMap<String, MemoryContainer>,
    networks: BTreeSet<String>,
    specs: Vec<SandboxSpec>,
    events: Vec<String>,
    spawn_calls: usize,
    failing_spawns: BTreeSet<usize>,
    failing_stops: BTreeSet<String>,
    unavailable: bool,
    next_id: u64,
}

/// In-process runtime with failure injection
///
/// Used by tests and dry runs. Every call is recorded in an event log so
/// callers can assert on ordering (e.g. teardown before respawn).
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the spawn calls with these zero-based indices fail after creation
    pub fn fail_spawns_at(&self, indices: impl IntoIterator<Item = usize>) {
        self.state.lock().failing_spawns.extend(indices);
    }

    /// Make stopping this sandbox fail
    pub fn fail_stop_of(&self, name: &str) {
        self.state.lock().failing_stops.insert(name.to_string());
    }

    /// Simulate the daemon going away (or coming back)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Simulate a sandbox exiting on its own
    pub fn mark_exited(&self, name: &str) {
        if let Some(c) = self.state.lock().containers.get_mut(name) {
            c.status = "exited".to_string();
        }
    }

    /// Names of every sandbox currently known, in name order
    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().containers.keys().cloned().collect()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().networks.iter().cloned().collect()
    }

    /// Specs of every spawn attempt, in call order
    pub fn spawned_specs(&self) -> Vec<SandboxSpec> {
        self.state.lock().specs.clone()
    }

    /// Call log such as `spawn:name`, `stop:name`, `remove:name`
    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    fn check_available(state: &MemoryState) -> Result<(), RuntimeError> {
        if state.unavailable {
            return Err(RuntimeError::Unavailable("memory runtime is offline".to_string()));
        }
        Ok(())
    }

    fn find<'a>(state: &'a mut MemoryState, name_or_id: &str) -> Option<&'a mut MemoryContainer> {
        let key = state
            .containers
            .values()
            .find(|c| c.name == name_or_id || c.id == name_or_id)
            .map(|c| c.name.clone())?;
        state.containers.get_mut(&key)
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn ensure_network(&self, name: &str, _internal: bool) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        if state.networks.insert(name.to_string()) {
            state.events.push(format!("network:{}", name));
        }
        Ok(())
    }

    async fn spawn(&self, spec: &SandboxSpec) -> Result<String, RuntimeError> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;

        let call = state.spawn_calls;
        state.spawn_calls += 1;
        state.specs.push(spec.clone());
        state.events.push(format!("spawn:{}", spec.name));

        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict(spec.name.clone()));
        }

        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        let failing = state.failing_spawns.contains(&call);
        state.containers.insert(
            spec.name.clone(),
            MemoryContainer {
                id: id.clone(),
                name: spec.name.clone(),
                status: if failing { "created" } else { "running" }.to_string(),
            },
        );

        if failing {
            return Err(RuntimeError::Failed(format!(
                "injected start failure for '{}'",
                spec.name
            )));
        }
        Ok(id)
    }

    async fn inspect(&self, name_or_id: &str) -> Result<ContainerInfo, RuntimeError> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        let c = Self::find(&mut state, name_or_id)
            .ok_or_else(|| RuntimeError::NotFound(name_or_id.to_string()))?;
        Ok(ContainerInfo {
            id: c.id.clone(),
            name: c.name.clone(),
            status: c.status.clone(),
            ports: String::new(),
        })
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        Ok(state
            .containers
            .values()
            .filter(|c| c.name.starts_with(name_prefix))
            .map(|c| ContainerInfo {
                id: c.id.clone(),
                name: c.name.clone(),
                status: c.status.clone(),
                ports: String::new(),
            })
            .collect())
    }

    async fn stop(&self, name_or_id: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        let name = match Self::find(&mut state, name_or_id) {
            Some(c) => c.name.clone(),
            None => return Ok(()),
        };
        state.events.push(format!("stop:{}", name));
        if state.failing_stops.contains(&name) {
            return Err(RuntimeError::Failed(format!("injected stop failure for '{}'", name)));
        }
        if let Some(c) = state.containers.get_mut(&name) {
            c.status = "exited".to_string();
        }
        Ok(())
    }

    async fn remove(&self, name_or_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        let name = match Self::find(&mut state, name_or_id) {
            Some(c) => c.name.clone(),
            None => return Ok(()),
        };
        if state.failing_stops.contains(&name) {
            return Err(RuntimeError::Failed(format!("injected remove failure for '{}'", name)));
        }
        state.events.push(format!("remove:{}", name));
        state.containers.remove(&name);
        Ok(())
    }
}
