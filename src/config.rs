use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Durable store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Container runtime settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Security and resource profile applied to every sandbox
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Reverse proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Cache expiry settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Deploy workflow settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Image pull policy for sandbox images
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before starting
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Docker host URL (default: DOCKER_HOST or the usual socket paths)
    pub docker_host: Option<String>,

    /// Network shared by every sandbox of every application
    #[serde(default = "default_network")]
    pub network: String,

    /// Create the shared network as internal (no route to the outside world)
    #[serde(default = "default_true")]
    pub internal_network: bool,

    /// Prefix for every runtime-level sandbox name
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Image used when an application has no custom image
    #[serde(default = "default_image")]
    pub default_image: String,

    /// Port the sandboxed process listens on (exported as PORT)
    #[serde(default = "default_app_port")]
    pub app_port: u16,

    /// Image pull policy: "always", "never", or "if-not-present" (default)
    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Seconds to wait for a sandbox to stop before it is killed
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Maximum runtime operations in flight on this host
    #[serde(default = "default_max_concurrent_ops")]
    pub max_concurrent_ops: usize,
}

impl RuntimeConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            network: default_network(),
            internal_network: true,
            prefix: default_prefix(),
            default_image: default_image(),
            app_port: default_app_port(),
            pull_policy: PullPolicy::default(),
            stop_timeout_secs: default_stop_timeout(),
            max_concurrent_ops: default_max_concurrent_ops(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Memory ceiling (e.g., "256m", "1g")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU ceiling (e.g., "0.5", "2")
    #[serde(default = "default_cpus")]
    pub cpus: String,

    /// Open file descriptor limit (soft = hard)
    #[serde(default = "default_nofile")]
    pub nofile: i64,

    /// Process count limit per user (soft = hard)
    #[serde(default = "default_nproc")]
    pub nproc: i64,

    /// PID limit for the whole sandbox
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    /// Writable scratch mounts on top of the read-only root filesystem
    #[serde(default = "default_tmpfs")]
    pub tmpfs: Vec<TmpfsMount>,

    /// Capabilities kept after dropping everything else
    #[serde(default = "default_cap_add")]
    pub cap_add: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
            nofile: default_nofile(),
            nproc: default_nproc(),
            pids_limit: default_pids_limit(),
            tmpfs: default_tmpfs(),
            cap_add: default_cap_add(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TmpfsMount {
    pub path: String,
    pub size: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Directory nginx includes route files from
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Name of the container running nginx
    #[serde(default = "default_proxy_container")]
    pub container: String,

    /// Path to the docker CLI used to exec into the proxy container
    #[serde(default = "default_docker_path")]
    pub docker_path: String,

    /// Hostnames are `{app name}.{domain}`
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Port the proxy listens on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// DNS resolver of the shared network (Docker's embedded DNS by default)
    #[serde(default = "default_resolver")]
    pub resolver: String,

    /// How long resolved backend addresses stay valid
    #[serde(default = "default_resolver_valid")]
    pub resolver_valid_secs: u64,

    /// Timeout for a single name resolution
    #[serde(default = "default_resolver_timeout")]
    pub resolver_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            container: default_proxy_container(),
            docker_path: default_docker_path(),
            domain: default_domain(),
            listen_port: default_listen_port(),
            resolver: default_resolver(),
            resolver_valid_secs: default_resolver_valid(),
            resolver_timeout_secs: default_resolver_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Expiry of cached instance counts
    #[serde(default = "default_instances_ttl")]
    pub instances_ttl_secs: u64,

    /// Expiry of the "deployed" hint
    #[serde(default = "default_deployed_ttl")]
    pub deployed_ttl_secs: u64,
}

impl CacheConfig {
    pub fn instances_ttl(&self) -> Duration {
        Duration::from_secs(self.instances_ttl_secs)
    }

    pub fn deployed_ttl(&self) -> Duration {
        Duration::from_secs(self.deployed_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            instances_ttl_secs: default_instances_ttl(),
            deployed_ttl_secs: default_deployed_ttl(),
        }
    }
}

/// Where utilization figures in metrics responses come from
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MetricsSource {
    /// Randomized figures, for platforms without a monitoring backend
    #[default]
    Simulated,
    /// All figures reported as zero
    Disabled,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound for a whole deploy/stop/scale workflow
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Largest instance count a single deploy may request
    #[serde(default = "default_max_instances")]
    pub max_instances_per_deploy: u32,

    /// Utilization source for metrics responses
    #[serde(default)]
    pub metrics_source: MetricsSource,
}

impl OrchestratorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            max_instances_per_deploy: default_max_instances(),
            metrics_source: MetricsSource::default(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./flotilla_data/flotilla.db")
}

fn default_network() -> String {
    "flotilla-apps".to_string()
}

fn default_prefix() -> String {
    "flotilla".to_string()
}

fn default_image() -> String {
    "busybox:1.36".to_string()
}

fn default_app_port() -> u16 {
    8080
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_max_concurrent_ops() -> usize {
    8
}

fn default_memory() -> String {
    "256m".to_string()
}

fn default_cpus() -> String {
    "0.5".to_string()
}

fn default_nofile() -> i64 {
    1024
}

fn default_nproc() -> i64 {
    100
}

fn default_pids_limit() -> i64 {
    256
}

fn default_tmpfs() -> Vec<TmpfsMount> {
    vec![TmpfsMount {
        path: "/tmp".to_string(),
        size: "64m".to_string(),
    }]
}

fn default_cap_add() -> Vec<String> {
    vec!["CHOWN".to_string()]
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/tmp/flotilla-nginx")
}

fn default_proxy_container() -> String {
    "flotilla-nginx".to_string()
}

fn default_docker_path() -> String {
    "docker".to_string()
}

fn default_domain() -> String {
    "flotilla.local".to_string()
}

fn default_listen_port() -> u16 {
    80
}

fn default_resolver() -> String {
    "127.0.0.11".to_string()
}

fn default_resolver_valid() -> u64 {
    10
}

fn default_resolver_timeout() -> u64 {
    5
}

fn default_instances_ttl() -> u64 {
    3600 // 1 hour
}

fn default_deployed_ttl() -> u64 {
    86400 // 24 hours
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_instances() -> u32 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.runtime.prefix.is_empty() {
            errors.push("runtime.prefix must not be empty".to_string());
        }
        if self.runtime.network.is_empty() {
            errors.push("runtime.network must not be empty".to_string());
        }
        if self.runtime.app_port == 0 {
            errors.push("runtime.app_port must be greater than 0".to_string());
        }
        if self.runtime.max_concurrent_ops == 0 {
            errors.push("runtime.max_concurrent_ops must be greater than 0".to_string());
        }
        if let Err(e) = crate::runtime::parse_memory_limit(&self.sandbox.memory) {
            errors.push(format!("sandbox.memory: {}", e));
        }
        if let Err(e) = crate::runtime::parse_cpu_limit(&self.sandbox.cpus) {
            errors.push(format!("sandbox.cpus: {}", e));
        }
        for mount in &self.sandbox.tmpfs {
            if !mount.path.starts_with('/') {
                errors.push(format!("sandbox.tmpfs: '{}' is not an absolute path", mount.path));
            }
        }
        if self.proxy.domain.is_empty() {
            errors.push("proxy.domain must not be empty".to_string());
        }
        if self.orchestrator.max_instances_per_deploy == 0 {
            errors.push("orchestrator.max_instances_per_deploy must be greater than 0".to_string());
        }
        if self.orchestrator.request_timeout_secs == 0 {
            errors.push("orchestrator.request_timeout_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
