//! Container lifecycle manager
//!
//! Creates, enumerates, and tears down the sandboxes of an application.
//! Nothing about running sandboxes is remembered in process: every lookup
//! lists the runtime by the application's name prefix.

use crate::cache::{deployed_key, Cache};
use crate::config::{Config, PullPolicy};
use crate::db::LogStream;
use crate::logs::LogSink;
use crate::runtime::{
    instance_id, instance_name, instance_prefix, parse_ordinal, ContainerInfo, ContainerRuntime,
    RuntimeError, SandboxSpec, SecurityProfile, LABEL_APP_ID, LABEL_ORDINAL,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

/// Lifecycle manager configuration
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Prefix of every sandbox name
    pub prefix: String,
    /// Network shared by all sandboxes
    pub network: String,
    pub internal_network: bool,
    /// Image for apps without a custom image
    pub default_image: String,
    /// Port exported to sandboxes as PORT
    pub app_port: u16,
    pub pull_policy: PullPolicy,
    pub stop_timeout: Duration,
    /// Expiry of the "deployed" hint
    pub deployed_ttl: Duration,
    /// Runtime operations allowed in flight at once
    pub max_concurrent_ops: usize,
}

impl LifecycleConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            prefix: config.runtime.prefix.clone(),
            network: config.runtime.network.clone(),
            internal_network: config.runtime.internal_network,
            default_image: config.runtime.default_image.clone(),
            app_port: config.runtime.app_port,
            pull_policy: config.runtime.pull_policy.clone(),
            stop_timeout: config.runtime.stop_timeout(),
            deployed_ttl: config.cache.deployed_ttl(),
            max_concurrent_ops: config.runtime.max_concurrent_ops,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A single sandbox that could not be started or stopped
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceFailure {
    pub instance: String,
    pub error: String,
}

/// Result of a deploy
#[derive(Debug, Clone, Default)]
pub struct DeployOutcome {
    pub requested: u32,
    /// Sandboxes confirmed running
    pub achieved: u32,
    /// The confirmed sandboxes as last inspected, ordinal order
    pub instances: Vec<ContainerInfo>,
    /// Previous-generation sandboxes that were removed first
    pub replaced: usize,
    pub spawn_failures: Vec<InstanceFailure>,
    pub teardown_failures: Vec<InstanceFailure>,
}

/// Result of stopping an application
#[derive(Debug, Clone, Default)]
pub struct StopOutcome {
    pub stopped: usize,
    pub failures: Vec<InstanceFailure>,
}

/// Manages the sandboxes of every application on this host
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    cache: Arc<dyn Cache>,
    logs: Arc<dyn LogSink>,
    profile: SecurityProfile,
    config: LifecycleConfig,
    ops: Semaphore,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        cache: Arc<dyn Cache>,
        logs: Arc<dyn LogSink>,
        profile: SecurityProfile,
        config: LifecycleConfig,
    ) -> Self {
        let ops = Semaphore::new(config.max_concurrent_ops.max(1));
        Self {
            runtime,
            cache,
            logs,
            profile,
            config,
            ops,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>, RuntimeError> {
        self.ops
            .acquire()
            .await
            .map_err(|_| RuntimeError::Unavailable("runtime operation limiter closed".to_string()))
    }

    /// Deploy `desired` sandboxes for an application
    ///
    /// Any existing sandboxes of the application are removed first. Spawns run
    /// one at a time; a failed spawn is recorded and the loop moves on, so the
    /// outcome may report fewer sandboxes than requested. Only an unreachable
    /// runtime before spawning starts fails the call.
    ///
    /// Ordinals are handed out to successful spawns only, so the live set is
    /// always `0..achieved`.
    pub async fn deploy(
        &self,
        app_id: i64,
        desired: u32,
        env: &BTreeMap<String, String>,
        image: Option<&str>,
    ) -> Result<DeployOutcome, RuntimeError> {
        if desired == 0 {
            return Err(RuntimeError::Failed(
                "desired instance count must be at least 1".to_string(),
            ));
        }

        {
            let _permit = self.permit().await?;
            self.runtime
                .ensure_network(&self.config.network, self.config.internal_network)
                .await?;
        }

        let mut outcome = DeployOutcome {
            requested: desired,
            ..Default::default()
        };

        let hinted = self.cache.exists(&deployed_key(app_id)).await;
        let existing = self.get_containers(app_id).await?;
        if hinted {
            info!(app_id, existing = existing.len(), "App already deployed, removing previous instances");
        } else if !existing.is_empty() {
            warn!(
                app_id,
                existing = existing.len(),
                "Found instances without a deployed marker, removing them"
            );
        }
        if !existing.is_empty() {
            let teardown = self.stop_instances(app_id, &existing).await;
            outcome.replaced = teardown.stopped;
            outcome.teardown_failures = teardown.failures;
        }

        let image_label = image.unwrap_or(&self.config.default_image);
        info!(app_id, desired, image = image_label, "Deploying instances");

        let mut ordinal: u32 = 0;
        for attempt in 1..=desired {
            let spec = self.sandbox_spec(app_id, ordinal, env, image);
            let short_id = instance_id(app_id, ordinal);

            match self.spawn_one(&spec).await {
                Ok(container) => {
                    info!(app_id, ordinal, container = spec.name, "Instance started");
                    self.logs
                        .append(
                            app_id,
                            LogStream::Stdout,
                            &format!(
                                "Instance {}/{} deployed: {}",
                                attempt,
                                desired,
                                &container.id[..container.id.len().min(12)]
                            ),
                            &short_id,
                        )
                        .await;
                    outcome.instances.push(container);
                    ordinal += 1;
                }
                Err(e) => {
                    warn!(app_id, ordinal, attempt, error = %e, "Failed to start instance");
                    self.logs
                        .append(
                            app_id,
                            LogStream::Stderr,
                            &format!("Failed to deploy instance {}: {}", ordinal, e),
                            &short_id,
                        )
                        .await;
                    // A created-but-not-started sandbox would block reuse of the name
                    if let Err(cleanup) = self.runtime.remove(&spec.name).await {
                        debug!(container = spec.name, error = %cleanup, "Cleanup after failed start failed");
                    }
                    outcome.spawn_failures.push(InstanceFailure {
                        instance: spec.name,
                        error: e.to_string(),
                    });
                }
            }
        }

        outcome.achieved = ordinal;
        if outcome.achieved > 0 {
            self.cache
                .set_ex(&deployed_key(app_id), "true", self.config.deployed_ttl)
                .await;
        }

        info!(
            app_id,
            requested = desired,
            achieved = outcome.achieved,
            failed = outcome.spawn_failures.len(),
            "Deploy finished"
        );

        Ok(outcome)
    }

    /// Create, start and confirm one sandbox
    async fn spawn_one(&self, spec: &SandboxSpec) -> Result<ContainerInfo, RuntimeError> {
        let _permit = self.permit().await?;
        let id = self.runtime.spawn(spec).await?;

        let info = self.runtime.inspect(&id).await?;
        if !info.is_running() {
            return Err(RuntimeError::Failed(format!(
                "sandbox '{}' is {} right after start",
                spec.name, info.status
            )));
        }
        Ok(info)
    }

    /// Build the sandbox definition for `(app_id, ordinal)`
    pub fn sandbox_spec(
        &self,
        app_id: i64,
        ordinal: u32,
        env: &BTreeMap<String, String>,
        image: Option<&str>,
    ) -> SandboxSpec {
        let name = instance_name(&self.config.prefix, app_id, ordinal);
        let short_id = instance_id(app_id, ordinal);

        // Platform variables win over user-supplied ones
        let mut vars = env.clone();
        vars.insert("PORT".to_string(), self.config.app_port.to_string());
        vars.insert("APP_ID".to_string(), app_id.to_string());
        vars.insert("INSTANCE_ID".to_string(), short_id);

        let (image, command) = match image {
            Some(custom) => (custom.to_string(), None),
            None => (self.config.default_image.clone(), Some(builtin_command())),
        };

        SandboxSpec {
            alias: name.clone(),
            name,
            image,
            command,
            env: vars,
            network: self.config.network.clone(),
            labels: BTreeMap::from([
                (LABEL_APP_ID.to_string(), app_id.to_string()),
                (LABEL_ORDINAL.to_string(), ordinal.to_string()),
            ]),
            profile: self.profile.clone(),
            pull_policy: self.config.pull_policy.clone(),
        }
    }

    /// Stop and remove every sandbox of an application
    ///
    /// Sandboxes are discovered from the runtime, so instances started by an
    /// earlier process are stopped too.
    pub async fn stop(&self, app_id: i64) -> Result<StopOutcome, RuntimeError> {
        let containers = self.get_containers(app_id).await?;
        let outcome = self.stop_instances(app_id, &containers).await;
        self.cache.del(&deployed_key(app_id)).await;

        info!(
            app_id,
            stopped = outcome.stopped,
            failed = outcome.failures.len(),
            "Stopped app"
        );
        Ok(outcome)
    }

    async fn stop_instances(&self, app_id: i64, containers: &[ContainerInfo]) -> StopOutcome {
        let mut outcome = StopOutcome::default();

        for container in containers {
            match self.stop_one(container).await {
                Ok(()) => {
                    debug!(app_id, container = container.name, "Instance removed");
                    outcome.stopped += 1;
                }
                Err(e) => {
                    warn!(app_id, container = container.name, error = %e, "Failed to stop instance");
                    outcome.failures.push(InstanceFailure {
                        instance: container.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        outcome
    }

    async fn stop_one(&self, container: &ContainerInfo) -> Result<(), RuntimeError> {
        let _permit = self.permit().await?;
        self.runtime
            .stop(&container.id, self.config.stop_timeout)
            .await?;
        self.runtime.remove(&container.id).await
    }

    /// Sandboxes of an application as the runtime reports them, ordinal order
    pub async fn get_containers(&self, app_id: i64) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let prefix = instance_prefix(&self.config.prefix, app_id);
        let mut containers = {
            let _permit = self.permit().await?;
            self.runtime.list(&prefix).await?
        };

        containers.retain(|c| parse_ordinal(&self.config.prefix, app_id, &c.name).is_some());
        containers.sort_by_key(|c| parse_ordinal(&self.config.prefix, app_id, &c.name));
        Ok(containers)
    }

    /// Sandboxes of an application that are currently running
    pub async fn running_instances(&self, app_id: i64) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let mut containers = self.get_containers(app_id).await?;
        containers.retain(ContainerInfo::is_running);
        Ok(containers)
    }

    /// Whether the "deployed" hint is set; never used to answer discovery
    pub async fn is_marked_deployed(&self, app_id: i64) -> bool {
        self.cache.exists(&deployed_key(app_id)).await
    }
}

/// Minimal HTTP responder plus a heartbeat line, for apps without an image
fn builtin_command() -> Vec<String> {
    let script = concat!(
        "mkdir -p /tmp/www && ",
        "echo \"ok from $INSTANCE_ID\" > /tmp/www/index.html && ",
        "httpd -f -p \"$PORT\" -h /tmp/www & ",
        "while true; do echo \"[$(date)] [STDOUT] $INSTANCE_ID heartbeat\"; sleep 2; done"
    );
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::db::{Database, NewApp};
    use crate::logs::DbLogSink;
    use crate::runtime::MemoryRuntime;

    struct Fixture {
        runtime: Arc<MemoryRuntime>,
        cache: Arc<MemoryCache>,
        db: Arc<Database>,
        manager: LifecycleManager,
    }

    fn fixture() -> Fixture {
        let runtime = Arc::new(MemoryRuntime::new());
        let cache = Arc::new(MemoryCache::new());
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.create_app(&NewApp {
            id: Some(42),
            name: "web".to_string(),
            ..Default::default()
        })
        .unwrap();

        let manager = LifecycleManager::new(
            runtime.clone(),
            cache.clone(),
            Arc::new(DbLogSink::new(db.clone())),
            SecurityProfile::default(),
            LifecycleConfig::default(),
        );
        Fixture {
            runtime,
            cache,
            db,
            manager,
        }
    }

    #[tokio::test]
    async fn test_deploy_spawns_named_instances() {
        let f = fixture();
        let outcome = f.manager.deploy(42, 3, &BTreeMap::new(), None).await.unwrap();

        assert_eq!(outcome.achieved, 3);
        assert_eq!(
            f.runtime.container_names(),
            vec![
                "flotilla-app-42-instance-0",
                "flotilla-app-42-instance-1",
                "flotilla-app-42-instance-2",
            ]
        );
        assert_eq!(f.runtime.networks(), vec!["flotilla-apps".to_string()]);
        assert!(f.manager.is_marked_deployed(42).await);
    }

    #[tokio::test]
    async fn test_deploy_rejects_zero_instances() {
        let f = fixture();
        assert!(f.manager.deploy(42, 0, &BTreeMap::new(), None).await.is_err());
        assert!(f.runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failures_are_absorbed_and_ordinals_stay_dense() {
        let f = fixture();
        f.runtime.fail_spawns_at([1, 3]);

        let outcome = f.manager.deploy(42, 5, &BTreeMap::new(), None).await.unwrap();

        assert_eq!(outcome.requested, 5);
        assert_eq!(outcome.achieved, 3);
        assert_eq!(outcome.spawn_failures.len(), 2);
        assert_eq!(
            f.runtime.container_names(),
            vec![
                "flotilla-app-42-instance-0",
                "flotilla-app-42-instance-1",
                "flotilla-app-42-instance-2",
            ]
        );

        let logs = f.db.recent_logs(42, 10).unwrap();
        assert_eq!(logs.iter().filter(|l| l.stream == LogStream::Stderr).count(), 2);
        assert_eq!(logs.iter().filter(|l| l.stream == LogStream::Stdout).count(), 3);
    }

    #[tokio::test]
    async fn test_redeploy_tears_down_previous_generation_first() {
        let f = fixture();
        f.manager.deploy(42, 2, &BTreeMap::new(), None).await.unwrap();
        let outcome = f.manager.deploy(42, 1, &BTreeMap::new(), None).await.unwrap();

        assert_eq!(outcome.replaced, 2);
        assert_eq!(f.runtime.container_names(), vec!["flotilla-app-42-instance-0"]);

        let events = f.runtime.events();
        let last_remove = events.iter().rposition(|e| e.starts_with("remove:")).unwrap();
        let last_spawn = events.iter().rposition(|e| e.starts_with("spawn:")).unwrap();
        assert!(last_remove < last_spawn);
    }

    #[tokio::test]
    async fn test_redeploy_without_hint_still_removes_leftovers() {
        let f = fixture();
        f.manager.deploy(42, 2, &BTreeMap::new(), None).await.unwrap();
        f.cache.del(&deployed_key(42)).await;

        let outcome = f.manager.deploy(42, 2, &BTreeMap::new(), None).await.unwrap();
        assert_eq!(outcome.replaced, 2);
        assert_eq!(outcome.achieved, 2);
        assert!(outcome.spawn_failures.is_empty());
    }

    #[tokio::test]
    async fn test_stop_discovers_from_runtime_and_clears_hint() {
        let f = fixture();
        f.manager.deploy(42, 2, &BTreeMap::new(), None).await.unwrap();

        // A different manager instance has no memory of the deploy
        let other = LifecycleManager::new(
            f.runtime.clone(),
            f.cache.clone(),
            Arc::new(DbLogSink::new(f.db.clone())),
            SecurityProfile::default(),
            LifecycleConfig::default(),
        );
        let outcome = other.stop(42).await.unwrap();

        assert_eq!(outcome.stopped, 2);
        assert!(f.runtime.container_names().is_empty());
        assert!(!f.manager.is_marked_deployed(42).await);
    }

    #[tokio::test]
    async fn test_stop_continues_past_failures() {
        let f = fixture();
        f.manager.deploy(42, 3, &BTreeMap::new(), None).await.unwrap();
        f.runtime.fail_stop_of("flotilla-app-42-instance-1");

        let outcome = f.manager.stop(42).await.unwrap();
        assert_eq!(outcome.stopped, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].instance, "flotilla-app-42-instance-1");
    }

    #[tokio::test]
    async fn test_get_containers_ignores_other_apps() {
        let f = fixture();
        f.manager.deploy(4, 1, &BTreeMap::new(), None).await.unwrap();
        f.manager.deploy(42, 2, &BTreeMap::new(), None).await.unwrap();

        let containers = f.manager.get_containers(4).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "flotilla-app-4-instance-0");
        assert!(f.manager.get_containers(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_running_instances_skips_exited() {
        let f = fixture();
        f.manager.deploy(42, 2, &BTreeMap::new(), None).await.unwrap();
        f.runtime.mark_exited("flotilla-app-42-instance-0");

        assert_eq!(f.manager.get_containers(42).await.unwrap().len(), 2);
        let running = f.manager.running_instances(42).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "flotilla-app-42-instance-1");
    }

    #[tokio::test]
    async fn test_unreachable_runtime_fails_deploy() {
        let f = fixture();
        f.runtime.set_unavailable(true);
        assert!(matches!(
            f.manager.deploy(42, 1, &BTreeMap::new(), None).await,
            Err(RuntimeError::Unavailable(_))
        ));
    }

    #[test]
    fn test_sandbox_spec_default_image() {
        let f = fixture();
        let env = BTreeMap::from([
            ("GREETING".to_string(), "hi".to_string()),
            ("PORT".to_string(), "1".to_string()),
        ]);
        let spec = f.manager.sandbox_spec(42, 1, &env, None);

        assert_eq!(spec.name, "flotilla-app-42-instance-1");
        assert_eq!(spec.alias, spec.name);
        assert_eq!(spec.image, "busybox:1.36");
        assert!(spec.command.is_some());
        assert_eq!(spec.env.get("GREETING").map(String::as_str), Some("hi"));
        assert_eq!(spec.env.get("PORT").map(String::as_str), Some("8080"));
        assert_eq!(spec.env.get("INSTANCE_ID").map(String::as_str), Some("app-42-instance-1"));
        assert_eq!(spec.labels.get(LABEL_ORDINAL).map(String::as_str), Some("1"));
    }

    #[test]
    fn test_sandbox_spec_custom_image_runs_as_is() {
        let f = fixture();
        let spec = f.manager.sandbox_spec(42, 0, &BTreeMap::new(), Some("ghcr.io/acme/api:2"));
        assert_eq!(spec.image, "ghcr.io/acme/api:2");
        assert!(spec.command.is_none());
        assert!(spec.profile.read_only_rootfs);
    }
}
