//! Deployment orchestrator
//!
//! Composes the lifecycle manager, proxy configuration manager and instance
//! registry into the operations exposed to callers. This is the only layer
//! that absorbs partial failures: spawn, stop and proxy faults become
//! `warnings` in the response, while a missing app, bad arguments, an
//! unreachable runtime or store, or a timeout fail the request.
//!
//! Workflows that change an application (deploy, stop, scale, proxy
//! regeneration) are serialized per application id.

use crate::cache::Cache;
use crate::config::{Config, OrchestratorConfig};
use crate::db::{AppRecord, AppStatus, Database, LogRecord, NewApp, ScalingPolicy};
use crate::error::OrchestratorError;
use crate::lifecycle::{InstanceFailure, LifecycleConfig, LifecycleManager};
use crate::logs::DbLogSink;
use crate::proxy::{GeneratedRoute, ProxyConfigManager, ProxyControl, ReloadOutcome};
use crate::registry::{utilization_source, InstanceRegistry, MetricsSnapshot};
use crate::runtime::{ContainerInfo, ContainerRuntime, SecurityProfile};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Category of a best-effort failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    InstanceSpawnFailed,
    InstanceStopFailed,
    ProxyUpdateFailed,
    ProxyValidationFailed,
    ProxyReloadFailed,
    ProxyNotRunning,
}

/// A degraded step that did not fail the request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub kind: WarningKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub message: String,
}

impl Warning {
    fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            instance: None,
            message: message.into(),
        }
    }

    fn for_instance(kind: WarningKind, failure: &InstanceFailure) -> Self {
        Self {
            kind,
            instance: Some(failure.instance.clone()),
            message: failure.error.clone(),
        }
    }
}

/// Arguments of a deploy
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployRequest {
    /// Desired count; the registry's target count when absent
    pub instances: Option<u32>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Overrides the application's image for this deploy
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployResponse {
    pub message: String,
    /// Achieved count
    pub instances: u32,
    pub status: AppStatus,
    pub containers: Vec<ContainerInfo>,
    pub metrics: MetricsSnapshot,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResponse {
    pub message: String,
    pub status: AppStatus,
    pub stopped: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainersResponse {
    pub containers: Vec<ContainerInfo>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScaleResponse {
    pub instances: i32,
    pub status: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScaleActionResponse {
    pub instances: i32,
    pub action: ScaleAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyGenerateResponse {
    pub app_url: String,
    pub ports: Vec<u16>,
    pub instances: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteStatus {
    Active,
    Pending,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatusResponse {
    pub app_url: String,
    pub status: RouteStatus,
    pub config_generated: bool,
}

pub struct Orchestrator {
    db: Arc<Database>,
    lifecycle: Arc<LifecycleManager>,
    proxy: Arc<ProxyConfigManager>,
    registry: Arc<InstanceRegistry>,
    config: OrchestratorConfig,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        lifecycle: Arc<LifecycleManager>,
        proxy: Arc<ProxyConfigManager>,
        registry: Arc<InstanceRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            db,
            lifecycle,
            proxy,
            registry,
            config,
            locks: DashMap::new(),
        }
    }

    /// Wire every component from configuration around the given runtime,
    /// proxy control, store and cache
    pub fn assemble(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        control: Arc<dyn ProxyControl>,
        db: Arc<Database>,
        cache: Arc<dyn Cache>,
    ) -> anyhow::Result<Self> {
        let profile = SecurityProfile::from_config(&config.sandbox)?;
        let lifecycle = Arc::new(LifecycleManager::new(
            runtime,
            cache.clone(),
            Arc::new(DbLogSink::new(db.clone())),
            profile,
            LifecycleConfig::from_config(config),
        ));
        let proxy = Arc::new(ProxyConfigManager::new(
            config.proxy.clone(),
            db.clone(),
            lifecycle.clone(),
            control,
        ));
        let registry = Arc::new(InstanceRegistry::new(
            db.clone(),
            cache,
            utilization_source(&config.orchestrator.metrics_source),
            config.cache.instances_ttl(),
        ));

        Ok(Self::new(
            db,
            lifecycle,
            proxy,
            registry,
            config.orchestrator.clone(),
        ))
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn proxy(&self) -> &ProxyConfigManager {
        &self.proxy
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Run a workflow holding the application's lock, within the request timeout
    async fn exclusive<T, F>(&self, app_id: i64, workflow: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let lock = self.locks.entry(app_id).or_default().clone();
        let result = self
            .bounded(app_id, async move {
                let _guard = lock.lock().await;
                workflow.await
            })
            .await;
        // Only the map holds the lock once no workflow is running or queued
        self.locks
            .remove_if(&app_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Run a workflow within the request timeout
    async fn bounded<T, F>(&self, app_id: i64, workflow: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let limit = self.config.request_timeout();
        match tokio::time::timeout(limit, workflow).await {
            Ok(result) => result,
            Err(_) => {
                error!(app_id, timeout = ?limit, "Request timed out");
                Err(OrchestratorError::Timeout(limit))
            }
        }
    }

    fn require_app(&self, app_id: i64) -> Result<AppRecord> {
        self.db
            .get_app(app_id)?
            .ok_or(OrchestratorError::AppNotFound(app_id))
    }

    // ==================== Apps ====================

    pub fn create_app(
        &self,
        name: &str,
        image: Option<&str>,
        policy: Option<ScalingPolicy>,
    ) -> Result<AppRecord> {
        validate_app_name(name)?;
        // Hostnames are case-insensitive, so names are stored lowercased
        let name = name.to_ascii_lowercase();
        if let Some(p) = policy {
            if p.min < 1 || p.min > p.max {
                return Err(OrchestratorError::InvalidRequest(format!(
                    "scaling policy min {} / max {} is not a valid range",
                    p.min, p.max
                )));
            }
        }
        if self.db.get_app_by_name(&name)?.is_some() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "app name '{}' is already taken",
                name
            )));
        }

        let id = self.db.create_app(&NewApp {
            id: None,
            name: name.clone(),
            image: image.map(str::to_string),
            scaling_policy: policy,
        })?;
        info!(app_id = id, name = %name, "Created app");
        self.require_app(id)
    }

    pub fn list_apps(&self) -> Result<Vec<AppRecord>> {
        Ok(self.db.list_apps()?)
    }

    pub fn logs(&self, app_id: i64, limit: usize) -> Result<Vec<LogRecord>> {
        self.require_app(app_id)?;
        Ok(self.db.recent_logs(app_id, limit)?)
    }

    // ==================== Deploy / Stop ====================

    /// Deploy an application, replacing any running generation
    pub async fn deploy(&self, app_id: i64, request: DeployRequest) -> Result<DeployResponse> {
        self.exclusive(app_id, self.deploy_inner(app_id, request))
            .await
    }

    async fn deploy_inner(&self, app_id: i64, request: DeployRequest) -> Result<DeployResponse> {
        let app = self.require_app(app_id)?;

        let desired = match request.instances {
            Some(n) => n,
            // A stored target below 1 is left by a deploy that started nothing
            None => u32::try_from(self.registry.get_count(app_id).await?.max(1)).unwrap_or(1),
        };
        let max = self.config.max_instances_per_deploy;
        if desired < 1 || desired > max {
            return Err(OrchestratorError::InvalidRequest(format!(
                "instances must be between 1 and {}, got {}",
                max, desired
            )));
        }

        let image = request.image.as_deref().or(app.image.as_deref());
        let outcome = self
            .lifecycle
            .deploy(app_id, desired, &request.env, image)
            .await?;

        let mut warnings: Vec<Warning> = outcome
            .teardown_failures
            .iter()
            .map(|f| Warning::for_instance(WarningKind::InstanceStopFailed, f))
            .chain(
                outcome
                    .spawn_failures
                    .iter()
                    .map(|f| Warning::for_instance(WarningKind::InstanceSpawnFailed, f)),
            )
            .collect();

        // Persist what is actually running, not what was asked for
        self.registry
            .set_count(app_id, i32::try_from(outcome.achieved).unwrap_or(i32::MAX))
            .await?;

        self.sync_proxy(app_id, Some(outcome.achieved), &mut warnings)
            .await;

        let status = if outcome.achieved > 0 {
            AppStatus::Running
        } else {
            AppStatus::Stopped
        };
        self.db.mark_deployed(app_id, status, Utc::now())?;

        let metrics = self.registry.metrics(app_id).await?;

        if warnings.is_empty() {
            info!(app_id, instances = outcome.achieved, "Deployed app");
        } else {
            warn!(
                app_id,
                requested = outcome.requested,
                instances = outcome.achieved,
                warnings = warnings.len(),
                "Deployed app with warnings"
            );
        }

        Ok(DeployResponse {
            message: format!(
                "Deployed {}/{} instances of {}",
                outcome.achieved, outcome.requested, app.name
            ),
            instances: outcome.achieved,
            status,
            containers: outcome.instances,
            metrics,
            warnings,
        })
    }

    /// Stop every sandbox of an application and take its route down
    pub async fn stop(&self, app_id: i64) -> Result<StopResponse> {
        self.exclusive(app_id, self.stop_inner(app_id)).await
    }

    async fn stop_inner(&self, app_id: i64) -> Result<StopResponse> {
        let app = self.require_app(app_id)?;
        let outcome = self.lifecycle.stop(app_id).await?;

        let mut warnings: Vec<Warning> = outcome
            .failures
            .iter()
            .map(|f| Warning::for_instance(WarningKind::InstanceStopFailed, f))
            .collect();

        if let Err(e) = self.proxy.remove_config(app_id) {
            warn!(app_id, error = %e, "Failed to remove proxy route");
            warnings.push(Warning::new(WarningKind::ProxyUpdateFailed, format!("{:#}", e)));
        }
        self.ensure_base_and_reload(&mut warnings).await;

        self.db.update_app_status(app_id, AppStatus::Stopped)?;
        info!(app_id, stopped = outcome.stopped, "Stopped app");

        Ok(StopResponse {
            message: format!("Stopped {} ({} instances)", app.name, outcome.stopped),
            status: AppStatus::Stopped,
            stopped: outcome.stopped,
            warnings,
        })
    }

    /// Sandboxes of an application as the runtime reports them
    pub async fn list_containers(&self, app_id: i64) -> Result<ContainersResponse> {
        self.require_app(app_id)?;
        let containers = self
            .bounded(app_id, async {
                self.lifecycle
                    .get_containers(app_id)
                    .await
                    .map_err(OrchestratorError::from)
            })
            .await?;
        Ok(ContainersResponse {
            count: containers.len(),
            containers,
        })
    }

    // ==================== Scaling ====================

    /// Set the target count; takes effect on the next deploy
    pub async fn scale(&self, app_id: i64, instances: i32) -> Result<ScaleResponse> {
        if instances < 1 {
            return Err(OrchestratorError::InvalidRequest(format!(
                "instances must be at least 1, got {}",
                instances
            )));
        }
        self.exclusive(app_id, self.scale_inner(app_id, instances))
            .await
    }

    async fn scale_inner(&self, app_id: i64, instances: i32) -> Result<ScaleResponse> {
        self.require_app(app_id)?;
        let instances = self.registry.set_count(app_id, instances).await?;
        info!(app_id, instances, "Set target instance count");
        Ok(ScaleResponse {
            instances,
            status: "success",
        })
    }

    pub async fn scale_up(&self, app_id: i64, delta: u32) -> Result<ScaleActionResponse> {
        self.scale_by(app_id, delta, ScaleAction::ScaleUp).await
    }

    pub async fn scale_down(&self, app_id: i64, delta: u32) -> Result<ScaleActionResponse> {
        self.scale_by(app_id, delta, ScaleAction::ScaleDown).await
    }

    async fn scale_by(
        &self,
        app_id: i64,
        delta: u32,
        action: ScaleAction,
    ) -> Result<ScaleActionResponse> {
        if delta < 1 {
            return Err(OrchestratorError::InvalidRequest(
                "scale delta must be at least 1".to_string(),
            ));
        }
        self.exclusive(app_id, self.scale_by_inner(app_id, delta, action))
            .await
    }

    async fn scale_by_inner(
        &self,
        app_id: i64,
        delta: u32,
        action: ScaleAction,
    ) -> Result<ScaleActionResponse> {
        self.require_app(app_id)?;
        let instances = match action {
            ScaleAction::ScaleUp => self.registry.scale_up(app_id, delta).await?,
            ScaleAction::ScaleDown => self.registry.scale_down(app_id, delta).await?,
        };
        info!(app_id, ?action, delta, instances, "Scaled app");
        Ok(ScaleActionResponse { instances, action })
    }

    pub async fn metrics(&self, app_id: i64) -> Result<MetricsSnapshot> {
        self.require_app(app_id)?;
        Ok(self.registry.metrics(app_id).await?)
    }

    // ==================== Proxy ====================

    /// Rebuild the route from the running sandboxes, then reload the proxy
    pub async fn regenerate_proxy(&self, app_id: i64) -> Result<ProxyGenerateResponse> {
        self.exclusive(app_id, self.regenerate_proxy_inner(app_id))
            .await
    }

    async fn regenerate_proxy_inner(&self, app_id: i64) -> Result<ProxyGenerateResponse> {
        self.require_app(app_id)?;
        let mut warnings = Vec::new();
        let generated = self.sync_proxy(app_id, None, &mut warnings).await;

        let hostname = match &generated {
            Some(route) => route.hostname.clone(),
            None => self.proxy.hostname(app_id)?,
        };
        let (ports, instances) = generated
            .map(|route| (route.ports, route.upstreams.len()))
            .unwrap_or_default();

        Ok(ProxyGenerateResponse {
            app_url: self.proxy.app_url(&hostname),
            ports,
            instances,
            warnings,
        })
    }

    pub fn proxy_status(&self, app_id: i64) -> Result<ProxyStatusResponse> {
        self.require_app(app_id)?;
        let hostname = self.proxy.hostname(app_id)?;
        let generated = self.proxy.route_exists(app_id);
        Ok(ProxyStatusResponse {
            app_url: self.proxy.app_url(&hostname),
            status: if generated {
                RouteStatus::Active
            } else {
                RouteStatus::Pending
            },
            config_generated: generated,
        })
    }

    /// Regenerate the route, ensure the default route and reload
    ///
    /// Never fails; every problem becomes a warning.
    async fn sync_proxy(
        &self,
        app_id: i64,
        instance_count: Option<u32>,
        warnings: &mut Vec<Warning>,
    ) -> Option<GeneratedRoute> {
        let generated = match self.proxy.generate_config(app_id, instance_count).await {
            Ok(route) => Some(route),
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(app_id, error = %message, "Failed to generate proxy route");
                warnings.push(Warning::new(WarningKind::ProxyUpdateFailed, message));
                None
            }
        };
        self.ensure_base_and_reload(warnings).await;
        generated
    }

    async fn ensure_base_and_reload(&self, warnings: &mut Vec<Warning>) {
        if let Err(e) = self.proxy.generate_base_config() {
            let message = format!("{:#}", e);
            warn!(error = %message, "Failed to write default route");
            warnings.push(Warning::new(WarningKind::ProxyUpdateFailed, message));
        }

        match self.proxy.reload().await {
            ReloadOutcome::Reloaded => {}
            ReloadOutcome::ProxyNotRunning => warnings.push(Warning::new(
                WarningKind::ProxyNotRunning,
                "proxy is not running; routes take effect when it starts",
            )),
            ReloadOutcome::ValidationFailed(e) => {
                warnings.push(Warning::new(WarningKind::ProxyValidationFailed, e))
            }
            ReloadOutcome::ReloadFailed(e) => {
                warnings.push(Warning::new(WarningKind::ProxyReloadFailed, e))
            }
        }
    }
}

/// App names become DNS labels in hostnames
fn validate_app_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidRequest(format!(
            "app name '{}' must be 1-63 letters, digits or inner hyphens",
            name
        )))
    }
}
