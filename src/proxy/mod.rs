//! Proxy configuration manager
//!
//! Owns one route file per application in the proxy's config directory plus
//! the catch-all default. Files are replaced atomically so the proxy never
//! reads a half-written route.

pub mod control;
pub mod route;

pub use control::{
    validate_and_reload, DockerExecControl, ProxyControl, ProxyControlError,
    RecordingProxyControl, ReloadOutcome,
};
pub use route::{Backend, ResolverSettings, Route, Upstream};

use crate::config::ProxyConfig;
use crate::db::Database;
use crate::lifecycle::LifecycleManager;
use crate::runtime::instance_name;
use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a generate call produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedRoute {
    pub app_id: i64,
    pub hostname: String,
    /// Backend hosts, ordinal order; empty when the route was removed
    pub upstreams: Vec<String>,
    pub ports: Vec<u16>,
    pub path: Option<PathBuf>,
}

impl GeneratedRoute {
    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }
}

pub struct ProxyConfigManager {
    config: ProxyConfig,
    db: Arc<Database>,
    lifecycle: Arc<LifecycleManager>,
    control: Arc<dyn ProxyControl>,
}

impl ProxyConfigManager {
    pub fn new(
        config: ProxyConfig,
        db: Arc<Database>,
        lifecycle: Arc<LifecycleManager>,
        control: Arc<dyn ProxyControl>,
    ) -> Self {
        Self {
            config,
            db,
            lifecycle,
            control,
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config.config_dir
    }

    pub fn route_path(&self, app_id: i64) -> PathBuf {
        self.config.config_dir.join(route::route_file_name(app_id))
    }

    pub fn route_exists(&self, app_id: i64) -> bool {
        self.route_path(app_id).exists()
    }

    /// Public hostname of an application
    pub fn hostname(&self, app_id: i64) -> Result<String> {
        let name = self
            .db
            .get_app(app_id)?
            .map(|app| app.name.to_lowercase())
            .unwrap_or_else(|| route::pool_name(app_id));
        Ok(format!("{}.{}", name, self.config.domain))
    }

    /// URL the application is reachable at through the proxy
    pub fn app_url(&self, hostname: &str) -> String {
        if self.config.listen_port == 80 {
            format!("http://{}", hostname)
        } else {
            format!("http://{}:{}", hostname, self.config.listen_port)
        }
    }

    fn resolver(&self) -> ResolverSettings {
        ResolverSettings {
            address: self.config.resolver.clone(),
            valid: Duration::from_secs(self.config.resolver_valid_secs),
            timeout: Duration::from_secs(self.config.resolver_timeout_secs),
        }
    }

    /// Write the route of an application
    ///
    /// With `instance_count` the backends are ordinals `0..count` (the live
    /// set after a deploy). Without it the running sandboxes are discovered
    /// from the runtime. No backends removes the route instead.
    pub async fn generate_config(
        &self,
        app_id: i64,
        instance_count: Option<u32>,
    ) -> Result<GeneratedRoute> {
        let prefix = &self.lifecycle.config().prefix;
        let port = self.lifecycle.config().app_port;

        let hosts: Vec<String> = match instance_count {
            Some(count) => (0..count)
                .map(|ordinal| instance_name(prefix, app_id, ordinal))
                .collect(),
            None => self
                .lifecycle
                .running_instances(app_id)
                .await
                .with_context(|| format!("Failed to discover instances of app {}", app_id))?
                .into_iter()
                .map(|c| c.name)
                .collect(),
        };

        let hostname = self.hostname(app_id)?;
        let upstreams: Vec<Upstream> = hosts.iter().map(|h| Upstream::new(h.clone(), port)).collect();

        let backend = match Backend::for_upstreams(app_id, upstreams) {
            Some(backend) => backend,
            None => {
                info!(app_id, "No live instances, removing route");
                self.remove_config(app_id)?;
                return Ok(GeneratedRoute {
                    app_id,
                    hostname,
                    upstreams: Vec::new(),
                    ports: Vec::new(),
                    path: None,
                });
            }
        };

        let route = Route {
            server_name: hostname.clone(),
            listen: self.config.listen_port,
            backend,
            resolver: self.resolver(),
        };

        let path = self.route_path(app_id);
        write_atomic(&path, &route::render(&route))
            .with_context(|| format!("Failed to write route for app {}", app_id))?;

        info!(
            app_id,
            hostname = %hostname,
            backends = hosts.len(),
            path = %path.display(),
            "Generated proxy route"
        );

        Ok(GeneratedRoute {
            app_id,
            hostname,
            ports: vec![port; hosts.len()],
            upstreams: hosts,
            path: Some(path),
        })
    }

    /// Delete the route of an application; returns whether one existed
    pub fn remove_config(&self, app_id: i64) -> Result<bool> {
        let path = self.route_path(app_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(app_id, path = %path.display(), "Removed proxy route");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// Ensure the catch-all route exists
    pub fn generate_base_config(&self) -> Result<PathBuf> {
        let path = self.config.config_dir.join(route::DEFAULT_ROUTE_FILE);
        let content = route::render_default(self.config.listen_port);

        if std::fs::read_to_string(&path).ok().as_deref() == Some(content.as_str()) {
            debug!(path = %path.display(), "Default route up to date");
            return Ok(path);
        }

        write_atomic(&path, &content).context("Failed to write default route")?;
        info!(path = %path.display(), "Wrote default route");
        Ok(path)
    }

    /// Validate the whole proxy configuration and reload it in place
    pub async fn reload(&self) -> ReloadOutcome {
        let outcome = validate_and_reload(self.control.as_ref()).await;
        match &outcome {
            ReloadOutcome::Reloaded => info!(container = %self.config.container, "Proxy reloaded"),
            ReloadOutcome::ProxyNotRunning => {
                info!(container = %self.config.container, "Proxy not running, skipping reload")
            }
            ReloadOutcome::ValidationFailed(e) => {
                warn!(container = %self.config.container, error = %e, "Proxy config validation failed")
            }
            ReloadOutcome::ReloadFailed(e) => {
                warn!(container = %self.config.container, error = %e, "Proxy reload failed")
            }
        }
        outcome
    }
}

/// Write-then-rename within the target directory
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path
        .parent()
        .context("Route path has no parent directory")?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;

    // The proxy reads as a different user
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))?;
    }

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
