//! Docker implementation of the container runtime

use crate::config::PullPolicy;
use crate::runtime::{ContainerInfo, ContainerRuntime, RuntimeError, SandboxSpec};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, EndpointSettings, HostConfig, ResourcesUlimits};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Container runtime backed by the Docker Engine API
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}.",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
        ];

        for (name, path) in &socket_paths {
            if path.starts_with('/') && std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon. Start dockerd or set DOCKER_HOST. \
                 Underlying error: {}",
                e
            )
        })
    }

    /// Pull an image if needed based on pull policy
    async fn pull_image_if_needed(&self, image: &str, policy: &PullPolicy) -> Result<(), RuntimeError> {
        let should_pull = match policy {
            PullPolicy::Always => true,
            PullPolicy::Never => {
                if self.client.inspect_image(image).await.is_err() {
                    return Err(RuntimeError::Failed(format!(
                        "Image '{}' not found locally and pull_policy is 'never'",
                        image
                    )));
                }
                false
            }
            PullPolicy::IfNotPresent => self.client.inspect_image(image).await.is_err(),
        };

        if !should_pull {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        return Err(RuntimeError::Failed(format!(
                            "Failed to pull image '{}': {}",
                            image, error
                        )));
                    }
                }
                Err(e) => return Err(map_error(image, e)),
            }
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }
}

/// Map a bollard error onto the runtime taxonomy
///
/// Anything that is not a response from the daemon means the daemon
/// could not be reached.
fn map_error(target: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(target.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409, ..
        } => RuntimeError::Conflict(target.to_string()),
        bollard::errors::Error::DockerResponseServerError { status_code, message } => {
            RuntimeError::Failed(format!("{} ({}): {}", target, status_code, message))
        }
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

fn build_container_config(spec: &SandboxSpec) -> Config<String> {
    let profile = &spec.profile;

    let host_config = HostConfig {
        memory: Some(profile.memory_bytes),
        // no swap beyond the memory ceiling
        memory_swap: Some(profile.memory_bytes),
        nano_cpus: Some(profile.nano_cpus),
        pids_limit: Some(profile.pids_limit),
        ulimits: Some(vec![
            ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(profile.nofile),
                hard: Some(profile.nofile),
            },
            ResourcesUlimits {
                name: Some("nproc".to_string()),
                soft: Some(profile.nproc),
                hard: Some(profile.nproc),
            },
        ]),
        readonly_rootfs: Some(profile.read_only_rootfs),
        tmpfs: Some(profile.tmpfs.clone().into_iter().collect()),
        cap_drop: Some(profile.cap_drop.clone()),
        cap_add: Some(profile.cap_add.clone()),
        security_opt: Some(profile.security_opts()),
        network_mode: Some(spec.network.clone()),
        ..Default::default()
    };

    let networking_config = NetworkingConfig {
        endpoints_config: HashMap::from([(
            spec.network.clone(),
            EndpointSettings {
                aliases: Some(vec![spec.alias.clone()]),
                ..Default::default()
            },
        )]),
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: spec.command.clone(),
        env: Some(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
        labels: Some(spec.labels.clone().into_iter().collect()),
        hostname: Some(spec.alias.clone()),
        host_config: Some(host_config),
        networking_config: Some(networking_config),
        ..Default::default()
    }
}

fn summary_to_info(summary: ContainerSummary) -> ContainerInfo {
    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();

    let ports = summary
        .ports
        .unwrap_or_default()
        .iter()
        .map(|p| {
            let proto = p.typ.as_ref().map(|t| t.to_string()).unwrap_or_else(|| "tcp".to_string());
            match (&p.ip, p.public_port) {
                (Some(ip), Some(public)) => format!("{}:{}->{}/{}", ip, public, p.private_port, proto),
                _ => format!("{}/{}", p.private_port, proto),
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    ContainerInfo {
        id: summary.id.unwrap_or_default(),
        name,
        status: summary.state.unwrap_or_default(),
        ports,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_network(&self, name: &str, internal: bool) -> Result<(), RuntimeError> {
        match self.client.inspect_network::<String>(name, None).await {
            Ok(_) => {
                debug!(network = name, "Network already exists");
                return Ok(());
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(map_error(name, e)),
        }

        info!(network = name, internal, "Creating sandbox network");
        match self
            .client
            .create_network(CreateNetworkOptions {
                name,
                driver: "bridge",
                internal,
                check_duplicate: true,
                ..Default::default()
            })
            .await
        {
            Ok(_) => Ok(()),
            // Lost a race with a concurrent create
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(map_error(name, e)),
        }
    }

    async fn spawn(&self, spec: &SandboxSpec) -> Result<String, RuntimeError> {
        self.pull_image_if_needed(&spec.image, &spec.pull_policy).await?;

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), build_container_config(spec))
            .await
            .map_err(|e| map_error(&spec.name, e))?;

        for warning in &response.warnings {
            warn!(container = spec.name, warning, "Docker warning on create");
        }

        self.client
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error(&spec.name, e))?;

        debug!(container = spec.name, id = response.id, image = spec.image, "Started sandbox");
        Ok(response.id)
    }

    async fn inspect(&self, name_or_id: &str) -> Result<ContainerInfo, RuntimeError> {
        let info = self
            .client
            .inspect_container(name_or_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error(name_or_id, e))?;

        let status = info
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_default();

        Ok(ContainerInfo {
            id: info.id.unwrap_or_default(),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            status,
            ports: String::new(),
        })
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        // The daemon treats the name filter as an unanchored regex, so the
        // prefix is re-checked on our side.
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("name".to_string(), vec![name_prefix.to_string()])]),
            ..Default::default()
        };

        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| map_error(name_prefix, e))?;

        Ok(summaries
            .into_iter()
            .map(summary_to_info)
            .filter(|c| c.name.starts_with(name_prefix))
            .collect())
    }

    async fn stop(&self, name_or_id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.client.stop_container(name_or_id, Some(options)).await {
            Ok(_) => {
                debug!(container = name_or_id, "Stopped sandbox");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container = name_or_id, "Sandbox was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container = name_or_id, "Sandbox not found");
                Ok(())
            }
            Err(e) => Err(map_error(name_or_id, e)),
        }
    }

    async fn remove(&self, name_or_id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(name_or_id, Some(options)).await {
            Ok(_) => {
                debug!(container = name_or_id, "Removed sandbox");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(map_error(name_or_id, e)),
        }
    }
}

/// Docker runtime that connects on first use
///
/// Commands that only touch the store never reach the daemon, so they keep
/// working while it is down. A failed connect is retried on the next call.
pub struct LazyDockerRuntime {
    docker_host: Option<String>,
    runtime: OnceCell<DockerRuntime>,
}

impl LazyDockerRuntime {
    pub fn new(docker_host: Option<String>) -> Self {
        Self {
            docker_host,
            runtime: OnceCell::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.runtime.initialized()
    }

    async fn get(&self) -> Result<&DockerRuntime, RuntimeError> {
        self.runtime
            .get_or_try_init(|| async {
                DockerRuntime::connect(self.docker_host.as_deref())
                    .await
                    .map_err(|e| RuntimeError::Unavailable(format!("{:#}", e)))
            })
            .await
    }
}

#[async_trait]
impl ContainerRuntime for LazyDockerRuntime {
    async fn ensure_network(&self, name: &str, internal: bool) -> Result<(), RuntimeError> {
        self.get().await?.ensure_network(name, internal).await
    }

    async fn spawn(&self, spec: &SandboxSpec) -> Result<String, RuntimeError> {
        self.get().await?.spawn(spec).await
    }

    async fn inspect(&self, name_or_id: &str) -> Result<ContainerInfo, RuntimeError> {
        self.get().await?.inspect(name_or_id).await
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        self.get().await?.list(name_prefix).await
    }

    async fn stop(&self, name_or_id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        self.get().await?.stop(name_or_id, timeout).await
    }

    async fn remove(&self, name_or_id: &str) -> Result<(), RuntimeError> {
        self.get().await?.remove(name_or_id).await
    }
}
