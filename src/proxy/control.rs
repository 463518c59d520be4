//! Control of the running proxy process

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Failure talking to the proxy process
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyControlError {
    /// The control command could not be started
    #[error("failed to run {command}: {reason}")]
    Spawn { command: String, reason: String },

    /// The proxy ran the command and refused it; carries its diagnostics
    #[error("{0}")]
    Rejected(String),
}

/// Result of a validate-then-reload attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ReloadOutcome {
    Reloaded,
    /// Nothing to reload; not an error
    ProxyNotRunning,
    ValidationFailed(String),
    ReloadFailed(String),
}

impl ReloadOutcome {
    pub fn is_reloaded(&self) -> bool {
        matches!(self, ReloadOutcome::Reloaded)
    }
}

/// Operations on the proxy process
#[async_trait]
pub trait ProxyControl: Send + Sync {
    async fn is_running(&self) -> bool;

    /// Check the full configuration; `Err` carries the proxy's diagnostics
    async fn validate(&self) -> Result<(), ProxyControlError>;

    async fn reload(&self) -> Result<(), ProxyControlError>;
}

/// Validate, then reload; skipped when the proxy is not running
pub async fn validate_and_reload(control: &dyn ProxyControl) -> ReloadOutcome {
    if !control.is_running().await {
        return ReloadOutcome::ProxyNotRunning;
    }
    if let Err(e) = control.validate().await {
        return ReloadOutcome::ValidationFailed(e.to_string());
    }
    match control.reload().await {
        Ok(()) => ReloadOutcome::Reloaded,
        Err(e) => ReloadOutcome::ReloadFailed(e.to_string()),
    }
}

/// Drives nginx inside its container through the docker CLI
pub struct DockerExecControl {
    docker_path: String,
    container: String,
}

impl DockerExecControl {
    pub fn new(docker_path: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            docker_path: docker_path.into(),
            container: container.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, ProxyControlError> {
        debug!(docker = %self.docker_path, ?args, "Running proxy command");
        let output = Command::new(&self.docker_path)
            .args(args)
            .output()
            .await
            .map_err(|e| ProxyControlError::Spawn {
                command: self.docker_path.clone(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            // nginx -t reports on stderr
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(ProxyControlError::Rejected(if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            }))
        }
    }
}

#[async_trait]
impl ProxyControl for DockerExecControl {
    async fn is_running(&self) -> bool {
        match self
            .run(&["inspect", "-f", "{{.State.Running}}", &self.container])
            .await
        {
            Ok(out) => out == "true",
            Err(e) => {
                debug!(container = %self.container, error = %e, "Proxy container not inspectable");
                false
            }
        }
    }

    async fn validate(&self) -> Result<(), ProxyControlError> {
        self.run(&["exec", &self.container, "nginx", "-t"])
            .await
            .map(|_| ())
    }

    async fn reload(&self) -> Result<(), ProxyControlError> {
        self.run(&["exec", &self.container, "nginx", "-s", "reload"])
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Default)]
struct RecordingState {
    running: bool,
    validation_error: Option<String>,
    reload_error: Option<String>,
    calls: Vec<String>,
}

/// In-process proxy control that records calls
#[derive(Debug)]
pub struct RecordingProxyControl {
    state: Mutex<RecordingState>,
}

impl RecordingProxyControl {
    pub fn new(running: bool) -> Self {
        Self {
            state: Mutex::new(RecordingState {
                running,
                ..Default::default()
            }),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.state.lock().running = running;
    }

    pub fn fail_validation(&self, message: &str) {
        self.state.lock().validation_error = Some(message.to_string());
    }

    pub fn fail_reload(&self, message: &str) {
        self.state.lock().reload_error = Some(message.to_string());
    }

    /// `validate` and `reload` calls, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn reload_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.as_str() == "reload")
            .count()
    }
}

impl Default for RecordingProxyControl {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl ProxyControl for RecordingProxyControl {
    async fn is_running(&self) -> bool {
        self.state.lock().running
    }

    async fn validate(&self) -> Result<(), ProxyControlError> {
        let mut state = self.state.lock();
        state.calls.push("validate".to_string());
        match &state.validation_error {
            Some(e) => Err(ProxyControlError::Rejected(e.clone())),
            None => Ok(()),
        }
    }

    async fn reload(&self) -> Result<(), ProxyControlError> {
        let mut state = self.state.lock();
        state.calls.push("reload".to_string());
        match &state.reload_error {
            Some(e) => Err(ProxyControlError::Rejected(e.clone())),
            None => Ok(()),
        }
    }
}
