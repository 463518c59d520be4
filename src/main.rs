//! flotilla - command-line front end of the control plane
//!
//! Every command prints its JSON response on stdout. Failures print
//! `{"error": {"code", "message", "status"}}` and exit non-zero. Logs go to
//! stderr.

use clap::{Args, Parser, Subcommand};
use flotilla::cache::MemoryCache;
use flotilla::config::Config;
use flotilla::db::{Database, ScalingPolicy};
use flotilla::docker::LazyDockerRuntime;
use flotilla::error::{ErrorCode, ErrorResponse, OrchestratorError};
use flotilla::orchestrator::{DeployRequest, Orchestrator};
use flotilla::proxy::DockerExecControl;
use flotilla::runtime::ContainerRuntime;
use flotilla::{PKG_NAME, VERSION};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info};

const DEFAULT_CONFIG_PATH: &str = "flotilla.toml";

#[derive(Parser)]
#[command(name = "flotilla", version, about = "Control plane for sandboxed app hosting")]
struct Cli {
    /// Configuration file (defaults to ./flotilla.toml when present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the app network and the default proxy route
    Init,

    /// Manage application records
    #[command(subcommand)]
    Apps(AppsCommand),

    /// Deploy an application, replacing running instances
    Deploy {
        app_id: i64,

        /// Instance count (defaults to the app's target count)
        #[arg(long, short)]
        instances: Option<u32>,

        /// Environment variable as KEY=VALUE (repeatable)
        #[arg(long = "env", short, value_parser = parse_env_var)]
        env: Vec<(String, String)>,

        /// Image to run instead of the app's image
        #[arg(long)]
        image: Option<String>,
    },

    /// Stop every instance of an application
    Stop { app_id: i64 },

    /// List an application's containers
    Containers { app_id: i64 },

    /// Set the target instance count
    Scale { app_id: i64, instances: i32 },

    /// Raise the target instance count
    ScaleUp(ScaleBy),

    /// Lower the target instance count (never below 1)
    ScaleDown(ScaleBy),

    /// Show instance count, scaling policy and utilization
    Metrics { app_id: i64 },

    /// Proxy route commands
    #[command(subcommand)]
    Proxy(ProxyCommand),

    /// Show recent instance log lines
    Logs {
        app_id: i64,

        #[arg(long, short = 'n', default_value = "100")]
        lines: usize,
    },
}

#[derive(Subcommand)]
enum AppsCommand {
    /// Create an application
    Create {
        name: String,

        /// Image to run (a built-in responder when omitted)
        #[arg(long)]
        image: Option<String>,

        /// Scaling policy lower bound
        #[arg(long, requires = "max")]
        min: Option<i32>,

        /// Scaling policy upper bound
        #[arg(long, requires = "min")]
        max: Option<i32>,
    },

    /// List applications
    List,
}

#[derive(Subcommand)]
enum ProxyCommand {
    /// Rebuild the route from running instances and reload the proxy
    Generate { app_id: i64 },

    /// Report whether the route has been generated
    Status { app_id: i64 },
}

#[derive(Args)]
struct ScaleBy {
    app_id: i64,

    #[arg(long, default_value = "1")]
    by: u32,
}

fn parse_env_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "flotilla=debug"
    } else {
        "flotilla=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive)),
        )
        .init();

    match run(cli).await {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("{}", e.to_json());
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH),
        None => {
            debug!("No configuration file, using defaults");
            Ok(Config::default())
        }
    }
}

fn setup_error(code: ErrorCode, e: anyhow::Error) -> ErrorResponse {
    let message = format!("{:#}", e);
    error!(error = %message, "Startup failed");
    ErrorResponse::new(code, message)
}

fn render<T: Serialize>(value: &T) -> Result<String, OrchestratorError> {
    serde_json::to_string_pretty(value).map_err(|e| OrchestratorError::Internal(e.to_string()))
}

async fn run(cli: Cli) -> Result<String, ErrorResponse> {
    let config = load_config(cli.config.as_deref())
        .map_err(|e| setup_error(ErrorCode::InvalidRequest, e))?;

    if let Some(dir) = config.store.path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| setup_error(ErrorCode::StoreError, e.into()))?;
    }
    let db = Arc::new(
        Database::open(&config.store.path).map_err(|e| setup_error(ErrorCode::StoreError, e))?,
    );

    // Connects on first use; store-only commands work with the daemon down
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(LazyDockerRuntime::new(config.runtime.docker_host.clone()));
    let control = Arc::new(DockerExecControl::new(
        config.proxy.docker_path.clone(),
        config.proxy.container.clone(),
    ));

    let orchestrator = Orchestrator::assemble(
        &config,
        runtime.clone(),
        control,
        db,
        Arc::new(MemoryCache::new()),
    )
    .map_err(|e| setup_error(ErrorCode::InvalidRequest, e))?;

    debug!(name = PKG_NAME, version = VERSION, "Control plane ready");

    execute(cli.command, &config, runtime, &orchestrator)
        .await
        .map_err(|e| e.to_response())
}

async fn execute(
    command: Command,
    config: &Config,
    runtime: Arc<dyn ContainerRuntime>,
    orchestrator: &Orchestrator,
) -> Result<String, OrchestratorError> {
    match command {
        Command::Init => {
            runtime
                .ensure_network(&config.runtime.network, config.runtime.internal_network)
                .await?;
            let default_route = orchestrator
                .proxy()
                .generate_base_config()
                .map_err(OrchestratorError::Proxy)?;
            let reload = orchestrator.proxy().reload().await;
            info!(network = %config.runtime.network, "Initialized");
            render(&serde_json::json!({
                "network": config.runtime.network,
                "default_route": default_route,
                "proxy": reload,
            }))
        }
        Command::Apps(AppsCommand::Create {
            name,
            image,
            min,
            max,
        }) => {
            let policy = match (min, max) {
                (Some(min), Some(max)) => Some(ScalingPolicy { min, max }),
                _ => None,
            };
            render(&orchestrator.create_app(&name, image.as_deref(), policy)?)
        }
        Command::Apps(AppsCommand::List) => render(&orchestrator.list_apps()?),
        Command::Deploy {
            app_id,
            instances,
            env,
            image,
        } => {
            let request = DeployRequest {
                instances,
                env: env.into_iter().collect::<BTreeMap<_, _>>(),
                image,
            };
            render(&orchestrator.deploy(app_id, request).await?)
        }
        Command::Stop { app_id } => render(&orchestrator.stop(app_id).await?),
        Command::Containers { app_id } => render(&orchestrator.list_containers(app_id).await?),
        Command::Scale { app_id, instances } => {
            render(&orchestrator.scale(app_id, instances).await?)
        }
        Command::ScaleUp(ScaleBy { app_id, by }) => {
            render(&orchestrator.scale_up(app_id, by).await?)
        }
        Command::ScaleDown(ScaleBy { app_id, by }) => {
            render(&orchestrator.scale_down(app_id, by).await?)
        }
        Command::Metrics { app_id } => render(&orchestrator.metrics(app_id).await?),
        Command::Proxy(ProxyCommand::Generate { app_id }) => {
            render(&orchestrator.regenerate_proxy(app_id).await?)
        }
        Command::Proxy(ProxyCommand::Status { app_id }) => {
            render(&orchestrator.proxy_status(app_id)?)
        }
        Command::Logs { app_id, lines } => render(&orchestrator.logs(app_id, lines)?),
    }
}
