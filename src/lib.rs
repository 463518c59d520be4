//! Flotilla - control plane for a multi-tenant app hosting platform
//!
//! This library runs applications as sandboxed containers and keeps a reverse
//! proxy pointed at them:
//! - Deploys N hardened instances of an app onto a shared private network
//! - Discovers live instances from the container runtime, never from memory
//! - Writes one nginx route per app (single backend or least-conn pool) and
//!   reloads the proxy after validating its configuration
//! - Tracks each app's target instance count within its scaling policy
//! - Reports partial failures as warnings instead of failing deploys

pub mod cache;
pub mod config;
pub mod db;
pub mod docker;
pub mod error;
pub mod lifecycle;
pub mod logs;
pub mod orchestrator;
pub mod proxy;
pub mod registry;
pub mod runtime;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
