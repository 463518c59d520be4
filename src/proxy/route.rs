//! Route model and nginx rendering
//!
//! A route is built as data and rendered by [`render`], so the single-backend
//! and pooled forms share every header, resolver and upgrade directive.

use std::fmt::Write as _;
use std::time::Duration;

/// File holding the catch-all server
pub const DEFAULT_ROUTE_FILE: &str = "00-default.conf";

/// Route file of an application; depends on nothing but the id
pub fn route_file_name(app_id: i64) -> String {
    format!("app-{}.conf", app_id)
}

/// Name of the backend pool of an application
pub fn pool_name(app_id: i64) -> String {
    format!("app-{}", app_id)
}

/// A backend address on the shared network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// DNS settings for resolving backends at request time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverSettings {
    pub address: String,
    pub valid: Duration,
    pub timeout: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            // Docker's embedded DNS
            address: "127.0.0.11".to_string(),
            valid: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        }
    }
}

impl ResolverSettings {
    fn directive(&self) -> String {
        format!(
            "resolver {} valid={}s ipv6=off;",
            self.address,
            self.valid.as_secs()
        )
    }

    fn timeout_directive(&self) -> String {
        format!("resolver_timeout {}s;", self.timeout.as_secs())
    }
}

/// Where a route sends traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Proxy straight to one instance
    Single(Upstream),
    /// Least-connections pool over several instances
    Pool { name: String, members: Vec<Upstream> },
}

impl Backend {
    /// Pick the form for a set of upstreams; `None` when empty
    pub fn for_upstreams(app_id: i64, mut upstreams: Vec<Upstream>) -> Option<Self> {
        match upstreams.len() {
            0 => None,
            1 => upstreams.pop().map(Backend::Single),
            _ => Some(Backend::Pool {
                name: pool_name(app_id),
                members: upstreams,
            }),
        }
    }

    pub fn upstreams(&self) -> Vec<&Upstream> {
        match self {
            Backend::Single(u) => vec![u],
            Backend::Pool { members, .. } => members.iter().collect(),
        }
    }
}

/// One virtual host routed to an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub server_name: String,
    pub listen: u16,
    pub backend: Backend,
    pub resolver: ResolverSettings,
}

/// Render a route as an nginx configuration fragment
pub fn render(route: &Route) -> String {
    let mut out = String::new();
    let resolver = route.resolver.directive();
    let resolver_timeout = route.resolver.timeout_directive();

    // writeln! into a String cannot fail
    if let Backend::Pool { name, members } = &route.backend {
        let _ = writeln!(out, "upstream {} {{", name);
        let _ = writeln!(out, "    zone {} 64k;", name);
        let _ = writeln!(out, "    least_conn;");
        let _ = writeln!(out, "    {}", resolver);
        let _ = writeln!(out, "    {}", resolver_timeout);
        for member in members {
            let _ = writeln!(out, "    server {} resolve;", member.address());
        }
        let _ = writeln!(out, "}}");
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "server {{");
    let _ = writeln!(out, "    listen {};", route.listen);
    let _ = writeln!(out, "    server_name {};", route.server_name);
    let _ = writeln!(out);
    let _ = writeln!(out, "    {}", resolver);
    let _ = writeln!(out, "    {}", resolver_timeout);
    let _ = writeln!(out);
    let _ = writeln!(out, "    location / {{");

    match &route.backend {
        Backend::Single(upstream) => {
            // A variable forces resolution per request instead of at load
            let _ = writeln!(out, "        set $backend \"http://{}\";", upstream.address());
            let _ = writeln!(out, "        proxy_pass $backend;");
        }
        Backend::Pool { name, .. } => {
            let _ = writeln!(out, "        proxy_pass http://{};", name);
        }
    }

    for line in [
        "proxy_http_version 1.1;",
        "proxy_set_header Upgrade $http_upgrade;",
        "proxy_set_header Connection 'upgrade';",
        "proxy_set_header Host $host;",
        "proxy_set_header X-Real-IP $remote_addr;",
        "proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;",
        "proxy_set_header X-Forwarded-Proto $scheme;",
        "proxy_cache_bypass $http_upgrade;",
    ] {
        let _ = writeln!(out, "        {}", line);
    }

    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");
    out
}

/// Catch-all server answering unknown hosts with 503
pub fn render_default(listen: u16) -> String {
    format!(
        "server {{\n    listen {listen} default_server;\n    server_name _;\n\n    location / {{\n        default_type text/plain;\n        return 503 'No apps deployed';\n    }}\n}}\n"
    )
}
