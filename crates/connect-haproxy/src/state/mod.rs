//! Declarative proxy state and its generator.
//!
//! A [`ProxyState`] is an ordered list of frontends and backends, rich
//! enough to render the native configuration and nothing more. The
//! generator is deterministic: a given snapshot always produces a
//! structurally equal state (upstreams in sorted order, servers named
//! `srv_<index>` in snapshot order), which is what lets the convergence
//! loop skip no-op rounds by comparing states.

mod downstream;
mod upstream;

use std::path::PathBuf;

use connect_core::{MeshSnapshot, Protocol, Result};
use tracing::debug;

use crate::certs::CertificateStore;

pub(crate) use downstream::generate_downstream;
pub(crate) use upstream::generate_upstream;

/// Name of the mesh-facing frontend.
pub const FRONT_DOWNSTREAM: &str = "front_downstream";
/// Name of the local-application backend.
pub const BACK_DOWNSTREAM: &str = "back_downstream";
/// Name of the authorization-agent backend.
pub const SPOE_BACKEND: &str = "spoe_back";

/// Options that shape state generation, fixed for the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Attach the authorization filter to the mesh-facing frontend.
    pub enable_intentions: bool,
    /// Emit request logging directives.
    pub log_requests: bool,
    /// Socket the request-log sink listens on.
    pub log_socket: Option<PathBuf>,
    /// Path of the static authorization-agent configuration.
    pub spoe_config_path: PathBuf,
    /// Socket the authorization agent listens on.
    pub spoe_socket: PathBuf,
}

/// Complete declarative proxy state. Equality is structural.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProxyState {
    /// Listeners, mesh-facing first, then upstreams in sorted order.
    pub frontends: Vec<Frontend>,
    /// Backends, in the same order, plus the agent backend when enabled.
    pub backends: Vec<Backend>,
}

impl ProxyState {
    /// Check the structural invariants the renderer relies on:
    /// referenced backends exist, inet servers have a port.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for fe in &self.frontends {
            if !self.backends.iter().any(|be| be.name == fe.default_backend) {
                return Err(format!(
                    "frontend {} references missing backend {}",
                    fe.name, fe.default_backend
                ));
            }
        }
        for be in &self.backends {
            for srv in &be.servers {
                let is_unix = srv.address.starts_with("unix@");
                match srv.port {
                    Some(0) => {
                        return Err(format!(
                            "backend {}: server {} has port 0",
                            be.name, srv.name
                        ))
                    }
                    None if !is_unix => {
                        return Err(format!(
                            "backend {}: server {} has no port",
                            be.name, srv.name
                        ))
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// A listener.
#[derive(Debug, Clone, PartialEq)]
pub struct Frontend {
    /// Section name.
    pub name: String,
    /// tcp or http processing.
    pub mode: Protocol,
    /// Bound address and TLS settings.
    pub bind: Bind,
    /// Backend all traffic is routed to.
    pub default_backend: String,
    /// Client inactivity timeout.
    pub client_timeout_ms: Option<u64>,
    /// Emit `option httplog`.
    pub httplog: bool,
    /// Attach the compression filter.
    pub compression: bool,
    /// Attach the authorization filter and its reject rule.
    pub spoe: Option<SpoeFilter>,
    /// Request-log destination.
    pub log_target: Option<LogTarget>,
}

/// A frontend's bind line.
#[derive(Debug, Clone, PartialEq)]
pub struct Bind {
    /// Listen address.
    pub address: String,
    /// Listen port.
    pub port: u16,
    /// Terminate TLS with this material (client verify stays off; the
    /// authorization agent decides acceptance).
    pub tls: Option<TlsPaths>,
}

/// Paths of on-disk TLS material, from the certificate store.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsPaths {
    /// Combined certificate + key file.
    pub crt: PathBuf,
    /// CA bundle file.
    pub ca: PathBuf,
}

/// The authorization filter on a frontend.
#[derive(Debug, Clone, PartialEq)]
pub struct SpoeFilter {
    /// Engine name (`intentions`).
    pub engine: String,
    /// Path of the static agent configuration.
    pub config: PathBuf,
}

/// A syslog-style log destination.
#[derive(Debug, Clone, PartialEq)]
pub struct LogTarget {
    /// Socket path or address.
    pub address: String,
    /// Syslog facility.
    pub facility: String,
    /// Message format.
    pub format: String,
}

impl LogTarget {
    /// The request-log sink on a UNIX socket.
    pub fn unix_sink(path: &std::path::Path) -> Self {
        Self {
            address: path.display().to_string(),
            facility: "local0".to_string(),
            format: "rfc5424".to_string(),
        }
    }
}

/// A backend and its servers.
#[derive(Debug, Clone, PartialEq)]
pub struct Backend {
    /// Section name.
    pub name: String,
    /// tcp or http processing.
    pub mode: Protocol,
    /// Balancing algorithm.
    pub balance: Balance,
    /// Server inactivity timeout.
    pub server_timeout_ms: Option<u64>,
    /// Connection establishment timeout.
    pub connect_timeout_ms: Option<u64>,
    /// Connection retry budget.
    pub retries: Option<u32>,
    /// Emit `option forwardfor`.
    pub forward_for: bool,
    /// HTTP request rules, in order.
    pub http_request_rules: Vec<HttpRequestRule>,
    /// Request-log destination.
    pub log_target: Option<LogTarget>,
    /// Servers, in order.
    pub servers: Vec<Server>,
}

/// Balancing algorithms in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Balance {
    /// Rotate across servers.
    RoundRobin,
    /// Prefer the server with the fewest connections.
    LeastConn,
}

impl std::fmt::Display for Balance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "roundrobin"),
            Self::LeastConn => write!(f, "leastconn"),
        }
    }
}

/// An ordered HTTP request rule.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpRequestRule {
    /// Append a header computed from a session variable.
    AddHeader {
        /// Header name.
        name: String,
        /// Value log-format expression.
        value_format: String,
    },
}

/// One server line.
#[derive(Debug, Clone, PartialEq)]
pub struct Server {
    /// Server name (`srv_<i>` for upstream endpoints).
    pub name: String,
    /// Host address, or `unix@<path>` for socket servers.
    pub address: String,
    /// Port; `None` only for socket servers.
    pub port: Option<u16>,
    /// Balancing weight.
    pub weight: Option<u32>,
    /// Present client TLS with this material (verify stays off; identity
    /// is verified at the peer sidecar).
    pub tls: Option<TlsPaths>,
    /// Active health checking.
    pub check: Option<ServerCheck>,
}

/// Health-check tuning for a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCheck {
    /// Steady-state check interval, ms.
    pub inter_ms: u64,
    /// Interval while transitioning up, ms.
    pub fastinter_ms: u64,
    /// Interval while transitioning down, ms.
    pub downinter_ms: u64,
    /// Successes to mark up.
    pub rise: u32,
    /// Failures to mark down.
    pub fall: u32,
    /// Connection errors before the server is tripped.
    pub error_limit: u32,
}

impl ServerCheck {
    /// Fast-failover profile: infrequent steady-state checks, immediate
    /// reaction to observed connection errors.
    pub fn fast_failover() -> Self {
        Self {
            inter_ms: 300_000,
            fastinter_ms: 2_000,
            downinter_ms: 2_000,
            rise: 1,
            fall: 1,
            error_limit: 1,
        }
    }
}

/// Generate the declarative state for a mesh snapshot.
///
/// Deterministic: upstreams are emitted in name order and servers are
/// named by snapshot position, so equal snapshots generate equal states.
/// `previous` only feeds the transition log.
pub fn generate(
    opts: &GenerateOptions,
    store: &CertificateStore,
    previous: &ProxyState,
    snapshot: &MeshSnapshot,
) -> Result<ProxyState> {
    let mut state = ProxyState::default();

    let (frontend, backend) = generate_downstream(opts, store, snapshot)?;
    state.frontends.push(frontend);
    state.backends.push(backend);

    let mut upstreams: Vec<_> = snapshot.upstreams.iter().collect();
    upstreams.sort_by(|a, b| a.name.cmp(&b.name));
    for upstream in upstreams {
        let (frontend, backend) = generate_upstream(opts, store, snapshot, upstream)?;
        state.frontends.push(frontend);
        state.backends.push(backend);
    }

    if opts.enable_intentions {
        state.backends.push(spoe_backend(opts));
    }

    debug!(
        frontends = state.frontends.len(),
        backends = state.backends.len(),
        changed = (*previous != state),
        "generated proxy state"
    );

    Ok(state)
}

/// The backend the authorization filter routes agent traffic to.
fn spoe_backend(opts: &GenerateOptions) -> Backend {
    Backend {
        name: SPOE_BACKEND.to_string(),
        mode: Protocol::Tcp,
        balance: Balance::RoundRobin,
        server_timeout_ms: Some(30_000),
        connect_timeout_ms: Some(30_000),
        retries: None,
        forward_for: false,
        http_request_rules: Vec::new(),
        log_target: None,
        servers: vec![Server {
            name: "agent".to_string(),
            address: format!("unix@{}", opts.spoe_socket.display()),
            port: None,
            weight: None,
            tls: None,
            check: None,
        }],
    }
}
