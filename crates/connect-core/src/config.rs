//! Mesh snapshot model.
//!
//! A [`MeshSnapshot`] is the unit of communication between the watcher and
//! the convergence loop: a deep, self-contained copy of everything that
//! affects the proxy configuration. Equality is structural, so the loop
//! can skip rounds whose generated state would be identical.

use std::time::Duration;

/// Default bind address for the mesh-facing (downstream) listener.
pub const DEFAULT_DOWNSTREAM_BIND_ADDR: &str = "0.0.0.0";
/// Default bind address for upstream loopback listeners.
pub const DEFAULT_UPSTREAM_BIND_ADDR: &str = "127.0.0.1";
/// Default read timeout applied when the mesh does not configure one.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Default connect timeout applied when the mesh does not configure one.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport protocol of a listener or backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// Opaque L4 forwarding.
    #[default]
    Tcp,
    /// L7 HTTP handling (compression, request rules, logging).
    Http,
}

impl Protocol {
    /// Parse the mesh's protocol string; anything other than "http" is TCP.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("http") {
            Self::Http
        } else {
            Self::Tcp
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Destination kind of an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestinationKind {
    /// A named mesh service, resolved via health-filtered discovery.
    #[default]
    Service,
    /// A prepared query, resolved by periodic execution.
    PreparedQuery,
}

/// A single resolvable endpoint of an upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host address (service address, or node address as fallback).
    pub host: String,
    /// Service port.
    pub port: u16,
    /// Balancing weight. Zero means "do not route"; such endpoints are
    /// dropped before they reach a snapshot.
    pub weight: u32,
}

/// A declared outbound dependency with its live endpoint set.
#[derive(Debug, Clone, PartialEq)]
pub struct Upstream {
    /// Unique name (`<kind>_<destination>`).
    pub name: String,
    /// How the destination is resolved.
    pub kind: DestinationKind,
    /// Destination service or query name.
    pub destination: String,
    /// Datacenter the destination is resolved in (empty = local).
    pub datacenter: String,
    /// Local listener address.
    pub local_bind_address: String,
    /// Local listener port.
    pub local_bind_port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Idle read timeout.
    pub read_timeout: Duration,
    /// Live endpoints, in discovery order.
    pub endpoints: Vec<Endpoint>,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: DestinationKind::default(),
            destination: String::new(),
            datacenter: String::new(),
            local_bind_address: DEFAULT_UPSTREAM_BIND_ADDR.to_string(),
            local_bind_port: 0,
            protocol: Protocol::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            endpoints: Vec::new(),
        }
    }
}

/// The mesh-facing listener and its local application target.
#[derive(Debug, Clone, PartialEq)]
pub struct Downstream {
    /// Address the mesh-facing listener binds.
    pub local_bind_address: String,
    /// Port the mesh-facing listener binds.
    pub local_bind_port: u16,
    /// Local application address.
    pub target_address: String,
    /// Local application port.
    pub target_port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Idle read timeout.
    pub read_timeout: Duration,
    /// Append an X-Forwarded-For header in HTTP mode.
    pub enable_forward_for: bool,
    /// Header name carrying the authenticated caller's service name.
    pub app_name_header: Option<String>,
}

impl Default for Downstream {
    fn default() -> Self {
        Self {
            local_bind_address: DEFAULT_DOWNSTREAM_BIND_ADDR.to_string(),
            local_bind_port: 0,
            target_address: DEFAULT_UPSTREAM_BIND_ADDR.to_string(),
            target_port: 0,
            protocol: Protocol::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            enable_forward_for: false,
            app_name_header: None,
        }
    }
}

/// Rotating leaf identity: PEM certificate and private key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeafIdentity {
    /// PEM-encoded certificate.
    pub cert_pem: Vec<u8>,
    /// PEM-encoded private key.
    pub key_pem: Vec<u8>,
}

impl LeafIdentity {
    /// Whether both halves of the identity are present.
    pub fn is_complete(&self) -> bool {
        !self.cert_pem.is_empty() && !self.key_pem.is_empty()
    }
}

/// A consistent view of the mesh state for one sidecar.
///
/// Emitted by the watcher on every observed change; consumed by the
/// convergence loop. Upstreams are sorted by name so that equal mesh
/// states compare equal regardless of discovery order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeshSnapshot {
    /// Registered id of the proxied service.
    pub service_id: String,
    /// Name of the proxied service (authorization target).
    pub service_name: String,
    /// The mesh-facing listener binding.
    pub downstream: Downstream,
    /// Declared upstreams, sorted by name.
    pub upstreams: Vec<Upstream>,
    /// Root CA bundle, one PEM block per root, in control-plane order.
    pub ca_bundle: Vec<Vec<u8>>,
    /// Current leaf identity.
    pub leaf: LeafIdentity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parse_defaults_to_tcp() {
        assert_eq!(Protocol::parse("http"), Protocol::Http);
        assert_eq!(Protocol::parse("HTTP"), Protocol::Http);
        assert_eq!(Protocol::parse("tcp"), Protocol::Tcp);
        assert_eq!(Protocol::parse("grpc"), Protocol::Tcp);
        assert_eq!(Protocol::parse(""), Protocol::Tcp);
    }

    #[test]
    fn snapshot_equality_is_structural() {
        let mut a = MeshSnapshot {
            service_id: "web-1".into(),
            service_name: "web".into(),
            ..Default::default()
        };
        let b = a.clone();
        assert_eq!(a, b);

        a.upstreams.push(Upstream {
            name: "service_db".into(),
            ..Default::default()
        });
        assert_ne!(a, b);
    }

    #[test]
    fn leaf_completeness() {
        let mut leaf = LeafIdentity::default();
        assert!(!leaf.is_complete());
        leaf.cert_pem = b"cert".to_vec();
        assert!(!leaf.is_complete());
        leaf.key_pem = b"key".to_vec();
        assert!(leaf.is_complete());
    }
}
