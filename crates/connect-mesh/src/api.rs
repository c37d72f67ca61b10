//! Wire types of the control-plane HTTP API.
//!
//! Field names mirror the agent's JSON exactly (PascalCase); only the
//! fields the controller consumes are declared, everything else is
//! ignored during deserialization.

use std::collections::HashMap;

use serde::Deserialize;

/// Service kind marking a sidecar registration.
pub const KIND_CONNECT_PROXY: &str = "connect-proxy";

/// Upstream destination type for plain services.
pub const DEST_TYPE_SERVICE: &str = "service";
/// Upstream destination type for prepared queries.
pub const DEST_TYPE_PREPARED_QUERY: &str = "prepared_query";

/// Aggregated health states.
pub const HEALTH_PASSING: &str = "passing";
/// Warning state; instances stay routable with their warning weight.
pub const HEALTH_WARNING: &str = "warning";
/// Critical state; instances are dropped.
pub const HEALTH_CRITICAL: &str = "critical";

/// A service registered with the local agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentService {
    /// Unique registration id.
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Service name.
    #[serde(rename = "Service", default)]
    pub service: String,
    /// Service kind ("" for plain services, "connect-proxy" for sidecars).
    #[serde(rename = "Kind", default)]
    pub kind: String,
    /// Registered port.
    #[serde(rename = "Port", default)]
    pub port: u16,
    /// Registration tags.
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
    /// Sidecar proxy declaration, when kind is "connect-proxy".
    #[serde(rename = "Proxy")]
    pub proxy: Option<AgentServiceProxy>,
}

/// The proxy block of a sidecar registration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentServiceProxy {
    /// Name of the service this sidecar fronts.
    #[serde(rename = "DestinationServiceName", default)]
    pub destination_service_name: String,
    /// Id of the service this sidecar fronts.
    #[serde(rename = "DestinationServiceID", default)]
    pub destination_service_id: String,
    /// Address of the local application.
    #[serde(rename = "LocalServiceAddress", default)]
    pub local_service_address: String,
    /// Port of the local application.
    #[serde(rename = "LocalServicePort", default)]
    pub local_service_port: u16,
    /// Opaque proxy configuration (protocol, timeouts, overrides).
    #[serde(rename = "Config", default)]
    pub config: HashMap<String, serde_json::Value>,
    /// Declared upstreams.
    #[serde(rename = "Upstreams", default)]
    pub upstreams: Vec<UpstreamDefinition>,
}

/// One declared upstream in a sidecar registration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamDefinition {
    /// "service" or "prepared_query".
    #[serde(rename = "DestinationType", default)]
    pub destination_type: String,
    /// Destination service or query name.
    #[serde(rename = "DestinationName", default)]
    pub destination_name: String,
    /// Datacenter override (empty = local).
    #[serde(rename = "Datacenter", default)]
    pub datacenter: String,
    /// Local listener address override.
    #[serde(rename = "LocalBindAddress", default)]
    pub local_bind_address: String,
    /// Local listener port.
    #[serde(rename = "LocalBindPort", default)]
    pub local_bind_port: u16,
    /// Opaque upstream configuration (protocol, timeouts, poll interval).
    #[serde(rename = "Config", default)]
    pub config: HashMap<String, serde_json::Value>,
}

/// A health-filtered service instance.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceEntry {
    /// Hosting node.
    #[serde(rename = "Node", default)]
    pub node: Node,
    /// The instance itself.
    #[serde(rename = "Service", default)]
    pub service: NodeService,
    /// All checks attached to node and instance.
    #[serde(rename = "Checks", default)]
    pub checks: Vec<HealthCheck>,
}

impl ServiceEntry {
    /// Address to dial: the instance address, or the node address when
    /// the instance does not declare one.
    pub fn address(&self) -> &str {
        if self.service.address.is_empty() {
            &self.node.address
        } else {
            &self.service.address
        }
    }

    /// Worst status across all checks; an empty check list is passing.
    pub fn aggregated_status(&self) -> &'static str {
        let mut warning = false;
        for check in &self.checks {
            match check.status.as_str() {
                HEALTH_WARNING => warning = true,
                HEALTH_PASSING => {}
                _ => return HEALTH_CRITICAL,
            }
        }
        if warning {
            HEALTH_WARNING
        } else {
            HEALTH_PASSING
        }
    }
}

/// Node half of a [`ServiceEntry`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Node {
    /// Node address.
    #[serde(rename = "Address", default)]
    pub address: String,
}

/// Service half of a [`ServiceEntry`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NodeService {
    /// Instance address; may be empty.
    #[serde(rename = "Address", default)]
    pub address: String,
    /// Instance port.
    #[serde(rename = "Port", default)]
    pub port: u16,
    /// Balancing weights by health state.
    #[serde(rename = "Weights", default)]
    pub weights: Weights,
}

/// Balancing weights attached to an instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Weights {
    /// Weight while passing.
    #[serde(rename = "Passing", default)]
    pub passing: u32,
    /// Weight while warning.
    #[serde(rename = "Warning", default)]
    pub warning: u32,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            passing: 1,
            warning: 1,
        }
    }
}

/// One health check of a node or instance.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HealthCheck {
    /// "passing", "warning" or "critical".
    #[serde(rename = "Status", default)]
    pub status: String,
}

/// Response of the prepared query execute endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreparedQueryResponse {
    /// Ranked matching instances.
    #[serde(rename = "Nodes", default)]
    pub nodes: Vec<ServiceEntry>,
}

/// The root CA bundle.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaRootList {
    /// Id of the currently active root.
    #[serde(rename = "ActiveRootID", default)]
    pub active_root_id: String,
    /// All trusted roots, active and cross-signed.
    #[serde(rename = "Roots", default)]
    pub roots: Vec<CaRoot>,
}

/// One root certificate in the CA bundle.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaRoot {
    /// PEM-encoded root certificate.
    #[serde(rename = "RootCert", default)]
    pub root_cert_pem: String,
}

/// A short-lived leaf identity issued for a service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeafCertificate {
    /// Colon-separated serial number.
    #[serde(rename = "SerialNumber", default)]
    pub serial_number: String,
    /// PEM-encoded certificate.
    #[serde(rename = "CertPEM", default)]
    pub cert_pem: String,
    /// PEM-encoded private key.
    #[serde(rename = "PrivateKeyPEM", default)]
    pub private_key_pem: String,
    /// Not-before timestamp (RFC 3339).
    #[serde(rename = "ValidAfter", default)]
    pub valid_after: String,
    /// Not-after timestamp (RFC 3339).
    #[serde(rename = "ValidBefore", default)]
    pub valid_before: String,
}

/// Parameters of a connection authorization query.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuthorizeRequest {
    /// Name of the destination service (this sidecar's service).
    #[serde(rename = "Target")]
    pub target: String,
    /// URI SAN presented by the caller.
    #[serde(rename = "ClientCertURI")]
    pub client_cert_uri: String,
    /// Hex serial of the caller's certificate.
    #[serde(rename = "ClientCertSerial")]
    pub client_cert_serial: String,
}

/// Result of a connection authorization query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeResponse {
    /// Whether the connection is allowed.
    #[serde(rename = "Authorized", default)]
    pub authorized: bool,
    /// Human-readable explanation.
    #[serde(rename = "Reason", default)]
    pub reason: String,
}
