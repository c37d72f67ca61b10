//! Bootstrap file parsing.
//!
//! Schedulers that template an Envoy bootstrap for their sidecars leave
//! two things we can reuse in it: the proxy's service identifier in
//! `node.id` and the agent token buried in the ADS gRPC metadata. This
//! module pulls both out without depending on the rest of the file's
//! shape.

use std::path::Path;

use connect_core::{Error, Result};
use serde::Deserialize;
use tracing::{debug, warn};

/// The metadata key carrying the agent token.
const TOKEN_METADATA_KEY: &str = "x-consul-token";

/// The values extracted from a bootstrap file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bootstrap {
    /// Service name derived from `node.id` (or `node.cluster`).
    pub service_name: Option<String>,
    /// Agent token from the ADS metadata.
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BootstrapFile {
    #[serde(default)]
    node: NodeSection,
    #[serde(default)]
    dynamic_resources: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct NodeSection {
    #[serde(default)]
    id: String,
    #[serde(default)]
    cluster: String,
}

/// Read and parse a bootstrap file. A missing file is not an error.
pub fn parse(path: &Path) -> Result<Option<Bootstrap>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "bootstrap file not found");
            return Ok(None);
        }
        Err(err) => return Err(Error::io(format!("read {}", path.display()), err)),
    };

    let file: BootstrapFile =
        serde_json::from_slice(&data).map_err(|e| Error::Configuration(format!(
            "invalid bootstrap file {}: {e}",
            path.display()
        )))?;

    let token = extract_token(&file.dynamic_resources);
    if token.is_some() {
        debug!("extracted agent token from bootstrap file");
    }

    Ok(Some(Bootstrap {
        service_name: extract_service_name(&file.node),
        token,
    }))
}

/// Walk `ads_config.grpc_services.initial_metadata[]` looking for the
/// token pair. `grpc_services` may be a single object or a list.
fn extract_token(dynamic_resources: &serde_json::Value) -> Option<String> {
    let ads_config = dynamic_resources.get("ads_config")?;
    let grpc_services = ads_config.get("grpc_services")?;

    let services: Vec<&serde_json::Value> = match grpc_services {
        serde_json::Value::Array(list) => list.iter().collect(),
        other => vec![other],
    };

    for service in services {
        let Some(metadata) = service.get("initial_metadata").and_then(|m| m.as_array())
        else {
            continue;
        };
        for item in metadata {
            let key = item.get("key").and_then(|k| k.as_str());
            let value = item.get("value").and_then(|v| v.as_str());
            if let (Some(TOKEN_METADATA_KEY), Some(value)) = (key, value) {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Pull the service name out of a scheduler-templated proxy id
/// (`…-<service>-sidecar-proxy`), falling back to the cluster name.
fn extract_service_name(node: &NodeSection) -> Option<String> {
    if node.id.contains("-sidecar-proxy") {
        let parts: Vec<&str> = node.id.split('-').collect();
        for (i, part) in parts.iter().enumerate() {
            if *part == "sidecar" && i > 0 {
                return Some(parts[i - 1].to_string());
            }
        }
    }
    if node.cluster.is_empty() {
        if node.id.is_empty() {
            None
        } else {
            warn!(id = %node.id, "could not derive a service name from the proxy id");
            None
        }
    } else {
        Some(node.cluster.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(json: &str) -> Bootstrap {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("envoy_bootstrap.json");
        std::fs::write(&path, json).expect("write");
        parse(&path).expect("parse").expect("present")
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(parse(&dir.path().join("nope.json")).expect("parse"), None);
    }

    #[test]
    fn extracts_service_name_from_node_id() {
        let bootstrap = parse_str(
            r#"{
                "node": {
                    "id": "_nomad-task-4a5f-group-api-backend-sidecar-proxy",
                    "cluster": "backend-cluster"
                }
            }"#,
        );
        assert_eq!(bootstrap.service_name.as_deref(), Some("backend"));
    }

    #[test]
    fn falls_back_to_cluster_name() {
        let bootstrap = parse_str(
            r#"{"node": {"id": "some-opaque-id", "cluster": "web"}}"#,
        );
        assert_eq!(bootstrap.service_name.as_deref(), Some("web"));
    }

    #[test]
    fn extracts_token_from_grpc_metadata_object() {
        let bootstrap = parse_str(
            r#"{
                "node": {"id": "", "cluster": ""},
                "dynamic_resources": {
                    "ads_config": {
                        "grpc_services": {
                            "initial_metadata": [
                                {"key": "other", "value": "x"},
                                {"key": "x-consul-token", "value": "secret-token"}
                            ]
                        }
                    }
                }
            }"#,
        );
        assert_eq!(bootstrap.token.as_deref(), Some("secret-token"));
        assert_eq!(bootstrap.service_name, None);
    }

    #[test]
    fn extracts_token_from_grpc_services_list() {
        let bootstrap = parse_str(
            r#"{
                "dynamic_resources": {
                    "ads_config": {
                        "grpc_services": [
                            {"initial_metadata": [
                                {"key": "x-consul-token", "value": "from-list"}
                            ]}
                        ]
                    }
                }
            }"#,
        );
        assert_eq!(bootstrap.token.as_deref(), Some("from-list"));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("envoy_bootstrap.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(parse(&path).is_err());
    }
}
