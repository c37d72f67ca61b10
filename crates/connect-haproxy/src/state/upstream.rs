//! Upstream frontend/backend generation.

use connect_core::{MeshSnapshot, Protocol, Result, Upstream};
use tracing::debug;

use crate::certs::CertificateStore;

use super::downstream::log_target;
use super::{
    Backend, Balance, Bind, Frontend, GenerateOptions, Server, ServerCheck, TlsPaths,
};

/// Build the loopback listener and the endpoint backend for one upstream.
///
/// The listener carries no TLS (it is loopback-trusted); each server
/// dials out with client TLS presenting the current leaf.
pub(crate) fn generate_upstream(
    opts: &GenerateOptions,
    store: &CertificateStore,
    snapshot: &MeshSnapshot,
    cfg: &Upstream,
) -> Result<(Frontend, Backend)> {
    let fe_name = format!("front_{}", cfg.name);
    let be_name = format!("back_{}", cfg.name);
    let http = cfg.protocol == Protocol::Http;

    debug!(
        upstream = %cfg.name,
        bind = %format!("{}:{}", cfg.local_bind_address, cfg.local_bind_port),
        endpoints = cfg.endpoints.len(),
        "configuring upstream"
    );

    let frontend = Frontend {
        name: fe_name,
        mode: cfg.protocol,
        bind: Bind {
            address: cfg.local_bind_address.clone(),
            port: cfg.local_bind_port,
            tls: None,
        },
        default_backend: be_name.clone(),
        client_timeout_ms: Some(cfg.read_timeout.as_millis() as u64),
        httplog: http && opts.log_requests,
        compression: http,
        spoe: None,
        log_target: log_target(opts),
    };

    let (ca_path, crt_path) = store.material_paths(
        &snapshot.leaf.cert_pem,
        &snapshot.leaf.key_pem,
        &snapshot.ca_bundle,
    )?;

    let servers: Vec<Server> = cfg
        .endpoints
        .iter()
        .enumerate()
        .map(|(i, endpoint)| Server {
            name: format!("srv_{i}"),
            address: endpoint.host.clone(),
            port: Some(endpoint.port),
            weight: Some(endpoint.weight),
            tls: Some(TlsPaths {
                crt: crt_path.clone(),
                ca: ca_path.clone(),
            }),
            check: Some(ServerCheck::fast_failover()),
        })
        .collect();

    let retries = (servers.len().saturating_sub(1)).max(1) as u32;

    let backend = Backend {
        name: be_name,
        mode: cfg.protocol,
        balance: Balance::LeastConn,
        server_timeout_ms: Some(cfg.read_timeout.as_millis() as u64),
        connect_timeout_ms: Some(cfg.connect_timeout.as_millis() as u64),
        retries: Some(retries),
        forward_for: false,
        http_request_rules: Vec::new(),
        log_target: log_target(opts),
        servers,
    };

    Ok((frontend, backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use connect_core::{Endpoint, LeafIdentity};

    fn snapshot() -> MeshSnapshot {
        MeshSnapshot {
            ca_bundle: vec![b"CA\n".to_vec()],
            leaf: LeafIdentity {
                cert_pem: b"CERT\n".to_vec(),
                key_pem: b"KEY\n".to_vec(),
            },
            ..Default::default()
        }
    }

    fn upstream(endpoints: usize) -> Upstream {
        Upstream {
            name: "service_db".into(),
            local_bind_port: 19000,
            endpoints: (0..endpoints)
                .map(|i| Endpoint {
                    host: format!("10.0.0.{i}"),
                    port: 5432,
                    weight: 1,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn retries_floor_at_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CertificateStore::new(dir.path());
        let opts = GenerateOptions::default();
        let snap = snapshot();

        for (endpoints, expected) in [(0, 1), (1, 1), (2, 1), (3, 2), (5, 4)] {
            let (_, be) = generate_upstream(&opts, &store, &snap, &upstream(endpoints))
                .expect("generate");
            assert_eq!(be.retries, Some(expected), "{endpoints} endpoints");
        }
    }

    #[test]
    fn servers_present_client_tls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CertificateStore::new(dir.path());
        let opts = GenerateOptions::default();

        let (fe, be) =
            generate_upstream(&opts, &store, &snapshot(), &upstream(2)).expect("generate");
        assert!(fe.bind.tls.is_none());
        assert!(be.servers.iter().all(|s| s.tls.is_some()));
        assert_eq!(be.balance, Balance::LeastConn);
    }
}
