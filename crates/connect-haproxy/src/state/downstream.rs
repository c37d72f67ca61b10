//! Mesh-facing frontend/backend generation.

use connect_core::{MeshSnapshot, Protocol, Result};
use tracing::info;

use crate::certs::CertificateStore;

use super::{
    Backend, Balance, Bind, Frontend, GenerateOptions, HttpRequestRule, LogTarget, Server,
    ServerCheck, SpoeFilter, TlsPaths, BACK_DOWNSTREAM, FRONT_DOWNSTREAM,
};

/// Build the mesh-facing listener and the local application backend.
///
/// The listener terminates mesh TLS with the current leaf; client
/// verification stays off because acceptance is decided by the
/// authorization agent, not by the certificate chain alone.
pub(crate) fn generate_downstream(
    opts: &GenerateOptions,
    store: &CertificateStore,
    snapshot: &MeshSnapshot,
) -> Result<(Frontend, Backend)> {
    let cfg = &snapshot.downstream;
    let http = cfg.protocol == Protocol::Http;

    let (ca_path, crt_path) = store.material_paths(
        &snapshot.leaf.cert_pem,
        &snapshot.leaf.key_pem,
        &snapshot.ca_bundle,
    )?;

    info!(
        bind = %format!("{}:{}", cfg.local_bind_address, cfg.local_bind_port),
        target = %format!("{}:{}", cfg.target_address, cfg.target_port),
        "configuring downstream"
    );

    let log_target = log_target(opts);

    let frontend = Frontend {
        name: FRONT_DOWNSTREAM.to_string(),
        mode: cfg.protocol,
        bind: Bind {
            address: cfg.local_bind_address.clone(),
            port: cfg.local_bind_port,
            tls: Some(TlsPaths {
                crt: crt_path,
                ca: ca_path,
            }),
        },
        default_backend: BACK_DOWNSTREAM.to_string(),
        client_timeout_ms: Some(cfg.read_timeout.as_millis() as u64),
        httplog: http && opts.log_requests,
        compression: http,
        spoe: opts.enable_intentions.then(|| SpoeFilter {
            engine: "intentions".to_string(),
            config: opts.spoe_config_path.clone(),
        }),
        log_target: log_target.clone(),
    };

    let mut http_request_rules = Vec::new();
    if http {
        if let Some(header) = &cfg.app_name_header {
            http_request_rules.push(HttpRequestRule::AddHeader {
                name: header.clone(),
                value_format: "%[var(sess.connect.source_app)]".to_string(),
            });
        }
    }

    let backend = Backend {
        name: BACK_DOWNSTREAM.to_string(),
        mode: cfg.protocol,
        balance: Balance::RoundRobin,
        server_timeout_ms: Some(cfg.read_timeout.as_millis() as u64),
        connect_timeout_ms: Some(cfg.connect_timeout.as_millis() as u64),
        retries: None,
        forward_for: cfg.enable_forward_for && http,
        http_request_rules,
        log_target,
        servers: vec![Server {
            name: "downstream_node".to_string(),
            address: cfg.target_address.clone(),
            port: Some(cfg.target_port),
            weight: None,
            tls: None,
            check: Some(ServerCheck::fast_failover()),
        }],
    };

    Ok((frontend, backend))
}

pub(super) fn log_target(opts: &GenerateOptions) -> Option<LogTarget> {
    if !opts.log_requests {
        return None;
    }
    opts.log_socket.as_deref().map(LogTarget::unix_sink)
}
