//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// Service-mesh sidecar controller driving HAProxy.
#[derive(Parser, Debug)]
#[command(name = "haproxy-connect", version)]
pub struct Args {
    /// Service id to run a sidecar for.
    #[arg(long = "sidecar-for")]
    pub sidecar_for: Option<String>,

    /// Select the service to proxy by one of its tags.
    #[arg(long = "sidecar-for-tag")]
    pub sidecar_for_tag: Option<String>,

    /// Bootstrap file to extract the service identifier and token from.
    #[arg(long = "envoy-bootstrap")]
    pub envoy_bootstrap: Option<PathBuf>,

    /// Agent address (host:port).
    #[arg(long = "http-addr", default_value = "127.0.0.1:8500")]
    pub http_addr: String,

    /// ACL token (overrides the environment and the bootstrap file).
    #[arg(long)]
    pub token: Option<String>,

    /// HAProxy binary path.
    #[arg(long = "haproxy", default_value = "haproxy")]
    pub haproxy: String,

    /// Directory the runtime files are created under.
    #[arg(long = "haproxy-cfg-base-path", default_value = "/tmp")]
    pub haproxy_cfg_base_path: PathBuf,

    /// Extra `global.<key>=<value>` or `defaults.<key>=<value>`
    /// configuration parameter; repeatable.
    #[arg(long = "haproxy-param")]
    pub haproxy_param: Vec<String>,

    /// Enforce mesh intentions on inbound connections.
    #[arg(long = "enable-intentions")]
    pub enable_intentions: bool,

    /// Log level (trace also enables request logging).
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["haproxy-connect", "--sidecar-for", "web"]);
        assert_eq!(args.sidecar_for.as_deref(), Some("web"));
        assert_eq!(args.http_addr, "127.0.0.1:8500");
        assert_eq!(args.haproxy, "haproxy");
        assert!(!args.enable_intentions);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn repeatable_params() {
        let args = Args::parse_from([
            "haproxy-connect",
            "--sidecar-for",
            "web",
            "--haproxy-param",
            "global.maxconn=2048",
            "--haproxy-param",
            "defaults.retries=2",
        ]);
        assert_eq!(args.haproxy_param.len(), 2);
    }
}
