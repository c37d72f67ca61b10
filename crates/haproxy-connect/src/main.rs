//! Sidecar controller entrypoint.
//!
//! Wires the pipeline together: watcher → convergence loop → proxy,
//! with the authorization agent and the request-log sink on the side,
//! all under one shutdown barrier.

mod bootstrap;
mod cli;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use clap::Parser;
use connect_core::{Error, MeshSnapshot, Result, Shutdown};
use connect_haproxy::state::GenerateOptions;
use connect_haproxy::{
    check_environment, run_request_log_sink, CertificateStore, ConfigWriter, ConvergenceLoop,
    HaproxyParams, ProxyHandle, RuntimePaths, Supervisor, SupervisorConfig,
};
use connect_mesh::{HttpMeshClient, MeshClient, Watcher};
use connect_spoe::{run_agent, IntentionsHandler};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};

/// Exit code when the dependency check fails.
const EXIT_DEPENDENCY_CHECK: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Args::parse();

    let level: Level = match args.log_level.parse() {
        Ok(level) => level,
        Err(_) => {
            eprintln!("invalid log level: {}", args.log_level);
            return ExitCode::from(1);
        }
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    let log_requests = level == Level::TRACE;

    if let Err(err) = check_environment(&args.haproxy).await {
        error!(%err, "proxy dependency check failed");
        return ExitCode::from(EXIT_DEPENDENCY_CHECK);
    }

    match run(args, log_requests).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "exiting with error");
            ExitCode::from(1)
        }
    }
}

async fn run(args: cli::Args, log_requests: bool) -> Result<()> {
    let bootstrap = load_bootstrap(&args)?;
    let token = resolve_token(&args, bootstrap.as_ref());
    let client: Arc<dyn MeshClient> =
        Arc::new(HttpMeshClient::new(&args.http_addr, token)?);

    let service_id = resolve_service_id(&args, bootstrap.as_ref(), client.as_ref()).await?;
    info!(service = %service_id, "running sidecar");

    let params = HaproxyParams::builtin()
        .merged_with(&HaproxyParams::from_flags(&args.haproxy_param)?);
    let paths = RuntimePaths::create(&args.haproxy_cfg_base_path, &params)?;
    let store = CertificateStore::new(&paths.base);

    let shutdown = Shutdown::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let (watcher, mut raw_snapshots) =
        Watcher::new(client.clone(), service_id.clone(), shutdown.clone());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = watcher.run().await {
                error!(%err, "watcher failed");
                shutdown.trigger(format!("watcher failed: {err}"));
            }
        });
    }

    // Tap the snapshot stream so the authorization responder always knows
    // the current target name, then hand it on unchanged.
    let target = Arc::new(RwLock::new(service_id.clone()));
    let (snapshot_tx, snapshot_rx) = mpsc::channel::<MeshSnapshot>(1);
    {
        let target = target.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = raw_snapshots.recv().await {
                *target.write().expect("target lock poisoned") =
                    snapshot.service_name.clone();
                if snapshot_tx.send(snapshot).await.is_err() {
                    return;
                }
            }
        });
    }

    if args.enable_intentions {
        let handler = Arc::new(IntentionsHandler::new(client.clone(), target));
        let socket = paths.spoe_socket.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = run_agent(socket, handler, shutdown.clone()).await {
                error!(%err, "authorization agent failed");
                shutdown.trigger(format!("authorization agent failed: {err}"));
            }
        });
    }

    if log_requests {
        let socket = paths.logs_socket.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = run_request_log_sink(socket, shutdown.clone()).await {
                error!(%err, "request log sink failed");
            }
        });
    }

    let opts = GenerateOptions {
        enable_intentions: args.enable_intentions,
        log_requests,
        log_socket: log_requests.then(|| paths.logs_socket.clone()),
        spoe_config_path: paths.spoe_config.clone(),
        spoe_socket: paths.spoe_socket.clone(),
    };
    let proxy = Haproxy::new(&args.haproxy, &paths, shutdown.clone());
    let (convergence, mut ready) = ConvergenceLoop::new(
        opts,
        params,
        paths.stats_socket.clone(),
        store,
        proxy,
    );
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = convergence.run(snapshot_rx, shutdown.clone()).await {
                error!(%err, "convergence loop failed");
                shutdown.trigger(format!("convergence loop failed: {err}"));
            }
        });
    }
    tokio::spawn(async move {
        if ready.changed().await.is_ok() {
            info!("sidecar ready, proxy serving mesh traffic");
        }
    });

    shutdown.signal().wait().await;
    let reason = shutdown.reason().unwrap_or_default();
    shutdown
        .wait_idle(std::time::Duration::from_secs(10))
        .await;
    paths.cleanup();

    if reason.starts_with("signal:") {
        Ok(())
    } else {
        Err(Error::ShutdownRequested { reason })
    }
}

/// Resolve the bootstrap file: the flag wins, otherwise the scheduler's
/// secrets directory is probed.
fn load_bootstrap(args: &cli::Args) -> Result<Option<bootstrap::Bootstrap>> {
    let path: Option<PathBuf> = args.envoy_bootstrap.clone().or_else(|| {
        let secrets_dir = std::env::var("NOMAD_SECRETS_DIR").ok()?;
        let candidate = PathBuf::from(secrets_dir).join("envoy_bootstrap.json");
        candidate.exists().then(|| {
            info!(path = %candidate.display(), "auto-detected bootstrap file");
            candidate
        })
    });

    let Some(path) = path else { return Ok(None) };
    match bootstrap::parse(&path) {
        Ok(parsed) => Ok(parsed),
        Err(err) => {
            warn!(%err, "could not parse bootstrap file");
            Ok(None)
        }
    }
}

/// Token priority, lowest to highest: bootstrap file, environment, flag.
fn resolve_token(args: &cli::Args, bootstrap: Option<&bootstrap::Bootstrap>) -> Option<String> {
    let mut token = bootstrap.and_then(|b| b.token.clone());
    if let Ok(env_token) = std::env::var("CONNECT_CONSUL_TOKEN") {
        info!("using token from environment");
        token = Some(env_token);
    }
    if let Some(flag_token) = &args.token {
        info!("using token from command line");
        token = Some(flag_token.clone());
    }
    token
}

/// Resolve the proxied service id from tag, flag or bootstrap file.
async fn resolve_service_id(
    args: &cli::Args,
    bootstrap: Option<&bootstrap::Bootstrap>,
    client: &dyn MeshClient,
) -> Result<String> {
    if let Some(tag) = &args.sidecar_for_tag {
        let services = client.agent_services().await?;
        for (id, service) in &services {
            if service.service.ends_with("sidecar-proxy") {
                continue;
            }
            if service.tags.iter().any(|t| t == tag) {
                return Ok(id.clone());
            }
        }
        return Err(Error::Configuration(format!(
            "no service found with tag {tag:?}"
        )));
    }
    if let Some(service) = &args.sidecar_for {
        return Ok(service.clone());
    }
    if let Some(service) = bootstrap.and_then(|b| b.service_name.clone()) {
        info!(service = %service, "service name from bootstrap file");
        return Ok(service);
    }
    Err(Error::Configuration(
        "specify --sidecar-for, --sidecar-for-tag, or --envoy-bootstrap".to_string(),
    ))
}

/// Translate OS signals into a shutdown trigger.
async fn watch_signals(shutdown: Shutdown) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            error!(%err, "could not install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(err) => {
            error!(%err, "could not install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => shutdown.trigger("signal: SIGTERM"),
        _ = sigint.recv() => shutdown.trigger("signal: SIGINT"),
    }
}

/// [`ProxyHandle`] over the supervisor and the config writer; the writer
/// exists once the child is up and its master PID is known.
struct Haproxy {
    supervisor: Supervisor,
    shutdown: Shutdown,
    config_path: PathBuf,
    haproxy_bin: String,
    writer: Mutex<Option<ConfigWriter>>,
}

impl Haproxy {
    fn new(haproxy_bin: &str, paths: &RuntimePaths, shutdown: Shutdown) -> Self {
        Self {
            supervisor: Supervisor::new(SupervisorConfig {
                haproxy_bin: haproxy_bin.to_string(),
                config_path: paths.config.clone(),
                master_socket: paths.master_socket.clone(),
            }),
            shutdown,
            config_path: paths.config.clone(),
            haproxy_bin: haproxy_bin.to_string(),
            writer: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ProxyHandle for Haproxy {
    async fn start(&self) -> Result<()> {
        let pid = self.supervisor.start(&self.shutdown).await?;
        let writer = ConfigWriter::new(
            self.config_path.clone(),
            self.haproxy_bin.clone(),
            pid,
        );
        *self.writer.lock().expect("writer lock poisoned") = Some(writer);
        Ok(())
    }

    async fn apply(&self, config: &str) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .expect("writer lock poisoned")
            .clone()
            .ok_or_else(|| Error::Configuration("proxy not started".to_string()))?;
        writer.apply(config).await
    }
}
