//! Mesh state watcher.
//!
//! The watcher maintains a live view of everything that affects the proxy
//! configuration for one sidecar and emits a fresh [`MeshSnapshot`] on any
//! change:
//!
//! - the sidecar definition (downstream binding + declared upstreams),
//!   long-polled on its content hash
//! - the root CA bundle and the leaf identity, long-polled on their index
//! - one endpoint subscriber per declared upstream, created and destroyed
//!   as the definition changes
//!
//! Subscribers write to a shared model under a single mutex and then
//! nudge the snapshot emitter through a capacity-1 dirty channel, so any
//! burst of updates collapses into one emission. Snapshots are sent
//! synchronously on the output channel; the emitter blocks until the
//! consumer accepts, which is the only backpressure in the pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use connect_core::{
    DestinationKind, Downstream, Endpoint, Error, LeafIdentity, MeshSnapshot, Protocol, Result,
    Shutdown, Upstream, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT,
    DEFAULT_UPSTREAM_BIND_ADDR,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::api::{
    AgentService, ServiceEntry, UpstreamDefinition, DEST_TYPE_PREPARED_QUERY, HEALTH_PASSING,
    HEALTH_WARNING, KIND_CONNECT_PROXY,
};
use crate::client::MeshClient;

/// Sleep between retries after a transport error.
const ERROR_WAIT: Duration = Duration::from_secs(5);
/// Default poll interval for prepared-query upstreams.
const PREPARED_QUERY_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Discovery retry budget.
const DISCOVERY_MAX_ATTEMPTS: u32 = 60;
/// Cap for the discovery backoff.
const DISCOVERY_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Concurrent mesh subscriber for one sidecar.
///
/// Created with [`Watcher::new`], which also returns the snapshot
/// receiver; driven by [`Watcher::run`], which only returns on shutdown
/// or on the single fatal condition (no sidecar registration).
pub struct Watcher {
    inner: Arc<Inner>,
    dirty_rx: mpsc::Receiver<()>,
    out: mpsc::Sender<MeshSnapshot>,
}

struct Inner {
    client: Arc<dyn MeshClient>,
    /// Service id this sidecar fronts (`-sidecar-for`).
    service_id: String,
    model: Mutex<Model>,
    dirty: mpsc::Sender<()>,
    shutdown: Shutdown,
    ready: Latch,
}

#[derive(Default)]
struct Model {
    service_name: String,
    downstream: Downstream,
    upstreams: HashMap<String, UpstreamEntry>,
    ca_bundle: Vec<Vec<u8>>,
    leaf: Option<LeafIdentity>,
}

struct UpstreamEntry {
    config: Upstream,
    nodes: Vec<ServiceEntry>,
    terminated: Arc<AtomicBool>,
}

impl Watcher {
    /// Create a watcher and the channel its snapshots arrive on.
    pub fn new(
        client: Arc<dyn MeshClient>,
        service_id: impl Into<String>,
        shutdown: Shutdown,
    ) -> (Self, mpsc::Receiver<MeshSnapshot>) {
        let (out_tx, out_rx) = mpsc::channel(1);
        let (dirty_tx, dirty_rx) = mpsc::channel(1);
        let watcher = Self {
            inner: Arc::new(Inner {
                client,
                service_id: service_id.into(),
                model: Mutex::new(Model::default()),
                dirty: dirty_tx,
                shutdown,
                ready: Latch::new(),
            }),
            dirty_rx,
            out: out_tx,
        };
        (watcher, out_rx)
    }

    /// Run the watcher until shutdown.
    ///
    /// Discovers the sidecar registration, starts all subscribers, waits
    /// for each to deliver its first response, then emits snapshots.
    pub async fn run(mut self) -> Result<()> {
        let _guard = self.inner.shutdown.register();

        let proxy_id = self.discover_sidecar().await?;
        info!(
            proxy = %proxy_id,
            service = %self.inner.service_id,
            "found sidecar proxy registration"
        );

        self.resolve_service_target(&proxy_id).await;

        self.inner.ready.add(3);
        tokio::spawn(watch_ca(self.inner.clone()));
        tokio::spawn(watch_leaf(self.inner.clone()));
        tokio::spawn(watch_definition(self.inner.clone(), proxy_id));

        tokio::select! {
            _ = self.inner.ready.wait() => {}
            _ = self.inner.shutdown.signal().wait() => {
                return Err(Error::ShutdownRequested {
                    reason: self.inner.shutdown.reason().unwrap_or_default(),
                });
            }
        }
        info!("all subscriptions ready, emitting snapshots");

        loop {
            tokio::select! {
                _ = self.inner.shutdown.signal().wait() => return Ok(()),
                received = self.dirty_rx.recv() => {
                    if received.is_none() {
                        return Ok(());
                    }
                    if let Some(snapshot) = self.inner.build_snapshot() {
                        if self.out.send(snapshot).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Find the sidecar registration for the configured service, with
    /// capped exponential backoff. The only fatal watcher error.
    async fn discover_sidecar(&self) -> Result<String> {
        let mut delay = Duration::from_secs(1);
        for attempt in 1..=DISCOVERY_MAX_ATTEMPTS {
            match self.inner.client.agent_services().await {
                Ok(services) => {
                    if let Some(id) = find_sidecar_proxy(&services, &self.inner.service_id) {
                        return Ok(id);
                    }
                    debug!(
                        attempt,
                        service = %self.inner.service_id,
                        "no sidecar proxy registered yet"
                    );
                }
                Err(err) => {
                    warn!(attempt, %err, "service enumeration failed");
                }
            }

            if attempt < DISCOVERY_MAX_ATTEMPTS {
                info!(
                    attempt,
                    max = DISCOVERY_MAX_ATTEMPTS,
                    retry_in = ?delay,
                    "sidecar proxy not found, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.inner.shutdown.signal().wait() => {
                        return Err(Error::ShutdownRequested {
                            reason: self.inner.shutdown.reason().unwrap_or_default(),
                        });
                    }
                }
                delay = (delay * 2).min(DISCOVERY_BACKOFF_CAP);
            }
        }

        Err(Error::SidecarNotFound {
            service: self.inner.service_id.clone(),
            attempts: DISCOVERY_MAX_ATTEMPTS,
        })
    }

    /// Resolve the proxied service's name and the local target port.
    ///
    /// The registration of the application service may not exist (the
    /// scheduler may only register the sidecar); every lookup here
    /// degrades to a recorded default instead of failing.
    async fn resolve_service_target(&self, proxy_id: &str) {
        let service_name = match self
            .inner
            .client
            .agent_service(&self.inner.service_id, "")
            .await
        {
            Ok((svc, _)) => svc.service,
            Err(err) => {
                warn!(
                    service = %self.inner.service_id,
                    %err,
                    "application service not registered, using its id as name"
                );
                self.inner.service_id.clone()
            }
        };

        let mut target_port = 0u16;
        match self.inner.client.agent_service(proxy_id, "").await {
            Ok((proxy_svc, _)) => {
                if let Some(port) = proxy_svc
                    .proxy
                    .as_ref()
                    .map(|p| p.local_service_port)
                    .filter(|p| *p > 0)
                {
                    target_port = port;
                    info!(port = target_port, "target port from sidecar declaration");
                } else if let Ok((app, _)) = self
                    .inner
                    .client
                    .agent_service(&self.inner.service_id, "")
                    .await
                {
                    target_port = app.port;
                    info!(port = target_port, "target port from application service");
                } else {
                    warn!("could not determine application target port");
                }
            }
            Err(err) => warn!(%err, "could not read sidecar registration details"),
        }

        let mut model = self.inner.model.lock().expect("model lock poisoned");
        model.service_name = service_name;
        model.downstream.target_port = target_port;
    }
}

impl Inner {
    /// Deep-copy the model into a [`MeshSnapshot`].
    ///
    /// Endpoints whose aggregated health is critical are dropped; weights
    /// follow the mesh's passing/warning weights; zero weight drops the
    /// endpoint. Upstreams are sorted by name.
    fn build_snapshot(&self) -> Option<MeshSnapshot> {
        let model = self.model.lock().expect("model lock poisoned");
        let leaf = model.leaf.clone()?;

        let mut alive = 0usize;
        let mut total = 0usize;

        let mut upstreams: Vec<Upstream> = Vec::with_capacity(model.upstreams.len());
        for entry in model.upstreams.values() {
            let mut upstream = entry.config.clone();
            upstream.endpoints = Vec::with_capacity(entry.nodes.len());
            for node in &entry.nodes {
                total += 1;
                let weight = match node.aggregated_status() {
                    HEALTH_PASSING => node.service.weights.passing,
                    HEALTH_WARNING => node.service.weights.warning,
                    _ => continue,
                };
                if weight == 0 {
                    continue;
                }
                alive += 1;
                upstream.endpoints.push(Endpoint {
                    host: node.address().to_string(),
                    port: node.service.port,
                    weight,
                });
            }
            upstreams.push(upstream);
        }
        upstreams.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(
            service = %model.service_name,
            instances_alive = alive,
            instances_total = total,
            "built mesh snapshot"
        );

        Some(MeshSnapshot {
            service_id: self.service_id.clone(),
            service_name: model.service_name.clone(),
            downstream: model.downstream.clone(),
            upstreams,
            ca_bundle: model.ca_bundle.clone(),
            leaf,
        })
    }

    /// Non-blocking nudge; a full channel means an emission is pending.
    fn notify_changed(&self) {
        let _ = self.dirty.try_send(());
    }

    /// Apply a changed sidecar definition: rewrite the downstream binding
    /// and reconcile the set of upstream subscribers.
    fn handle_definition_change(self: &Arc<Self>, first: bool, srv: &AgentService) {
        let mut keep: HashMap<String, UpstreamDefinition> = HashMap::new();
        {
            let mut model = self.model.lock().expect("model lock poisoned");
            let target_port = model.downstream.target_port;
            let mut downstream = Downstream {
                local_bind_port: srv.port,
                target_port,
                ..Default::default()
            };

            if let Some(proxy) = &srv.proxy {
                let cfg = &proxy.config;
                if let Some(p) = config_str(cfg, "protocol") {
                    downstream.protocol = Protocol::parse(&p);
                }
                if let Some(b) = config_str(cfg, "bind_address") {
                    downstream.local_bind_address = b;
                }
                if let Some(a) = config_str(cfg, "local_service_address") {
                    downstream.target_address = a;
                }
                if let Some(p) = config_port(cfg, "local_service_port") {
                    info!(port = p, "target port overridden by proxy config");
                    downstream.target_port = p;
                }
                if let Some(f) = cfg.get("enable_forwardfor").and_then(|v| v.as_bool()) {
                    downstream.enable_forward_for = f;
                }
                if let Some(h) = config_str(cfg, "appname_header") {
                    downstream.app_name_header = Some(h);
                }
                if let Some(d) = config_duration(cfg, "connect_timeout", DEFAULT_CONNECT_TIMEOUT) {
                    downstream.connect_timeout = d;
                }
                if let Some(d) = config_duration(cfg, "read_timeout", DEFAULT_READ_TIMEOUT) {
                    downstream.read_timeout = d;
                }

                for def in &proxy.upstreams {
                    let name = format!("{}_{}", def.destination_type, def.destination_name);
                    keep.insert(name, def.clone());
                }
            }
            model.downstream = downstream;
        }

        // Reconcile subscribers outside the model lock: spawning and
        // updating take the lock themselves.
        let existing: Vec<String> = {
            let model = self.model.lock().expect("model lock poisoned");
            model.upstreams.keys().cloned().collect()
        };

        for (name, def) in &keep {
            if existing.iter().any(|n| n == name) {
                self.update_upstream(name, def);
            } else {
                self.start_upstream(first, name.clone(), def.clone());
            }
        }

        for name in existing {
            if !keep.contains_key(&name) {
                self.remove_upstream(&name);
            }
        }

        if first {
            self.ready.done();
        }
    }

    /// Refresh a tracked upstream's static configuration in place.
    fn update_upstream(&self, name: &str, def: &UpstreamDefinition) {
        let mut model = self.model.lock().expect("model lock poisoned");
        if let Some(entry) = model.upstreams.get_mut(name) {
            apply_upstream_definition(&mut entry.config, def);
        }
    }

    /// Track a newly declared upstream and spawn its endpoint subscriber.
    fn start_upstream(self: &Arc<Self>, startup: bool, name: String, def: UpstreamDefinition) {
        info!(
            kind = %def.destination_type,
            destination = %def.destination_name,
            upstream = %name,
            "watching upstream"
        );

        if startup {
            self.ready.add(1);
        }

        let mut config = Upstream {
            name: name.clone(),
            destination: def.destination_name.clone(),
            kind: if def.destination_type == DEST_TYPE_PREPARED_QUERY {
                DestinationKind::PreparedQuery
            } else {
                DestinationKind::Service
            },
            ..Default::default()
        };
        apply_upstream_definition(&mut config, &def);
        let kind = config.kind;

        let terminated = Arc::new(AtomicBool::new(false));
        {
            let mut model = self.model.lock().expect("model lock poisoned");
            model.upstreams.insert(
                name.clone(),
                UpstreamEntry {
                    config,
                    nodes: Vec::new(),
                    terminated: terminated.clone(),
                },
            );
        }

        let inner = self.clone();
        match kind {
            DestinationKind::Service => {
                tokio::spawn(run_service_subscriber(inner, name, def, terminated, startup));
            }
            DestinationKind::PreparedQuery => {
                tokio::spawn(run_query_subscriber(inner, name, def, terminated, startup));
            }
        }
    }

    /// Untrack an upstream; its subscriber observes the flag at the next
    /// poll boundary and exits.
    fn remove_upstream(&self, name: &str) {
        info!(upstream = %name, "removing upstream");
        let mut model = self.model.lock().expect("model lock poisoned");
        if let Some(entry) = model.upstreams.remove(name) {
            entry.terminated.store(true, Ordering::SeqCst);
        }
    }

    /// Replace the endpoint set of a tracked upstream.
    fn set_upstream_nodes(&self, name: &str, nodes: Vec<ServiceEntry>) {
        let mut model = self.model.lock().expect("model lock poisoned");
        if let Some(entry) = model.upstreams.get_mut(name) {
            entry.nodes = nodes;
        }
    }
}

/// Long-poll the sidecar definition on its content hash.
async fn watch_definition(inner: Arc<Inner>, proxy_id: String) {
    let _guard = inner.shutdown.register();
    let shutdown = inner.shutdown.signal();

    let mut hash = String::new();
    let mut first = true;
    loop {
        if shutdown.is_triggered() {
            return;
        }
        match inner.client.agent_service(&proxy_id, &hash).await {
            Ok((srv, new_hash)) => {
                let changed = hash != new_hash;
                hash = new_hash;
                if changed {
                    debug!(service = %proxy_id, "sidecar definition changed");
                    inner.handle_definition_change(first, &srv);
                    inner.notify_changed();
                }
                first = false;
            }
            Err(err) => {
                error!(service = %proxy_id, %err, "sidecar definition poll failed");
                hash.clear();
                if !sleep_or_shutdown(&shutdown, ERROR_WAIT).await {
                    return;
                }
            }
        }
    }
}

/// Long-poll the root CA bundle on its index.
async fn watch_ca(inner: Arc<Inner>) {
    let _guard = inner.shutdown.register();
    let shutdown = inner.shutdown.signal();

    let mut index = 0u64;
    let mut first = true;
    loop {
        if shutdown.is_triggered() {
            return;
        }
        match inner.client.ca_roots(index).await {
            Ok((roots, new_index)) => {
                let changed = index != new_index;
                index = new_index;
                if changed {
                    info!(active_root = %roots.active_root_id, "CA bundle changed");
                    {
                        let mut model = inner.model.lock().expect("model lock poisoned");
                        model.ca_bundle = roots
                            .roots
                            .iter()
                            .map(|r| r.root_cert_pem.clone().into_bytes())
                            .collect();
                    }
                    inner.notify_changed();
                }
                if first {
                    info!("CA bundle ready");
                    inner.ready.done();
                    first = false;
                }
            }
            Err(err) => {
                error!(%err, "CA bundle poll failed");
                index = 0;
                if !sleep_or_shutdown(&shutdown, ERROR_WAIT).await {
                    return;
                }
            }
        }
    }
}

/// Long-poll the leaf identity on its index.
async fn watch_leaf(inner: Arc<Inner>) {
    let _guard = inner.shutdown.register();
    let shutdown = inner.shutdown.signal();

    // Resolved before subscribers are spawned; empty only if the
    // application registration resolved to an empty name.
    let service_name = {
        let model = inner.model.lock().expect("model lock poisoned");
        if model.service_name.is_empty() {
            inner.service_id.clone()
        } else {
            model.service_name.clone()
        }
    };

    let mut index = 0u64;
    let mut first = true;
    loop {
        if shutdown.is_triggered() {
            return;
        }
        match inner.client.leaf_certificate(&service_name, index).await {
            Ok((leaf, new_index)) => {
                let changed = index != new_index;
                index = new_index;
                if changed {
                    info!(
                        service = %service_name,
                        serial = %leaf.serial_number,
                        valid_after = %leaf.valid_after,
                        valid_before = %leaf.valid_before,
                        "leaf identity changed"
                    );
                    {
                        let mut model = inner.model.lock().expect("model lock poisoned");
                        model.leaf = Some(LeafIdentity {
                            cert_pem: leaf.cert_pem.into_bytes(),
                            key_pem: leaf.private_key_pem.into_bytes(),
                        });
                    }
                    inner.notify_changed();
                }
                if first {
                    info!(service = %service_name, "leaf identity ready");
                    inner.ready.done();
                    first = false;
                }
            }
            Err(err) => {
                error!(service = %service_name, %err, "leaf identity poll failed");
                index = 0;
                if !sleep_or_shutdown(&shutdown, ERROR_WAIT).await {
                    return;
                }
            }
        }
    }
}

/// Long-poll health-filtered endpoints for a service upstream.
async fn run_service_subscriber(
    inner: Arc<Inner>,
    name: String,
    def: UpstreamDefinition,
    terminated: Arc<AtomicBool>,
    startup: bool,
) {
    let _guard = inner.shutdown.register();
    let shutdown = inner.shutdown.signal();

    let mut index = 0u64;
    let mut first = true;
    loop {
        if terminated.load(Ordering::SeqCst) || shutdown.is_triggered() {
            return;
        }
        match inner
            .client
            .service_health(&def.destination_name, &def.datacenter, index)
            .await
        {
            Ok((nodes, new_index)) => {
                let changed = index != new_index;
                index = new_index;
                if changed {
                    inner.set_upstream_nodes(&name, nodes);
                    inner.notify_changed();
                }
                if startup && first {
                    inner.ready.done();
                }
                first = false;
            }
            Err(err) => {
                error!(upstream = %name, %err, "endpoint poll failed");
                index = 0;
                if !sleep_or_shutdown(&shutdown, ERROR_WAIT).await {
                    return;
                }
            }
        }
    }
}

/// Periodically execute a prepared query and diff the result.
async fn run_query_subscriber(
    inner: Arc<Inner>,
    name: String,
    def: UpstreamDefinition,
    terminated: Arc<AtomicBool>,
    startup: bool,
) {
    let _guard = inner.shutdown.register();
    let shutdown = inner.shutdown.signal();

    let interval = match config_duration(&def.config, "poll_interval", Duration::ZERO) {
        Some(d) if d > Duration::ZERO => d,
        Some(_) | None => PREPARED_QUERY_POLL_INTERVAL,
    };

    let mut last: Option<Vec<ServiceEntry>> = None;
    let mut first = true;
    loop {
        if terminated.load(Ordering::SeqCst) || shutdown.is_triggered() {
            return;
        }
        match inner
            .client
            .execute_prepared_query(&def.destination_name, &def.datacenter)
            .await
        {
            Ok(nodes) => {
                if last.as_ref() != Some(&nodes) {
                    inner.set_upstream_nodes(&name, nodes.clone());
                    inner.notify_changed();
                    last = Some(nodes);
                }
                if startup && first {
                    inner.ready.done();
                }
                first = false;
                if !sleep_or_shutdown(&shutdown, interval).await {
                    return;
                }
            }
            Err(err) => {
                error!(query = %def.destination_name, %err, "prepared query failed");
                if !sleep_or_shutdown(&shutdown, ERROR_WAIT).await {
                    return;
                }
            }
        }
    }
}

/// Sleep, returning `false` if shutdown fired first.
async fn sleep_or_shutdown(shutdown: &connect_core::ShutdownSignal, wait: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(wait) => true,
        _ = shutdown.clone().wait() => false,
    }
}

/// Select the sidecar registration for `service_id`.
///
/// Prefer a connect-proxy whose declared destination matches; fall back
/// to the `<service>-sidecar-proxy` naming convention.
fn find_sidecar_proxy(
    services: &HashMap<String, AgentService>,
    service_id: &str,
) -> Option<String> {
    for (id, svc) in services {
        if svc.kind == KIND_CONNECT_PROXY {
            if let Some(proxy) = &svc.proxy {
                if proxy.destination_service_id == service_id
                    || proxy.destination_service_name == service_id
                {
                    return Some(id.clone());
                }
            }
        }
    }

    let expected = format!("{service_id}-sidecar-proxy");
    for (id, svc) in services {
        if svc.service == expected || *id == expected {
            return Some(id.clone());
        }
    }
    None
}

/// Copy the static parts of an upstream definition into its tracked config.
fn apply_upstream_definition(config: &mut Upstream, def: &UpstreamDefinition) {
    config.datacenter = def.datacenter.clone();
    config.local_bind_address = if def.local_bind_address.is_empty() {
        DEFAULT_UPSTREAM_BIND_ADDR.to_string()
    } else {
        def.local_bind_address.clone()
    };
    config.local_bind_port = def.local_bind_port;
    config.connect_timeout = DEFAULT_CONNECT_TIMEOUT;
    config.read_timeout = DEFAULT_READ_TIMEOUT;

    if let Some(p) = config_str(&def.config, "protocol") {
        config.protocol = Protocol::parse(&p);
    }
    if let Some(d) = config_duration(&def.config, "connect_timeout", DEFAULT_CONNECT_TIMEOUT) {
        config.connect_timeout = d;
    }
    if let Some(d) = config_duration(&def.config, "read_timeout", DEFAULT_READ_TIMEOUT) {
        config.read_timeout = d;
    }
}

fn config_str(cfg: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    cfg.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn config_port(cfg: &HashMap<String, serde_json::Value>, key: &str) -> Option<u16> {
    cfg.get(key)
        .and_then(|v| v.as_u64())
        .filter(|p| *p > 0 && *p <= u64::from(u16::MAX))
        .map(|p| p as u16)
}

/// Parse a duration config value, logging and substituting `fallback` on
/// a malformed string. `None` means the key is absent.
fn config_duration(
    cfg: &HashMap<String, serde_json::Value>,
    key: &str,
    fallback: Duration,
) -> Option<Duration> {
    let raw = cfg.get(key)?.as_str()?;
    match parse_duration(raw) {
        Some(d) => Some(d),
        None => {
            error!(key, value = raw, default = ?fallback, "bad duration in proxy config");
            Some(fallback)
        }
    }
}

/// Parse durations in the control plane's `<number><unit>` notation
/// (`ms`, `s`, `m`, `h`), e.g. "500ms", "30s", "10m".
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (value, unit) = s.split_at(s.find(|c: char| c.is_ascii_alphabetic())?);
    let value: f64 = value.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => return None,
    };
    Some(Duration::from_millis(millis as u64))
}

/// Dynamic-count ready barrier (add/done/wait).
struct Latch {
    tx: watch::Sender<usize>,
}

impl Latch {
    fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    fn add(&self, n: usize) {
        self.tx.send_modify(|c| *c += n);
    }

    fn done(&self) {
        self.tx.send_modify(|c| *c = c.saturating_sub(1));
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|c| *c == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        AgentServiceProxy, AuthorizeRequest, AuthorizeResponse, CaRoot, CaRootList, HealthCheck,
        LeafCertificate, NodeService, Weights,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    /// In-memory control plane; watch methods block on version bumps.
    struct MockMesh {
        services: Mutex<HashMap<String, AgentService>>,
        sidecar: watch::Sender<(AgentService, u64)>,
        roots: watch::Sender<(CaRootList, u64)>,
        leaf: watch::Sender<(LeafCertificate, u64)>,
        health: Mutex<HashMap<String, watch::Sender<(Vec<ServiceEntry>, u64)>>>,
        health_calls: AtomicU64,
    }

    impl MockMesh {
        fn new(sidecar: AgentService) -> Arc<Self> {
            let mut services = HashMap::new();
            services.insert(sidecar.id.clone(), sidecar.clone());
            let roots = CaRootList {
                active_root_id: "root-1".into(),
                roots: vec![CaRoot {
                    root_cert_pem: "CA PEM".into(),
                }],
            };
            let leaf = LeafCertificate {
                serial_number: "01".into(),
                cert_pem: "LEAF PEM".into(),
                private_key_pem: "KEY PEM".into(),
                ..Default::default()
            };
            Arc::new(Self {
                services: Mutex::new(services),
                sidecar: watch::channel((sidecar, 1)).0,
                roots: watch::channel((roots, 1)).0,
                leaf: watch::channel((leaf, 1)).0,
                health: Mutex::new(HashMap::new()),
                health_calls: AtomicU64::new(0),
            })
        }

        fn set_health(&self, service: &str, nodes: Vec<ServiceEntry>) {
            let mut health = self.health.lock().unwrap();
            match health.get(service) {
                Some(tx) => tx.send_modify(|(n, v)| {
                    *n = nodes;
                    *v += 1;
                }),
                None => {
                    health.insert(service.to_string(), watch::channel((nodes, 1)).0);
                }
            }
        }

        fn set_sidecar(&self, sidecar: AgentService) {
            self.sidecar.send_modify(|(s, v)| {
                *s = sidecar;
                *v += 1;
            });
        }
    }

    async fn wait_changed<T: Clone>(tx: &watch::Sender<(T, u64)>, seen: u64) -> (T, u64) {
        let mut rx = tx.subscribe();
        let (value, version) = rx
            .wait_for(|(_, v)| *v > seen)
            .await
            .expect("watch closed")
            .clone();
        (value, version)
    }

    #[async_trait]
    impl MeshClient for MockMesh {
        async fn agent_services(&self) -> connect_core::Result<HashMap<String, AgentService>> {
            Ok(self.services.lock().unwrap().clone())
        }

        async fn agent_service(
            &self,
            id: &str,
            wait_hash: &str,
        ) -> connect_core::Result<(AgentService, String)> {
            let seen: u64 = wait_hash.parse().unwrap_or(0);
            let current = self.sidecar.borrow().clone();
            if current.0.id == id {
                if current.1 > seen {
                    return Ok((current.0, current.1.to_string()));
                }
                let (svc, version) = wait_changed(&self.sidecar, seen).await;
                return Ok((svc, version.to_string()));
            }
            self.services
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .map(|s| (s, "0".to_string()))
                .ok_or_else(|| connect_core::Error::InvalidResponse {
                    operation: "agent service".into(),
                    reason: format!("unknown service {id}"),
                })
        }

        async fn ca_roots(&self, wait_index: u64) -> connect_core::Result<(CaRootList, u64)> {
            let current = self.roots.borrow().clone();
            if current.1 > wait_index {
                return Ok(current);
            }
            Ok(wait_changed(&self.roots, wait_index).await)
        }

        async fn leaf_certificate(
            &self,
            _service_name: &str,
            wait_index: u64,
        ) -> connect_core::Result<(LeafCertificate, u64)> {
            let current = self.leaf.borrow().clone();
            if current.1 > wait_index {
                return Ok(current);
            }
            Ok(wait_changed(&self.leaf, wait_index).await)
        }

        async fn service_health(
            &self,
            service: &str,
            _datacenter: &str,
            wait_index: u64,
        ) -> connect_core::Result<(Vec<ServiceEntry>, u64)> {
            self.health_calls.fetch_add(1, Ordering::SeqCst);
            let tx = {
                let mut health = self.health.lock().unwrap();
                health
                    .entry(service.to_string())
                    .or_insert_with(|| watch::channel((Vec::new(), 1)).0)
                    .clone()
            };
            let current = tx.borrow().clone();
            if current.1 > wait_index {
                return Ok(current);
            }
            Ok(wait_changed(&tx, wait_index).await)
        }

        async fn execute_prepared_query(
            &self,
            query: &str,
            _datacenter: &str,
        ) -> connect_core::Result<Vec<ServiceEntry>> {
            Ok(self
                .health
                .lock()
                .unwrap()
                .get(query)
                .map(|tx| tx.borrow().0.clone())
                .unwrap_or_default())
        }

        async fn authorize(
            &self,
            _request: &AuthorizeRequest,
        ) -> connect_core::Result<AuthorizeResponse> {
            Ok(AuthorizeResponse::default())
        }
    }

    fn sidecar_service(upstream_names: &[&str]) -> AgentService {
        AgentService {
            id: "web-sidecar-proxy".into(),
            service: "web-sidecar-proxy".into(),
            kind: KIND_CONNECT_PROXY.into(),
            port: 20000,
            tags: Vec::new(),
            proxy: Some(AgentServiceProxy {
                destination_service_name: "web".into(),
                destination_service_id: "web".into(),
                local_service_port: 8080,
                config: HashMap::from([(
                    "protocol".to_string(),
                    serde_json::Value::String("http".into()),
                )]),
                upstreams: upstream_names
                    .iter()
                    .map(|n| UpstreamDefinition {
                        destination_type: "service".into(),
                        destination_name: (*n).to_string(),
                        local_bind_port: 19000,
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
        }
    }

    fn healthy_entry(addr: &str, port: u16) -> ServiceEntry {
        ServiceEntry {
            service: NodeService {
                address: addr.into(),
                port,
                weights: Weights {
                    passing: 10,
                    warning: 1,
                },
            },
            checks: vec![HealthCheck {
                status: HEALTH_PASSING.into(),
            }],
            ..Default::default()
        }
    }

    async fn recv_snapshot(rx: &mut mpsc::Receiver<MeshSnapshot>) -> MeshSnapshot {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for snapshot")
            .expect("snapshot channel closed")
    }

    #[tokio::test]
    async fn emits_initial_snapshot_after_all_subscriptions_ready() {
        let mesh = MockMesh::new(sidecar_service(&["db"]));
        mesh.set_health("db", vec![healthy_entry("10.0.0.1", 5432)]);

        let shutdown = Shutdown::new();
        let (watcher, mut rx) = Watcher::new(mesh.clone(), "web", shutdown.clone());
        tokio::spawn(watcher.run());

        let snapshot = recv_snapshot(&mut rx).await;
        assert_eq!(snapshot.service_name, "web");
        assert_eq!(snapshot.downstream.local_bind_port, 20000);
        assert_eq!(snapshot.downstream.target_port, 8080);
        assert_eq!(snapshot.downstream.protocol, Protocol::Http);
        assert_eq!(snapshot.upstreams.len(), 1);
        assert_eq!(snapshot.upstreams[0].name, "service_db");
        assert_eq!(
            snapshot.upstreams[0].endpoints,
            vec![Endpoint {
                host: "10.0.0.1".into(),
                port: 5432,
                weight: 10,
            }]
        );
        assert_eq!(snapshot.ca_bundle, vec![b"CA PEM".to_vec()]);
        assert_eq!(snapshot.leaf.cert_pem, b"LEAF PEM".to_vec());

        shutdown.trigger("test over");
    }

    #[tokio::test]
    async fn drops_critical_and_zero_weight_endpoints() {
        let mesh = MockMesh::new(sidecar_service(&["db"]));
        let critical = ServiceEntry {
            checks: vec![HealthCheck {
                status: "critical".into(),
            }],
            ..healthy_entry("10.0.0.2", 5432)
        };
        let warning_zero = ServiceEntry {
            service: NodeService {
                address: "10.0.0.3".into(),
                port: 5432,
                weights: Weights {
                    passing: 10,
                    warning: 0,
                },
            },
            checks: vec![HealthCheck {
                status: HEALTH_WARNING.into(),
            }],
            ..Default::default()
        };
        mesh.set_health(
            "db",
            vec![healthy_entry("10.0.0.1", 5432), critical, warning_zero],
        );

        let shutdown = Shutdown::new();
        let (watcher, mut rx) = Watcher::new(mesh.clone(), "web", shutdown.clone());
        tokio::spawn(watcher.run());

        let snapshot = recv_snapshot(&mut rx).await;
        let endpoints = &snapshot.upstreams[0].endpoints;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].host, "10.0.0.1");

        shutdown.trigger("test over");
    }

    #[tokio::test]
    async fn upstreams_sorted_by_name() {
        let mesh = MockMesh::new(sidecar_service(&["zeta", "alpha"]));
        mesh.set_health("zeta", vec![healthy_entry("10.0.0.1", 80)]);
        mesh.set_health("alpha", vec![healthy_entry("10.0.0.2", 80)]);

        let shutdown = Shutdown::new();
        let (watcher, mut rx) = Watcher::new(mesh.clone(), "web", shutdown.clone());
        tokio::spawn(watcher.run());

        let snapshot = recv_snapshot(&mut rx).await;
        let names: Vec<_> = snapshot.upstreams.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["service_alpha", "service_zeta"]);

        shutdown.trigger("test over");
    }

    #[tokio::test]
    async fn removed_upstream_disappears_from_snapshots() {
        let mesh = MockMesh::new(sidecar_service(&["db"]));
        mesh.set_health("db", vec![healthy_entry("10.0.0.1", 5432)]);

        let shutdown = Shutdown::new();
        let (watcher, mut rx) = Watcher::new(mesh.clone(), "web", shutdown.clone());
        tokio::spawn(watcher.run());

        let first = recv_snapshot(&mut rx).await;
        assert_eq!(first.upstreams.len(), 1);

        mesh.set_sidecar(sidecar_service(&[]));

        let mut latest = recv_snapshot(&mut rx).await;
        while !latest.upstreams.is_empty() {
            latest = recv_snapshot(&mut rx).await;
        }

        shutdown.trigger("test over");
    }

    #[tokio::test]
    async fn discovery_falls_back_to_name_suffix() {
        let plain_sidecar = AgentService {
            id: "web-sidecar-proxy".into(),
            service: "web-sidecar-proxy".into(),
            // Not marked connect-proxy; matched by naming convention only.
            kind: String::new(),
            port: 20000,
            ..Default::default()
        };
        let mesh = MockMesh::new(plain_sidecar);

        let shutdown = Shutdown::new();
        let (watcher, mut rx) = Watcher::new(mesh.clone(), "web", shutdown.clone());
        tokio::spawn(watcher.run());

        let snapshot = recv_snapshot(&mut rx).await;
        assert_eq!(snapshot.downstream.local_bind_port, 20000);

        shutdown.trigger("test over");
    }

    #[test]
    fn parse_duration_notation() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("nope"), None);
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("-5s"), None);
    }

    #[test]
    fn sidecar_lookup_prefers_declared_destination() {
        let mut services = HashMap::new();
        services.insert(
            "by-name".to_string(),
            AgentService {
                id: "by-name".into(),
                service: "web-sidecar-proxy".into(),
                ..Default::default()
            },
        );
        services.insert(
            "by-destination".to_string(),
            AgentService {
                id: "by-destination".into(),
                service: "custom-proxy".into(),
                kind: KIND_CONNECT_PROXY.into(),
                proxy: Some(AgentServiceProxy {
                    destination_service_name: "web".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        assert_eq!(
            find_sidecar_proxy(&services, "web").as_deref(),
            Some("by-destination")
        );
    }
}
