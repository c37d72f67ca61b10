//! The convergence loop: snapshots in, reloads out.
//!
//! A single-consumer state machine with four inputs: the snapshot
//! channel, a retry timer, a throttle tick and the shutdown signal.
//! Inputs arriving within one 500 ms window coalesce into a single
//! generate/render/apply round; failed renders and applies are retried
//! 3 s later; a snapshot that generates the already-applied state is a
//! no-op.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use connect_core::{MeshSnapshot, Result, Shutdown};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::certs::CertificateStore;
use crate::params::HaproxyParams;
use crate::render;
use crate::state::{generate, GenerateOptions, ProxyState};

/// Coalescing window for incoming inputs.
const THROTTLE: Duration = Duration::from_millis(500);
/// Delay before a failed render/apply is retried.
const RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// The loop's handle on the proxy: lazy start and configuration apply.
///
/// Production wires this to [`Supervisor`] + [`ConfigWriter`]; tests
/// script it.
///
/// [`Supervisor`]: crate::Supervisor
/// [`ConfigWriter`]: crate::ConfigWriter
#[async_trait]
pub trait ProxyHandle: Send + Sync {
    /// Start the proxy child; called once, before the first apply.
    async fn start(&self) -> Result<()>;

    /// Install a rendered configuration and trigger a reload.
    async fn apply(&self, config: &str) -> Result<()>;
}

/// Drives snapshots through generate → render → apply.
pub struct ConvergenceLoop<P> {
    opts: GenerateOptions,
    params: HaproxyParams,
    stats_socket: PathBuf,
    store: CertificateStore,
    proxy: P,
    ready: watch::Sender<bool>,
}

impl<P: ProxyHandle> ConvergenceLoop<P> {
    /// Create the loop and the readiness channel observers watch
    /// (flips to `true` after the first successful apply).
    pub fn new(
        opts: GenerateOptions,
        params: HaproxyParams,
        stats_socket: PathBuf,
        store: CertificateStore,
        proxy: P,
    ) -> (Self, watch::Receiver<bool>) {
        let (ready, ready_rx) = watch::channel(false);
        (
            Self {
                opts,
                params,
                stats_socket,
                store,
                proxy,
                ready,
            },
            ready_rx,
        )
    }

    /// Run until shutdown or until the snapshot channel closes.
    pub async fn run(
        self,
        mut snapshots: mpsc::Receiver<MeshSnapshot>,
        shutdown: Shutdown,
    ) -> Result<()> {
        let _guard = shutdown.register();

        let mut throttle = tokio::time::interval_at(
            tokio::time::Instant::now() + THROTTLE,
            THROTTLE,
        );
        // Retry requests collapse: one pending retry is enough.
        let (retry_tx, mut retry_rx) = mpsc::channel::<()>(1);

        let mut current: Option<MeshSnapshot> = None;
        let mut last_state = ProxyState::default();
        let mut started = false;
        let mut signaled_ready = false;

        loop {
            // Throttle window: wait for any input, then absorb further
            // inputs until the next tick.
            let mut input_received = false;
            loop {
                tokio::select! {
                    _ = shutdown.signal().wait() => return Ok(()),
                    _ = throttle.tick() => {
                        if input_received {
                            break;
                        }
                    }
                    received = snapshots.recv() => match received {
                        Some(snapshot) => {
                            info!("handling new configuration");
                            current = Some(snapshot);
                            input_received = true;
                        }
                        None => return Ok(()),
                    },
                    Some(()) = retry_rx.recv() => {
                        warn!("retrying configuration apply");
                        input_received = true;
                    }
                }
            }

            let Some(snapshot) = current.clone() else {
                continue;
            };

            if !started {
                self.proxy.start().await?;
                started = true;
            }

            let state = match generate(&self.opts, &self.store, &last_state, &snapshot) {
                Ok(state) => state,
                Err(err) => {
                    // No retry schedule: the next snapshot forces a
                    // fresh round anyway.
                    error!(%err, "state generation failed");
                    continue;
                }
            };

            if state == last_state {
                info!("no configuration change to apply");
                continue;
            }

            let config = match render::render(&state, &self.stats_socket, &self.params) {
                Ok(config) => config,
                Err(err) => {
                    error!(%err, "configuration rendering failed");
                    schedule_retry(&retry_tx);
                    continue;
                }
            };

            if let Err(err) = self.proxy.apply(&config).await {
                error!(%err, "configuration apply failed");
                schedule_retry(&retry_tx);
                continue;
            }

            if !signaled_ready {
                self.ready.send_replace(true);
                signaled_ready = true;
            }
            last_state = state;
            info!("configuration applied");
        }
    }
}

/// Arrange a retry nudge after the backoff; extra requests while one is
/// pending are dropped.
fn schedule_retry(retry_tx: &mpsc::Sender<()>) {
    let retry_tx = retry_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(RETRY_BACKOFF).await;
        let _ = retry_tx.try_send(());
    });
}
