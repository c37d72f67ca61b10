//! Proxy child process lifecycle.
//!
//! The proxy runs in master/worker mode with a master socket, so reloads
//! are a signal away instead of a restart. The supervisor tails both
//! stdio streams, forwards them to tracing, and watches for the ready
//! marker the first worker prints; only then may reload signals be sent.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use connect_core::{Error, Result, Shutdown};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::halog;

/// Line the proxy prints when its first worker finished loading.
pub const READY_MARKER: &str = "Loading success";

/// How long to wait for the ready marker before giving up.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// What to launch and where its control files live.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Proxy binary path or name.
    pub haproxy_bin: String,
    /// Configuration file passed with `-f`.
    pub config_path: PathBuf,
    /// Master runtime socket passed with `-S`.
    pub master_socket: PathBuf,
}

/// Starts the proxy child and owns its lifetime.
#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
}

impl Supervisor {
    /// Create a supervisor for the given launch configuration.
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    /// Launch the proxy and wait for its ready marker.
    ///
    /// Returns the child PID once the marker is seen. Fails on a 30 s
    /// ready timeout or if shutdown is requested while waiting; both
    /// paths terminate the child. After a successful return, a monitor
    /// task owns the child: it kills it on shutdown and triggers
    /// shutdown if it exits on its own.
    pub async fn start(&self, shutdown: &Shutdown) -> Result<i32> {
        info!(bin = %self.config.haproxy_bin, "starting proxy");

        let mut child = Command::new(&self.config.haproxy_bin)
            .arg("-W")
            .arg("-S")
            .arg(&self.config.master_socket)
            .arg("-f")
            .arg(&self.config.config_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::io(format!("spawn {}", self.config.haproxy_bin), e))?;

        // Buffered so that whichever stream sees the marker first can
        // signal without blocking; only the first send lands.
        let (ready_tx, mut ready_rx) = mpsc::channel(1);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(tail_stream(stdout, ready_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(tail_stream(stderr, ready_tx));
        }

        let pid = child.id().ok_or_else(|| {
            Error::io(
                "read child pid".to_string(),
                std::io::Error::other("child exited before pid could be read"),
            )
        })? as i32;

        tokio::select! {
            Some(()) = ready_rx.recv() => {
                debug!(pid, "proxy ready for reloads");
            }
            _ = tokio::time::sleep(READY_TIMEOUT) => {
                let _ = child.kill().await;
                return Err(Error::ReadyTimeout { waited: READY_TIMEOUT });
            }
            _ = shutdown.signal().wait() => {
                let _ = child.kill().await;
                return Err(Error::ShutdownRequested {
                    reason: shutdown.reason().unwrap_or_default(),
                });
            }
        }

        tokio::spawn(monitor_child(child, shutdown.clone()));
        Ok(pid)
    }
}

/// Forward one stdio stream line-by-line, signaling on the ready marker.
async fn tail_stream<R: AsyncRead + Unpin>(stream: R, ready: mpsc::Sender<()>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                halog::log_line(&line);
                if line.contains(READY_MARKER) {
                    // Non-blocking: a full channel means someone already
                    // signaled.
                    let _ = ready.try_send(());
                }
            }
            Ok(None) => return,
            Err(err) => {
                debug!(%err, "proxy stdio closed");
                return;
            }
        }
    }
}

/// Own the child after startup: kill on shutdown, propagate an
/// unexpected exit as a shutdown trigger.
async fn monitor_child(mut child: Child, shutdown: Shutdown) {
    let _guard = shutdown.register();
    tokio::select! {
        _ = shutdown.signal().wait() => {
            info!("terminating proxy");
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        status = child.wait() => {
            match status {
                Ok(status) => {
                    error!(%status, "proxy exited unexpectedly");
                    shutdown.trigger(format!("proxy exited: {status}"));
                }
                Err(err) => {
                    error!(%err, "failed waiting on proxy");
                    shutdown.trigger("proxy wait failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A stand-in proxy that prints the ready marker and then lingers.
    fn fake_proxy(dir: &std::path::Path, ready: bool) -> String {
        let script = dir.join("haproxy.sh");
        let body = if ready {
            "#!/bin/sh\necho '[NOTICE]   (1) : haproxy version is 2.8.0'\n\
             echo '[NOTICE]   (1) : Loading success.'\nsleep 60\n"
        } else {
            "#!/bin/sh\nsleep 60\n"
        };
        std::fs::write(&script, body).expect("write script");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
        }
        script.display().to_string()
    }

    fn config(dir: &std::path::Path, ready: bool) -> SupervisorConfig {
        SupervisorConfig {
            haproxy_bin: fake_proxy(dir, ready),
            config_path: dir.join("haproxy.conf"),
            master_socket: dir.join("master.sock"),
        }
    }

    #[tokio::test]
    async fn start_returns_after_ready_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shutdown = Shutdown::new();
        let supervisor = Supervisor::new(config(dir.path(), true));

        let pid = supervisor.start(&shutdown).await.expect("start");
        assert!(pid > 0);

        shutdown.trigger("test over");
        shutdown.wait_idle(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn shutdown_while_waiting_is_clean() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shutdown = Shutdown::new();
        let supervisor = Supervisor::new(config(dir.path(), false));

        let sd = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            sd.trigger("test shutdown");
        });

        let err = supervisor.start(&shutdown).await.expect_err("must fail");
        assert!(matches!(err, Error::ShutdownRequested { .. }));
    }

    #[tokio::test]
    async fn ready_signal_is_single_shot_and_never_blocks() {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        // Both stdio tails racing on the marker; neither may block.
        for _ in 0..4 {
            assert!(matches!(
                tx.try_send(()),
                Ok(()) | Err(mpsc::error::TrySendError::Full(()))
            ));
        }
        assert_eq!(rx.recv().await, Some(()));
        assert!(rx.try_recv().is_err());
    }
}
