//! Request-log sink.
//!
//! When request logging is enabled, every frontend and backend gets a
//! `log` directive pointing at a UNIX datagram socket in the runtime
//! directory; this task drains it and forwards each record to tracing.

use std::path::PathBuf;

use connect_core::{Error, Result, Shutdown};
use tokio::net::UnixDatagram;
use tracing::info;

/// Bind the sink socket and forward records until shutdown.
pub async fn run_request_log_sink(path: PathBuf, shutdown: Shutdown) -> Result<()> {
    let socket = UnixDatagram::bind(&path)
        .map_err(|e| Error::io(format!("bind {}", path.display()), e))?;
    let _guard = shutdown.register();
    info!(socket = %path.display(), "request log sink listening");

    let mut buf = vec![0u8; 8192];
    loop {
        tokio::select! {
            _ = shutdown.signal().wait() => return Ok(()),
            received = socket.recv(&mut buf) => {
                let len = received
                    .map_err(|e| Error::io(format!("recv on {}", path.display()), e))?;
                let record = String::from_utf8_lossy(&buf[..len]);
                info!(target: "haproxy::requests", "{}", strip_syslog_prefix(&record));
            }
        }
    }
}

/// Drop the syslog priority tag (`<134>`) and surrounding whitespace.
fn strip_syslog_prefix(record: &str) -> &str {
    let record = record.trim();
    if let Some(rest) = record.strip_prefix('<') {
        if let Some(end) = rest.find('>') {
            if rest[..end].bytes().all(|b| b.is_ascii_digit()) {
                return rest[end + 1..].trim_start();
            }
        }
    }
    record
}
