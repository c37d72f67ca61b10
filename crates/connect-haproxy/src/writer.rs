//! Atomic configuration install and graceful reload.
//!
//! Apply is a four-step pipeline: write to a sibling temp file, validate
//! out-of-process with the proxy binary's check mode, rename into place
//! (atomic within the directory), then signal the master process to
//! reload. A validation failure never touches the live file.

use std::path::PathBuf;

use connect_core::{Error, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info};

/// Installs rendered configurations and drives reloads.
#[derive(Debug, Clone)]
pub struct ConfigWriter {
    config_path: PathBuf,
    haproxy_bin: String,
    master_pid: i32,
}

impl ConfigWriter {
    /// Create a writer for the given live config path and master PID.
    pub fn new(config_path: PathBuf, haproxy_bin: String, master_pid: i32) -> Self {
        Self {
            config_path,
            haproxy_bin,
            master_pid,
        }
    }

    /// Validate and install `config`, then trigger a graceful reload.
    pub async fn apply(&self, config: &str) -> Result<()> {
        let tmp_path = PathBuf::from(format!("{}.new", self.config_path.display()));

        write_private(&tmp_path, config.as_bytes()).await?;
        debug!(path = %tmp_path.display(), "wrote candidate configuration");

        let output = Command::new(&self.haproxy_bin)
            .arg("-c")
            .arg("-f")
            .arg(&tmp_path)
            .output()
            .await
            .map_err(|e| Error::io(format!("run {} -c", self.haproxy_bin), e))?;

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
            captured.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(Error::Validate { output: captured });
        }

        tokio::fs::rename(&tmp_path, &self.config_path)
            .await
            .map_err(|e| {
                Error::io(
                    format!(
                        "rename {} -> {}",
                        tmp_path.display(),
                        self.config_path.display()
                    ),
                    e,
                )
            })?;

        kill(Pid::from_raw(self.master_pid), Signal::SIGUSR2).map_err(|e| {
            Error::io(
                format!("signal reload to master pid {}", self.master_pid),
                std::io::Error::from(e),
            )
        })?;

        info!("configuration installed and reload signaled");
        Ok(())
    }
}

async fn write_private(path: &std::path::Path, content: &[u8]) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(path)
        .await
        .map_err(|e| Error::io(format!("open {}", path.display()), e))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, content)
        .await
        .map_err(|e| Error::io(format!("write {}", path.display()), e))
}
