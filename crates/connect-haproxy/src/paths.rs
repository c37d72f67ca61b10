//! Runtime directory layout and static file emission.
//!
//! All of the proxy's runtime artifacts live in one per-process base
//! directory: the rendered configuration, the sockets, the static
//! authorization-agent configuration and the content-addressed PEM
//! files. The directory is created at startup and removed as a whole on
//! shutdown.

use std::path::{Path, PathBuf};

use connect_core::{Error, Result};
use tracing::info;

use crate::params::HaproxyParams;
use crate::render;

/// Static authorization-agent configuration, written verbatim at startup.
///
/// Declares the `intentions` engine with the `check-intentions` message
/// carrying the caller's DER certificate, and routes agent traffic to
/// the `spoe_back` backend.
const SPOE_CONF: &str = "\
[intentions]

spoe-agent intentions-agent
	messages check-intentions

	option var-prefix connect

	timeout hello      3000ms
	timeout idle       3000s
	timeout processing 3000ms

	use-backend spoe_back

spoe-message check-intentions
	args ip=src cert=ssl_c_der
	event on-frontend-tcp-request
";

/// Well-known paths inside the runtime base directory.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// The base directory itself.
    pub base: PathBuf,
    /// Rendered proxy configuration.
    pub config: PathBuf,
    /// Static authorization-agent configuration.
    pub spoe_config: PathBuf,
    /// Authorization agent listener socket.
    pub spoe_socket: PathBuf,
    /// Stats/runtime socket.
    pub stats_socket: PathBuf,
    /// Master process socket.
    pub master_socket: PathBuf,
    /// Request-log sink socket.
    pub logs_socket: PathBuf,
}

impl RuntimePaths {
    /// Create the base directory under `base_dir` and emit the static
    /// files: the initial configuration (global/defaults only, so the
    /// proxy can start before the first snapshot) and the agent config.
    pub fn create(base_dir: &Path, params: &HaproxyParams) -> Result<Self> {
        let base = unique_base(base_dir)?;
        info!(base = %base.display(), "created runtime directory");

        let paths = Self {
            config: base.join("haproxy.conf"),
            spoe_config: base.join("spoe.conf"),
            spoe_socket: base.join("spoe.sock"),
            stats_socket: base.join("haproxy.sock"),
            master_socket: base.join("haproxy-master.sock"),
            logs_socket: base.join("logs.sock"),
            base,
        };

        let initial = render::render_base(&paths.stats_socket, params);
        write_private(&paths.config, initial.as_bytes())?;
        write_private(&paths.spoe_config, SPOE_CONF.as_bytes())?;

        Ok(paths)
    }

    /// Remove the base directory and everything in it.
    pub fn cleanup(&self) {
        info!(base = %self.base.display(), "removing runtime directory");
        if let Err(err) = std::fs::remove_dir_all(&self.base) {
            tracing::warn!(%err, "failed to remove runtime directory");
        }
    }
}

/// Create a uniquely named, private base directory.
fn unique_base(base_dir: &Path) -> Result<PathBuf> {
    for n in 0..1024u32 {
        let candidate = base_dir.join(format!("haproxy-connect-{}-{n}", std::process::id()));
        match std::fs::create_dir(&candidate) {
            Ok(()) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(
                        &candidate,
                        std::fs::Permissions::from_mode(0o700),
                    )
                    .map_err(|e| {
                        Error::io(format!("chmod {}", candidate.display()), e)
                    })?;
                }
                return Ok(candidate);
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(Error::io(
                    format!("create runtime directory under {}", base_dir.display()),
                    err,
                ))
            }
        }
    }
    Err(Error::Configuration(format!(
        "could not create a unique runtime directory under {}",
        base_dir.display()
    )))
}

fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|e| Error::io(format!("open {}", path.display()), e))?;
    file.write_all(content)
        .map_err(|e| Error::io(format!("write {}", path.display()), e))
}
