//! # connect-haproxy
//!
//! Everything between a [`MeshSnapshot`] and a running HAProxy:
//!
//! - [`state`] - declarative proxy state and the pure generator
//! - [`render`] - deterministic native configuration rendering
//! - [`CertificateStore`] - content-addressed on-disk PEM material
//! - [`ConfigWriter`] - atomic install + out-of-process validation +
//!   graceful reload
//! - [`Supervisor`] - master/worker child process lifecycle
//! - [`ConvergenceLoop`] - the throttled snapshot-to-reload pipeline
//!
//! [`MeshSnapshot`]: connect_core::MeshSnapshot

#![deny(unsafe_code)]

mod certs;
mod convergence;
mod halog;
mod logsink;
mod params;
mod paths;
pub mod render;
pub mod state;
mod supervisor;
mod version;
mod writer;

pub use certs::CertificateStore;
pub use convergence::{ConvergenceLoop, ProxyHandle};
pub use logsink::run_request_log_sink;
pub use params::{HaproxyParams, ParamScope};
pub use paths::RuntimePaths;
pub use supervisor::{Supervisor, SupervisorConfig, READY_MARKER};
pub use version::check_environment;
pub use writer::ConfigWriter;
