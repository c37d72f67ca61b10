//! # connect-core
//!
//! Core types shared by every crate in the sidecar controller:
//!
//! - [`Error`] - error type covering all failure modes, with per-component
//!   disposition documented on each variant
//! - [`MeshSnapshot`] - a consistent view of the mesh state for one sidecar
//! - [`Shutdown`] - process-wide shutdown barrier with task accounting
//!
//! ## Example
//!
//! ```rust
//! use connect_core::{MeshSnapshot, Shutdown};
//!
//! let shutdown = Shutdown::new();
//! let snapshot = MeshSnapshot::default();
//! assert!(snapshot.upstreams.is_empty());
//! assert!(!shutdown.is_triggered());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod shutdown;

pub use config::{
    DestinationKind, Downstream, Endpoint, LeafIdentity, MeshSnapshot, Protocol, Upstream,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_DOWNSTREAM_BIND_ADDR, DEFAULT_READ_TIMEOUT,
    DEFAULT_UPSTREAM_BIND_ADDR,
};
pub use error::Error;
pub use shutdown::{Shutdown, ShutdownSignal, TaskGuard};

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
