//! # connect-mesh
//!
//! Control-plane access for the sidecar controller:
//!
//! - [`MeshClient`] - trait over the catalog/identity/authorization API,
//!   with long-poll (blocking query) semantics
//! - [`HttpMeshClient`] - production implementation over the agent's HTTP API
//! - [`Watcher`] - concurrent subscriber that assembles [`MeshSnapshot`]s
//!   and emits them on a channel
//!
//! The watcher is generic over [`MeshClient`] so its concurrency and
//! snapshot semantics are testable without a running control plane.
//!
//! [`MeshSnapshot`]: connect_core::MeshSnapshot

#![deny(unsafe_code)]

pub mod api;
mod client;
mod watcher;

pub use client::{HttpMeshClient, MeshClient, WATCH_WAIT};
pub use watcher::Watcher;
