//! Error types for the sidecar controller.
//!
//! [`Error`] covers every failure mode in the controller. Each variant's
//! disposition (retry, drop, fatal) is decided by its owning component;
//! the variants here only carry enough context to log and act on.

use std::time::Duration;

/// Error type for all sidecar controller operations.
///
/// Designed to:
/// - Cover all failure modes without panics
/// - Carry the originating component's context in each variant
/// - Support error chaining via `source` fields
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Control-plane transport failed. Subscribers sleep and retry on this.
    #[error("control plane request failed: {operation}")]
    Transport {
        /// The request that failed (e.g. "agent services", "ca roots").
        operation: String,
        /// Underlying transport error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A control-plane response could not be decoded.
    #[error("invalid control plane response for {operation}: {reason}")]
    InvalidResponse {
        /// The request whose response was malformed.
        operation: String,
        /// Why decoding failed.
        reason: String,
    },

    /// No sidecar registration matched the configured service. Fatal after
    /// the startup retry budget is exhausted.
    #[error("no sidecar proxy registered for service {service} after {attempts} attempts")]
    SidecarNotFound {
        /// The service id the sidecar was searched for.
        service: String,
        /// Number of discovery attempts made.
        attempts: u32,
    },

    /// State generation failed; the convergence loop drops the round.
    #[error("state generation failed: {reason}")]
    Generate {
        /// Why the generator rejected the snapshot.
        reason: String,
    },

    /// Configuration rendering failed; retried after the backoff.
    #[error("config rendering failed: {reason}")]
    Render {
        /// Why rendering failed.
        reason: String,
    },

    /// The proxy binary rejected the candidate configuration.
    #[error("config validation failed:\n{output}")]
    Validate {
        /// Combined stdout/stderr captured from the check invocation.
        output: String,
    },

    /// Filesystem or process-control failure while applying configuration.
    #[error("{context}")]
    Io {
        /// What was being done when the error occurred.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The proxy child never printed its ready marker.
    #[error("timeout waiting for proxy to be ready (waited {waited:?})")]
    ReadyTimeout {
        /// How long the supervisor waited.
        waited: Duration,
    },

    /// Shutdown was requested while an operation was still starting up.
    #[error("shutdown requested: {reason}")]
    ShutdownRequested {
        /// The reason recorded when shutdown was triggered.
        reason: String,
    },

    /// An authorization decision did not arrive within the deadline.
    #[error("authorization lookup timed out after {waited:?}")]
    AuthzTimeout {
        /// The deadline that elapsed.
        waited: Duration,
    },

    /// The mesh authorization API call failed.
    #[error("authorization call failed: {reason}")]
    Authz {
        /// Why the call failed.
        reason: String,
    },

    /// The caller's certificate could not be used for authorization.
    #[error("invalid peer certificate: {reason}")]
    InvalidCertificate {
        /// Why the certificate was rejected.
        reason: String,
    },

    /// A malformed frame arrived on the agent socket.
    #[error("agent protocol error: {reason}")]
    Protocol {
        /// What the codec could not parse.
        reason: String,
    },

    /// The proxy binary version is outside the supported range.
    #[error("unsupported proxy version: {found} (supported: {min} <= v < {max})")]
    UnsupportedVersion {
        /// Version reported by the binary.
        found: String,
        /// Inclusive lower bound.
        min: String,
        /// Exclusive upper bound.
        max: String,
    },

    /// Invalid user-supplied configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a transport error from any error type.
    pub fn transport<E>(operation: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create an I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error is transient for a subscriber (retried in place
    /// without surfacing to the convergence loop).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::InvalidResponse { .. }
        )
    }
}
