//! Proxy stdio log forwarding.
//!
//! HAProxy prefixes its own messages with a severity tag
//! (`[NOTICE]`, `[WARNING]`, `[ALERT]`); map those onto tracing levels
//! and forward everything else at info.

use tracing::{error, info, warn};

/// Severity parsed from a proxy log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Severity {
    Info,
    Warning,
    Error,
}

/// Split a proxy log line into severity and message.
pub(crate) fn parse_line(line: &str) -> (Severity, &str) {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let severity = match &rest[..end] {
                "NOTICE" => Severity::Info,
                "WARNING" => Severity::Warning,
                "ALERT" | "ERROR" => Severity::Error,
                _ => return (Severity::Info, line),
            };
            return (severity, rest[end + 1..].trim_start());
        }
    }
    (Severity::Info, line)
}

/// Forward one proxy log line to tracing.
pub(crate) fn log_line(line: &str) {
    if line.is_empty() {
        return;
    }
    match parse_line(line) {
        (Severity::Info, msg) => info!(target: "haproxy", "{msg}"),
        (Severity::Warning, msg) => warn!(target: "haproxy", "{msg}"),
        (Severity::Error, msg) => error!(target: "haproxy", "{msg}"),
    }
}
