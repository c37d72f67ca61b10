//! Native configuration rendering.
//!
//! Pure text emission from a validated [`ProxyState`]. Determinism rules:
//! parameter maps iterate in key order, sections follow state order, and
//! unset optionals omit their directive entirely (never a zero).

use std::fmt::Write;
use std::path::Path;

use connect_core::{Error, Result};

use crate::params::HaproxyParams;
use crate::state::{Backend, Frontend, HttpRequestRule, ProxyState, Server};

/// Render the `global` and `defaults` sections.
///
/// Also used on its own for the initial configuration the proxy starts
/// with before the first snapshot arrives.
pub fn render_base(stats_socket: &Path, params: &HaproxyParams) -> String {
    let mut out = String::new();

    out.push_str("global\n");
    let _ = writeln!(
        out,
        "\tstats socket {} mode 600 level admin expose-fd listeners",
        stats_socket.display()
    );
    for (key, values) in &params.globals {
        for value in values {
            let _ = writeln!(out, "\t{key} {value}");
        }
    }
    out.push('\n');

    out.push_str("defaults\n");
    for (key, values) in &params.defaults {
        for value in values {
            let _ = writeln!(out, "\t{key} {value}");
        }
    }
    out.push_str("\tcompression algo gzip\n");
    out.push_str(
        "\tcompression type text/css text/html text/javascript application/javascript \
         text/plain text/xml application/json\n",
    );
    out.push('\n');

    out
}

/// Render a complete configuration.
///
/// Validates the state first; a state violating its invariants is a
/// generator bug surfaced as a render error, not a panic.
pub fn render(
    state: &ProxyState,
    stats_socket: &Path,
    params: &HaproxyParams,
) -> Result<String> {
    state
        .validate()
        .map_err(|reason| Error::Render { reason })?;

    let mut out = render_base(stats_socket, params);
    for frontend in &state.frontends {
        emit_frontend(&mut out, frontend);
    }
    for backend in &state.backends {
        emit_backend(&mut out, backend);
    }
    Ok(out)
}

fn emit_frontend(out: &mut String, fe: &Frontend) {
    let _ = writeln!(out, "frontend {}", fe.name);
    let _ = writeln!(out, "\tmode {}", fe.mode);

    let mut bind = format!("\tbind {}:{}", fe.bind.address, fe.bind.port);
    if let Some(tls) = &fe.bind.tls {
        let _ = write!(
            bind,
            " ssl crt {} ca-file {} verify none",
            tls.crt.display(),
            tls.ca.display()
        );
    }
    out.push_str(&bind);
    out.push('\n');

    let _ = writeln!(out, "\tdefault_backend {}", fe.default_backend);
    if let Some(ms) = fe.client_timeout_ms {
        let _ = writeln!(out, "\ttimeout client {ms}ms");
    }
    if fe.httplog {
        out.push_str("\toption httplog\n");
    }
    if let Some(spoe) = &fe.spoe {
        let _ = writeln!(
            out,
            "\tfilter spoe engine {} config {}",
            spoe.engine,
            spoe.config.display()
        );
        out.push_str(
            "\ttcp-request content reject unless { var(sess.connect.auth) -m int eq 1 }\n",
        );
    }
    if fe.compression {
        out.push_str("\tfilter compression\n");
    }
    if let Some(log) = &fe.log_target {
        let _ = writeln!(out, "\tlog {} {} {}", log.address, log.facility, log.format);
    }
    out.push('\n');
}

fn emit_backend(out: &mut String, be: &Backend) {
    let _ = writeln!(out, "backend {}", be.name);
    let _ = writeln!(out, "\tmode {}", be.mode);
    let _ = writeln!(out, "\tbalance {}", be.balance);
    if let Some(ms) = be.server_timeout_ms {
        let _ = writeln!(out, "\ttimeout server {ms}ms");
    }
    if let Some(ms) = be.connect_timeout_ms {
        let _ = writeln!(out, "\ttimeout connect {ms}ms");
    }
    if let Some(retries) = be.retries {
        let _ = writeln!(out, "\tretries {retries}");
    }
    if be.forward_for {
        out.push_str("\toption forwardfor\n");
    }
    if let Some(log) = &be.log_target {
        let _ = writeln!(out, "\tlog {} {} {}", log.address, log.facility, log.format);
    }
    for rule in &be.http_request_rules {
        match rule {
            HttpRequestRule::AddHeader { name, value_format } => {
                let _ = writeln!(out, "\thttp-request add-header {name} {value_format}");
            }
        }
    }
    for server in &be.servers {
        emit_server(out, server);
    }
    out.push('\n');
}

fn emit_server(out: &mut String, srv: &Server) {
    let mut line = format!("\tserver {} {}", srv.name, srv.address);
    if let Some(port) = srv.port {
        let _ = write!(line, ":{port}");
    }
    if let Some(tls) = &srv.tls {
        let _ = write!(
            line,
            " ssl crt {} ca-file {} verify none",
            tls.crt.display(),
            tls.ca.display()
        );
    }
    if let Some(weight) = srv.weight {
        let _ = write!(line, " weight {weight}");
    }
    if let Some(check) = &srv.check {
        let _ = write!(
            line,
            " check inter {} fastinter {} downinter {} rise {} fall {} \
             observe layer4 on-error mark-down error-limit {}",
            check.inter_ms,
            check.fastinter_ms,
            check.downinter_ms,
            check.rise,
            check.fall,
            check.error_limit
        );
    }
    out.push_str(&line);
    out.push('\n');
}
