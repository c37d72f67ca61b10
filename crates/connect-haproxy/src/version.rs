//! Proxy binary dependency check.

use connect_core::{Error, Result};
use tokio::process::Command;
use tracing::debug;

/// Inclusive minimum supported proxy version.
const MIN_VERSION: &str = "2.0";
/// Exclusive maximum supported proxy version.
const MAX_VERSION: &str = "4.0";

/// Verify the proxy binary exists and its version is within
/// `2.0 <= v < 4.0`.
pub async fn check_environment(haproxy_bin: &str) -> Result<()> {
    let output = Command::new(haproxy_bin)
        .arg("-v")
        .output()
        .await
        .map_err(|e| Error::io(format!("run {haproxy_bin} -v"), e))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    let version = extract_version(&text).ok_or_else(|| {
        Error::Configuration(format!(
            "could not find a version number in {haproxy_bin} -v output"
        ))
    })?;
    debug!(bin = haproxy_bin, version, "detected proxy version");

    if compare_versions(version, MIN_VERSION) == std::cmp::Ordering::Less
        || compare_versions(version, MAX_VERSION) != std::cmp::Ordering::Less
    {
        return Err(Error::UnsupportedVersion {
            found: version.to_string(),
            min: MIN_VERSION.to_string(),
            max: MAX_VERSION.to_string(),
        });
    }
    Ok(())
}

/// First `digits(.digits)+` token in the output.
fn extract_version(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            let mut dots = 0;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                if bytes[i] == b'.' {
                    dots += 1;
                }
                i += 1;
            }
            let mut token = &text[start..i];
            token = token.trim_end_matches('.');
            if dots >= 1 && token.contains('.') {
                return Some(token);
            }
        } else {
            i += 1;
        }
    }
    None
}

/// Numeric component-wise comparison, missing components count as zero.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let (x, y) = (
            a.get(i).copied().unwrap_or(0),
            b.get(i).copied().unwrap_or(0),
        );
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}
