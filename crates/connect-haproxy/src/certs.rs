//! Content-addressed on-disk store for PEM material.
//!
//! HAProxy reads TLS material from files, so every rotation has to land
//! on disk before it can be referenced from a configuration. Paths are
//! the hex SHA-256 of the content: identical material maps to the same
//! file, rotated material to a new one, and a config referencing an old
//! path stays valid until the next reload completes.

use std::path::{Path, PathBuf};

use connect_core::{Error, Result};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Write-once, content-addressed file store rooted at the runtime base
/// directory. Entries are never deleted during a run; the base directory
/// is removed as a whole on shutdown.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    base: PathBuf,
}

impl CertificateStore {
    /// Create a store rooted at `base` (must already exist).
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Store `content`, returning its stable path.
    ///
    /// Idempotent: if the path already exists the content is known (the
    /// name is its hash) and nothing is rewritten. Concurrent racers on
    /// the same content converge on the same path; the loser observes
    /// the winner's file and returns.
    pub fn store(&self, content: &[u8]) -> Result<PathBuf> {
        let digest = Sha256::digest(content);
        let path = self.base.join(hex_encode(&digest));

        match std::fs::metadata(&path) {
            Ok(_) => return Ok(path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(Error::io(
                    format!("stat {}", path.display()),
                    err,
                ))
            }
        }

        match exclusive_create(&path, content) {
            Ok(()) => {
                debug!(path = %path.display(), "stored certificate material");
                Ok(path)
            }
            // Lost the race: the winner wrote the same bytes.
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(path),
            Err(err) => Err(Error::io(format!("write {}", path.display()), err)),
        }
    }

    /// Store a leaf identity and a CA bundle, returning
    /// `(ca_path, crt_path)`.
    ///
    /// The crt file is the concatenation `cert || key` (the combined
    /// format the proxy expects); the CA file concatenates all roots in
    /// control-plane order.
    pub fn material_paths(
        &self,
        cert_pem: &[u8],
        key_pem: &[u8],
        ca_bundle: &[Vec<u8>],
    ) -> Result<(PathBuf, PathBuf)> {
        let mut crt = Vec::with_capacity(cert_pem.len() + key_pem.len());
        crt.extend_from_slice(cert_pem);
        crt.extend_from_slice(key_pem);
        let crt_path = self.store(&crt)?;

        let mut ca = Vec::new();
        for root in ca_bundle {
            ca.extend_from_slice(root);
        }
        let ca_path = self.store(&ca)?;

        Ok((ca_path, crt_path))
    }
}

/// Create the file exclusively with mode 0600 and write all content.
fn exclusive_create(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content)?;
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_is_content_addressed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CertificateStore::new(dir.path());

        let a1 = store.store(b"material a").expect("store");
        let a2 = store.store(b"material a").expect("store");
        let b = store.store(b"material b").expect("store");

        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(std::fs::read(&a1).expect("read"), b"material a");
    }

    #[test]
    fn path_is_hex_sha256_of_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CertificateStore::new(dir.path());

        let path = store.store(b"abc").expect("store");
        // SHA-256("abc")
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn random_content_distinct_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CertificateStore::new(dir.path());

        let mut paths = std::collections::HashSet::new();
        for i in 0..64u32 {
            let content = i.to_be_bytes();
            let first = store.store(&content).expect("store");
            let second = store.store(&content).expect("store");
            assert_eq!(first, second);
            paths.insert(first);
        }
        assert_eq!(paths.len(), 64);
    }

    #[test]
    fn material_paths_concatenate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CertificateStore::new(dir.path());

        let (ca_path, crt_path) = store
            .material_paths(
                b"CERT\n",
                b"KEY\n",
                &[b"ROOT1\n".to_vec(), b"ROOT2\n".to_vec()],
            )
            .expect("material");

        assert_eq!(std::fs::read(&crt_path).expect("read"), b"CERT\nKEY\n");
        assert_eq!(std::fs::read(&ca_path).expect("read"), b"ROOT1\nROOT2\n");
    }

    #[test]
    fn concurrent_stores_converge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CertificateStore::new(dir.path());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.store(b"shared content").expect("store"))
            })
            .collect();

        let paths: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
    }
}
