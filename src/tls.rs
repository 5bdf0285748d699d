use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;

const MAX_KEY_BYTES: u64 = 10 * 1024;
const MAX_CERT_CHAIN_BYTES: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is too large", .path.display())]
    TooLarge { path: PathBuf },
    #[error("no certificates found in {}", .path.display())]
    NoCertificates { path: PathBuf },
    #[error("no private key found in {}", .path.display())]
    NoPrivateKey { path: PathBuf },
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

fn read_pem(path: &Path, max_bytes: u64) -> Result<Vec<u8>, TlsError> {
    let read_err = |source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut pem = Vec::new();
    File::open(path)
        .map_err(read_err)?
        .take(max_bytes + 1)
        .read_to_end(&mut pem)
        .map_err(read_err)?;

    if pem.len() as u64 > max_bytes {
        return Err(TlsError::TooLarge {
            path: path.to_path_buf(),
        });
    }
    Ok(pem)
}

/// Server config from a PEM private key and a PEM certificate chain.
pub fn load_server_config(key_path: &Path, cert_path: &Path) -> Result<ServerConfig, TlsError> {
    let cert_pem = read_pem(cert_path, MAX_CERT_CHAIN_BYTES)?;
    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates {
            path: cert_path.to_path_buf(),
        });
    }

    let key_pem = read_pem(key_path, MAX_KEY_BYTES)?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|source| TlsError::Read {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey {
            path: key_path.to_path_buf(),
        })?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(config)
}
