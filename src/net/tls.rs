//! TLS configuration and certificate loading.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;
use thiserror::Error;

use crate::config::schema::TlsConfig;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("{kind} file not found: {path}")]
    NotFound { kind: &'static str, path: String },

    #[error("error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no private key found in {0}")]
    MissingKey(String),

    #[error("HTTP TLS enabled without cert_file and key_file")]
    Incomplete,
}

/// Parsed certificate chain and key, compared on reload so that a rotated
/// certificate restarts the listeners even when the paths are unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub certs: Vec<Vec<u8>>,
    pub key: Vec<u8>,
}

impl TlsMaterial {
    /// Load the HTTP TLS material, if HTTP TLS is enabled.
    pub fn load(tls: &TlsConfig) -> Result<Option<Self>, TlsError> {
        if !tls.http_enabled() {
            return Ok(None);
        }
        let (Some(cert), Some(key)) = (tls.cert_file.as_deref(), tls.key_file.as_deref()) else {
            return Err(TlsError::Incomplete);
        };

        let certs = rustls_pemfile::certs(&mut open(cert, "Certificate")?)
            .map(|c| c.map(|c| c.as_ref().to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TlsError::Io {
                path: cert.to_string(),
                source,
            })?;

        let key_der = rustls_pemfile::private_key(&mut open(key, "Private key")?)
            .map_err(|source| TlsError::Io {
                path: key.to_string(),
                source,
            })?
            .ok_or_else(|| TlsError::MissingKey(key.to_string()))?;

        Ok(Some(Self {
            certs,
            key: key_der.secret_der().to_vec(),
        }))
    }
}

fn open(path: &str, kind: &'static str) -> Result<BufReader<File>, TlsError> {
    if !Path::new(path).exists() {
        return Err(TlsError::NotFound {
            kind,
            path: path.to_string(),
        });
    }
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })
}

/// Load a rustls server configuration from certificate and key files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, std::io::Error> {
    RustlsConfig::from_pem_file(cert_path, key_path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tls_loads_nothing() {
        assert_eq!(TlsMaterial::load(&TlsConfig::default()).unwrap(), None);
    }

    #[test]
    fn enabled_tls_requires_files() {
        let mut tls = TlsConfig {
            enable_http: Some(true),
            ..TlsConfig::default()
        };
        assert!(matches!(TlsMaterial::load(&tls), Err(TlsError::Incomplete)));

        tls.cert_file = Some("/nonexistent/agent.pem".into());
        tls.key_file = Some("/nonexistent/agent-key.pem".into());
        assert!(matches!(
            TlsMaterial::load(&tls),
            Err(TlsError::NotFound { kind: "Certificate", .. })
        ));
    }

    #[test]
    fn pem_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();

        let tls = TlsConfig {
            enable_http: Some(true),
            cert_file: Some(cert.display().to_string()),
            key_file: Some(key.display().to_string()),
            ..TlsConfig::default()
        };
        assert!(matches!(TlsMaterial::load(&tls), Err(TlsError::MissingKey(_))));
    }
}
