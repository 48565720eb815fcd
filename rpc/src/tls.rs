// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! TLS client configuration from PEM key/cert/chain paths.
//!
//! Certified clients authenticate with a private key and client
//! certificate; uncertified clients connect with server verification only
//! and authenticate at the Blade layer instead.

use crate::Error;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Paths to the PEM materials used to build a client TLS context.
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial<'a> {
    pub private_key_path: Option<&'a Path>,
    pub client_cert_path: Option<&'a Path>,
    pub cert_chain_path: Option<&'a Path>,
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::Io)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

/// Build a rustls client config from the given materials.
///
/// The trust store is the platform store plus, when given, the configured
/// certificate chain; mutual auth is enabled when both a key and a client
/// certificate are configured.
pub fn client_config(material: &TlsMaterial<'_>) -> Result<Arc<rustls::ClientConfig>, Error> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        // Unusable platform anchors are skipped, same as a browser would.
        let _ = roots.add(cert);
    }
    if let Some(chain) = material.cert_chain_path {
        for cert in read_certs(chain)? {
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("bad chain certificate: {e}")))?;
        }
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let config = match (material.private_key_path, material.client_cert_path) {
        (Some(key), Some(cert)) => builder
            .with_client_auth_cert(read_certs(cert)?, read_key(key)?)
            .map_err(|e| Error::Tls(format!("client auth rejected: {e}")))?,
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_file_is_an_io_error() {
        let material = TlsMaterial {
            private_key_path: Some(Path::new("/definitely/not/here.pem")),
            client_cert_path: Some(Path::new("/definitely/not/here.crt")),
            cert_chain_path: None,
        };
        assert!(matches!(client_config(&material), Err(Error::Io(_))));
    }

    #[test]
    fn no_client_materials_builds_a_verify_only_config() {
        client_config(&TlsMaterial::default()).unwrap();
    }
}
