// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! TLS certificate loading. The resolver re-reads the PEM files on every
//! handshake so certificates can be rotated without a restart, falling back
//! to the last good pair when the files are unreadable mid-rotation.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use log::{error, warn};
use parking_lot::RwLock;
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read certificate material: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid certificate or key: {0}")]
    Invalid(String),
}

pub struct ReloadingCertResolver {
    cert_file: String,
    key_file: String,
    cached: RwLock<Arc<CertifiedKey>>,
}

impl fmt::Debug for ReloadingCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadingCertResolver")
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .finish()
    }
}

impl ReloadingCertResolver {
    /// Fails when the initial pair cannot be loaded, so a misconfigured
    /// server refuses to start instead of serving no certificate.
    pub fn new(cert_file: &str, key_file: &str) -> Result<Self, TlsError> {
        let cached = load_certified_key(cert_file, key_file)?;
        Ok(ReloadingCertResolver {
            cert_file: cert_file.to_string(),
            key_file: key_file.to_string(),
            cached: RwLock::new(cached),
        })
    }
}

impl ResolvesServerCert for ReloadingCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match load_certified_key(&self.cert_file, &self.key_file) {
            Ok(key) => {
                *self.cached.write() = key.clone();
                Some(key)
            }
            Err(e) => {
                error!("cert: failed to read new certifications: {e}");
                warn!("cert: fallback to the cached certification");
                Some(self.cached.read().clone())
            }
        }
    }
}

fn load_certified_key(cert_file: &str, key_file: &str) -> Result<Arc<CertifiedKey>, TlsError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::Invalid(format!(
            "no certificates found in {cert_file}"
        )));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_file)?))?
        .ok_or_else(|| TlsError::Invalid(format!("no private key found in {key_file}")))?;
    let signing_key =
        any_supported_type(&key).map_err(|e| TlsError::Invalid(e.to_string()))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Server config with the reloading resolver plugged in.
pub fn server_config(cert_file: &str, key_file: &str) -> Result<rustls::ServerConfig, TlsError> {
    let resolver = ReloadingCertResolver::new(cert_file, key_file)?;
    Ok(rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver)))
}
