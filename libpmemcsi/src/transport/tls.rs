//! Mutual TLS for the QUIC fabric.
//!
//! Every endpoint presents a certificate issued by the cluster CA and
//! requires one from its peer.  A peer is identified by the SHA-256
//! fingerprint of its DER leaf certificate.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CsiError;

pub const ALPN: &[u8] = b"pmem-csi/1";

/// PEM files for one endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl TlsConfig {
    pub fn is_configured(&self) -> bool {
        !self.ca_file.as_os_str().is_empty()
            && !self.cert_file.as_os_str().is_empty()
            && !self.key_file.as_os_str().is_empty()
    }
}

fn tls_error(what: &str, e: impl std::fmt::Display) -> CsiError {
    CsiError::TransportError(format!("{what}: {e}"))
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CsiError> {
    let file = std::fs::File::open(path)
        .map_err(|e| tls_error(&format!("open {}", path.display()), e))?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(&format!("parse {}", path.display()), e))?;
    if certs.is_empty() {
        return Err(CsiError::TransportError(format!(
            "no certificate in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CsiError> {
    let file = std::fs::File::open(path)
        .map_err(|e| tls_error(&format!("open {}", path.display()), e))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error(&format!("parse {}", path.display()), e))?
        .ok_or_else(|| CsiError::TransportError(format!("no private key in {}", path.display())))
}

/// Lowercase hex SHA-256 of a DER certificate.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

/// Leaf certificate the peer presented, if any.
pub fn peer_certificate(conn: &quinn::Connection) -> Option<CertificateDer<'static>> {
    let identity = conn.peer_identity()?;
    let certs = identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
    certs.first().cloned()
}

/// Fingerprint of the leaf certificate the peer presented, if any.
pub fn peer_fingerprint(conn: &quinn::Connection) -> Option<String> {
    peer_certificate(conn).as_ref().map(fingerprint)
}

/// Whether `cert` is valid for the DNS name `name`.  Unparseable
/// certificates and names are valid for nothing.
pub fn certificate_names(cert: &CertificateDer<'_>, name: &str) -> bool {
    let Ok(name) = ServerName::try_from(name) else {
        return false;
    };
    webpki::EndEntityCert::try_from(cert)
        .is_ok_and(|cert| cert.verify_is_valid_for_subject_name(&name).is_ok())
}

/// CA roots plus this endpoint's own chain and key.
#[derive(Debug)]
pub struct TlsIdentity {
    roots: Vec<CertificateDer<'static>>,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            roots: self.roots.clone(),
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl TlsIdentity {
    pub fn new(
        roots: Vec<CertificateDer<'static>>,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, CsiError> {
        if roots.is_empty() || chain.is_empty() {
            return Err(CsiError::TransportError(
                "TLS identity needs a CA and a certificate".into(),
            ));
        }
        Ok(Self { roots, chain, key })
    }

    pub fn load(config: &TlsConfig) -> Result<Self, CsiError> {
        Self::new(
            load_certs(&config.ca_file)?,
            load_certs(&config.cert_file)?,
            load_private_key(&config.key_file)?,
        )
    }

    /// Fingerprint of our own leaf certificate.
    pub fn fingerprint(&self) -> String {
        self.chain.first().map(fingerprint).unwrap_or_default()
    }

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    fn root_store(&self) -> Result<RootCertStore, CsiError> {
        let mut store = RootCertStore::empty();
        for cert in &self.roots {
            store
                .add(cert.clone())
                .map_err(|e| tls_error("add CA certificate", e))?;
        }
        Ok(store)
    }

    /// Server side: client certificates signed by the CA are mandatory.
    pub fn server_config(&self) -> Result<rustls::ServerConfig, CsiError> {
        let provider = Self::provider();
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(self.root_store()?), provider.clone())
                .build()
                .map_err(|e| tls_error("client verifier", e))?;
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| tls_error("server protocol versions", e))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| tls_error("server certificate", e))?;
        config.alpn_protocols = vec![ALPN.to_vec()];
        Ok(config)
    }

    pub fn client_config(&self) -> Result<rustls::ClientConfig, CsiError> {
        let mut config = rustls::ClientConfig::builder_with_provider(Self::provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| tls_error("client protocol versions", e))?
            .with_root_certificates(self.root_store()?)
            .with_client_auth_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| tls_error("client certificate", e))?;
        config.alpn_protocols = vec![ALPN.to_vec()];
        Ok(config)
    }
}
