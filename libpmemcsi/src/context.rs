//! Per-call context handed to long-running operations.

use std::time::Duration;

use rustls::pki_types::CertificateDer;
use tokio_util::sync::CancellationToken;

use crate::transport::tls::{certificate_names, fingerprint};

/// The authenticated caller on the other end of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Peer {
    /// Lowercase hex SHA-256 of the caller's DER leaf certificate.  `None`
    /// for local socket callers and connections without a client certificate.
    pub fingerprint: Option<String>,
    certificate: Option<CertificateDer<'static>>,
}

impl Peer {
    pub fn local() -> Self {
        Self::default()
    }

    /// A caller known only by fingerprint.  It is not named by any DNS name.
    pub fn with_fingerprint(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: Some(fingerprint.into()),
            certificate: None,
        }
    }

    /// The caller that presented `certificate` as its leaf.
    pub fn from_certificate(certificate: CertificateDer<'static>) -> Self {
        Self {
            fingerprint: Some(fingerprint(&certificate)),
            certificate: Some(certificate),
        }
    }

    /// Whether the caller's certificate is valid for the DNS name `name`.
    pub fn is_named(&self, name: &str) -> bool {
        self.certificate
            .as_ref()
            .is_some_and(|cert| certificate_names(cert, name))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub peer: Peer,
    /// Fired when the caller's deadline passes or the connection goes away.
    pub cancel: CancellationToken,
    pub deadline: Option<Duration>,
}

impl CallContext {
    /// Context for in-process callers: no peer, never cancelled.
    pub fn local() -> Self {
        Self::default()
    }

    pub fn for_peer(peer: Peer) -> Self {
        Self {
            peer,
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A context sharing the peer whose token is cancelled together with
    /// this one.
    pub fn child(&self) -> Self {
        Self {
            peer: self.peer.clone(),
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }
}

/// A peer holding a self-signed certificate for `name`.
#[cfg(test)]
pub(crate) fn named_peer(name: &str) -> Peer {
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec![name.to_owned()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    Peer::from_certificate(cert.der().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_names_come_from_the_certificate() {
        let peer = named_peer("worker-1");
        assert!(peer.is_named("worker-1"));
        assert!(!peer.is_named("worker-2"));
        assert_eq!(peer.fingerprint.as_deref().map(str::len), Some(64));

        assert!(!Peer::with_fingerprint("aa").is_named("aa"));
        assert!(!Peer::local().is_named(""));
    }
}
