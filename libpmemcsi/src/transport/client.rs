//! QUIC client used by the controller to reach node agents and by node
//! agents to reach the registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicClientConfig;
use tracing::{debug, instrument};

use crate::error::CsiError;
use crate::message::{CsiMessage, MAX_MESSAGE_SIZE, Request};

/// Extra time the client waits beyond the deadline it sends, so the server's
/// own `DeadlineExceeded` answer normally arrives first.
const DEADLINE_SLACK: Duration = Duration::from_secs(1);

/// Sends [`CsiMessage`] requests over a single QUIC connection.
pub struct CsiClient {
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
    request_timeout: Option<Duration>,
}

impl CsiClient {
    /// Establish a new QUIC connection to the server at `addr`.
    ///
    /// `server_name` must match a SAN in the server's certificate.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, CsiError> {
        let quic_client_config = QuicClientConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));

        let bind: SocketAddr = if addr.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = quinn::Endpoint::client(bind).map_err(CsiError::transport)?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint
            .connect(addr, server_name)
            .map_err(CsiError::transport)?
            .await
            .map_err(CsiError::transport)?;

        debug!(%addr, %server_name, "QUIC connection established");
        Ok(Self {
            endpoint,
            connection,
            request_timeout: None,
        })
    }

    /// Attach `timeout` as the deadline of every request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// Each call opens a new bi-directional stream, writes the JSON request
    /// envelope, finishes the send side, then reads the full response.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let mut envelope = Request::new(msg.clone());
        match self.request_timeout {
            Some(timeout) => {
                envelope = envelope.with_deadline(timeout);
                tokio::time::timeout(timeout + DEADLINE_SLACK, self.exchange(&envelope))
                    .await
                    .map_err(|_| CsiError::DeadlineExceeded(msg.to_string()))?
            }
            None => self.exchange(&envelope).await,
        }
    }

    /// Like [`request`](Self::request) but turns an error reply into `Err`.
    pub async fn call(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        self.request(msg).await?.into_result()
    }

    async fn exchange(&self, envelope: &Request) -> Result<CsiMessage, CsiError> {
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(CsiError::transport)?;

        let payload = serde_json::to_vec(envelope).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;

        let buf = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(CsiError::transport)?;

        let response: CsiMessage = serde_json::from_slice(&buf).map_err(CsiError::transport)?;
        debug!(%response, "response received");
        Ok(response)
    }

    /// Fingerprint of the certificate the server presented.
    pub fn peer_fingerprint(&self) -> Option<String> {
        super::tls::peer_fingerprint(&self.connection)
    }

    /// `true` once the connection has been closed by either side.
    pub fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    /// Close the underlying QUIC connection gracefully.
    pub fn close(&self) {
        self.connection
            .close(quinn::VarInt::from_u32(0), b"client shutdown");
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"client shutdown");
    }
}
