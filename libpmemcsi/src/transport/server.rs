//! QUIC server for the internal fabric.
//!
//! Node agents serve [`NodeControl`] on it and the controller serves the
//! registry.  Every connection must present a client certificate; its
//! fingerprint is handed to the services as the caller's [`Peer`].
//!
//! [`NodeControl`]: crate::node::NodeControl

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use super::dispatch::Dispatcher;
use super::tls::peer_certificate;
use crate::context::Peer;
use crate::error::CsiError;
use crate::message::{CsiMessage, MAX_MESSAGE_SIZE, Request};

/// Accepts QUIC connections and dispatches each bi-stream's request.
pub struct CsiServer {
    endpoint: quinn::Endpoint,
    dispatcher: Dispatcher,
}

impl CsiServer {
    /// Create a new server bound to `addr`.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        dispatcher: Dispatcher,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(addr = %endpoint.local_addr().unwrap_or(addr), "QUIC server listening");
        Ok(Self {
            endpoint,
            dispatcher,
        })
    }

    /// Accept connections in a loop until the endpoint is closed.
    pub async fn serve(&self) -> Result<(), CsiError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        let peer = peer_certificate(&conn)
                            .map(Peer::from_certificate)
                            .unwrap_or_default();
                        debug!(%remote, fingerprint = ?peer.fingerprint, "connection accepted");
                        if let Err(e) = Self::handle_connection(conn, peer, dispatcher).await {
                            warn!(%remote, error = %e, "connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "incoming connection failed");
                    }
                }
            });
        }
        Ok(())
    }

    async fn handle_connection(
        conn: quinn::Connection,
        peer: Peer,
        dispatcher: Dispatcher,
    ) -> Result<(), CsiError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::LocallyClosed) => return Ok(()),
                Err(e) => return Err(CsiError::transport(e)),
            };

            let dispatcher = dispatcher.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, peer, &dispatcher).await {
                    error!(error = %e, "stream handler error");
                }
            });
        }
    }

    /// Read request, dispatch, write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        peer: Peer,
        dispatcher: &Dispatcher,
    ) -> Result<(), CsiError> {
        let buf = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(CsiError::transport)?;

        let response = match serde_json::from_slice::<Request>(&buf) {
            Ok(request) => {
                debug!(request = %request.message, "request received");
                dispatcher.handle(peer, request).await
            }
            Err(e) => CsiMessage::Error(CsiError::TransportError(format!(
                "malformed request: {e}"
            ))),
        };

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CsiError> {
        self.endpoint.local_addr().map_err(CsiError::transport)
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"server shutdown");
    }

    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}
