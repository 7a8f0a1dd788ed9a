//! Local Unix socket endpoint for the orchestrator-facing CSI services.
//!
//! Frames are length-delimited JSON: a [`Request`] from the caller, a
//! [`CsiMessage`] back.  Requests on one connection are answered in order.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatch::Dispatcher;
use crate::context::Peer;
use crate::error::CsiError;
use crate::message::{CsiMessage, MAX_MESSAGE_SIZE, Request};

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_MESSAGE_SIZE)
        .new_codec()
}

pub struct LocalServer {
    path: PathBuf,
    listener: UnixListener,
    dispatcher: Dispatcher,
}

impl LocalServer {
    /// Bind `path`, replacing a stale socket left by a previous run.
    pub fn bind(path: impl Into<PathBuf>, dispatcher: Dispatcher) -> Result<Self, CsiError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(CsiError::transport)?;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CsiError::transport(e)),
        }
        let listener = UnixListener::bind(&path).map_err(CsiError::transport)?;
        info!(path = %path.display(), "CSI socket listening");
        Ok(Self {
            path,
            listener,
            dispatcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve until `shutdown` fires, then remove the socket file.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), CsiError> {
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            let dispatcher = self.dispatcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, dispatcher, shutdown).await {
                    warn!(error = %e, "CSI socket connection error");
                }
            });
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "socket already gone");
        }
        Ok(())
    }

    async fn handle_connection(
        stream: UnixStream,
        dispatcher: Dispatcher,
        shutdown: CancellationToken,
    ) -> Result<(), CsiError> {
        let mut framed = Framed::new(stream, codec());
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                frame = framed.next() => match frame {
                    Some(frame) => frame.map_err(CsiError::transport)?,
                    None => return Ok(()),
                },
            };
            let response = match serde_json::from_slice::<Request>(&frame) {
                Ok(request) => dispatcher.handle(Peer::local(), request).await,
                Err(e) => CsiMessage::Error(CsiError::TransportError(format!(
                    "malformed request: {e}"
                ))),
            };
            let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
            framed
                .send(Bytes::from(payload))
                .await
                .map_err(CsiError::transport)?;
        }
    }
}

/// Client side of the local socket, used by tooling and tests.
pub struct LocalClient {
    framed: Mutex<Framed<UnixStream, LengthDelimitedCodec>>,
}

impl LocalClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, CsiError> {
        let stream = UnixStream::connect(path).await.map_err(CsiError::transport)?;
        Ok(Self {
            framed: Mutex::new(Framed::new(stream, codec())),
        })
    }

    pub async fn request(&self, request: Request) -> Result<CsiMessage, CsiError> {
        let payload = serde_json::to_vec(&request).map_err(CsiError::internal)?;
        let mut framed = self.framed.lock().await;
        framed
            .send(Bytes::from(payload))
            .await
            .map_err(CsiError::transport)?;
        let frame = framed
            .next()
            .await
            .ok_or_else(|| CsiError::TransportError("connection closed".into()))?
            .map_err(CsiError::transport)?;
        serde_json::from_slice(&frame).map_err(CsiError::transport)
    }

    pub async fn call(&self, message: CsiMessage) -> Result<CsiMessage, CsiError> {
        self.request(Request::new(message)).await?.into_result()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::identity::CsiIdentity;
    use crate::types::{PluginCapability, PluginInfo};

    struct Fixed;

    #[async_trait]
    impl CsiIdentity for Fixed {
        async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
            Ok(PluginInfo {
                name: "rk8s.pmem.csi".into(),
                vendor_version: "test".into(),
            })
        }

        async fn probe(&self) -> Result<bool, CsiError> {
            Ok(true)
        }

        async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
            Ok(vec![PluginCapability::ControllerService])
        }
    }

    #[tokio::test]
    async fn serves_requests_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("csi.sock");
        let server = LocalServer::bind(&path, Dispatcher::new().with_identity(Arc::new(Fixed)))
            .unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.serve(shutdown.clone()));

        let client = LocalClient::connect(&path).await.unwrap();
        let info = client.call(CsiMessage::GetPluginInfo).await.unwrap();
        assert!(matches!(info, CsiMessage::PluginInfoResponse(ref i) if i.name == "rk8s.pmem.csi"));
        let probe = client.call(CsiMessage::Probe).await.unwrap();
        assert!(matches!(probe, CsiMessage::ProbeResult(true)));

        // Node calls are not served by an identity-only dispatcher.
        let err = client.call(CsiMessage::GetNodeInfo).await.unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("csi.sock");
        std::fs::write(&path, b"stale").unwrap();
        let server = LocalServer::bind(&path, Dispatcher::new()).unwrap();
        assert_eq!(server.path(), path.as_path());
    }
}
