//! Node agent's connection to the registry.
//!
//! [`RegistryLink::run`] keeps the node registered: it connects, registers
//! with a fresh capacity snapshot, then heartbeats and flushes capacity
//! deltas every interval.  When the registry goes away it reconnects after
//! the retry delay and registers again.  On shutdown it unregisters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::reporter::{CapacityReporter, CapacitySink};
use crate::error::CsiError;
use crate::message::{CsiMessage, unexpected};
use crate::transport::CsiClient;
use crate::types::{CapacityDelta, DeviceMode, ModeCapacity, NodeIdentity, RegisterNodeRequest};

#[derive(Debug, Clone)]
pub struct LinkTimings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub retry_delay: Duration,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
        }
    }
}

pub struct RegistryLink {
    identity: NodeIdentity,
    /// `host:port` of the registry.
    endpoint: String,
    server_name: String,
    tls: rustls::ClientConfig,
    timings: LinkTimings,
    client: RwLock<Option<Arc<CsiClient>>>,
}

impl RegistryLink {
    pub fn new(
        identity: NodeIdentity,
        endpoint: impl Into<String>,
        server_name: impl Into<String>,
        tls: rustls::ClientConfig,
        timings: LinkTimings,
    ) -> Self {
        Self {
            identity,
            endpoint: endpoint.into(),
            server_name: server_name.into(),
            tls,
            timings,
            client: RwLock::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    fn unreachable(&self, e: impl std::fmt::Display) -> CsiError {
        CsiError::NodeUnreachable(format!("registry {}: {e}", self.endpoint))
    }

    /// The live connection, if any.
    async fn current(&self) -> Result<Arc<CsiClient>, CsiError> {
        match self.client.read().await.as_ref() {
            Some(client) if !client.is_closed() => Ok(Arc::clone(client)),
            _ => Err(self.unreachable("not connected")),
        }
    }

    async fn connect(&self) -> Result<Arc<CsiClient>, CsiError> {
        let addr = tokio::net::lookup_host(&self.endpoint)
            .await
            .map_err(|e| self.unreachable(e))?
            .next()
            .ok_or_else(|| self.unreachable("address did not resolve"))?;
        let client = tokio::time::timeout(
            self.timings.connect_timeout,
            CsiClient::connect(addr, &self.server_name, self.tls.clone()),
        )
        .await
        .map_err(|_| self.unreachable("connect timed out"))?
        .map_err(|e| self.unreachable(e))?
        .with_request_timeout(self.timings.request_timeout);
        let client = Arc::new(client);
        *self.client.write().await = Some(Arc::clone(&client));
        debug!(endpoint = %self.endpoint, "connected to registry");
        Ok(client)
    }

    async fn disconnect(&self) {
        if let Some(client) = self.client.write().await.take() {
            client.close();
        }
    }

    async fn call(&self, msg: CsiMessage) -> Result<CsiMessage, CsiError> {
        self.current().await?.call(&msg).await
    }

    /// Connect and register with a snapshot taken from `reporter`.
    #[instrument(skip_all, fields(node = %self.identity.node_id))]
    pub async fn register(&self, reporter: &CapacityReporter) -> Result<(), CsiError> {
        self.connect().await?;
        let capacity = reporter.reset().await?;
        let reply = self
            .call(CsiMessage::RegisterNode(RegisterNodeRequest {
                identity: self.identity.clone(),
                capacity,
            }))
            .await?;
        match reply {
            CsiMessage::Ok => {
                info!(endpoint = %self.endpoint, "registered with registry");
                Ok(())
            }
            other => Err(unexpected(&other)),
        }
    }

    pub async fn heartbeat(&self) -> Result<(), CsiError> {
        match self
            .call(CsiMessage::Heartbeat {
                node_id: self.identity.node_id.clone(),
            })
            .await?
        {
            CsiMessage::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn unregister(&self) -> Result<(), CsiError> {
        let reply = self
            .call(CsiMessage::UnregisterNode {
                node_id: self.identity.node_id.clone(),
            })
            .await;
        self.disconnect().await;
        match reply? {
            CsiMessage::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Stay registered until `shutdown` fires.
    pub async fn run(self: Arc<Self>, reporter: Arc<CapacityReporter>, shutdown: CancellationToken) {
        'outer: while !shutdown.is_cancelled() {
            if let Err(e) = self.register(&reporter).await {
                if e.is_retryable() {
                    warn!(error = %e, retry_in = ?self.timings.retry_delay, "registration failed");
                } else {
                    error!(error = %e, retry_in = ?self.timings.retry_delay, "registration rejected");
                }
                self.disconnect().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break 'outer,
                    _ = tokio::time::sleep(self.timings.retry_delay) => continue 'outer,
                }
            }

            let mut ticker = tokio::time::interval(self.timings.heartbeat_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break 'outer,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.heartbeat().await {
                    warn!(error = %e, "heartbeat failed, reconnecting");
                    self.disconnect().await;
                    continue 'outer;
                }
                match reporter.sync().await {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => debug!(error = %e, "capacity sync deferred"),
                    Err(e) => {
                        // The registry no longer accepts this registration.
                        warn!(error = %e, "capacity sync rejected, registering again");
                        self.disconnect().await;
                        continue 'outer;
                    }
                }
            }
        }

        match self.unregister().await {
            Ok(()) => info!("unregistered from registry"),
            Err(e) => warn!(error = %e, "unregister failed"),
        }
    }
}

#[async_trait]
impl CapacitySink for RegistryLink {
    async fn push(
        &self,
        mode: DeviceMode,
        seq: u64,
        delta: CapacityDelta,
    ) -> Result<ModeCapacity, CsiError> {
        match self
            .call(CsiMessage::UpdateCapacity {
                node_id: self.identity.node_id.clone(),
                mode,
                seq,
                delta,
            })
            .await?
        {
            CsiMessage::ModeCapacity(capacity) => Ok(capacity),
            other => Err(unexpected(&other)),
        }
    }
}
