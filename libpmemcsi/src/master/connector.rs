//! Reaching a node agent's [`NodeControl`] service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::context::CallContext;
use crate::error::CsiError;
use crate::message::{CsiMessage, unexpected};
use crate::node::NodeControl;
use crate::transport::CsiClient;
use crate::types::{CapacityReport, NodeCreateVolumeRequest, NodeIdentity, Volume, VolumeId};

#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, node: &NodeIdentity) -> Result<Arc<dyn NodeControl>, CsiError>;
}

/// In-process node agents, keyed by node id.
#[derive(Default)]
pub struct LocalConnector {
    nodes: DashMap<String, Arc<dyn NodeControl>>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node_id: impl Into<String>, node: Arc<dyn NodeControl>) {
        self.nodes.insert(node_id.into(), node);
    }

    /// Simulate a node going away.
    pub fn remove(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }
}

#[async_trait]
impl NodeConnector for LocalConnector {
    async fn connect(&self, node: &NodeIdentity) -> Result<Arc<dyn NodeControl>, CsiError> {
        self.nodes
            .get(&node.node_id)
            .map(|n| Arc::clone(n.value()))
            .ok_or_else(|| CsiError::NodeUnreachable(node.node_id.clone()))
    }
}

/// Node agents over the mutual-TLS QUIC fabric.  Connections are cached per
/// node and replaced once closed.
pub struct QuicConnector {
    tls: rustls::ClientConfig,
    connect_timeout: Duration,
    request_timeout: Duration,
    clients: DashMap<String, Arc<RemoteNode>>,
}

impl QuicConnector {
    pub fn new(
        tls: rustls::ClientConfig,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            tls,
            connect_timeout,
            request_timeout,
            clients: DashMap::new(),
        }
    }

    async fn dial(&self, node: &NodeIdentity) -> Result<RemoteNode, CsiError> {
        let unreachable = |e: &dyn std::fmt::Display| {
            CsiError::NodeUnreachable(format!("{} at {}: {e}", node.node_id, node.endpoint))
        };
        let addr = tokio::net::lookup_host(&node.endpoint)
            .await
            .map_err(|e| unreachable(&e))?
            .next()
            .ok_or_else(|| unreachable(&"address did not resolve"))?;
        let client = tokio::time::timeout(
            self.connect_timeout,
            CsiClient::connect(addr, &node.server_name, self.tls.clone()),
        )
        .await
        .map_err(|_| unreachable(&"connect timed out"))?
        .map_err(|e| unreachable(&e))?
        .with_request_timeout(self.request_timeout);

        // The CA vouches for the name; the registry vouches for the key.
        if client.peer_fingerprint().as_deref() != Some(node.fingerprint.as_str()) {
            client.close();
            return Err(CsiError::StaleRegistration(format!(
                "node {} presented a certificate other than the registered one",
                node.node_id
            )));
        }
        Ok(RemoteNode {
            node_id: node.node_id.clone(),
            fingerprint: node.fingerprint.clone(),
            client,
        })
    }
}

#[async_trait]
impl NodeConnector for QuicConnector {
    #[instrument(skip(self, node), fields(node = %node.node_id))]
    async fn connect(&self, node: &NodeIdentity) -> Result<Arc<dyn NodeControl>, CsiError> {
        if let Some(cached) = self.clients.get(&node.node_id) {
            if !cached.client.is_closed() && cached.fingerprint == node.fingerprint {
                return Ok(Arc::clone(cached.value()) as Arc<dyn NodeControl>);
            }
        }
        let remote = Arc::new(self.dial(node).await?);
        debug!(endpoint = %node.endpoint, "connected to node");
        if let Some(old) = self
            .clients
            .insert(node.node_id.clone(), Arc::clone(&remote))
        {
            old.client.close();
        }
        Ok(remote)
    }
}

/// [`NodeControl`] proxy for one remote node.
pub struct RemoteNode {
    node_id: String,
    fingerprint: String,
    client: CsiClient,
}

impl RemoteNode {
    async fn call(&self, msg: CsiMessage) -> Result<CsiMessage, CsiError> {
        self.client.call(&msg).await.map_err(|e| match e {
            CsiError::TransportError(reason) => {
                CsiError::NodeUnreachable(format!("{}: {reason}", self.node_id))
            }
            other => other,
        })
    }
}

#[async_trait]
impl NodeControl for RemoteNode {
    async fn create_volume(
        &self,
        _ctx: &CallContext,
        req: NodeCreateVolumeRequest,
    ) -> Result<Volume, CsiError> {
        match self.call(CsiMessage::NodeCreateVolume(req)).await? {
            CsiMessage::VolumeCreated(volume) => Ok(volume),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete_volume(
        &self,
        _ctx: &CallContext,
        volume_id: &VolumeId,
    ) -> Result<bool, CsiError> {
        match self
            .call(CsiMessage::NodeDeleteVolume(volume_id.clone()))
            .await?
        {
            CsiMessage::VolumeDeleted(found) => Ok(found),
            other => Err(unexpected(&other)),
        }
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        match self.call(CsiMessage::NodeListVolumes).await? {
            CsiMessage::VolumeList(volumes) => Ok(volumes),
            other => Err(unexpected(&other)),
        }
    }

    async fn expand_volume(
        &self,
        _ctx: &CallContext,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<u64, CsiError> {
        match self
            .call(CsiMessage::NodeExpandVolume {
                volume_id: volume_id.clone(),
                capacity_bytes,
            })
            .await?
        {
            CsiMessage::VolumeExpanded(size) => Ok(size),
            other => Err(unexpected(&other)),
        }
    }

    async fn get_capacity(&self) -> Result<CapacityReport, CsiError> {
        match self.call(CsiMessage::NodeGetCapacity).await? {
            CsiMessage::Capacity(report) => Ok(report),
            other => Err(unexpected(&other)),
        }
    }
}
