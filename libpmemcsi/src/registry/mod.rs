//! Node registry: who the node agents are, how to reach them and how much
//! PMEM each one has left.
//!
//! The table lives in memory on the controller.  Node agents register over
//! the mutual-TLS fabric and from then on are the only writers of their own
//! row: every call is checked against the certificate fingerprint recorded
//! at registration.  Liveness is decided by heartbeat age alone.

mod client;
mod reporter;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::context::Peer;
use crate::error::CsiError;
use crate::types::{
    CapacityDelta, CapacityReport, DeviceMode, ModeCapacity, NodeIdentity, NodeStatus,
    NodeSummary, RegisterNodeRequest,
};

pub use client::{LinkTimings, RegistryLink};
pub use reporter::{CapacityReporter, CapacitySink, RegistrySink};

pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Registry: Send + Sync {
    /// Add or replace the caller's node record.
    async fn register_node(&self, caller: &Peer, req: RegisterNodeRequest)
    -> Result<(), CsiError>;

    /// Mark the node as gone.  The row is kept so deletes can still be
    /// routed once the node comes back.
    async fn unregister_node(&self, caller: &Peer, node_id: &str) -> Result<(), CsiError>;

    /// Apply a capacity delta computed by the node; returns the new figure.
    ///
    /// `seq` increases with every new delta a node sends for `mode`.  A delta
    /// whose `seq` was already applied is a resend after a lost reply and
    /// leaves the figure unchanged.
    async fn update_capacity(
        &self,
        caller: &Peer,
        node_id: &str,
        mode: DeviceMode,
        seq: u64,
        delta: CapacityDelta,
    ) -> Result<ModeCapacity, CsiError>;

    async fn heartbeat(&self, caller: &Peer, node_id: &str) -> Result<(), CsiError>;

    /// Every known node, sorted by id.
    async fn list_nodes(&self) -> Result<Vec<NodeSummary>, CsiError>;

    async fn get_capacity(&self, node_id: &str, mode: DeviceMode)
    -> Result<ModeCapacity, CsiError>;
}

#[derive(Debug, Clone)]
struct NodeRecord {
    identity: NodeIdentity,
    capacity: CapacityReport,
    last_seen: Instant,
    registered: bool,
    /// Highest delta sequence number applied per mode.
    applied: BTreeMap<DeviceMode, u64>,
}

/// In-memory [`Registry`].
pub struct NodeRegistry {
    nodes: DashMap<String, NodeRecord>,
    heartbeat_timeout: Duration,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_TIMEOUT)
    }
}

fn caller_fingerprint(caller: &Peer) -> Result<&str, CsiError> {
    caller
        .fingerprint
        .as_deref()
        .ok_or_else(|| CsiError::Unauthenticated("no client certificate".into()))
}

impl NodeRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            nodes: DashMap::new(),
            heartbeat_timeout,
        }
    }

    fn status(&self, record: &NodeRecord) -> NodeStatus {
        if record.registered && record.last_seen.elapsed() <= self.heartbeat_timeout {
            NodeStatus::Reachable
        } else {
            NodeStatus::Unreachable
        }
    }

    fn summary(&self, record: &NodeRecord) -> NodeSummary {
        NodeSummary {
            identity: record.identity.clone(),
            status: self.status(record),
            capacity: record.capacity.clone(),
        }
    }

    /// Only the certificate a node registered with may change its row.
    fn authorize(caller: &Peer, record: &NodeRecord) -> Result<(), CsiError> {
        let fingerprint = caller_fingerprint(caller)?;
        if fingerprint != record.identity.fingerprint {
            return Err(CsiError::StaleRegistration(format!(
                "caller is not the registered owner of node {}",
                record.identity.node_id
            )));
        }
        Ok(())
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|r| self.status(&r))
    }
}

#[async_trait]
impl Registry for NodeRegistry {
    #[instrument(skip(self, caller, req), fields(node = %req.identity.node_id))]
    async fn register_node(
        &self,
        caller: &Peer,
        req: RegisterNodeRequest,
    ) -> Result<(), CsiError> {
        let fingerprint = caller_fingerprint(caller)?;
        if fingerprint != req.identity.fingerprint {
            return Err(CsiError::Unauthenticated(format!(
                "certificate does not match the fingerprint claimed for node {}",
                req.identity.node_id
            )));
        }
        if req.identity.node_id.is_empty() {
            return Err(CsiError::InvalidArgument("missing node id".into()));
        }
        if req.identity.endpoint.is_empty() {
            return Err(CsiError::InvalidArgument("missing endpoint address".into()));
        }
        // The controller dials `server_name` and checks it against the
        // certificate, so both must be the node id.
        if req.identity.server_name != req.identity.node_id
            || !caller.is_named(&req.identity.node_id)
        {
            warn!("certificate is not issued for the claimed node");
            return Err(CsiError::StaleRegistration(format!(
                "certificate is not valid for node {}",
                req.identity.node_id
            )));
        }

        let record = NodeRecord {
            identity: req.identity.clone(),
            capacity: req.capacity,
            last_seen: Instant::now(),
            registered: true,
            applied: BTreeMap::new(),
        };
        match self.nodes.entry(req.identity.node_id.clone()) {
            Entry::Occupied(mut existing) => {
                let live = self.status(existing.get()) == NodeStatus::Reachable;
                if live && existing.get().identity.fingerprint != req.identity.fingerprint {
                    warn!("live registration with another certificate, rejecting");
                    return Err(CsiError::StaleRegistration(format!(
                        "node {} is registered with a different certificate",
                        req.identity.node_id
                    )));
                }
                existing.insert(record);
                info!(endpoint = %req.identity.endpoint, "node re-registered");
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                info!(endpoint = %req.identity.endpoint, "node registered");
            }
        }
        Ok(())
    }

    #[instrument(skip(self, caller))]
    async fn unregister_node(&self, caller: &Peer, node_id: &str) -> Result<(), CsiError> {
        let Some(mut record) = self.nodes.get_mut(node_id) else {
            debug!("unknown node, nothing to unregister");
            return Ok(());
        };
        Self::authorize(caller, &record)?;
        record.registered = false;
        info!("node unregistered");
        Ok(())
    }

    #[instrument(skip(self, caller), fields(total = delta.total, available = delta.available))]
    async fn update_capacity(
        &self,
        caller: &Peer,
        node_id: &str,
        mode: DeviceMode,
        seq: u64,
        delta: CapacityDelta,
    ) -> Result<ModeCapacity, CsiError> {
        let mut record = self.nodes.get_mut(node_id).ok_or_else(|| {
            CsiError::FailedPrecondition(format!("node {node_id} is not registered"))
        })?;
        Self::authorize(caller, &record)?;
        if !record.registered {
            return Err(CsiError::FailedPrecondition(format!(
                "node {node_id} is not registered"
            )));
        }
        record.last_seen = Instant::now();
        let applied = record.applied.get(&mode).copied().unwrap_or(0);
        if seq <= applied {
            debug!(seq, applied, "delta already applied");
            return Ok(record.capacity.get(mode));
        }
        record.applied.insert(mode, seq);
        let entry = record.capacity.modes.entry(mode).or_default();
        entry.apply(delta);
        let updated = *entry;
        debug!(
            total = updated.total,
            available = updated.available,
            "capacity updated"
        );
        Ok(updated)
    }

    async fn heartbeat(&self, caller: &Peer, node_id: &str) -> Result<(), CsiError> {
        let mut record = self.nodes.get_mut(node_id).ok_or_else(|| {
            CsiError::FailedPrecondition(format!("node {node_id} is not registered"))
        })?;
        Self::authorize(caller, &record)?;
        if !record.registered {
            return Err(CsiError::FailedPrecondition(format!(
                "node {node_id} is not registered"
            )));
        }
        record.last_seen = Instant::now();
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeSummary>, CsiError> {
        let mut nodes: Vec<NodeSummary> = self.nodes.iter().map(|r| self.summary(&r)).collect();
        nodes.sort_by(|a, b| a.identity.node_id.cmp(&b.identity.node_id));
        Ok(nodes)
    }

    async fn get_capacity(
        &self,
        node_id: &str,
        mode: DeviceMode,
    ) -> Result<ModeCapacity, CsiError> {
        self.nodes
            .get(node_id)
            .map(|r| r.capacity.get(mode))
            .ok_or_else(|| CsiError::NodeUnreachable(node_id.to_owned()))
    }
}
