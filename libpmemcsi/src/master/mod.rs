//! Cluster-wide Controller service.
//!
//! The controller holds no PMEM.  It places each new volume on a node using
//! the registry's capacity table and forwards every lifecycle call to the
//! owning node's [`NodeControl`] service.  Volumes it has seen are cached;
//! after a restart the cache is refilled by asking the nodes.  Until every
//! registered node has been listed once, a volume missing from the cache may
//! still exist, so lookups fail with [`CsiError::NodeUnreachable`] rather than
//! report it absent.

mod connector;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::context::CallContext;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::node::NodeControl;
use crate::parameters::{Origin, VolumeParameters};
use crate::registry::Registry;
use crate::types::{
    CapacityReport, ControllerCapability, CreateVolumeRequest, DeviceMode, GetCapacityRequest,
    ListVolumesRequest, ListVolumesResponse, NodeCreateVolumeRequest, NodeStatus, NodeSummary,
    PluginCapability, PluginInfo, TopologyRequirement, Volume, VolumeCapability, VolumeId,
};

pub use connector::{LocalConnector, NodeConnector, QuicConnector, RemoteNode};

pub const DEFAULT_DRIVER_NAME: &str = "rk8s.pmem.csi";

/// Topology segment key naming the node a volume lives on.
pub fn topology_key(driver_name: &str) -> String {
    format!("{driver_name}/node")
}

/// Stable id for a volume name, so retried creates find the same volume.
pub fn volume_id_for(name: &str) -> VolumeId {
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    VolumeId(format!("pmem-{}", &digest[..40]))
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub driver_name: String,
    pub vendor_version: String,
    /// Mode for requests that do not name one.
    pub default_mode: DeviceMode,
    /// Nodes tried per create before giving up.
    pub max_attempts: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            default_mode: DeviceMode::Lvm,
            max_attempts: 2,
        }
    }
}

pub struct ControllerServer {
    options: ControllerOptions,
    topology_key: String,
    registry: Arc<dyn Registry>,
    connector: Arc<dyn NodeConnector>,
    volumes: DashMap<VolumeId, Volume>,
    /// Nodes whose volumes are all in `volumes`, with the certificate
    /// fingerprint they were listed under.
    inventoried: DashMap<String, String>,
    /// One marker per volume name with a create in progress.
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl ControllerServer {
    pub fn new(
        options: ControllerOptions,
        registry: Arc<dyn Registry>,
        connector: Arc<dyn NodeConnector>,
    ) -> Self {
        Self {
            topology_key: topology_key(&options.driver_name),
            options,
            registry,
            connector,
            volumes: DashMap::new(),
            inventoried: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    pub fn topology_key(&self) -> &str {
        &self.topology_key
    }

    fn owner(&self, volume: &Volume) -> Result<String, CsiError> {
        volume
            .node(&self.topology_key)
            .map(str::to_owned)
            .ok_or_else(|| {
                CsiError::Internal(format!("volume {} has no owning node", volume.volume_id))
            })
    }

    async fn node_record(&self, node_id: &str) -> Result<NodeSummary, CsiError> {
        self.registry
            .list_nodes()
            .await?
            .into_iter()
            .find(|n| n.identity.node_id == node_id)
            .ok_or_else(|| CsiError::NodeUnreachable(format!("{node_id} is not registered")))
    }

    async fn connect(&self, node: &NodeSummary) -> Result<Arc<dyn NodeControl>, CsiError> {
        if node.status == NodeStatus::Unreachable {
            return Err(CsiError::NodeUnreachable(node.identity.node_id.clone()));
        }
        self.connector.connect(&node.identity).await
    }

    fn is_inventoried(&self, node: &NodeSummary) -> bool {
        self.inventoried
            .get(&node.identity.node_id)
            .is_some_and(|fp| *fp == node.identity.fingerprint)
    }

    /// Replace the cached volumes of `node` with `volumes`.
    fn take_inventory(&self, node: &NodeSummary, volumes: Vec<Volume>) {
        let node_id = node.identity.node_id.as_str();
        self.volumes
            .retain(|_, v| v.node(&self.topology_key) != Some(node_id));
        for volume in volumes {
            self.volumes.insert(volume.volume_id.clone(), volume);
        }
        self.inventoried
            .insert(node_id.to_owned(), node.identity.fingerprint.clone());
    }

    /// The volume from the cache, or from the node that holds it.
    ///
    /// Registered nodes not yet listed are asked first.  `None` is only
    /// returned once all of them answered.
    async fn find_volume(&self, volume_id: &VolumeId) -> Result<Option<Volume>, CsiError> {
        if let Some(volume) = self.volumes.get(volume_id) {
            return Ok(Some(volume.clone()));
        }
        let mut silent = Vec::new();
        for node in self.registry.list_nodes().await? {
            if self.is_inventoried(&node) {
                continue;
            }
            let listed = match self.connect(&node).await {
                Ok(control) => control.list_volumes().await,
                Err(e) => Err(e),
            };
            match listed {
                Ok(volumes) => self.take_inventory(&node, volumes),
                Err(e) => {
                    warn!(node = %node.identity.node_id, error = %e, "cannot list volumes");
                    silent.push(node.identity.node_id);
                }
            }
        }
        if let Some(volume) = self.volumes.get(volume_id) {
            return Ok(Some(volume.clone()));
        }
        if silent.is_empty() {
            Ok(None)
        } else {
            Err(CsiError::NodeUnreachable(format!(
                "cannot rule out {volume_id}, no volume list from {}",
                silent.join(", ")
            )))
        }
    }

    /// Candidate nodes in the order they should be tried.
    fn placement(
        &self,
        nodes: Vec<NodeSummary>,
        mode: DeviceMode,
        size: u64,
        topology: Option<&TopologyRequirement>,
    ) -> Vec<NodeSummary> {
        let key = self.topology_key.as_str();
        let requisite: Option<HashSet<&str>> = topology
            .filter(|t| !t.requisite.is_empty())
            .map(|t| {
                t.requisite
                    .iter()
                    .filter_map(|s| s.segments.get(key).map(String::as_str))
                    .collect()
            });
        let mut candidates: Vec<NodeSummary> = nodes
            .into_iter()
            .filter(|n| n.status == NodeStatus::Reachable)
            .filter(|n| {
                requisite
                    .as_ref()
                    .is_none_or(|r| r.contains(n.identity.node_id.as_str()))
            })
            .collect();

        let preferred = topology.and_then(|t| {
            t.preferred
                .iter()
                .filter_map(|s| s.segments.get(key))
                .find(|id| candidates.iter().any(|n| &n.identity.node_id == *id))
                .cloned()
        });

        candidates.sort_by(|a, b| {
            b.capacity
                .get(mode)
                .available
                .cmp(&a.capacity.get(mode).available)
                .then_with(|| a.identity.node_id.cmp(&b.identity.node_id))
        });
        let mut ordered = Vec::with_capacity(candidates.len());
        if let Some(pos) = preferred
            .as_ref()
            .and_then(|p| candidates.iter().position(|n| &n.identity.node_id == p))
        {
            ordered.push(candidates.remove(pos));
        }
        ordered.extend(
            candidates
                .into_iter()
                .filter(|n| n.capacity.get(mode).available >= size),
        );
        ordered
    }

    fn matches_existing(
        &self,
        volume: &Volume,
        size: u64,
        mode: DeviceMode,
        topology: Option<&TopologyRequirement>,
    ) -> bool {
        if volume.capacity_bytes < size || volume.device_mode != mode {
            return false;
        }
        let Some(requisite) = topology.map(|t| &t.requisite).filter(|r| !r.is_empty()) else {
            return true;
        };
        let owner = volume.node(&self.topology_key);
        requisite
            .iter()
            .any(|s| s.segments.get(&self.topology_key).map(String::as_str) == owner)
    }

    async fn create_locked(
        &self,
        ctx: &CallContext,
        req: CreateVolumeRequest,
        params: VolumeParameters,
        mode: DeviceMode,
    ) -> Result<Volume, CsiError> {
        let volume_id = volume_id_for(&req.name);
        let topology = req.accessibility_requirements.as_ref();

        if let Some(existing) = self.find_volume(&volume_id).await? {
            if self.matches_existing(&existing, req.capacity_bytes, mode, topology) {
                debug!(volume_id = %volume_id, "volume already exists");
                return Ok(existing);
            }
            return Err(CsiError::VolumeAlreadyExists(req.name));
        }

        // Fail closed: without the registry there is no safe placement.
        let nodes = self.registry.list_nodes().await?;
        let candidates = self.placement(nodes, mode, req.capacity_bytes, topology);
        if candidates.is_empty() {
            return Err(CsiError::NoCapacity(format!(
                "no reachable node has {} bytes of {mode} capacity",
                req.capacity_bytes
            )));
        }

        let node_params = VolumeParameters {
            device_mode: Some(mode),
            erase_after: params.erase_after,
            name: Some(req.name.clone()),
            ..VolumeParameters::default()
        };
        let mut last_error = None;
        for node in candidates.iter().take(self.options.max_attempts) {
            if ctx.is_cancelled() {
                return Err(CsiError::Cancelled(format!("create {}", req.name)));
            }
            let node_id = &node.identity.node_id;
            let attempt = match self.connect(node).await {
                Ok(control) => {
                    control
                        .create_volume(
                            ctx,
                            NodeCreateVolumeRequest {
                                volume_id: volume_id.clone(),
                                name: req.name.clone(),
                                capacity_bytes: req.capacity_bytes,
                                device_mode: mode,
                                parameters: node_params.to_context(),
                            },
                        )
                        .await
                }
                Err(e) => Err(e),
            };
            match attempt {
                Ok(volume) => {
                    info!(%volume_id, node = %node_id, size = volume.capacity_bytes, %mode, "volume created");
                    self.volumes.insert(volume_id, volume.clone());
                    return Ok(volume);
                }
                Err(e) if e.is_capacity_class() => {
                    warn!(node = %node_id, error = %e, "node could not take the volume");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(CsiError::NoCapacity(match last_error {
            Some(e) => format!("{}: {e}", req.name),
            None => req.name,
        }))
    }
}

#[async_trait]
impl CsiIdentity for ControllerServer {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.options.driver_name.clone(),
            vendor_version: self.options.vendor_version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![
            PluginCapability::ControllerService,
            PluginCapability::VolumeAccessibilityConstraints,
        ])
    }
}

#[async_trait]
impl CsiController for ControllerServer {
    #[instrument(skip(self, ctx, req), fields(name = %req.name, size = req.capacity_bytes))]
    async fn create_volume(
        &self,
        ctx: &CallContext,
        req: CreateVolumeRequest,
    ) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("volume name missing".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities missing".into(),
            ));
        }
        for cap in &req.volume_capabilities {
            cap.validate()?;
        }
        if req.capacity_bytes == 0 {
            return Err(CsiError::InvalidArgument("capacity must be positive".into()));
        }
        let params = VolumeParameters::parse(Origin::CreateVolume, &req.parameters)?;
        let mode = params.device_mode_or(self.options.default_mode);

        let name = req.name.clone();
        let marker = Arc::clone(self.in_flight.entry(name.clone()).or_default().value());
        let result = {
            let _guard = marker.lock().await;
            self.create_locked(ctx, req, params, mode).await
        };
        drop(marker);
        self.in_flight
            .remove_if(&name, |_, marker| Arc::strong_count(marker) == 1);
        result
    }

    #[instrument(skip(self, ctx))]
    async fn delete_volume(&self, ctx: &CallContext, volume_id: &VolumeId) -> Result<(), CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id missing".into()));
        }
        let cached = self.volumes.get(volume_id).map(|v| v.clone());
        if let Some(volume) = cached {
            let node_id = self.owner(&volume)?;
            let node = self.node_record(&node_id).await?;
            let found = self.connect(&node).await?.delete_volume(ctx, volume_id).await?;
            self.volumes.remove(volume_id);
            info!(node = %node_id, found, "volume deleted");
            return Ok(());
        }

        // Unknown here: every registered node must confirm it is not theirs.
        let mut silent = Vec::new();
        for node in self.registry.list_nodes().await? {
            let node_id = node.identity.node_id.clone();
            let answer = match self.connect(&node).await {
                Ok(control) => control.delete_volume(ctx, volume_id).await,
                Err(e) => Err(e),
            };
            match answer {
                Ok(true) => {
                    info!(node = %node_id, "volume deleted");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) if e.is_capacity_class() => {
                    warn!(node = %node_id, error = %e, "node did not answer delete");
                    silent.push(node_id);
                }
                Err(e) => return Err(e),
            }
        }
        if silent.is_empty() {
            debug!("no node holds the volume");
            Ok(())
        } else {
            Err(CsiError::NodeUnreachable(format!(
                "cannot confirm deletion of {volume_id}, no answer from {}",
                silent.join(", ")
            )))
        }
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        if capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities missing".into(),
            ));
        }
        if self.find_volume(volume_id).await?.is_none() {
            return Err(CsiError::VolumeNotFound(volume_id.to_string()));
        }
        Ok(capabilities.iter().all(|c| c.validate().is_ok()))
    }

    async fn list_volumes(
        &self,
        req: ListVolumesRequest,
    ) -> Result<ListVolumesResponse, CsiError> {
        for node in self.registry.list_nodes().await? {
            if node.status != NodeStatus::Reachable {
                continue;
            }
            let listed = match self.connect(&node).await {
                Ok(control) => control.list_volumes().await,
                Err(e) => Err(e),
            };
            match listed {
                Ok(volumes) => self.take_inventory(&node, volumes),
                Err(e) => {
                    warn!(node = %node.identity.node_id, error = %e, "listing from cache instead")
                }
            }
        }

        let mut all: Vec<Volume> = self.volumes.iter().map(|v| v.value().clone()).collect();
        all.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));

        let start = match &req.starting_token {
            Some(token) => all.partition_point(|v| v.volume_id.0.as_str() < token.as_str()),
            None => 0,
        };
        let limit = match req.max_entries {
            0 => usize::MAX,
            n => n as usize,
        };
        let mut rest = all.split_off(start.min(all.len()));
        let next_token = rest.get(limit).map(|v| v.volume_id.0.clone());
        rest.truncate(limit);
        Ok(ListVolumesResponse {
            entries: rest,
            next_token,
        })
    }

    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<CapacityReport, CsiError> {
        let wanted_node = req
            .accessible_topology
            .as_ref()
            .and_then(|t| t.segments.get(&self.topology_key));
        let mut report = CapacityReport::default();
        if let Some(mode) = req.device_mode {
            report.modes.insert(mode, Default::default());
        }
        for node in self.registry.list_nodes().await? {
            if node.status != NodeStatus::Reachable {
                continue;
            }
            if wanted_node.is_some_and(|id| *id != node.identity.node_id) {
                continue;
            }
            let mut capacity = node.capacity;
            if let Some(mode) = req.device_mode {
                capacity.modes.retain(|m, _| *m == mode);
            }
            report.merge(&capacity);
        }
        Ok(report)
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::ListVolumes,
            ControllerCapability::GetCapacity,
            ControllerCapability::ExpandVolume,
        ])
    }

    #[instrument(skip(self, ctx))]
    async fn expand_volume(
        &self,
        ctx: &CallContext,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<u64, CsiError> {
        let volume = self
            .find_volume(volume_id)
            .await?
            .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))?;
        let node = self.node_record(&self.owner(&volume)?).await?;
        let size = self
            .connect(&node)
            .await?
            .expand_volume(ctx, volume_id, capacity_bytes)
            .await?;
        if let Some(mut cached) = self.volumes.get_mut(volume_id) {
            cached.capacity_bytes = size;
        }
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::named_peer;
    use crate::registry::NodeRegistry;
    use crate::types::{
        CapacityReport, ModeCapacity, NodeIdentity, RegisterNodeRequest, Topology, GIB,
    };

    fn summary(node: &str, available: u64, status: NodeStatus) -> NodeSummary {
        let mut capacity = CapacityReport::default();
        capacity.modes.insert(
            DeviceMode::Lvm,
            ModeCapacity {
                total: 8 * GIB,
                available,
            },
        );
        NodeSummary {
            identity: NodeIdentity {
                node_id: node.into(),
                endpoint: format!("{node}:7443"),
                server_name: node.into(),
                fingerprint: node.into(),
            },
            status,
            capacity,
        }
    }

    fn controller() -> ControllerServer {
        ControllerServer::new(
            ControllerOptions::default(),
            Arc::new(NodeRegistry::default()),
            Arc::new(LocalConnector::new()),
        )
    }

    fn ids(nodes: &[NodeSummary]) -> Vec<&str> {
        nodes.iter().map(|n| n.identity.node_id.as_str()).collect()
    }

    #[test]
    fn volume_ids_are_deterministic() {
        let a = volume_id_for("pvc-1");
        assert_eq!(a, volume_id_for("pvc-1"));
        assert_ne!(a, volume_id_for("pvc-2"));
        assert!(a.0.starts_with("pmem-"));
        assert_eq!(a.0.len(), 45);
    }

    #[test]
    fn placement_prefers_most_available() {
        let c = controller();
        let nodes = vec![
            summary("n1", GIB, NodeStatus::Reachable),
            summary("n2", 4 * GIB, NodeStatus::Reachable),
            summary("n3", 8 * GIB, NodeStatus::Unreachable),
            summary("n4", 2 * GIB, NodeStatus::Reachable),
        ];
        let order = c.placement(nodes, DeviceMode::Lvm, GIB, None);
        assert_eq!(ids(&order), vec!["n2", "n4", "n1"]);
    }

    #[test]
    fn placement_honours_topology() {
        let c = controller();
        let key = c.topology_key().to_owned();
        let nodes = vec![
            summary("n1", GIB, NodeStatus::Reachable),
            summary("n2", 4 * GIB, NodeStatus::Reachable),
            summary("n3", 2 * GIB, NodeStatus::Reachable),
        ];
        let topology = TopologyRequirement {
            requisite: vec![Topology::node(&key, "n1"), Topology::node(&key, "n3")],
            preferred: vec![Topology::node(&key, "n2"), Topology::node(&key, "n1")],
        };
        // n2 is preferred but not requisite; n1 is the first usable preference.
        let order = c.placement(nodes, DeviceMode::Lvm, GIB, Some(&topology));
        assert_eq!(ids(&order), vec!["n1", "n3"]);
    }

    #[test]
    fn placement_skips_nodes_without_room() {
        let c = controller();
        let nodes = vec![
            summary("n1", GIB, NodeStatus::Reachable),
            summary("n2", 512, NodeStatus::Reachable),
        ];
        let order = c.placement(nodes, DeviceMode::Lvm, 2 * GIB, None);
        assert!(order.is_empty());
        let order = c.placement(
            vec![summary("n1", 0, NodeStatus::Reachable)],
            DeviceMode::Direct,
            GIB,
            None,
        );
        assert!(order.is_empty());
    }

    #[tokio::test]
    async fn create_without_nodes_is_no_capacity() {
        let c = controller();
        let err = c
            .create_volume(
                &CallContext::local(),
                CreateVolumeRequest {
                    name: "pvc-1".into(),
                    capacity_bytes: GIB,
                    volume_capabilities: vec![VolumeCapability::default()],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::NoCapacity(_)));
        assert!(c.in_flight.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_bad_requests() {
        let c = controller();
        let ctx = CallContext::local();
        let base = CreateVolumeRequest {
            name: "pvc-1".into(),
            capacity_bytes: GIB,
            volume_capabilities: vec![VolumeCapability::default()],
            ..Default::default()
        };
        let mut no_caps = base.clone();
        no_caps.volume_capabilities.clear();
        assert!(matches!(
            c.create_volume(&ctx, no_caps).await,
            Err(CsiError::InvalidArgument(_))
        ));

        let mut bad_param = base.clone();
        bad_param
            .parameters
            .insert("size".into(), "1Gi".into());
        assert!(matches!(
            c.create_volume(&ctx, bad_param).await,
            Err(CsiError::InvalidArgument(_))
        ));

        let mut bad_mode = base;
        bad_mode
            .parameters
            .insert("deviceMode".into(), "fsdax".into());
        assert!(matches!(
            c.create_volume(&ctx, bad_mode).await,
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn delete_of_unknown_volume_needs_every_node() {
        let registry = Arc::new(NodeRegistry::default());
        let peer = named_peer("n1");
        let mut identity = summary("n1", GIB, NodeStatus::Reachable).identity;
        identity.fingerprint = peer.fingerprint.clone().unwrap();
        registry
            .register_node(
                &peer,
                RegisterNodeRequest {
                    identity,
                    capacity: CapacityReport::default(),
                },
            )
            .await
            .unwrap();
        // Registered, but the connector cannot reach it.
        let c = ControllerServer::new(
            ControllerOptions::default(),
            registry,
            Arc::new(LocalConnector::new()),
        );
        let err = c
            .delete_volume(&CallContext::local(), &VolumeId::from("pmem-unknown"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::NodeUnreachable(_)));

        // Nor can a lookup or a create rule the volume out.
        let err = c
            .validate_volume_capabilities(
                &VolumeId::from("pmem-unknown"),
                &[VolumeCapability::default()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::NodeUnreachable(_)), "{err:?}");
        let err = c
            .create_volume(
                &CallContext::local(),
                CreateVolumeRequest {
                    name: "pvc-1".into(),
                    capacity_bytes: GIB,
                    volume_capabilities: vec![VolumeCapability::default()],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::NodeUnreachable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn capacity_for_unknown_mode_is_zero() {
        let c = controller();
        let report = c
            .get_capacity(GetCapacityRequest {
                device_mode: Some(DeviceMode::Direct),
                accessible_topology: None,
            })
            .await
            .unwrap();
        assert_eq!(report.get(DeviceMode::Direct), ModeCapacity::default());
        assert_eq!(report.modes.len(), 1);
    }
}
