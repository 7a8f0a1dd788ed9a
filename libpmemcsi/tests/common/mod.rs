//! In-process cluster pieces shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use libpmemcsi::backend::{NodeOptions, PmemNode, RecordingMounter, StateStore};
use libpmemcsi::device::{LvmGeometry, SimulatedAdapter};
use libpmemcsi::master::{ControllerOptions, ControllerServer, LocalConnector};
use libpmemcsi::pool::{PoolConfig, VolumeGroupManager};
use libpmemcsi::registry::{CapacityReporter, NodeRegistry, RegistrySink};
use libpmemcsi::{
    CreateVolumeRequest, DeviceMode, MIB, NodeIdentity, Peer, RegisterNodeRequest, Registry,
    VolumeCapability,
};
use tempfile::TempDir;

/// A caller holding a fresh self-signed certificate for `name`.
pub fn peer_named(name: &str) -> Peer {
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec![name.to_owned()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    Peer::from_certificate(cert.der().clone())
}

/// Exact geometry: no metadata overhead, 4MiB extents.
pub fn pool_config(default_mode: DeviceMode) -> PoolConfig {
    PoolConfig {
        default_mode,
        lvm: LvmGeometry {
            extent_size: 4 * MIB,
            pv_metadata_bytes: 0,
        },
        ..Default::default()
    }
}

pub struct TestNode {
    pub id: String,
    pub node: Arc<PmemNode>,
    pub sim: Arc<SimulatedAdapter>,
    pub mounter: Arc<RecordingMounter>,
    pub peer: Peer,
    pub state: TempDir,
}

impl TestNode {
    pub async fn start(id: &str, config: PoolConfig, regions: &[(&str, u64)]) -> Self {
        let sim = SimulatedAdapter::new(config.lvm);
        for (region, size) in regions {
            sim.add_region(region, *size);
        }
        let sim = Arc::new(sim);
        let vgm = Arc::new(
            VolumeGroupManager::discover(sim.clone(), &config)
                .await
                .unwrap(),
        );
        let mounter = Arc::new(RecordingMounter::new());
        let state = tempfile::tempdir().unwrap();
        let mut options = NodeOptions::new(id);
        options.default_mode = config.default_mode;
        let node = Arc::new(PmemNode::new(
            options,
            vgm,
            mounter.clone(),
            StateStore::new(state.path()),
        ));
        Self {
            id: id.to_owned(),
            node,
            sim,
            mounter,
            peer: peer_named(id),
            state,
        }
    }

    /// Register with `registry`, report capacity changes to it and become
    /// reachable through `connector`.
    pub async fn join(&self, registry: &Arc<NodeRegistry>, connector: &LocalConnector) {
        let reporter = Arc::new(CapacityReporter::new(
            Arc::clone(self.node.volume_group_manager()),
            Arc::new(RegistrySink::new(
                registry.clone(),
                self.peer.clone(),
                self.id.as_str(),
            )),
        ));
        let capacity = reporter.reset().await.unwrap();
        registry
            .register_node(
                &self.peer,
                RegisterNodeRequest {
                    identity: NodeIdentity {
                        node_id: self.id.clone(),
                        endpoint: format!("local://{}", self.id),
                        server_name: self.id.clone(),
                        fingerprint: self.peer.fingerprint.clone().unwrap_or_default(),
                    },
                    capacity,
                },
            )
            .await
            .unwrap();
        self.node.attach_reporter(reporter);
        connector.insert(self.id.as_str(), self.node.clone());
    }
}

pub struct Cluster {
    pub registry: Arc<NodeRegistry>,
    pub connector: Arc<LocalConnector>,
    pub controller: Arc<ControllerServer>,
    pub nodes: Vec<TestNode>,
}

impl Cluster {
    pub async fn new(registry: NodeRegistry, nodes: Vec<TestNode>) -> Self {
        let registry = Arc::new(registry);
        let connector = Arc::new(LocalConnector::new());
        for node in &nodes {
            node.join(&registry, &connector).await;
        }
        let controller = Arc::new(ControllerServer::new(
            ControllerOptions::default(),
            registry.clone(),
            connector.clone(),
        ));
        Self {
            registry,
            connector,
            controller,
            nodes,
        }
    }

    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes.iter().find(|n| n.id == id).unwrap()
    }
}

pub fn create_request(name: &str, size: u64, mode: Option<DeviceMode>) -> CreateVolumeRequest {
    let mut parameters = HashMap::new();
    if let Some(mode) = mode {
        parameters.insert("deviceMode".to_owned(), mode.to_string());
    }
    CreateVolumeRequest {
        name: name.to_owned(),
        capacity_bytes: size,
        volume_capabilities: vec![VolumeCapability::mount("ext4")],
        parameters,
        accessibility_requirements: None,
    }
}

/// Heartbeat every node except `silent`.
pub async fn heartbeat_all_but(cluster: &Cluster, silent: &str) {
    for node in cluster.nodes.iter().filter(|n| n.id != silent) {
        cluster.registry.heartbeat(&node.peer, &node.id).await.unwrap();
    }
}
