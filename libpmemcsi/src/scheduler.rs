//! Kubernetes scheduler extender.
//!
//! The scheduler calls `POST /filter` with a pod and candidate nodes, then
//! `POST /prioritize` with the survivors.  Answers come from the registry's
//! capacity table only; nothing here changes state.  When the registry cannot
//! be read every node passes with score zero so scheduling never stalls on
//! this extender.
//!
//! A pod's PMEM demand is read from its inline CSI volumes of this driver
//! (`size` and `deviceMode` attributes) and from `<driver>/lvm` and
//! `<driver>/direct` annotations carrying quantities for claims.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::CsiError;
use crate::parameters::{DEVICE_MODE, SIZE, parse_quantity};
use crate::registry::Registry;
use crate::types::{DeviceMode, NodeStatus, NodeSummary};

/// Highest score handed to the scheduler.
pub const MAX_SCORE: i64 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsiVolumeSource {
    pub driver: String,
    #[serde(default)]
    pub volume_attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodVolume {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub csi: Option<CsiVolumeSource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub volumes: Vec<PodVolume>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

/// Node objects are passed back untouched, so they stay raw JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeList {
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
}

fn node_name(node: &serde_json::Value) -> Option<&str> {
    node.get("metadata")?.get("name")?.as_str()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtenderArgs {
    pub pod: Pod,
    #[serde(default)]
    pub nodes: Option<NodeList>,
    #[serde(default)]
    pub node_names: Option<Vec<String>>,
}

impl ExtenderArgs {
    fn candidates(&self) -> Vec<String> {
        match (&self.node_names, &self.nodes) {
            (Some(names), _) => names.clone(),
            (None, Some(nodes)) => nodes
                .items
                .iter()
                .filter_map(node_name)
                .map(str::to_owned)
                .collect(),
            (None, None) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtenderFilterResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_names: Option<Vec<String>>,
    #[serde(default)]
    pub failed_nodes: BTreeMap<String, String>,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostPriority {
    pub host: String,
    pub score: i64,
}

/// PMEM a pod asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodRequests {
    /// Sum of LVM requests; one volume group serves them all.
    pub lvm: u64,
    /// Each Direct request needs its own namespace.
    pub direct: Vec<u64>,
}

impl PodRequests {
    pub fn is_empty(&self) -> bool {
        self.lvm == 0 && self.direct.is_empty()
    }

    fn add(&mut self, mode: DeviceMode, size: u64) {
        match mode {
            DeviceMode::Lvm => self.lvm = self.lvm.saturating_add(size),
            DeviceMode::Direct => self.direct.push(size),
        }
    }

    /// Why `node` cannot host the pod, if it cannot.
    ///
    /// Direct volumes are only checked by the largest request against the
    /// node's free Direct bytes.  Several requests that each fit may still
    /// not fit together, or not fit the free space of any single region; the
    /// node then refuses the create and the controller tries elsewhere.
    pub fn misfit(&self, node: &NodeSummary) -> Option<String> {
        if node.status != NodeStatus::Reachable {
            return Some("node is unreachable".into());
        }
        let lvm = node.capacity.get(DeviceMode::Lvm).available;
        if self.lvm > lvm {
            return Some(format!(
                "needs {} bytes of lvm PMEM, {lvm} available",
                self.lvm
            ));
        }
        let direct = node.capacity.get(DeviceMode::Direct).available;
        if let Some(largest) = self.direct.iter().copied().max()
            && largest > direct
        {
            return Some(format!(
                "needs a {largest} byte direct namespace, {direct} available"
            ));
        }
        None
    }

    fn modes(&self) -> Vec<DeviceMode> {
        let mut modes = Vec::new();
        if self.lvm > 0 {
            modes.push(DeviceMode::Lvm);
        }
        if !self.direct.is_empty() {
            modes.push(DeviceMode::Direct);
        }
        if modes.is_empty() {
            modes.extend(DeviceMode::ALL);
        }
        modes
    }
}

pub struct SchedulerExtender {
    driver_name: String,
    registry: Arc<dyn Registry>,
}

impl SchedulerExtender {
    pub fn new(driver_name: impl Into<String>, registry: Arc<dyn Registry>) -> Self {
        Self {
            driver_name: driver_name.into(),
            registry,
        }
    }

    /// PMEM requests of `pod` for this driver.
    pub fn requests(&self, pod: &Pod) -> Result<PodRequests, CsiError> {
        let mut requests = PodRequests::default();
        for volume in &pod.spec.volumes {
            let Some(csi) = &volume.csi else { continue };
            if csi.driver != self.driver_name {
                continue;
            }
            let Some(size) = csi.volume_attributes.get(SIZE) else {
                continue;
            };
            let size = parse_quantity(size).map_err(|e| {
                CsiError::InvalidArgument(format!("volume {}: {e}", volume.name))
            })?;
            let mode = match csi.volume_attributes.get(DEVICE_MODE) {
                Some(mode) => mode.parse()?,
                None => DeviceMode::Lvm,
            };
            requests.add(mode, size);
        }
        for mode in DeviceMode::ALL {
            let key = format!("{}/{mode}", self.driver_name);
            if let Some(value) = pod.metadata.annotations.get(&key) {
                let size = parse_quantity(value)
                    .map_err(|e| CsiError::InvalidArgument(format!("annotation {key}: {e}")))?;
                requests.add(mode, size);
            }
        }
        Ok(requests)
    }

    async fn nodes(&self) -> Result<HashMap<String, NodeSummary>, CsiError> {
        Ok(self
            .registry
            .list_nodes()
            .await?
            .into_iter()
            .map(|n| (n.identity.node_id.clone(), n))
            .collect())
    }

    #[instrument(skip_all, fields(pod = %args.pod.metadata.name))]
    pub async fn filter(&self, args: ExtenderArgs) -> ExtenderFilterResult {
        let candidates = args.candidates();
        let requests = match self.requests(&args.pod) {
            Ok(r) => r,
            Err(e) => {
                return ExtenderFilterResult {
                    error: e.to_string(),
                    ..Default::default()
                };
            }
        };

        let mut failed = BTreeMap::new();
        if !requests.is_empty() {
            match self.nodes().await {
                Ok(nodes) => {
                    for name in &candidates {
                        let reason = match nodes.get(name) {
                            Some(node) => requests.misfit(node),
                            None => Some("node has no PMEM registered".into()),
                        };
                        if let Some(reason) = reason {
                            failed.insert(name.clone(), reason);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "registry unavailable, not filtering"),
            }
        }
        debug!(?requests, failed = failed.len(), "filtered");

        let keep = |name: &str| !failed.contains_key(name);
        ExtenderFilterResult {
            nodes: args.nodes.map(|list| NodeList {
                items: list
                    .items
                    .into_iter()
                    .filter(|n| node_name(n).is_some_and(keep))
                    .collect(),
            }),
            node_names: args
                .node_names
                .map(|names| names.into_iter().filter(|n| keep(n)).collect()),
            failed_nodes: failed,
            error: String::new(),
        }
    }

    #[instrument(skip_all, fields(pod = %args.pod.metadata.name))]
    pub async fn prioritize(&self, args: ExtenderArgs) -> Vec<HostPriority> {
        let candidates = args.candidates();
        let zero = |candidates: Vec<String>| {
            candidates
                .into_iter()
                .map(|host| HostPriority { host, score: 0 })
                .collect()
        };
        let modes = match self.requests(&args.pod) {
            Ok(requests) => requests.modes(),
            Err(e) => {
                debug!(error = %e, "unparsable requests, neutral scores");
                return zero(candidates);
            }
        };
        let nodes = match self.nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "registry unavailable, neutral scores");
                return zero(candidates);
            }
        };

        let available = |name: &str| -> u64 {
            match nodes.get(name) {
                Some(node) if node.status == NodeStatus::Reachable => modes
                    .iter()
                    .map(|m| node.capacity.get(*m).available)
                    .fold(0u64, u64::saturating_add),
                _ => 0,
            }
        };
        let best = candidates.iter().map(|n| available(n)).max().unwrap_or(0);
        candidates
            .iter()
            .map(|host| {
                let score = if best == 0 {
                    0
                } else {
                    (u128::from(available(host)) * MAX_SCORE as u128 / u128::from(best)) as i64
                };
                HostPriority {
                    host: host.clone(),
                    score,
                }
            })
            .collect()
    }
}

async fn filter(
    State(extender): State<Arc<SchedulerExtender>>,
    Json(args): Json<ExtenderArgs>,
) -> Json<ExtenderFilterResult> {
    Json(extender.filter(args).await)
}

async fn prioritize(
    State(extender): State<Arc<SchedulerExtender>>,
    Json(args): Json<ExtenderArgs>,
) -> Json<Vec<HostPriority>> {
    Json(extender.prioritize(args).await)
}

pub fn router(extender: Arc<SchedulerExtender>) -> Router {
    Router::new()
        .route("/filter", post(filter))
        .route("/prioritize", post(prioritize))
        .with_state(extender)
}

/// Serve the extender on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    extender: Arc<SchedulerExtender>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "scheduler extender listening");
    axum::serve(listener, router(extender))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    use super::*;
    use crate::context::named_peer;
    use crate::registry::NodeRegistry;
    use crate::types::{
        CapacityReport, GIB, ModeCapacity, NodeIdentity, RegisterNodeRequest,
    };

    const DRIVER: &str = "rk8s.pmem.csi";

    async fn registry(nodes: &[(&str, u64, u64)]) -> Arc<NodeRegistry> {
        let registry = Arc::new(NodeRegistry::default());
        for (id, lvm, direct) in nodes {
            let peer = named_peer(id);
            let capacity = CapacityReport {
                modes: BTreeMap::from([
                    (DeviceMode::Lvm, ModeCapacity { total: *lvm, available: *lvm }),
                    (DeviceMode::Direct, ModeCapacity { total: *direct, available: *direct }),
                ]),
            };
            registry
                .register_node(
                    &peer,
                    RegisterNodeRequest {
                        identity: NodeIdentity {
                            node_id: (*id).into(),
                            endpoint: format!("{id}:7000"),
                            server_name: (*id).into(),
                            fingerprint: peer.fingerprint.clone().unwrap(),
                        },
                        capacity,
                    },
                )
                .await
                .unwrap();
        }
        registry
    }

    fn pod(volumes: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: "app".into(),
                ..Default::default()
            },
            spec: PodSpec {
                volumes: volumes
                    .iter()
                    .enumerate()
                    .map(|(i, (size, mode))| PodVolume {
                        name: format!("pmem-{i}"),
                        csi: Some(CsiVolumeSource {
                            driver: DRIVER.into(),
                            volume_attributes: HashMap::from([
                                (SIZE.to_owned(), (*size).to_owned()),
                                (DEVICE_MODE.to_owned(), (*mode).to_owned()),
                            ]),
                        }),
                    })
                    .collect(),
            },
        }
    }

    fn args(pod: Pod, names: &[&str]) -> ExtenderArgs {
        ExtenderArgs {
            pod,
            nodes: None,
            node_names: Some(names.iter().map(|n| (*n).to_owned()).collect()),
        }
    }

    #[tokio::test]
    async fn requests_from_volumes_and_annotations() {
        let extender = SchedulerExtender::new(DRIVER, registry(&[]).await);
        let mut p = pod(&[("1Gi", "lvm"), ("2Gi", "lvm"), ("1Gi", "direct")]);
        p.metadata
            .annotations
            .insert(format!("{DRIVER}/direct"), "512Mi".into());
        p.spec.volumes.push(PodVolume {
            name: "other".into(),
            csi: Some(CsiVolumeSource {
                driver: "other.csi".into(),
                volume_attributes: HashMap::from([(SIZE.to_owned(), "100Gi".to_owned())]),
            }),
        });
        let r = extender.requests(&p).unwrap();
        assert_eq!(r.lvm, 3 * GIB);
        assert_eq!(r.direct, vec![GIB, GIB / 2]);
    }

    #[tokio::test]
    async fn lvm_sums_direct_takes_largest() {
        let extender = SchedulerExtender::new(
            DRIVER,
            registry(&[("n1", 4 * GIB, 2 * GIB), ("n2", 2 * GIB, 4 * GIB)]).await,
        );
        let result = extender
            .filter(args(pod(&[("2Gi", "lvm"), ("2Gi", "lvm")]), &["n1", "n2", "n3"]))
            .await;
        assert_eq!(result.node_names.unwrap(), vec!["n1".to_owned()]);
        assert!(result.failed_nodes["n3"].contains("no PMEM"));

        // 5Gi of direct volumes pass n2's 4Gi on the largest request alone.
        let result = extender
            .filter(args(pod(&[("2Gi", "direct"), ("3Gi", "direct")]), &["n1", "n2"]))
            .await;
        assert_eq!(result.node_names.unwrap(), vec!["n2".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_nodes_are_filtered() {
        let registry = registry(&[("n1", 4 * GIB, 0)]).await;
        tokio::time::advance(crate::registry::DEFAULT_HEARTBEAT_TIMEOUT * 2).await;
        let extender = SchedulerExtender::new(DRIVER, registry);
        let result = extender
            .filter(args(pod(&[("1Gi", "lvm")]), &["n1"]))
            .await;
        assert!(result.node_names.unwrap().is_empty());
        assert_eq!(result.failed_nodes["n1"], "node is unreachable");
    }

    #[tokio::test]
    async fn pods_without_pmem_pass() {
        let extender = SchedulerExtender::new(DRIVER, registry(&[]).await);
        let result = extender.filter(args(Pod::default(), &["a", "b"])).await;
        assert_eq!(result.node_names.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn scores_scale_with_capacity() {
        let extender = SchedulerExtender::new(
            DRIVER,
            registry(&[("n1", 4 * GIB, 0), ("n2", 2 * GIB, 0)]).await,
        );
        let scores = extender
            .prioritize(args(pod(&[("1Gi", "lvm")]), &["n1", "n2", "n3"]))
            .await;
        assert_eq!(
            scores,
            vec![
                HostPriority { host: "n1".into(), score: 10 },
                HostPriority { host: "n2".into(), score: 5 },
                HostPriority { host: "n3".into(), score: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn http_filter_keeps_node_objects() {
        let extender = Arc::new(SchedulerExtender::new(
            DRIVER,
            registry(&[("n1", 4 * GIB, 0), ("n2", 0, 0)]).await,
        ));
        let body = serde_json::json!({
            "Pod": pod(&[("1Gi", "lvm")]),
            "Nodes": { "items": [
                { "metadata": { "name": "n1" } },
                { "metadata": { "name": "n2" } },
            ]},
        });
        let response = router(extender)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/filter")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let result: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(result["Nodes"]["items"].as_array().unwrap().len(), 1);
        assert_eq!(result["Nodes"]["items"][0]["metadata"]["name"], "n1");
        assert!(result["FailedNodes"]["n2"].is_string());
    }
}
