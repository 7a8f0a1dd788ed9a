//! Protocol messages transmitted over QUIC and the local socket.
//!
//! [`CsiMessage`] is the single envelope for every request and response
//! variant.  Requests travel inside a [`Request`] that also carries the
//! caller's deadline; the reply is a bare [`CsiMessage`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Largest frame either side accepts.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Which service a request variant belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceGroup {
    Identity,
    Controller,
    Node,
    NodeControl,
    Registry,
}

/// Top-level message envelope.
///
/// Each QUIC bi-stream (or local socket frame pair) carries exactly one
/// request followed by one response.  The server replies with the matching
/// response variant or [`CsiMessage::Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Identity --------------------------------------------------------
    Probe,
    GetPluginInfo,
    GetPluginCapabilities,

    // ----- Controller ------------------------------------------------------
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(VolumeId),
    ControllerPublishVolume {
        volume_id: VolumeId,
        node_id: String,
    },
    ControllerUnpublishVolume {
        volume_id: VolumeId,
        node_id: String,
    },
    ValidateVolumeCapabilities {
        volume_id: VolumeId,
        capabilities: Vec<VolumeCapability>,
    },
    ListVolumes(ListVolumesRequest),
    GetCapacity(GetCapacityRequest),
    ControllerGetCapabilities,
    ExpandVolume {
        volume_id: VolumeId,
        capacity_bytes: u64,
    },

    // ----- Node ------------------------------------------------------------
    StageVolume(NodeStageVolumeRequest),
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    PublishVolume(NodePublishVolumeRequest),
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    GetNodeInfo,
    NodeGetCapabilities,
    ClearStuckVolume(VolumeId),

    // ----- Node control (controller to node) --------------------------------
    NodeCreateVolume(NodeCreateVolumeRequest),
    NodeDeleteVolume(VolumeId),
    NodeListVolumes,
    NodeExpandVolume {
        volume_id: VolumeId,
        capacity_bytes: u64,
    },
    NodeGetCapacity,

    // ----- Registry (node to registry) --------------------------------------
    RegisterNode(RegisterNodeRequest),
    UnregisterNode {
        node_id: String,
    },
    UpdateCapacity {
        node_id: String,
        mode: DeviceMode,
        /// Per-mode sequence number; the registry ignores replays.
        seq: u64,
        delta: CapacityDelta,
    },
    Heartbeat {
        node_id: String,
    },
    ListNodes,
    GetNodeCapacity {
        node_id: String,
        mode: DeviceMode,
    },

    // ----- Responses -------------------------------------------------------
    VolumeCreated(Volume),
    VolumeList(Vec<Volume>),
    VolumePage(ListVolumesResponse),
    Capacity(CapacityReport),
    ModeCapacity(ModeCapacity),
    CapabilitiesValid(bool),
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    ControllerCapabilitiesResponse(Vec<ControllerCapability>),
    NodeCapabilitiesResponse(Vec<NodeCapability>),
    NodeInfoResponse(NodeInfo),
    /// `false` when the node did not hold the volume.
    VolumeDeleted(bool),
    VolumeExpanded(u64),
    /// `false` when the volume was not stuck.
    StuckCleared(bool),
    NodeList(Vec<NodeSummary>),
    /// Generic success acknowledgement (no payload).
    Ok,
    ProbeResult(bool),
    Error(CsiError),
}

impl CsiMessage {
    /// Service a request variant is dispatched to; `None` for responses.
    pub fn group(&self) -> Option<ServiceGroup> {
        use CsiMessage::*;
        Some(match self {
            Probe | GetPluginInfo | GetPluginCapabilities => ServiceGroup::Identity,
            CreateVolume(_)
            | DeleteVolume(_)
            | ControllerPublishVolume { .. }
            | ControllerUnpublishVolume { .. }
            | ValidateVolumeCapabilities { .. }
            | ListVolumes(_)
            | GetCapacity(_)
            | ControllerGetCapabilities
            | ExpandVolume { .. } => ServiceGroup::Controller,
            StageVolume(_)
            | UnstageVolume { .. }
            | PublishVolume(_)
            | UnpublishVolume { .. }
            | GetNodeInfo
            | NodeGetCapabilities
            | ClearStuckVolume(_) => ServiceGroup::Node,
            NodeCreateVolume(_)
            | NodeDeleteVolume(_)
            | NodeListVolumes
            | NodeExpandVolume { .. }
            | NodeGetCapacity => ServiceGroup::NodeControl,
            RegisterNode(_)
            | UnregisterNode { .. }
            | UpdateCapacity { .. }
            | Heartbeat { .. }
            | ListNodes
            | GetNodeCapacity { .. } => ServiceGroup::Registry,
            _ => return None,
        })
    }

    /// Turn an error reply into `Err`, leaving other replies untouched.
    pub fn into_result(self) -> Result<CsiMessage, CsiError> {
        match self {
            Self::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

/// Error for a reply variant that does not match the request.
pub fn unexpected(response: &CsiMessage) -> CsiError {
    CsiError::TransportError(format!("unexpected response: {response}"))
}

/// A request as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Time the caller is willing to wait, in milliseconds.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    pub message: CsiMessage,
}

impl Request {
    pub fn new(message: CsiMessage) -> Self {
        Self {
            deadline_ms: None,
            message,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(id) => write!(f, "DeleteVolume({id})"),
            Self::ControllerPublishVolume { volume_id, node_id } => {
                write!(f, "ControllerPublishVolume({volume_id}, node={node_id})")
            }
            Self::ControllerUnpublishVolume { volume_id, node_id } => {
                write!(f, "ControllerUnpublishVolume({volume_id}, node={node_id})")
            }
            Self::ValidateVolumeCapabilities { volume_id, .. } => {
                write!(f, "ValidateVolumeCapabilities({volume_id})")
            }
            Self::ListVolumes(req) => write!(f, "ListVolumes(max={})", req.max_entries),
            Self::GetCapacity(req) => write!(f, "GetCapacity(mode={:?})", req.device_mode),
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::ExpandVolume {
                volume_id,
                capacity_bytes,
            } => write!(f, "ExpandVolume({volume_id}, {capacity_bytes})"),
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({volume_id})"),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => write!(f, "UnpublishVolume({volume_id})"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::NodeGetCapabilities => f.write_str("NodeGetCapabilities"),
            Self::ClearStuckVolume(id) => write!(f, "ClearStuckVolume({id})"),
            Self::NodeCreateVolume(req) => {
                write!(f, "NodeCreateVolume({}, {})", req.volume_id, req.device_mode)
            }
            Self::NodeDeleteVolume(id) => write!(f, "NodeDeleteVolume({id})"),
            Self::NodeListVolumes => f.write_str("NodeListVolumes"),
            Self::NodeExpandVolume {
                volume_id,
                capacity_bytes,
            } => write!(f, "NodeExpandVolume({volume_id}, {capacity_bytes})"),
            Self::NodeGetCapacity => f.write_str("NodeGetCapacity"),
            Self::RegisterNode(req) => write!(f, "RegisterNode({})", req.identity.node_id),
            Self::UnregisterNode { node_id } => write!(f, "UnregisterNode({node_id})"),
            Self::UpdateCapacity {
                node_id,
                mode,
                seq,
                delta,
            } => write!(
                f,
                "UpdateCapacity({node_id}, {mode}, #{seq}, total={:+}, available={:+})",
                delta.total, delta.available
            ),
            Self::Heartbeat { node_id } => write!(f, "Heartbeat({node_id})"),
            Self::ListNodes => f.write_str("ListNodes"),
            Self::GetNodeCapacity { node_id, mode } => {
                write!(f, "GetNodeCapacity({node_id}, {mode})")
            }
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::VolumeList(vs) => write!(f, "VolumeList(count={})", vs.len()),
            Self::VolumePage(page) => write!(f, "VolumePage(count={})", page.entries.len()),
            Self::Capacity(report) => write!(f, "Capacity(modes={})", report.modes.len()),
            Self::ModeCapacity(c) => {
                write!(f, "ModeCapacity(total={}, available={})", c.total, c.available)
            }
            Self::CapabilitiesValid(v) => write!(f, "CapabilitiesValid({v})"),
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::ControllerCapabilitiesResponse(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::VolumeDeleted(found) => write!(f, "VolumeDeleted({found})"),
            Self::VolumeExpanded(size) => write!(f, "VolumeExpanded({size})"),
            Self::StuckCleared(cleared) => write!(f, "StuckCleared({cleared})"),
            Self::NodeList(nodes) => write!(f, "NodeList(count={})", nodes.len()),
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({ok})"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_roundtrip() {
        let req = Request::new(CsiMessage::CreateVolume(CreateVolumeRequest {
            name: "pvc-1".into(),
            capacity_bytes: GIB,
            volume_capabilities: vec![VolumeCapability::default()],
            ..Default::default()
        }))
        .with_deadline(Duration::from_secs(10));
        let json = serde_json::to_vec(&req).expect("serialize");
        let de: Request = serde_json::from_slice(&json).expect("deserialize");
        assert_eq!(de.deadline(), Some(Duration::from_secs(10)));
        assert!(matches!(de.message, CsiMessage::CreateVolume(ref r) if r.name == "pvc-1"));
    }

    #[test]
    fn missing_deadline_defaults_to_none() {
        let de: Request = serde_json::from_str(r#"{"message":"Probe"}"#).expect("deserialize");
        assert_eq!(de.deadline(), None);
        assert_eq!(de.message.group(), Some(ServiceGroup::Identity));
    }

    #[test]
    fn error_reply_becomes_err() {
        let msg = CsiMessage::Error(CsiError::VolumeNotFound("vol-1".into()));
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(
            de.into_result(),
            Err(CsiError::VolumeNotFound(id)) if id == "vol-1"
        ));
    }

    #[test]
    fn groups() {
        assert_eq!(
            CsiMessage::NodeListVolumes.group(),
            Some(ServiceGroup::NodeControl)
        );
        assert_eq!(CsiMessage::ListNodes.group(), Some(ServiceGroup::Registry));
        assert_eq!(
            CsiMessage::UnpublishVolume {
                volume_id: "v".into(),
                target_path: "/t".into()
            }
            .group(),
            Some(ServiceGroup::Node)
        );
        assert_eq!(CsiMessage::Ok.group(), None);
        assert_eq!(CsiMessage::VolumeDeleted(true).group(), None);
    }

    #[test]
    fn display_formatting() {
        assert_eq!(CsiMessage::Ok.to_string(), "Ok");
        let delta = CsiMessage::UpdateCapacity {
            node_id: "n1".into(),
            mode: DeviceMode::Lvm,
            seq: 7,
            delta: CapacityDelta {
                total: 0,
                available: -1024,
            },
        };
        assert_eq!(
            delta.to_string(),
            "UpdateCapacity(n1, lvm, #7, total=+0, available=-1024)"
        );
    }
}
