//! Core CSI types: volumes, capabilities, requests, capacity and topology.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! registry and backend implementations.  They are all
//! [`Serialize`]/[`Deserialize`] so they can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::CsiError;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Round `size` up to a multiple of `granularity`.  A zero granularity leaves
/// the value unchanged.
pub fn round_up(size: u64, granularity: u64) -> u64 {
    if granularity == 0 {
        return size;
    }
    size.div_ceil(granularity).saturating_mul(granularity)
}

/// Round `size` down to a multiple of `granularity`.
pub fn round_down(size: u64, granularity: u64) -> u64 {
    if granularity == 0 {
        return size;
    }
    size / granularity * granularity
}

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Device mode
// ---------------------------------------------------------------------------

/// How a volume's backing storage is carved out of PMEM.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Logical volume in a volume group pooled across regions.
    #[default]
    Lvm,
    /// Dedicated fsdax namespace per volume.
    Direct,
}

impl DeviceMode {
    pub const ALL: [DeviceMode; 2] = [DeviceMode::Lvm, DeviceMode::Direct];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lvm => "lvm",
            Self::Direct => "direct",
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceMode {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lvm" => Ok(Self::Lvm),
            "direct" | "ndctl" => Ok(Self::Direct),
            other => Err(CsiError::InvalidArgument(format!(
                "unknown device mode {other:?}, expected \"lvm\" or \"direct\""
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Filesystems this driver formats.  `xfs` is created with reflink disabled
/// because DAX and copy-on-write extents do not mix.
pub const SUPPORTED_FS_TYPES: [&str; 2] = ["ext4", "xfs"];

/// Filesystem used when the capability leaves `fs_type` empty.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Single-node read-only.
    ReadOnlyOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

impl AccessMode {
    /// PMEM is node-local, so only single-node modes are served.
    pub fn is_supported(self) -> bool {
        matches!(self, Self::ReadWriteOnce | Self::ReadOnlyOnce)
    }
}

/// Whether the volume is consumed as a filesystem or a raw block device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Mount {
        /// Filesystem type, empty selects [`DEFAULT_FS_TYPE`].
        #[serde(default)]
        fs_type: String,
        /// Additional mount flags (e.g. `"noatime"`).
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    Block,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Filesystem or block access.
    pub access_type: AccessType,
}

impl VolumeCapability {
    pub fn mount(fs_type: &str) -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            access_type: AccessType::Mount {
                fs_type: fs_type.to_owned(),
                mount_flags: Vec::new(),
            },
        }
    }

    pub fn block() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            access_type: AccessType::Block,
        }
    }

    /// Filesystem to format, `None` for block volumes.
    pub fn fs_type(&self) -> Option<&str> {
        match &self.access_type {
            AccessType::Mount { fs_type, .. } if fs_type.is_empty() => Some(DEFAULT_FS_TYPE),
            AccessType::Mount { fs_type, .. } => Some(fs_type),
            AccessType::Block => None,
        }
    }

    pub fn mount_flags(&self) -> &[String] {
        match &self.access_type {
            AccessType::Mount { mount_flags, .. } => mount_flags,
            AccessType::Block => &[],
        }
    }

    /// Reject access modes and filesystems this driver cannot serve.
    pub fn validate(&self) -> Result<(), CsiError> {
        if !self.access_mode.is_supported() {
            return Err(CsiError::InvalidArgument(format!(
                "access mode {:?} not supported for node-local PMEM",
                self.access_mode
            )));
        }
        if let Some(fs) = self.fs_type()
            && !SUPPORTED_FS_TYPES.contains(&fs)
        {
            return Err(CsiError::InvalidArgument(format!(
                "filesystem {fs:?} not supported, use one of {SUPPORTED_FS_TYPES:?}"
            )));
        }
        Ok(())
    }
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self::mount(DEFAULT_FS_TYPE)
    }
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// Full metadata for a provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes, rounded up to the pool granularity.
    pub capacity_bytes: u64,
    /// Device mode of the backing storage.
    #[serde(default)]
    pub device_mode: DeviceMode,
    /// User-supplied parameters from the storage class / request.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Topology constraints (the owning node).
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
    /// Set in listings when the volume needs attention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<VolumeCondition>,
}

impl Volume {
    /// Node named by the first topology segment under `key`.
    pub fn node(&self, key: &str) -> Option<&str> {
        self.accessible_topology
            .iter()
            .find_map(|t| t.segments.get(key).map(String::as_str))
    }
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"rk8s.pmem.csi/node": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

impl Topology {
    pub fn node(key: &str, node_id: &str) -> Self {
        Self {
            segments: HashMap::from([(key.to_owned(), node_id.to_owned())]),
        }
    }
}

/// Placement hints attached by the orchestrator to `CreateVolume`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologyRequirement {
    /// Volume must be accessible from one of these.
    #[serde(default)]
    pub requisite: Vec<Topology>,
    /// Try these first, in order.
    #[serde(default)]
    pub preferred: Vec<Topology>,
}

// ---------------------------------------------------------------------------
// Volume lifecycle state
// ---------------------------------------------------------------------------

/// Tracks the lifecycle state of a volume on a particular node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum VolumeState {
    /// Backing storage exists, nothing is mounted.
    #[default]
    Created,
    /// Formatted and mounted at the staging path.
    Staged,
    /// Bind-mounted into a Pod container.
    Published,
    /// Deleting failed because the device is held elsewhere.  Deletes are
    /// refused until an operator clears the state.
    Stuck { reason: String },
}

/// Health of a volume as reported in listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCondition {
    pub abnormal: bool,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Client-supplied name, the idempotency key.
    pub name: String,
    /// Desired capacity in bytes.
    pub capacity_bytes: u64,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage class parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Placement hints.
    #[serde(default)]
    pub accessibility_requirements: Option<TopologyRequirement>,
}

/// Internal request the Controller forwards to the chosen node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCreateVolumeRequest {
    /// Id assigned by the Controller.
    pub volume_id: VolumeId,
    /// Client-supplied name, kept for logging and recovery.
    pub name: String,
    pub capacity_bytes: u64,
    pub device_mode: DeviceMode,
    /// Parameters after validation, in node-internal form.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to stage (globally mount) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish (bind-mount) a staged volume into a Pod container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The global staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Target path inside the container.
    pub target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Paged listing request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesRequest {
    /// Zero means no limit.
    #[serde(default)]
    pub max_entries: u32,
    #[serde(default)]
    pub starting_token: Option<String>,
}

/// Paged listing response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesResponse {
    pub entries: Vec<Volume>,
    pub next_token: Option<String>,
}

/// Capacity query.  Without a mode the answer covers every mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetCapacityRequest {
    #[serde(default)]
    pub device_mode: Option<DeviceMode>,
    /// Restrict the answer to one node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

/// Total and currently allocatable bytes of one device mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModeCapacity {
    pub total: u64,
    /// Largest volume that can be created right now.
    pub available: u64,
}

impl ModeCapacity {
    /// Change relative to `previous`.
    pub fn delta_from(&self, previous: &ModeCapacity) -> CapacityDelta {
        CapacityDelta {
            total: signed_diff(self.total, previous.total),
            available: signed_diff(self.available, previous.available),
        }
    }

    pub fn apply(&mut self, delta: CapacityDelta) {
        self.total = self.total.saturating_add_signed(delta.total);
        self.available = self.available.saturating_add_signed(delta.available);
    }
}

fn signed_diff(now: u64, before: u64) -> i64 {
    let diff = i128::from(now) - i128::from(before);
    i64::try_from(diff).unwrap_or(if diff < 0 { i64::MIN } else { i64::MAX })
}

/// Signed change of a node's capacity, computed on the node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityDelta {
    pub total: i64,
    pub available: i64,
}

impl CapacityDelta {
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.available == 0
    }
}

/// Capacity of every device mode a node (or the cluster) serves.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityReport {
    pub modes: BTreeMap<DeviceMode, ModeCapacity>,
}

impl CapacityReport {
    pub fn get(&self, mode: DeviceMode) -> ModeCapacity {
        self.modes.get(&mode).copied().unwrap_or_default()
    }

    /// Fold another node's report into a cluster-wide one.
    ///
    /// `total` becomes the sum over nodes.  `available` becomes the largest
    /// single-node figure, the biggest volume that can still be created,
    /// not the free space summed over nodes.
    pub fn merge(&mut self, other: &CapacityReport) {
        for (mode, cap) in &other.modes {
            let entry = self.modes.entry(*mode).or_default();
            entry.total = entry.total.saturating_add(cap.total);
            entry.available = entry.available.max(cap.available);
        }
    }
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"rk8s.pmem.csi"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// RPCs the Controller service implements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    ListVolumes,
    GetCapacity,
    ExpandVolume,
}

/// RPCs the Node service implements beyond the mandatory ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host.
    pub max_volumes: u64,
    /// Topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}

// ---------------------------------------------------------------------------
// Registry records
// ---------------------------------------------------------------------------

/// Who a node is and where its internal endpoint listens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: String,
    /// `host:port` of the node's internal QUIC endpoint.
    pub endpoint: String,
    /// TLS server name in the node's certificate.
    pub server_name: String,
    /// Lowercase hex SHA-256 of the node's DER certificate.
    pub fingerprint: String,
}

/// Registration payload: identity plus a fresh capacity snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub identity: NodeIdentity,
    pub capacity: CapacityReport,
}

/// Liveness as seen by the registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    Reachable,
    /// Heartbeats stopped; kept for deletes once it returns.
    Unreachable,
}

/// One row of the registry table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub identity: NodeIdentity,
    pub status: NodeStatus,
    pub capacity: CapacityReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_display() {
        let id = VolumeId("vol-abc".into());
        assert_eq!(id.to_string(), "vol-abc");
    }

    #[test]
    fn device_mode_parse() {
        assert_eq!("lvm".parse::<DeviceMode>().unwrap(), DeviceMode::Lvm);
        assert_eq!("direct".parse::<DeviceMode>().unwrap(), DeviceMode::Direct);
        assert!("fsdax".parse::<DeviceMode>().is_err());
        let json = serde_json::to_string(&DeviceMode::Direct).unwrap();
        assert_eq!(json, "\"direct\"");
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up(1, 4 * MIB), 4 * MIB);
        assert_eq!(round_up(4 * MIB, 4 * MIB), 4 * MIB);
        assert_eq!(round_up(GIB + 1, GIB), 2 * GIB);
        assert_eq!(round_down(GIB + 1, 4 * MIB), GIB);
        assert_eq!(round_up(17, 0), 17);
    }

    #[test]
    fn capability_validation() {
        assert!(VolumeCapability::default().validate().is_ok());
        assert!(VolumeCapability::block().validate().is_ok());
        assert!(VolumeCapability::mount("btrfs").validate().is_err());

        let mut shared = VolumeCapability::default();
        shared.access_mode = AccessMode::ReadWriteMany;
        assert!(shared.validate().is_err());

        assert_eq!(VolumeCapability::mount("").fs_type(), Some("ext4"));
        assert_eq!(VolumeCapability::block().fs_type(), None);
    }

    #[test]
    fn capacity_delta_applies() {
        let before = ModeCapacity {
            total: 4 * GIB,
            available: 4 * GIB,
        };
        let after = ModeCapacity {
            total: 4 * GIB,
            available: 3 * GIB,
        };
        let delta = after.delta_from(&before);
        assert_eq!(delta.available, -(GIB as i64));

        let mut seen = before;
        seen.apply(delta);
        assert_eq!(seen, after);
    }

    #[test]
    fn report_merge_keeps_largest_available() {
        let mut a = CapacityReport::default();
        a.modes.insert(
            DeviceMode::Lvm,
            ModeCapacity {
                total: 4 * GIB,
                available: GIB,
            },
        );
        let mut b = CapacityReport::default();
        b.modes.insert(
            DeviceMode::Lvm,
            ModeCapacity {
                total: 2 * GIB,
                available: 2 * GIB,
            },
        );
        a.merge(&b);
        assert_eq!(a.get(DeviceMode::Lvm).total, 6 * GIB);
        assert_eq!(a.get(DeviceMode::Lvm).available, 2 * GIB);
        assert_eq!(a.get(DeviceMode::Direct), ModeCapacity::default());
    }

    #[test]
    fn volume_serde_roundtrip() {
        let vol = Volume {
            volume_id: VolumeId("v1".into()),
            capacity_bytes: GIB,
            device_mode: DeviceMode::Direct,
            parameters: HashMap::from([("eraseafter".into(), "false".into())]),
            volume_context: HashMap::new(),
            accessible_topology: vec![Topology::node("rk8s.pmem.csi/node", "node-01")],
            condition: None,
        };
        let json = serde_json::to_string(&vol).expect("serialize");
        let de: Volume = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(de, vol);
        assert_eq!(de.node("rk8s.pmem.csi/node"), Some("node-01"));
    }
}
