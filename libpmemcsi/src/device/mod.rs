//! Device / LVM adapter.
//!
//! [`DeviceAdapter`] is the only place that touches PMEM hardware.  It
//! enumerates regions and namespaces, creates and destroys fsdax namespaces,
//! and manages volume groups and logical volumes on top of them.  The
//! production implementation, [`SystemAdapter`], shells out to `ndctl` and the
//! LVM tools; [`SimulatedAdapter`] keeps the same bookkeeping in memory.

mod exec;
mod ndctl;
mod simulated;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CsiError;
use crate::types::MIB;

pub use exec::run_command;
pub use ndctl::SystemAdapter;
pub use simulated::SimulatedAdapter;

/// Classification of a device or command failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceErrorKind {
    /// Worth retrying as is.
    Transient,
    /// Device node has not shown up yet.
    NotReady,
    NotFound,
    Exists,
    /// Region or volume group is full.
    NoSpace,
    /// Held by another user or the kernel.
    Busy,
    /// Hardware or configuration problem; retrying will not help.
    Permanent,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transient => "transient",
            Self::NotReady => "not ready",
            Self::NotFound => "not found",
            Self::Exists => "exists",
            Self::NoSpace => "no space",
            Self::Busy => "busy",
            Self::Permanent => "permanent",
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<DeviceError> for CsiError {
    fn from(e: DeviceError) -> Self {
        CsiError::Device {
            kind: e.kind,
            message: e.message,
        }
    }
}

/// Namespace personality supported by a region.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceMode {
    Fsdax,
    Devdax,
    Sector,
    Raw,
}

/// Contiguous PMEM address range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Region {
    /// Kernel name, e.g. `region0`.
    pub id: String,
    pub size: u64,
    /// Largest contiguous free extent.
    pub available: u64,
    pub modes: Vec<NamespaceMode>,
}

impl Region {
    pub fn supports_fsdax(&self) -> bool {
        self.modes.contains(&NamespaceMode::Fsdax)
    }
}

/// Kernel-addressable device carved from a region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    /// Kernel name, e.g. `namespace0.1`.
    pub id: String,
    /// Label given at creation.
    pub name: String,
    pub region: String,
    pub size: u64,
    pub mode: NamespaceMode,
    /// Block device path, e.g. `/dev/pmem0.1`.
    pub device_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeGroupInfo {
    pub name: String,
    pub size: u64,
    pub free: u64,
    pub extent_size: u64,
    pub physical_volumes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogicalVolume {
    pub name: String,
    pub volume_group: String,
    pub size: u64,
    pub device_path: String,
}

/// How LVM turns physical volume bytes into allocatable extents.
///
/// Each physical volume loses `pv_metadata_bytes` to the PV label and VG
/// metadata area and is then truncated to whole extents.  Both numbers depend
/// on how `vgcreate` is tuned on the host, so they are configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LvmGeometry {
    pub extent_size: u64,
    pub pv_metadata_bytes: u64,
}

impl Default for LvmGeometry {
    fn default() -> Self {
        Self {
            extent_size: 4 * MIB,
            pv_metadata_bytes: MIB,
        }
    }
}

impl LvmGeometry {
    /// Allocatable bytes a physical volume of `pv_size` contributes.
    pub fn usable(&self, pv_size: u64) -> u64 {
        crate::types::round_down(
            pv_size.saturating_sub(self.pv_metadata_bytes),
            self.extent_size,
        )
    }
}

/// Access to local PMEM hardware and the LVM stack on top of it.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    async fn list_regions(&self) -> Result<Vec<Region>, DeviceError>;

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, DeviceError>;

    /// Create an fsdax namespace of at least `size` bytes.
    async fn create_namespace(
        &self,
        region: &str,
        name: &str,
        size: u64,
    ) -> Result<Namespace, DeviceError>;

    async fn destroy_namespace(&self, id: &str) -> Result<(), DeviceError>;

    async fn list_volume_groups(&self) -> Result<Vec<VolumeGroupInfo>, DeviceError>;

    async fn create_volume_group(
        &self,
        name: &str,
        devices: &[String],
    ) -> Result<VolumeGroupInfo, DeviceError>;

    async fn list_logical_volumes(&self, vg: &str) -> Result<Vec<LogicalVolume>, DeviceError>;

    async fn create_logical_volume(
        &self,
        vg: &str,
        name: &str,
        size: u64,
    ) -> Result<LogicalVolume, DeviceError>;

    /// Grow a logical volume to `size` bytes.
    async fn resize_logical_volume(
        &self,
        vg: &str,
        name: &str,
        size: u64,
    ) -> Result<LogicalVolume, DeviceError>;

    async fn remove_logical_volume(&self, vg: &str, name: &str) -> Result<(), DeviceError>;

    /// Zero the first `blocks` KiB of a device, or overwrite all of it when
    /// `full` is set, so the next owner cannot see old data.
    async fn wipe(
        &self,
        device_path: &str,
        size: u64,
        blocks: u64,
        full: bool,
    ) -> Result<(), DeviceError>;
}
