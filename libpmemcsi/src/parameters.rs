//! Volume parameters carried as string maps.
//!
//! The same keys show up in several places: storage class parameters in
//! `CreateVolume`, the internal request the Controller sends to a node, the
//! volume context handed back to Kubernetes and replayed in stage/publish, and
//! the node's own persisted volume records.  Which keys are allowed depends on
//! where the map came from, so [`VolumeParameters::parse`] takes an
//! [`Origin`].
//!
//! Beware of compatibility when renaming keys: volume contexts are persisted
//! by Kubernetes and node records are persisted on disk.

use std::collections::HashMap;

use crate::error::CsiError;
use crate::types::DeviceMode;

pub const DEVICE_MODE: &str = "deviceMode";
pub const ERASE_AFTER: &str = "eraseafter";
pub const NAME: &str = "name";
pub const SIZE: &str = "size";

/// Set by Kubernetes on inline ephemeral volumes.
pub const EPHEMERAL: &str = "csi.storage.k8s.io/ephemeral";
/// Pod info keys Kubernetes adds to the publish context.
pub const POD_INFO_PREFIX: &str = "csi.storage.k8s.io/";
/// Added by the external provisioner.
pub const PROVISIONER_ID: &str = "storage.kubernetes.io/csiProvisionerIdentity";

/// Where a parameter map came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Storage class parameters in controller `CreateVolume`.
    CreateVolume,
    /// Parameters the Controller forwards to a node.
    NodeCreateVolume,
    /// Volume context replayed in `NodeStageVolume` / `NodePublishVolume`.
    VolumeContext,
    /// Inline ephemeral volume attributes.
    Ephemeral,
    /// The node's persisted record.
    Stored,
}

impl Origin {
    fn allowed(self) -> &'static [&'static str] {
        match self {
            Self::CreateVolume => &[DEVICE_MODE, ERASE_AFTER],
            Self::NodeCreateVolume => &[DEVICE_MODE, ERASE_AFTER, NAME],
            Self::VolumeContext => &[
                DEVICE_MODE,
                ERASE_AFTER,
                NAME,
                SIZE,
                POD_INFO_PREFIX,
                PROVISIONER_ID,
            ],
            Self::Ephemeral => &[DEVICE_MODE, ERASE_AFTER, SIZE, POD_INFO_PREFIX],
            Self::Stored => &[DEVICE_MODE, ERASE_AFTER, NAME, SIZE],
        }
    }
}

/// Parsed parameters.  Unset values fall back to defaults in the getters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeParameters {
    pub device_mode: Option<DeviceMode>,
    pub erase_after: Option<bool>,
    pub name: Option<String>,
    pub size: Option<u64>,
    pub ephemeral: bool,
}

impl VolumeParameters {
    pub fn parse(origin: Origin, map: &HashMap<String, String>) -> Result<Self, CsiError> {
        let allowed = origin.allowed();
        let mut result = Self::default();

        for (key, value) in map {
            let pod_info = key.starts_with(POD_INFO_PREFIX);
            let valid = allowed
                .iter()
                .any(|k| *k == key || (pod_info && *k == POD_INFO_PREFIX));
            if !valid {
                return Err(CsiError::InvalidArgument(format!(
                    "parameter {key:?} invalid in this context"
                )));
            }

            match key.as_str() {
                DEVICE_MODE => result.device_mode = Some(value.parse()?),
                ERASE_AFTER => result.erase_after = Some(parse_bool(key, value)?),
                NAME => result.name = Some(value.clone()),
                SIZE => result.size = Some(parse_quantity(value).map_err(|e| {
                    CsiError::InvalidArgument(format!("parameter {key:?}: {e}"))
                })?),
                EPHEMERAL => result.ephemeral = parse_bool(key, value)?,
                // Pod info and provisioner identity are informational.
                _ => {}
            }
        }

        if origin == Origin::Ephemeral && result.size.is_none() {
            return Err(CsiError::InvalidArgument(format!(
                "required parameter {SIZE:?} not specified"
            )));
        }
        Ok(result)
    }

    /// Back to a string map for volume contexts and node records.
    pub fn to_context(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        if let Some(mode) = self.device_mode {
            out.insert(DEVICE_MODE.to_owned(), mode.to_string());
        }
        if let Some(erase) = self.erase_after {
            out.insert(ERASE_AFTER.to_owned(), erase.to_string());
        }
        if let Some(name) = &self.name {
            out.insert(NAME.to_owned(), name.clone());
        }
        if let Some(size) = self.size {
            out.insert(SIZE.to_owned(), size.to_string());
        }
        out
    }

    pub fn device_mode_or(&self, default: DeviceMode) -> DeviceMode {
        self.device_mode.unwrap_or(default)
    }

    /// Wiping freed storage is on unless a volume opts out.
    pub fn erase_after(&self) -> bool {
        self.erase_after.unwrap_or(true)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, CsiError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "t" => Ok(true),
        "false" | "0" | "f" => Ok(false),
        _ => Err(CsiError::InvalidArgument(format!(
            "parameter {key:?}: failed to parse {value:?} as boolean"
        ))),
    }
}

/// Parse a Kubernetes-style quantity such as `4Gi`, `100M` or `1073741824`.
pub fn parse_quantity(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    let number: u64 = digits
        .parse()
        .map_err(|_| format!("{value:?} is not a quantity"))?;
    let factor: u64 = match suffix {
        "" => 1,
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        other => return Err(format!("unknown quantity suffix {other:?}")),
    };
    number
        .checked_mul(factor)
        .ok_or_else(|| format!("{value:?} overflows"))
}
