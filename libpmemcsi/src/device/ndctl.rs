//! [`DeviceAdapter`] backed by `ndctl` and the LVM command line tools.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, instrument};

use super::exec::{run_command, wait_device_appears};
use super::{
    DeviceAdapter, DeviceError, DeviceErrorKind, LogicalVolume, Namespace, NamespaceMode, Region,
    VolumeGroupInfo,
};

/// Adapter for real PMEM hardware.
#[derive(Debug, Default, Clone)]
pub struct SystemAdapter;

impl SystemAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// `ndctl list` prints a bare object when there is exactly one match.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Many(v) => v,
            Self::One(t) => vec![t],
        }
    }
}

#[derive(Debug, Deserialize)]
struct NdctlRegion {
    dev: String,
    size: u64,
    #[serde(default)]
    available_size: u64,
    #[serde(default)]
    max_available_extent: Option<u64>,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    namespaces: Vec<NdctlNamespace>,
}

#[derive(Debug, Deserialize)]
struct NdctlNamespace {
    dev: String,
    #[serde(default)]
    mode: String,
    size: u64,
    #[serde(default)]
    blockdev: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

fn namespace_mode(mode: &str) -> NamespaceMode {
    match mode {
        "fsdax" | "memory" => NamespaceMode::Fsdax,
        "devdax" | "dax" => NamespaceMode::Devdax,
        "sector" => NamespaceMode::Sector,
        _ => NamespaceMode::Raw,
    }
}

fn convert_namespace(region: &str, ns: NdctlNamespace) -> Namespace {
    let device_path = ns
        .blockdev
        .as_deref()
        .map(|b| format!("/dev/{b}"))
        .unwrap_or_default();
    Namespace {
        id: ns.dev,
        name: ns.name.unwrap_or_default(),
        region: region.to_owned(),
        size: ns.size,
        mode: namespace_mode(&ns.mode),
        device_path,
    }
}

fn parse_json<T: for<'de> Deserialize<'de>>(what: &str, out: &str) -> Result<T, DeviceError> {
    serde_json::from_str(out).map_err(|e| {
        DeviceError::new(
            DeviceErrorKind::Permanent,
            format!("unexpected {what} output: {e}"),
        )
    })
}

/// Parse `ndctl list -RN`.
pub(crate) fn parse_regions(out: &str) -> Result<(Vec<Region>, Vec<Namespace>), DeviceError> {
    if out.trim().is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    let raw: OneOrMany<NdctlRegion> = parse_json("ndctl list", out)?;
    let mut regions = Vec::new();
    let mut namespaces = Vec::new();
    for r in raw.into_vec() {
        let modes = if r.kind == "pmem" {
            vec![
                NamespaceMode::Fsdax,
                NamespaceMode::Devdax,
                NamespaceMode::Sector,
                NamespaceMode::Raw,
            ]
        } else {
            vec![NamespaceMode::Sector, NamespaceMode::Raw]
        };
        for ns in r.namespaces {
            namespaces.push(convert_namespace(&r.dev, ns));
        }
        regions.push(Region {
            available: r.max_available_extent.unwrap_or(r.available_size),
            id: r.dev,
            size: r.size,
            modes,
        });
    }
    Ok((regions, namespaces))
}

#[derive(Debug, Deserialize)]
struct LvmReport<T> {
    report: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct VgSection {
    #[serde(default)]
    vg: Vec<VgRow>,
}

#[derive(Debug, Deserialize)]
struct VgRow {
    vg_name: String,
    vg_size: String,
    vg_free: String,
    vg_extent_size: String,
    #[serde(default)]
    pv_name: String,
}

#[derive(Debug, Deserialize)]
struct LvSection {
    #[serde(default)]
    lv: Vec<LvRow>,
}

#[derive(Debug, Deserialize)]
struct LvRow {
    lv_name: String,
    lv_size: String,
    #[serde(default)]
    lv_path: String,
}

fn bytes(field: &str, value: &str) -> Result<u64, DeviceError> {
    value.trim().trim_end_matches('B').parse().map_err(|_| {
        DeviceError::new(
            DeviceErrorKind::Permanent,
            format!("cannot parse {field} value {value:?}"),
        )
    })
}

/// Parse `vgs --reportformat json` with one row per physical volume.
pub(crate) fn parse_volume_groups(out: &str) -> Result<Vec<VolumeGroupInfo>, DeviceError> {
    let report: LvmReport<VgSection> = parse_json("vgs", out)?;
    let mut groups: BTreeMap<String, VolumeGroupInfo> = BTreeMap::new();
    for row in report.report.into_iter().flat_map(|s| s.vg) {
        let size = bytes("vg_size", &row.vg_size)?;
        let free = bytes("vg_free", &row.vg_free)?;
        let extent_size = bytes("vg_extent_size", &row.vg_extent_size)?;
        let entry = groups
            .entry(row.vg_name.clone())
            .or_insert_with(|| VolumeGroupInfo {
                name: row.vg_name.clone(),
                size,
                free,
                extent_size,
                physical_volumes: Vec::new(),
            });
        if !row.pv_name.is_empty() {
            entry.physical_volumes.push(row.pv_name);
        }
    }
    Ok(groups.into_values().collect())
}

/// Parse `lvs --reportformat json`.
pub(crate) fn parse_logical_volumes(
    vg: &str,
    out: &str,
) -> Result<Vec<LogicalVolume>, DeviceError> {
    let report: LvmReport<LvSection> = parse_json("lvs", out)?;
    report
        .report
        .into_iter()
        .flat_map(|s| s.lv)
        .map(|row| {
            Ok(LogicalVolume {
                size: bytes("lv_size", &row.lv_size)?,
                device_path: if row.lv_path.is_empty() {
                    format!("/dev/{vg}/{}", row.lv_name)
                } else {
                    row.lv_path
                },
                name: row.lv_name,
                volume_group: vg.to_owned(),
            })
        })
        .collect()
}

#[async_trait]
impl DeviceAdapter for SystemAdapter {
    async fn list_regions(&self) -> Result<Vec<Region>, DeviceError> {
        let out = run_command("ndctl", &["list", "-RN"]).await?;
        Ok(parse_regions(&out)?.0)
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, DeviceError> {
        let out = run_command("ndctl", &["list", "-RN"]).await?;
        Ok(parse_regions(&out)?.1)
    }

    #[instrument(skip(self))]
    async fn create_namespace(
        &self,
        region: &str,
        name: &str,
        size: u64,
    ) -> Result<Namespace, DeviceError> {
        let size_arg = size.to_string();
        let out = run_command(
            "ndctl",
            &[
                "create-namespace",
                "--mode",
                "fsdax",
                "--region",
                region,
                "--size",
                &size_arg,
                "--name",
                name,
            ],
        )
        .await?;
        let ns: NdctlNamespace = parse_json("ndctl create-namespace", &out)?;
        let ns = convert_namespace(region, ns);
        if !ns.device_path.is_empty() {
            wait_device_appears(&ns.device_path).await?;
        }
        info!(id = %ns.id, device = %ns.device_path, "namespace created");
        Ok(ns)
    }

    #[instrument(skip(self))]
    async fn destroy_namespace(&self, id: &str) -> Result<(), DeviceError> {
        run_command("ndctl", &["destroy-namespace", "--force", id]).await?;
        info!(%id, "namespace destroyed");
        Ok(())
    }

    async fn list_volume_groups(&self) -> Result<Vec<VolumeGroupInfo>, DeviceError> {
        let out = run_command(
            "vgs",
            &[
                "--reportformat",
                "json",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                "vg_name,vg_size,vg_free,vg_extent_size,pv_name",
            ],
        )
        .await?;
        parse_volume_groups(&out)
    }

    #[instrument(skip(self))]
    async fn create_volume_group(
        &self,
        name: &str,
        devices: &[String],
    ) -> Result<VolumeGroupInfo, DeviceError> {
        let mut args = vec!["--force", name];
        args.extend(devices.iter().map(String::as_str));
        run_command("vgcreate", &args).await?;
        self.list_volume_groups()
            .await?
            .into_iter()
            .find(|vg| vg.name == name)
            .ok_or_else(|| {
                DeviceError::new(
                    DeviceErrorKind::NotFound,
                    format!("volume group {name} missing after vgcreate"),
                )
            })
    }

    async fn list_logical_volumes(&self, vg: &str) -> Result<Vec<LogicalVolume>, DeviceError> {
        let out = run_command(
            "lvs",
            &[
                "--reportformat",
                "json",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                "lv_name,lv_size,lv_path",
                vg,
            ],
        )
        .await?;
        parse_logical_volumes(vg, &out)
    }

    #[instrument(skip(self))]
    async fn create_logical_volume(
        &self,
        vg: &str,
        name: &str,
        size: u64,
    ) -> Result<LogicalVolume, DeviceError> {
        let size_arg = format!("{size}b");
        // -Zn: skip zeroing, the device is wiped when it is freed.
        run_command("lvcreate", &["-Zn", "-L", &size_arg, "-n", name, vg]).await?;
        let lv = self
            .list_logical_volumes(vg)
            .await?
            .into_iter()
            .find(|lv| lv.name == name)
            .ok_or_else(|| {
                DeviceError::new(
                    DeviceErrorKind::NotFound,
                    format!("logical volume {vg}/{name} missing after lvcreate"),
                )
            })?;
        wait_device_appears(&lv.device_path).await?;
        Ok(lv)
    }

    #[instrument(skip(self))]
    async fn resize_logical_volume(
        &self,
        vg: &str,
        name: &str,
        size: u64,
    ) -> Result<LogicalVolume, DeviceError> {
        let size_arg = format!("{size}b");
        let target = format!("{vg}/{name}");
        run_command("lvextend", &["-L", &size_arg, &target]).await?;
        self.list_logical_volumes(vg)
            .await?
            .into_iter()
            .find(|lv| lv.name == name)
            .ok_or_else(|| {
                DeviceError::new(
                    DeviceErrorKind::NotFound,
                    format!("logical volume {target} missing after lvextend"),
                )
            })
    }

    #[instrument(skip(self))]
    async fn remove_logical_volume(&self, vg: &str, name: &str) -> Result<(), DeviceError> {
        let target = format!("{vg}/{name}");
        run_command("lvremove", &["-fy", &target]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn wipe(
        &self,
        device_path: &str,
        size: u64,
        blocks: u64,
        full: bool,
    ) -> Result<(), DeviceError> {
        if full {
            // One pass instead of shred's default three.
            run_command("shred", &["-n", "1", device_path]).await?;
            return Ok(());
        }
        let blocks = blocks.min(size / 1024);
        if blocks == 0 {
            return Ok(());
        }
        let of = format!("of={device_path}");
        let count = format!("count={blocks}");
        run_command("dd", &["if=/dev/zero", &of, "bs=1024", &count]).await?;
        Ok(())
    }
}
