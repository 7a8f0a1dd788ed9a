//! In-memory [`DeviceAdapter`].
//!
//! Keeps the same bookkeeping the kernel and LVM would: namespaces consume
//! region space, volume groups are built from namespace block devices and
//! logical volumes consume whole extents.  Used by tests and by nodes started
//! without PMEM hardware.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{
    DeviceAdapter, DeviceError, DeviceErrorKind, LogicalVolume, LvmGeometry, Namespace,
    NamespaceMode, Region, VolumeGroupInfo,
};
use crate::types::round_up;

#[derive(Debug)]
struct SimRegion {
    size: u64,
    /// Index used for kernel-style names (`region3` -> `namespace3.N`).
    index: String,
    next_namespace: u32,
}

#[derive(Debug)]
struct SimVolumeGroup {
    size: u64,
    physical_volumes: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    regions: BTreeMap<String, SimRegion>,
    namespaces: BTreeMap<String, Namespace>,
    volume_groups: BTreeMap<String, SimVolumeGroup>,
    logical_volumes: BTreeMap<(String, String), LogicalVolume>,
    busy: HashSet<String>,
    failures: Vec<(&'static str, DeviceError)>,
    wiped: Vec<(String, bool)>,
    namespaces_created: u64,
    logical_volumes_created: u64,
}

impl State {
    fn region_used(&self, region: &str) -> u64 {
        self.namespaces
            .values()
            .filter(|ns| ns.region == region)
            .map(|ns| ns.size)
            .sum()
    }

    fn vg_used(&self, vg: &str) -> u64 {
        self.logical_volumes
            .values()
            .filter(|lv| lv.volume_group == vg)
            .map(|lv| lv.size)
            .sum()
    }

    fn take_failure(&mut self, op: &str) -> Result<(), DeviceError> {
        match self.failures.iter().position(|(o, _)| *o == op) {
            Some(i) => Err(self.failures.remove(i).1),
            None => Ok(()),
        }
    }

    fn check_busy(&self, path: &str) -> Result<(), DeviceError> {
        if self.busy.contains(path) {
            return Err(DeviceError::new(
                DeviceErrorKind::Busy,
                format!("{path} is in use"),
            ));
        }
        Ok(())
    }
}

/// Simulated PMEM node.
#[derive(Debug)]
pub struct SimulatedAdapter {
    geometry: LvmGeometry,
    state: Mutex<State>,
}

impl SimulatedAdapter {
    pub fn new(geometry: LvmGeometry) -> Self {
        Self {
            geometry,
            state: Mutex::new(State::default()),
        }
    }

    /// Add an fsdax-capable region of `size` bytes.
    pub fn with_region(self, id: &str, size: u64) -> Self {
        self.add_region(id, size);
        self
    }

    pub fn add_region(&self, id: &str, size: u64) {
        let index = id.trim_start_matches("region").to_owned();
        self.lock().regions.insert(
            id.to_owned(),
            SimRegion {
                size,
                index,
                next_namespace: 0,
            },
        );
    }

    /// Mark a device path as held open, so removing or wiping it fails.
    pub fn set_busy(&self, device_path: &str, busy: bool) {
        let mut state = self.lock();
        if busy {
            state.busy.insert(device_path.to_owned());
        } else {
            state.busy.remove(device_path);
        }
    }

    /// Make the next call of adapter method `op` fail with `err`.
    pub fn fail_next(&self, op: &'static str, err: DeviceError) {
        self.lock().failures.push((op, err));
    }

    /// Devices wiped so far, with whether the wipe was full.
    pub fn wiped(&self) -> Vec<(String, bool)> {
        self.lock().wiped.clone()
    }

    /// Number of `create_namespace` calls that succeeded.
    pub fn namespaces_created(&self) -> u64 {
        self.lock().namespaces_created
    }

    /// Number of `create_logical_volume` calls that succeeded.
    pub fn logical_volumes_created(&self) -> u64 {
        self.lock().logical_volumes_created
    }

    /// Logical volumes that currently exist across all groups.
    pub fn logical_volume_count(&self) -> usize {
        self.lock().logical_volumes.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DeviceAdapter for SimulatedAdapter {
    async fn list_regions(&self) -> Result<Vec<Region>, DeviceError> {
        let state = self.lock();
        Ok(state
            .regions
            .iter()
            .map(|(id, r)| Region {
                id: id.clone(),
                size: r.size,
                available: r.size.saturating_sub(state.region_used(id)),
                modes: vec![
                    NamespaceMode::Fsdax,
                    NamespaceMode::Devdax,
                    NamespaceMode::Sector,
                    NamespaceMode::Raw,
                ],
            })
            .collect())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, DeviceError> {
        Ok(self.lock().namespaces.values().cloned().collect())
    }

    async fn create_namespace(
        &self,
        region: &str,
        name: &str,
        size: u64,
    ) -> Result<Namespace, DeviceError> {
        let mut state = self.lock();
        state.take_failure("create_namespace")?;
        if state
            .namespaces
            .values()
            .any(|ns| ns.region == region && ns.name == name)
        {
            return Err(DeviceError::new(
                DeviceErrorKind::Exists,
                format!("namespace {name} already exists in {region}"),
            ));
        }
        let used = state.region_used(region);
        let Some(r) = state.regions.get_mut(region) else {
            return Err(DeviceError::new(
                DeviceErrorKind::NotFound,
                format!("region {region} not found"),
            ));
        };
        if size == 0 || r.size.saturating_sub(used) < size {
            return Err(DeviceError::new(
                DeviceErrorKind::NoSpace,
                format!(
                    "not enough space in {region}: requested {size}, free {}",
                    r.size.saturating_sub(used)
                ),
            ));
        }
        let slot = r.next_namespace;
        r.next_namespace += 1;
        let id = format!("namespace{}.{slot}", r.index);
        let device_path = format!("/dev/pmem{}.{slot}", r.index);

        let ns = Namespace {
            id: id.clone(),
            name: name.to_owned(),
            region: region.to_owned(),
            size,
            mode: NamespaceMode::Fsdax,
            device_path,
        };
        state.namespaces.insert(id, ns.clone());
        state.namespaces_created += 1;
        debug!(id = %ns.id, %region, size, "simulated namespace created");
        Ok(ns)
    }

    async fn destroy_namespace(&self, id: &str) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.take_failure("destroy_namespace")?;
        let Some(ns) = state.namespaces.get(id) else {
            return Err(DeviceError::new(
                DeviceErrorKind::NotFound,
                format!("namespace {id} not found"),
            ));
        };
        state.check_busy(&ns.device_path)?;
        let path = ns.device_path.clone();
        if state
            .volume_groups
            .values()
            .any(|vg| vg.physical_volumes.contains(&path))
        {
            return Err(DeviceError::new(
                DeviceErrorKind::Busy,
                format!("{path} is in use by a volume group"),
            ));
        }
        state.namespaces.remove(id);
        Ok(())
    }

    async fn list_volume_groups(&self) -> Result<Vec<VolumeGroupInfo>, DeviceError> {
        let mut state = self.lock();
        state.take_failure("list_volume_groups")?;
        Ok(state
            .volume_groups
            .iter()
            .map(|(name, vg)| VolumeGroupInfo {
                name: name.clone(),
                size: vg.size,
                free: vg.size.saturating_sub(state.vg_used(name)),
                extent_size: self.geometry.extent_size,
                physical_volumes: vg.physical_volumes.clone(),
            })
            .collect())
    }

    async fn create_volume_group(
        &self,
        name: &str,
        devices: &[String],
    ) -> Result<VolumeGroupInfo, DeviceError> {
        let mut state = self.lock();
        state.take_failure("create_volume_group")?;
        if state.volume_groups.contains_key(name) {
            return Err(DeviceError::new(
                DeviceErrorKind::Exists,
                format!("volume group {name} already exists"),
            ));
        }
        let mut size = 0;
        for dev in devices {
            let ns = state
                .namespaces
                .values()
                .find(|ns| &ns.device_path == dev)
                .ok_or_else(|| {
                    DeviceError::new(DeviceErrorKind::NotFound, format!("device {dev} not found"))
                })?;
            size += self.geometry.usable(ns.size);
        }
        state.volume_groups.insert(
            name.to_owned(),
            SimVolumeGroup {
                size,
                physical_volumes: devices.to_vec(),
            },
        );
        Ok(VolumeGroupInfo {
            name: name.to_owned(),
            size,
            free: size,
            extent_size: self.geometry.extent_size,
            physical_volumes: devices.to_vec(),
        })
    }

    async fn list_logical_volumes(&self, vg: &str) -> Result<Vec<LogicalVolume>, DeviceError> {
        let mut state = self.lock();
        state.take_failure("list_logical_volumes")?;
        if !state.volume_groups.contains_key(vg) {
            return Err(DeviceError::new(
                DeviceErrorKind::NotFound,
                format!("volume group {vg} not found"),
            ));
        }
        Ok(state
            .logical_volumes
            .values()
            .filter(|lv| lv.volume_group == vg)
            .cloned()
            .collect())
    }

    async fn create_logical_volume(
        &self,
        vg: &str,
        name: &str,
        size: u64,
    ) -> Result<LogicalVolume, DeviceError> {
        let mut state = self.lock();
        state.take_failure("create_logical_volume")?;
        let Some(group) = state.volume_groups.get(vg) else {
            return Err(DeviceError::new(
                DeviceErrorKind::NotFound,
                format!("volume group {vg} not found"),
            ));
        };
        let key = (vg.to_owned(), name.to_owned());
        if state.logical_volumes.contains_key(&key) {
            return Err(DeviceError::new(
                DeviceErrorKind::Exists,
                format!("logical volume {vg}/{name} already exists"),
            ));
        }
        let size = round_up(size, self.geometry.extent_size);
        let free = group.size.saturating_sub(state.vg_used(vg));
        if size > free {
            return Err(DeviceError::new(
                DeviceErrorKind::NoSpace,
                format!("volume group {vg} has insufficient free space: requested {size}, free {free}"),
            ));
        }
        let lv = LogicalVolume {
            name: name.to_owned(),
            volume_group: vg.to_owned(),
            size,
            device_path: format!("/dev/{vg}/{name}"),
        };
        state.logical_volumes.insert(key, lv.clone());
        state.logical_volumes_created += 1;
        Ok(lv)
    }

    async fn resize_logical_volume(
        &self,
        vg: &str,
        name: &str,
        size: u64,
    ) -> Result<LogicalVolume, DeviceError> {
        let mut state = self.lock();
        state.take_failure("resize_logical_volume")?;
        let group_size = match state.volume_groups.get(vg) {
            Some(g) => g.size,
            None => {
                return Err(DeviceError::new(
                    DeviceErrorKind::NotFound,
                    format!("volume group {vg} not found"),
                ));
            }
        };
        let free = group_size.saturating_sub(state.vg_used(vg));
        let key = (vg.to_owned(), name.to_owned());
        let Some(lv) = state.logical_volumes.get_mut(&key) else {
            return Err(DeviceError::new(
                DeviceErrorKind::NotFound,
                format!("logical volume {vg}/{name} not found"),
            ));
        };
        let size = round_up(size, self.geometry.extent_size);
        if size > lv.size && size - lv.size > free {
            return Err(DeviceError::new(
                DeviceErrorKind::NoSpace,
                format!("volume group {vg} has insufficient free space"),
            ));
        }
        lv.size = lv.size.max(size);
        Ok(lv.clone())
    }

    async fn remove_logical_volume(&self, vg: &str, name: &str) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.take_failure("remove_logical_volume")?;
        let key = (vg.to_owned(), name.to_owned());
        let Some(lv) = state.logical_volumes.get(&key) else {
            return Err(DeviceError::new(
                DeviceErrorKind::NotFound,
                format!("failed to find logical volume {vg}/{name}"),
            ));
        };
        state.check_busy(&lv.device_path)?;
        state.logical_volumes.remove(&key);
        Ok(())
    }

    async fn wipe(
        &self,
        device_path: &str,
        _size: u64,
        _blocks: u64,
        full: bool,
    ) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.take_failure("wipe")?;
        state.check_busy(device_path)?;
        state.wiped.push((device_path.to_owned(), full));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GIB, MIB};

    fn exact() -> LvmGeometry {
        LvmGeometry {
            extent_size: 4 * MIB,
            pv_metadata_bytes: 0,
        }
    }

    #[tokio::test]
    async fn namespaces_consume_region_space() {
        let sim = SimulatedAdapter::new(exact()).with_region("region0", 2 * GIB);
        let ns = sim.create_namespace("region0", "a", GIB).await.unwrap();
        assert_eq!(ns.id, "namespace0.0");
        assert_eq!(ns.device_path, "/dev/pmem0.0");
        assert_eq!(sim.list_regions().await.unwrap()[0].available, GIB);

        let err = sim
            .create_namespace("region0", "b", 2 * GIB)
            .await
            .unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::NoSpace);

        let err = sim.create_namespace("region0", "a", MIB).await.unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Exists);

        sim.destroy_namespace(&ns.id).await.unwrap();
        assert_eq!(sim.list_regions().await.unwrap()[0].available, 2 * GIB);
    }

    #[tokio::test]
    async fn logical_volumes_round_to_extents() {
        let sim = SimulatedAdapter::new(exact()).with_region("region0", 4 * GIB);
        let ns = sim
            .create_namespace("region0", "pv", 4 * GIB)
            .await
            .unwrap();
        let vg = sim
            .create_volume_group("vg", &[ns.device_path.clone()])
            .await
            .unwrap();
        assert_eq!(vg.size, 4 * GIB);

        let lv = sim.create_logical_volume("vg", "lv", 1).await.unwrap();
        assert_eq!(lv.size, 4 * MIB);
        assert_eq!(
            sim.list_volume_groups().await.unwrap()[0].free,
            4 * GIB - 4 * MIB
        );

        let err = sim.destroy_namespace(&ns.id).await.unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Busy);
    }

    #[tokio::test]
    async fn busy_device_refuses_removal() {
        let sim = SimulatedAdapter::new(exact()).with_region("region0", GIB);
        let ns = sim.create_namespace("region0", "pv", GIB).await.unwrap();
        sim.create_volume_group("vg", &[ns.device_path])
            .await
            .unwrap();
        let lv = sim.create_logical_volume("vg", "lv", GIB / 2).await.unwrap();

        sim.set_busy(&lv.device_path, true);
        let err = sim.remove_logical_volume("vg", "lv").await.unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Busy);

        sim.set_busy(&lv.device_path, false);
        sim.remove_logical_volume("vg", "lv").await.unwrap();
        assert_eq!(sim.logical_volume_count(), 0);
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let sim = SimulatedAdapter::new(exact()).with_region("region0", GIB);
        sim.fail_next(
            "create_namespace",
            DeviceError::new(DeviceErrorKind::Transient, "flaky"),
        );
        assert!(sim.create_namespace("region0", "a", MIB).await.is_err());
        assert!(sim.create_namespace("region0", "a", MIB).await.is_ok());
    }
}
