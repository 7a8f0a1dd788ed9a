//! LVM mode: one volume group pooled across all LVM regions.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::rollback::Rollback;
use super::{Allocation, BackingHandle, PoolAllocator, release_error};
use crate::device::{
    DeviceAdapter, DeviceErrorKind, LogicalVolume, LvmGeometry, Region, VolumeGroupInfo,
};
use crate::error::CsiError;
use crate::types::{DeviceMode, ModeCapacity, round_down, round_up};

/// Name of the namespace a region contributes as physical volume.
pub fn physical_volume_name(region: &str) -> String {
    format!("pmem-csi-{region}")
}

/// Volume group name for a set of regions.  Order of `regions` does not
/// matter, so the name can be re-derived after a restart.
pub fn volume_group_name(mode: DeviceMode, regions: &[String]) -> String {
    let mut sorted: Vec<&str> = regions.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    format!("pmem-csi-{mode}-{}", sorted.join("-"))
}

pub struct LvmPool {
    adapter: Arc<dyn DeviceAdapter>,
    regions: Vec<String>,
    vg_name: String,
    geometry: LvmGeometry,
    pmem_percentage: u8,
    erase_blocks: u64,
    lock: Mutex<()>,
}

impl LvmPool {
    pub fn new(
        adapter: Arc<dyn DeviceAdapter>,
        regions: Vec<Region>,
        geometry: LvmGeometry,
        pmem_percentage: u8,
        erase_blocks: u64,
    ) -> Self {
        let regions: Vec<String> = regions.into_iter().map(|r| r.id).collect();
        let vg_name = volume_group_name(DeviceMode::Lvm, &regions);
        Self {
            adapter,
            regions,
            vg_name,
            geometry,
            pmem_percentage,
            erase_blocks,
            lock: Mutex::new(()),
        }
    }

    pub fn volume_group(&self) -> &str {
        &self.vg_name
    }

    async fn find_group(&self) -> Result<Option<VolumeGroupInfo>, CsiError> {
        Ok(self
            .adapter
            .list_volume_groups()
            .await?
            .into_iter()
            .find(|vg| vg.name == self.vg_name))
    }

    /// Bytes a region turns into a physical volume.
    fn planned_pv_size(&self, region: &Region) -> u64 {
        let share = u128::from(region.size) * u128::from(self.pmem_percentage) / 100;
        let share = u64::try_from(share).unwrap_or(region.size);
        round_down(share.min(region.available), self.geometry.extent_size)
    }

    /// Capacity the group will have once created.
    async fn predicted(&self) -> Result<ModeCapacity, CsiError> {
        let regions = self.adapter.list_regions().await?;
        let total = regions
            .iter()
            .filter(|r| self.regions.contains(&r.id))
            .map(|r| self.geometry.usable(self.planned_pv_size(r)))
            .sum();
        Ok(ModeCapacity {
            total,
            available: total,
        })
    }

    /// Find the volume group, creating its physical volumes and the group
    /// itself on first use.  Must be called with the pool lock held.
    async fn ensure_group(&self, cancel: &CancellationToken) -> Result<VolumeGroupInfo, CsiError> {
        if let Some(vg) = self.find_group().await? {
            return Ok(vg);
        }

        let mut rollback = Rollback::new("create volume group");
        let result = self.create_group(&mut rollback, cancel).await;
        rollback.finish(result).await
    }

    async fn create_group(
        &self,
        rollback: &mut Rollback,
        cancel: &CancellationToken,
    ) -> Result<VolumeGroupInfo, CsiError> {
        let regions = self.adapter.list_regions().await?;
        let namespaces = self.adapter.list_namespaces().await?;
        let mut devices = Vec::new();

        for region in regions.iter().filter(|r| self.regions.contains(&r.id)) {
            rollback.check(cancel)?;
            let pv_name = physical_volume_name(&region.id);
            // Left over from an interrupted attempt.
            if let Some(ns) = namespaces
                .iter()
                .find(|ns| ns.region == region.id && ns.name == pv_name)
            {
                devices.push(ns.device_path.clone());
                continue;
            }
            let size = self.planned_pv_size(region);
            if size == 0 {
                debug!(region = %region.id, "no space left for a physical volume");
                continue;
            }
            let ns = self
                .adapter
                .create_namespace(&region.id, &pv_name, size)
                .await?;
            let adapter = Arc::clone(&self.adapter);
            let id = ns.id.clone();
            rollback.push(
                format!("destroy namespace {id}"),
                Box::pin(async move { Ok(adapter.destroy_namespace(&id).await?) }),
            );
            devices.push(ns.device_path);
        }

        if devices.is_empty() {
            return Err(CsiError::InsufficientCapacity {
                mode: DeviceMode::Lvm,
                requested: 0,
                available: 0,
            });
        }
        rollback.check(cancel)?;
        let vg = self
            .adapter
            .create_volume_group(&self.vg_name, &devices)
            .await?;
        info!(vg = %vg.name, size = vg.size, pvs = ?vg.physical_volumes, "volume group created");
        Ok(vg)
    }

    async fn find_volume(&self, name: &str) -> Result<Option<LogicalVolume>, CsiError> {
        if self.find_group().await?.is_none() {
            return Ok(None);
        }
        Ok(self
            .adapter
            .list_logical_volumes(&self.vg_name)
            .await?
            .into_iter()
            .find(|lv| lv.name == name))
    }

    fn allocation(&self, lv: LogicalVolume) -> Allocation {
        Allocation {
            size: lv.size,
            handle: BackingHandle::Lvm {
                volume_group: lv.volume_group,
                name: lv.name,
                device_path: lv.device_path,
            },
        }
    }

    fn check_handle<'a>(&self, handle: &'a BackingHandle) -> Result<&'a str, CsiError> {
        match handle {
            BackingHandle::Lvm {
                volume_group, name, ..
            } if *volume_group == self.vg_name => Ok(name),
            other => Err(CsiError::Internal(format!(
                "{other} does not belong to volume group {}",
                self.vg_name
            ))),
        }
    }
}

#[async_trait]
impl PoolAllocator for LvmPool {
    fn mode(&self) -> DeviceMode {
        DeviceMode::Lvm
    }

    #[instrument(skip(self, cancel), fields(vg = %self.vg_name))]
    async fn reserve(
        &self,
        name: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<Allocation, CsiError> {
        let _guard = self.lock.lock().await;
        let vg = self.ensure_group(cancel).await.map_err(|e| match e {
            CsiError::InsufficientCapacity { .. } => CsiError::InsufficientCapacity {
                mode: DeviceMode::Lvm,
                requested: size,
                available: 0,
            },
            other => other,
        })?;
        let size = round_up(size, vg.extent_size.max(1));

        if let Some(lv) = self.find_volume(name).await? {
            if lv.size >= size {
                debug!(%name, "logical volume already exists");
                return Ok(self.allocation(lv));
            }
            return Err(CsiError::VolumeAlreadyExists(name.to_owned()));
        }

        if size > vg.free {
            return Err(CsiError::InsufficientCapacity {
                mode: DeviceMode::Lvm,
                requested: size,
                available: vg.free,
            });
        }
        if cancel.is_cancelled() {
            return Err(CsiError::Cancelled(format!("reserve {name}")));
        }

        let lv = self
            .adapter
            .create_logical_volume(&self.vg_name, name, size)
            .await
            .map_err(|e| match e.kind {
                DeviceErrorKind::NoSpace => CsiError::InsufficientCapacity {
                    mode: DeviceMode::Lvm,
                    requested: size,
                    available: vg.free,
                },
                _ => e.into(),
            })?;
        info!(%name, size = lv.size, device = %lv.device_path, "logical volume created");
        Ok(self.allocation(lv))
    }

    #[instrument(skip(self), fields(handle = %handle))]
    async fn release(&self, handle: &BackingHandle, erase: bool) -> Result<(), CsiError> {
        let name = self.check_handle(handle)?;
        let _guard = self.lock.lock().await;
        let Some(lv) = self.find_volume(name).await? else {
            debug!("logical volume already gone");
            return Ok(());
        };
        self.adapter
            .wipe(&lv.device_path, lv.size, self.erase_blocks, erase)
            .await
            .map_err(|e| release_error(handle, e))?;
        match self.adapter.remove_logical_volume(&self.vg_name, name).await {
            Ok(()) => {}
            Err(e) if e.kind == DeviceErrorKind::NotFound => {}
            Err(e) => return Err(release_error(handle, e)),
        }
        info!(size = lv.size, "logical volume removed");
        Ok(())
    }

    async fn capacity(&self) -> Result<ModeCapacity, CsiError> {
        match self.find_group().await? {
            Some(vg) => Ok(ModeCapacity {
                total: vg.size,
                available: vg.free,
            }),
            None => self.predicted().await,
        }
    }

    #[instrument(skip(self), fields(handle = %handle))]
    async fn expand(&self, handle: &BackingHandle, new_size: u64) -> Result<u64, CsiError> {
        let name = self.check_handle(handle)?;
        let _guard = self.lock.lock().await;
        let lv = self
            .find_volume(name)
            .await?
            .ok_or_else(|| CsiError::VolumeNotFound(name.to_owned()))?;
        let target = round_up(new_size, self.geometry.extent_size);
        if target <= lv.size {
            return Ok(lv.size);
        }
        let free = self.find_group().await?.map(|vg| vg.free).unwrap_or(0);
        let lv = self
            .adapter
            .resize_logical_volume(&self.vg_name, name, target)
            .await
            .map_err(|e| match e.kind {
                DeviceErrorKind::NoSpace => CsiError::InsufficientCapacity {
                    mode: DeviceMode::Lvm,
                    requested: target - lv.size,
                    available: free,
                },
                _ => e.into(),
            })?;
        info!(size = lv.size, "logical volume expanded");
        Ok(lv.size)
    }

    async fn lookup(&self, handle: &BackingHandle) -> Result<Option<u64>, CsiError> {
        let name = self.check_handle(handle)?;
        Ok(self.find_volume(name).await?.map(|lv| lv.size))
    }

    async fn list(&self) -> Result<Vec<Allocation>, CsiError> {
        if self.find_group().await?.is_none() {
            return Ok(Vec::new());
        }
        Ok(self
            .adapter
            .list_logical_volumes(&self.vg_name)
            .await?
            .into_iter()
            .map(|lv| self.allocation(lv))
            .collect())
    }
}
