//! Volume Group Manager: maps volume requests onto node-local PMEM.
//!
//! Every fsdax-capable region is assigned to one [`DeviceMode`].  All LVM
//! regions back a single volume group ([`lvm::LvmPool`]); every Direct region
//! is its own pool inside [`direct::DirectPool`].  The manager dispatches by
//! mode through the [`PoolAllocator`] trait so callers never branch on it.
//!
//! Allocation is serialized per pool: the LVM pool has one lock, the Direct
//! pool one lock per region.

mod direct;
mod lvm;
pub mod rollback;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::device::{DeviceAdapter, DeviceError, DeviceErrorKind, LvmGeometry};
use crate::error::CsiError;
use crate::types::{CapacityReport, DeviceMode, MIB, ModeCapacity};

pub use direct::DirectPool;
pub use lvm::{LvmPool, volume_group_name};
pub use rollback::Rollback;

/// Allocation settings of a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Mode of regions not listed in `region_modes`.
    pub default_mode: DeviceMode,
    /// Per-region overrides, keyed by region id.
    pub region_modes: BTreeMap<String, DeviceMode>,
    /// Share of each LVM region turned into a physical volume.
    pub pmem_percentage: u8,
    pub lvm: LvmGeometry,
    /// Namespace size granularity in Direct mode.
    pub direct_alignment: u64,
    /// KiB zeroed at the start of a freed device when no full erase is asked.
    pub erase_blocks: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_mode: DeviceMode::Lvm,
            region_modes: BTreeMap::new(),
            pmem_percentage: 100,
            lvm: LvmGeometry::default(),
            direct_alignment: 2 * MIB,
            erase_blocks: 4,
        }
    }
}

impl PoolConfig {
    pub fn mode_of(&self, region: &str) -> DeviceMode {
        self.region_modes
            .get(region)
            .copied()
            .unwrap_or(self.default_mode)
    }

    pub fn validate(&self) -> Result<(), CsiError> {
        if self.pmem_percentage == 0 || self.pmem_percentage > 100 {
            return Err(CsiError::InvalidArgument(format!(
                "pmem_percentage must be within 1..=100, got {}",
                self.pmem_percentage
            )));
        }
        if self.lvm.extent_size == 0 || self.direct_alignment == 0 {
            return Err(CsiError::InvalidArgument(
                "extent size and namespace alignment must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Identifies the backing storage of one volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackingHandle {
    Lvm {
        volume_group: String,
        name: String,
        device_path: String,
    },
    Namespace {
        region: String,
        id: String,
        name: String,
        device_path: String,
    },
}

impl BackingHandle {
    pub fn mode(&self) -> DeviceMode {
        match self {
            Self::Lvm { .. } => DeviceMode::Lvm,
            Self::Namespace { .. } => DeviceMode::Direct,
        }
    }

    pub fn device_path(&self) -> &str {
        match self {
            Self::Lvm { device_path, .. } | Self::Namespace { device_path, .. } => device_path,
        }
    }

    /// Name given at reservation time, the volume id.
    pub fn name(&self) -> &str {
        match self {
            Self::Lvm { name, .. } | Self::Namespace { name, .. } => name,
        }
    }
}

impl fmt::Display for BackingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lvm {
                volume_group, name, ..
            } => write!(f, "lv {volume_group}/{name}"),
            Self::Namespace { region, id, .. } => write!(f, "namespace {id} in {region}"),
        }
    }
}

/// A reserved piece of storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Allocation {
    pub handle: BackingHandle,
    /// Actual size after rounding.
    pub size: u64,
}

/// One device mode's allocation policy.
#[async_trait]
pub trait PoolAllocator: Send + Sync {
    fn mode(&self) -> DeviceMode;

    /// Reserve at least `size` bytes under `name`.  A reservation that
    /// already exists under that name and is large enough is returned as is.
    async fn reserve(
        &self,
        name: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<Allocation, CsiError>;

    /// Free the storage, wiping it first.  Already gone is success.
    async fn release(&self, handle: &BackingHandle, erase: bool) -> Result<(), CsiError>;

    async fn capacity(&self) -> Result<ModeCapacity, CsiError>;

    /// Grow to at least `new_size`, returning the resulting size.
    async fn expand(&self, handle: &BackingHandle, new_size: u64) -> Result<u64, CsiError>;

    /// Size of the backing object, `None` when it does not exist.
    async fn lookup(&self, handle: &BackingHandle) -> Result<Option<u64>, CsiError>;

    /// Everything this pool currently holds.
    async fn list(&self) -> Result<Vec<Allocation>, CsiError>;
}

/// Turn a device failure during release into the error surfaced upwards.
/// A busy device will not free itself, so the volume is reported stuck.
pub(crate) fn release_error(handle: &BackingHandle, e: DeviceError) -> CsiError {
    if e.kind == DeviceErrorKind::Busy {
        warn!(%handle, error = %e, "backing device busy, volume stuck");
        CsiError::VolumeStuck {
            volume_id: handle.name().to_owned(),
            reason: e.message,
        }
    } else {
        e.into()
    }
}

pub struct VolumeGroupManager {
    pools: BTreeMap<DeviceMode, Arc<dyn PoolAllocator>>,
}

impl VolumeGroupManager {
    /// Inspect the node's regions and build one pool per mode that has any.
    pub async fn discover(
        adapter: Arc<dyn DeviceAdapter>,
        config: &PoolConfig,
    ) -> Result<Self, CsiError> {
        config.validate()?;
        let regions = adapter.list_regions().await?;

        let mut by_mode: BTreeMap<DeviceMode, Vec<_>> = BTreeMap::new();
        for region in regions {
            if !region.supports_fsdax() {
                warn!(region = %region.id, "region does not support fsdax, ignoring");
                continue;
            }
            by_mode
                .entry(config.mode_of(&region.id))
                .or_default()
                .push(region);
        }

        let mut pools: BTreeMap<DeviceMode, Arc<dyn PoolAllocator>> = BTreeMap::new();
        for (mode, regions) in by_mode {
            let ids: Vec<String> = regions.iter().map(|r| r.id.clone()).collect();
            info!(%mode, regions = ?ids, "device pool configured");
            let pool: Arc<dyn PoolAllocator> = match mode {
                DeviceMode::Lvm => Arc::new(LvmPool::new(
                    Arc::clone(&adapter),
                    regions,
                    config.lvm,
                    config.pmem_percentage,
                    config.erase_blocks,
                )),
                DeviceMode::Direct => Arc::new(DirectPool::new(
                    Arc::clone(&adapter),
                    regions,
                    config.direct_alignment,
                    config.erase_blocks,
                )),
            };
            pools.insert(mode, pool);
        }
        Ok(Self { pools })
    }

    /// Build from explicit pools.
    pub fn from_pools(pools: impl IntoIterator<Item = Arc<dyn PoolAllocator>>) -> Self {
        Self {
            pools: pools.into_iter().map(|p| (p.mode(), p)).collect(),
        }
    }

    pub fn modes(&self) -> impl Iterator<Item = DeviceMode> + '_ {
        self.pools.keys().copied()
    }

    fn pool(&self, mode: DeviceMode) -> Result<&Arc<dyn PoolAllocator>, CsiError> {
        self.pools.get(&mode).ok_or_else(|| {
            CsiError::NoSuitableGroup(format!("no region on this node serves {mode} mode"))
        })
    }

    #[instrument(skip(self, cancel))]
    pub async fn reserve(
        &self,
        name: &str,
        size: u64,
        mode: DeviceMode,
        cancel: &CancellationToken,
    ) -> Result<Allocation, CsiError> {
        if size == 0 {
            return Err(CsiError::InvalidArgument("volume size must be positive".into()));
        }
        self.pool(mode)?.reserve(name, size, cancel).await
    }

    #[instrument(skip(self), fields(handle = %handle))]
    pub async fn release(&self, handle: &BackingHandle, erase: bool) -> Result<(), CsiError> {
        self.pool(handle.mode())?.release(handle, erase).await
    }

    /// Capacity of `mode`; zero when the node has no such pool.
    pub async fn capacity(&self, mode: DeviceMode) -> Result<ModeCapacity, CsiError> {
        match self.pools.get(&mode) {
            Some(pool) => pool.capacity().await,
            None => Ok(ModeCapacity::default()),
        }
    }

    pub async fn capacity_report(&self) -> Result<CapacityReport, CsiError> {
        let mut report = CapacityReport::default();
        for (mode, pool) in &self.pools {
            report.modes.insert(*mode, pool.capacity().await?);
        }
        Ok(report)
    }

    pub async fn expand(&self, handle: &BackingHandle, new_size: u64) -> Result<u64, CsiError> {
        self.pool(handle.mode())?.expand(handle, new_size).await
    }

    pub async fn exists(&self, handle: &BackingHandle) -> Result<bool, CsiError> {
        Ok(self.pool(handle.mode())?.lookup(handle).await?.is_some())
    }

    pub async fn lookup(&self, handle: &BackingHandle) -> Result<Option<u64>, CsiError> {
        self.pool(handle.mode())?.lookup(handle).await
    }

    pub async fn list(&self) -> Result<Vec<Allocation>, CsiError> {
        let mut all = Vec::new();
        for pool in self.pools.values() {
            all.extend(pool.list().await?);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedAdapter;
    use crate::types::GIB;

    fn exact_lvm() -> LvmGeometry {
        LvmGeometry {
            extent_size: 4 * MIB,
            pv_metadata_bytes: 0,
        }
    }

    async fn manager(
        config: PoolConfig,
        regions: &[(&str, u64)],
    ) -> (Arc<SimulatedAdapter>, VolumeGroupManager) {
        let sim = SimulatedAdapter::new(config.lvm);
        for (id, size) in regions {
            sim.add_region(id, *size);
        }
        let sim = Arc::new(sim);
        let vgm = VolumeGroupManager::discover(sim.clone(), &config)
            .await
            .unwrap();
        (sim, vgm)
    }

    #[tokio::test]
    async fn mixed_modes_report_separately() {
        let config = PoolConfig {
            lvm: exact_lvm(),
            region_modes: BTreeMap::from([("region1".to_owned(), DeviceMode::Direct)]),
            ..Default::default()
        };
        let (_sim, vgm) = manager(config, &[("region0", 4 * GIB), ("region1", 2 * GIB)]).await;
        let report = vgm.capacity_report().await.unwrap();
        assert_eq!(report.get(DeviceMode::Lvm).total, 4 * GIB);
        assert_eq!(report.get(DeviceMode::Direct).available, 2 * GIB);
    }

    #[tokio::test]
    async fn missing_mode_is_no_suitable_group() {
        let config = PoolConfig {
            lvm: exact_lvm(),
            ..Default::default()
        };
        let (_sim, vgm) = manager(config, &[("region0", GIB)]).await;
        let err = vgm
            .reserve("v", MIB, DeviceMode::Direct, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::NoSuitableGroup(_)));
        assert_eq!(
            vgm.capacity(DeviceMode::Direct).await.unwrap(),
            ModeCapacity::default()
        );
    }

    /// Replaying arbitrary reserve/release sequences must keep
    /// `available == total - sum(reserved)` on a pool.
    #[tokio::test]
    async fn reserve_release_replay_balances() {
        for mode in DeviceMode::ALL {
            let config = PoolConfig {
                default_mode: mode,
                lvm: exact_lvm(),
                direct_alignment: 4 * MIB,
                ..Default::default()
            };
            let (_sim, vgm) = manager(config, &[("region0", GIB)]).await;
            let cancel = CancellationToken::new();
            let total = vgm.capacity(mode).await.unwrap().total;

            let sizes = [64 * MIB, 3 * MIB, 128 * MIB, 17 * MIB, 256 * MIB, 5 * MIB];
            let mut held: Vec<Allocation> = Vec::new();
            for (step, size) in sizes.iter().enumerate() {
                let alloc = vgm
                    .reserve(&format!("vol-{step}"), *size, mode, &cancel)
                    .await
                    .unwrap();
                assert!(alloc.size >= *size);
                held.push(alloc);
                if step % 3 == 2 {
                    let freed = held.remove(0);
                    vgm.release(&freed.handle, false).await.unwrap();
                }
                let reserved: u64 = held.iter().map(|a| a.size).sum();
                let cap = vgm.capacity(mode).await.unwrap();
                assert_eq!(cap.total, total, "{mode}");
                assert_eq!(cap.available, total - reserved, "{mode} step {step}");
            }
            for alloc in held.drain(..) {
                vgm.release(&alloc.handle, true).await.unwrap();
            }
            assert_eq!(vgm.capacity(mode).await.unwrap().available, total);
        }
    }

    #[tokio::test]
    async fn busy_release_reports_stuck() {
        let config = PoolConfig {
            lvm: exact_lvm(),
            ..Default::default()
        };
        let (sim, vgm) = manager(config, &[("region0", GIB)]).await;
        let alloc = vgm
            .reserve("vol-a", MIB, DeviceMode::Lvm, &CancellationToken::new())
            .await
            .unwrap();
        sim.set_busy(alloc.handle.device_path(), true);
        let err = vgm.release(&alloc.handle, false).await.unwrap_err();
        assert!(matches!(err, CsiError::VolumeStuck { ref volume_id, .. } if volume_id == "vol-a"));
        assert!(vgm.exists(&alloc.handle).await.unwrap());
    }

    #[test]
    fn config_validation() {
        assert!(PoolConfig::default().validate().is_ok());
        let bad = PoolConfig {
            pmem_percentage: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
