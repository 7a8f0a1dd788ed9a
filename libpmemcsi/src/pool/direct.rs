//! Direct mode: one fsdax namespace per volume, each region its own pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{Allocation, BackingHandle, PoolAllocator, release_error};
use crate::device::{DeviceAdapter, DeviceErrorKind, Namespace, Region};
use crate::error::CsiError;
use crate::types::{DeviceMode, ModeCapacity, round_down, round_up};

pub struct DirectPool {
    adapter: Arc<dyn DeviceAdapter>,
    /// One lock per region.
    regions: BTreeMap<String, Mutex<()>>,
    alignment: u64,
    erase_blocks: u64,
}

impl DirectPool {
    pub fn new(
        adapter: Arc<dyn DeviceAdapter>,
        regions: Vec<Region>,
        alignment: u64,
        erase_blocks: u64,
    ) -> Self {
        Self {
            adapter,
            regions: regions
                .into_iter()
                .map(|r| (r.id, Mutex::new(())))
                .collect(),
            alignment: alignment.max(1),
            erase_blocks,
        }
    }

    async fn own_regions(&self) -> Result<Vec<Region>, CsiError> {
        Ok(self
            .adapter
            .list_regions()
            .await?
            .into_iter()
            .filter(|r| self.regions.contains_key(&r.id))
            .collect())
    }

    async fn find_namespace(&self, name: &str) -> Result<Option<Namespace>, CsiError> {
        Ok(self
            .adapter
            .list_namespaces()
            .await?
            .into_iter()
            .find(|ns| self.regions.contains_key(&ns.region) && ns.name == name))
    }

    fn allocation(ns: Namespace) -> Allocation {
        Allocation {
            size: ns.size,
            handle: BackingHandle::Namespace {
                region: ns.region,
                id: ns.id,
                name: ns.name,
                device_path: ns.device_path,
            },
        }
    }

    fn region_lock(&self, region: &str) -> Result<&Mutex<()>, CsiError> {
        self.regions
            .get(region)
            .ok_or_else(|| CsiError::Internal(format!("region {region} is not in Direct mode")))
    }
}

#[async_trait]
impl PoolAllocator for DirectPool {
    fn mode(&self) -> DeviceMode {
        DeviceMode::Direct
    }

    #[instrument(skip(self, cancel))]
    async fn reserve(
        &self,
        name: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<Allocation, CsiError> {
        let size = round_up(size, self.alignment);

        if let Some(ns) = self.find_namespace(name).await? {
            if ns.size >= size {
                debug!(%name, id = %ns.id, "namespace already exists");
                return Ok(Self::allocation(ns));
            }
            return Err(CsiError::VolumeAlreadyExists(name.to_owned()));
        }

        // Best fit: the smallest region that still has room.
        let mut candidates: Vec<Region> = self
            .own_regions()
            .await?
            .into_iter()
            .filter(|r| round_down(r.available, self.alignment) >= size)
            .collect();
        candidates.sort_by(|a, b| a.available.cmp(&b.available).then(a.id.cmp(&b.id)));

        for candidate in &candidates {
            if cancel.is_cancelled() {
                return Err(CsiError::Cancelled(format!("reserve {name}")));
            }
            let _guard = self.region_lock(&candidate.id)?.lock().await;
            // Another reservation may have taken the space while we waited.
            let still_fits = self
                .own_regions()
                .await?
                .iter()
                .any(|r| r.id == candidate.id && round_down(r.available, self.alignment) >= size);
            if !still_fits {
                continue;
            }
            match self.adapter.create_namespace(&candidate.id, name, size).await {
                Ok(ns) => {
                    info!(%name, id = %ns.id, region = %ns.region, size = ns.size, "namespace created");
                    return Ok(Self::allocation(ns));
                }
                Err(e) if e.kind == DeviceErrorKind::NoSpace => {
                    debug!(region = %candidate.id, error = %e, "region full, trying next");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CsiError::InsufficientCapacity {
            mode: DeviceMode::Direct,
            requested: size,
            available: self.capacity().await?.available,
        })
    }

    #[instrument(skip(self), fields(handle = %handle))]
    async fn release(&self, handle: &BackingHandle, erase: bool) -> Result<(), CsiError> {
        let BackingHandle::Namespace { region, id, .. } = handle else {
            return Err(CsiError::Internal(format!("{handle} is not a namespace")));
        };
        let _guard = self.region_lock(region)?.lock().await;
        let Some(ns) = self
            .adapter
            .list_namespaces()
            .await?
            .into_iter()
            .find(|ns| &ns.id == id)
        else {
            debug!("namespace already gone");
            return Ok(());
        };
        self.adapter
            .wipe(&ns.device_path, ns.size, self.erase_blocks, erase)
            .await
            .map_err(|e| release_error(handle, e))?;
        match self.adapter.destroy_namespace(id).await {
            Ok(()) => {}
            Err(e) if e.kind == DeviceErrorKind::NotFound => {}
            Err(e) => return Err(release_error(handle, e)),
        }
        info!(size = ns.size, "namespace destroyed");
        Ok(())
    }

    /// Available is the largest single region; a namespace cannot span
    /// regions.
    async fn capacity(&self) -> Result<ModeCapacity, CsiError> {
        let regions = self.own_regions().await?;
        Ok(ModeCapacity {
            total: regions.iter().map(|r| r.size).sum(),
            available: regions
                .iter()
                .map(|r| round_down(r.available, self.alignment))
                .max()
                .unwrap_or(0),
        })
    }

    async fn expand(&self, handle: &BackingHandle, _new_size: u64) -> Result<u64, CsiError> {
        Err(CsiError::FailedPrecondition(format!(
            "{handle}: Direct mode volumes cannot be expanded"
        )))
    }

    async fn lookup(&self, handle: &BackingHandle) -> Result<Option<u64>, CsiError> {
        let BackingHandle::Namespace { id, .. } = handle else {
            return Ok(None);
        };
        Ok(self
            .adapter
            .list_namespaces()
            .await?
            .into_iter()
            .find(|ns| &ns.id == id)
            .map(|ns| ns.size))
    }

    async fn list(&self) -> Result<Vec<Allocation>, CsiError> {
        Ok(self
            .adapter
            .list_namespaces()
            .await?
            .into_iter()
            .filter(|ns| self.regions.contains_key(&ns.region))
            .map(Self::allocation)
            .collect())
    }
}
