//! PMEM node agent.
//!
//! [`PmemNode`] implements [`CsiIdentity`] and [`CsiNode`] for the
//! orchestrator, and [`NodeControl`] for the Controller.  Backing storage
//! comes from the [`VolumeGroupManager`]; every volume has a
//! [`VolumeRecord`] in the [`StateStore`] so a restarted agent knows what it
//! holds and where it is mounted.
//!
//! Calls on the same volume are serialized by a per-volume lock.  Calls on
//! different volumes run in parallel and only meet in the pool allocator.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use super::mount::Mounter;
use super::state::{Publication, StateStore, Staging, VolumeRecord};
use crate::context::CallContext;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::master::{DEFAULT_DRIVER_NAME, topology_key};
use crate::node::{CsiNode, NodeControl};
use crate::parameters::{Origin, VolumeParameters};
use crate::pool::{Rollback, VolumeGroupManager};
use crate::registry::CapacityReporter;
use crate::types::*;

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub driver_name: String,
    pub vendor_version: String,
    pub node_id: String,
    pub max_volumes: u64,
    /// Mode of ephemeral volumes that do not name one.
    pub default_mode: DeviceMode,
}

impl NodeOptions {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            node_id: node_id.into(),
            max_volumes: 256,
            default_mode: DeviceMode::Lvm,
        }
    }
}

pub struct PmemNode {
    options: NodeOptions,
    topology_key: String,
    vgm: Arc<VolumeGroupManager>,
    mounter: Arc<dyn Mounter>,
    store: StateStore,
    records: DashMap<VolumeId, VolumeRecord>,
    locks: DashMap<VolumeId, Arc<Mutex<()>>>,
    reporter: OnceLock<Arc<CapacityReporter>>,
}

fn validate_id(id: &VolumeId) -> Result<(), CsiError> {
    if id.0.is_empty() {
        return Err(CsiError::InvalidArgument("volume id missing".into()));
    }
    // Ids name device nodes and record files.
    if id.0.contains('/') || id.0.starts_with('.') {
        return Err(CsiError::InvalidArgument(format!("invalid volume id {id:?}")));
    }
    Ok(())
}

fn require_path(what: &str, path: &str) -> Result<(), CsiError> {
    if path.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{what} missing")));
    }
    Ok(())
}

impl PmemNode {
    pub fn new(
        options: NodeOptions,
        vgm: Arc<VolumeGroupManager>,
        mounter: Arc<dyn Mounter>,
        store: StateStore,
    ) -> Self {
        Self {
            topology_key: topology_key(&options.driver_name),
            options,
            vgm,
            mounter,
            store,
            records: DashMap::new(),
            locks: DashMap::new(),
            reporter: OnceLock::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.options.node_id
    }

    pub fn volume_group_manager(&self) -> &Arc<VolumeGroupManager> {
        &self.vgm
    }

    /// Push capacity changes through `reporter` from now on.  Only the first
    /// reporter is kept.
    pub fn attach_reporter(&self, reporter: Arc<CapacityReporter>) {
        if self.reporter.set(reporter).is_err() {
            warn!("capacity reporter already attached");
        }
    }

    /// Rebuild the volume table from the state directory.  Records whose
    /// backing storage is gone are dropped with a warning.  A record whose
    /// storage cannot be checked is kept.
    pub async fn recover(&self) -> Result<usize, CsiError> {
        for record in self.store.load_all().await? {
            let id = record.id().clone();
            match self.vgm.exists(&record.handle).await {
                Ok(true) => {
                    self.records.insert(id, record);
                }
                Ok(false) => {
                    warn!(volume_id = %id, handle = %record.handle, "backing storage missing, dropping record");
                    self.store.remove(&id).await?;
                }
                Err(e) => {
                    warn!(volume_id = %id, error = %e, "cannot check backing storage, keeping record");
                    self.records.insert(id, record);
                }
            }
        }
        info!(
            state_dir = %self.store.dir().display(),
            count = self.records.len(),
            "recovery complete",
        );
        Ok(self.records.len())
    }

    pub fn record(&self, id: &VolumeId) -> Option<VolumeRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    async fn lock(&self, id: &VolumeId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(id.clone()).or_default().value());
        lock.lock_owned().await
    }

    async fn persist(&self, record: VolumeRecord) -> Result<(), CsiError> {
        self.store.save(&record).await?;
        self.records.insert(record.id().clone(), record);
        Ok(())
    }

    async fn forget(&self, id: &VolumeId) -> Result<(), CsiError> {
        self.store.remove(id).await?;
        self.records.remove(id);
        // Held by the map and the caller's guard only.
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) <= 2);
        Ok(())
    }

    async fn report_capacity(&self) {
        if let Some(reporter) = self.reporter.get()
            && let Err(e) = reporter.sync().await
        {
            warn!(error = %e, "capacity update not delivered");
        }
    }

    /// Reserve backing storage and build the record; the reservation is
    /// undone by `rollback`.
    async fn allocate(
        &self,
        ctx: &CallContext,
        volume_id: &VolumeId,
        size: u64,
        mode: DeviceMode,
        params: &VolumeParameters,
        rollback: &mut Rollback,
    ) -> Result<VolumeRecord, CsiError> {
        let alloc = self.vgm.reserve(&volume_id.0, size, mode, &ctx.cancel).await?;
        let vgm = Arc::clone(&self.vgm);
        let handle = alloc.handle.clone();
        rollback.push(
            format!("reserve {handle}"),
            Box::pin(async move { vgm.release(&handle, true).await }),
        );

        let context = VolumeParameters {
            device_mode: Some(mode),
            erase_after: params.erase_after,
            name: params.name.clone(),
            size: None,
            ephemeral: false,
        }
        .to_context();
        Ok(VolumeRecord {
            volume: Volume {
                volume_id: volume_id.clone(),
                capacity_bytes: alloc.size,
                device_mode: mode,
                parameters: context.clone(),
                volume_context: context,
                accessible_topology: vec![Topology::node(
                    &self.topology_key,
                    &self.options.node_id,
                )],
                condition: None,
            },
            handle: alloc.handle,
            erase_after: params.erase_after(),
            ephemeral: false,
            state: VolumeState::Created,
            staging: None,
            published: None,
        })
    }

    /// Free the backing storage and drop the record.  A busy device leaves
    /// the record in [`VolumeState::Stuck`], and a stuck record is not
    /// retried.
    async fn release(&self, mut record: VolumeRecord) -> Result<(), CsiError> {
        if let VolumeState::Stuck { reason } = &record.state {
            debug!(volume_id = %record.id(), "volume stuck, not retrying");
            return Err(CsiError::VolumeStuck {
                volume_id: record.id().0.clone(),
                reason: reason.clone(),
            });
        }
        if let Err(e) = self.vgm.release(&record.handle, record.erase_after).await {
            if let CsiError::VolumeStuck { reason, .. } = &e {
                record.state = VolumeState::Stuck {
                    reason: reason.clone(),
                };
                self.persist(record).await?;
            }
            return Err(e);
        }
        self.forget(record.id()).await?;
        info!(volume_id = %record.id(), handle = %record.handle, "volume deleted");
        Ok(())
    }

    async fn stage_locked(
        &self,
        ctx: &CallContext,
        req: &NodeStageVolumeRequest,
        params: &VolumeParameters,
        rollback: &mut Rollback,
    ) -> Result<(), CsiError> {
        let id = &req.volume_id;
        let mut record = match self.record(id) {
            Some(record) => record,
            None => match params.size {
                Some(size) => {
                    let mode = params.device_mode_or(self.options.default_mode);
                    info!(volume_id = %id, %mode, size, "creating ephemeral volume");
                    let mut record = self
                        .allocate(ctx, id, size, mode, params, rollback)
                        .await?;
                    record.ephemeral = true;
                    record
                }
                None => return Err(CsiError::VolumeNotFound(id.0.clone())),
            },
        };

        if let VolumeState::Stuck { reason } = &record.state {
            return Err(CsiError::VolumeStuck {
                volume_id: id.0.clone(),
                reason: reason.clone(),
            });
        }
        if let Some(staged) = &record.staging {
            if staged.path != req.staging_target_path
                || staged.capability != req.volume_capability
            {
                return Err(CsiError::VolumeBusyDifferentParameters(id.0.clone()));
            }
            if staged.capability.fs_type().is_none()
                || self.mounter.is_mountpoint(&staged.path).await
            {
                debug!(volume_id = %id, path = %staged.path, "already staged");
                return Ok(());
            }
            warn!(volume_id = %id, path = %staged.path, "staging mount missing, mounting again");
        }

        if let Some(fs) = req.volume_capability.fs_type() {
            let device = record.handle.device_path().to_owned();
            match self.mounter.existing_fs(&device).await? {
                None => {
                    rollback.check(&ctx.cancel)?;
                    self.mounter.format(&device, fs).await?;
                }
                Some(existing) if existing == fs => {}
                Some(existing) => {
                    return Err(CsiError::FailedPrecondition(format!(
                        "{device} already holds {existing}, cannot use it as {fs}"
                    )));
                }
            }

            rollback.check(&ctx.cancel)?;
            let mut options = vec!["dax".to_owned()];
            options.extend(req.volume_capability.mount_flags().iter().cloned());
            self.mounter
                .mount(&device, &req.staging_target_path, fs, &options)
                .await?;
            let mounter = Arc::clone(&self.mounter);
            let path = req.staging_target_path.clone();
            rollback.push(
                format!("mount {path}"),
                Box::pin(async move { mounter.unmount(&path).await }),
            );
        }

        rollback.check(&ctx.cancel)?;
        record.staging = Some(Staging {
            path: req.staging_target_path.clone(),
            capability: req.volume_capability.clone(),
        });
        if record.published.is_none() {
            record.state = VolumeState::Staged;
        }
        self.persist(record).await?;
        info!(volume_id = %id, path = %req.staging_target_path, "volume staged");
        Ok(())
    }
}

#[async_trait]
impl CsiIdentity for PmemNode {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.options.driver_name.clone(),
            vendor_version: self.options.vendor_version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(self.vgm.modes().next().is_some())
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::VolumeAccessibilityConstraints])
    }
}

#[async_trait]
impl CsiNode for PmemNode {
    #[instrument(skip(self, ctx, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(
        &self,
        ctx: &CallContext,
        req: NodeStageVolumeRequest,
    ) -> Result<(), CsiError> {
        validate_id(&req.volume_id)?;
        require_path("staging target path", &req.staging_target_path)?;
        req.volume_capability.validate()?;
        let params = VolumeParameters::parse(Origin::VolumeContext, &req.volume_context)?;

        let _guard = self.lock(&req.volume_id).await;
        let mut rollback = Rollback::new("stage volume");
        let result = self.stage_locked(ctx, &req, &params, &mut rollback).await;
        rollback.finish(result).await?;
        self.report_capacity().await;
        Ok(())
    }

    #[instrument(skip(self, _ctx))]
    async fn unstage_volume(
        &self,
        _ctx: &CallContext,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        validate_id(volume_id)?;
        require_path("staging target path", staging_target_path)?;
        let _guard = self.lock(volume_id).await;

        let Some(mut record) = self.record(volume_id) else {
            debug!("unknown volume, nothing to unstage");
            return Ok(());
        };
        if let Some(published) = &record.published {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {volume_id} is still published at {}",
                published.target_path
            )));
        }
        if let Some(staged) = &record.staging
            && staged.path != staging_target_path
        {
            warn!(recorded = %staged.path, "unstaging at a path other than the recorded one");
        }

        if self.mounter.is_mountpoint(staging_target_path).await {
            self.mounter.unmount(staging_target_path).await?;
        }

        if record.ephemeral {
            self.release(record).await?;
        } else if record.staging.is_some() {
            record.staging = None;
            record.state = VolumeState::Created;
            self.persist(record).await?;
            info!(path = %staging_target_path, "volume unstaged");
        }
        self.report_capacity().await;
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        validate_id(&req.volume_id)?;
        require_path("target path", &req.target_path)?;
        req.volume_capability.validate()?;
        let _guard = self.lock(&req.volume_id).await;

        let mut record = self
            .record(&req.volume_id)
            .ok_or_else(|| CsiError::VolumeNotFound(req.volume_id.0.clone()))?;

        if let Some(published) = &record.published {
            if published.target_path != req.target_path {
                return Err(CsiError::AlreadyPublishedElsewhere {
                    volume_id: req.volume_id.0.clone(),
                    target_path: published.target_path.clone(),
                });
            }
            if published.read_only != req.read_only {
                return Err(CsiError::VolumeBusyDifferentParameters(
                    req.volume_id.0.clone(),
                ));
            }
            if self.mounter.is_mountpoint(&req.target_path).await {
                debug!("already published");
                return Ok(());
            }
        }

        let Some(staged) = &record.staging else {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} is not staged",
                req.volume_id
            )));
        };
        if !req.staging_target_path.is_empty() && staged.path != req.staging_target_path {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} is staged at {}, not {}",
                req.volume_id, staged.path, req.staging_target_path
            )));
        }
        let source = match staged.capability.fs_type() {
            Some(_) => staged.path.clone(),
            None => record.handle.device_path().to_owned(),
        };

        self.mounter
            .bind_mount(&source, &req.target_path, req.read_only)
            .await?;
        record.published = Some(Publication {
            target_path: req.target_path.clone(),
            read_only: req.read_only,
        });
        record.state = VolumeState::Published;
        if let Err(e) = self.persist(record).await {
            if let Err(undo) = self.mounter.unmount(&req.target_path).await {
                warn!(error = %undo, "rollback of bind mount failed");
            }
            return Err(e);
        }
        info!(%source, read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        validate_id(volume_id)?;
        require_path("target path", target_path)?;
        let _guard = self.lock(volume_id).await;

        if self.mounter.is_mountpoint(target_path).await {
            self.mounter.unmount(target_path).await?;
        } else {
            debug!("target is not a mount point");
        }

        let Some(mut record) = self.record(volume_id) else {
            return Ok(());
        };
        if record
            .published
            .as_ref()
            .is_some_and(|p| p.target_path == target_path)
        {
            record.published = None;
            record.state = if record.staging.is_some() {
                VolumeState::Staged
            } else {
                VolumeState::Created
            };
            self.persist(record).await?;
            info!("volume unpublished");
        }
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.options.node_id.clone(),
            max_volumes: self.options.max_volumes,
            accessible_topology: Some(Topology::node(
                &self.topology_key,
                &self.options.node_id,
            )),
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }

    #[instrument(skip(self))]
    async fn clear_stuck(&self, volume_id: &VolumeId) -> Result<bool, CsiError> {
        validate_id(volume_id)?;
        let _guard = self.lock(volume_id).await;
        let mut record = self
            .record(volume_id)
            .ok_or_else(|| CsiError::VolumeNotFound(volume_id.0.clone()))?;
        if !matches!(record.state, VolumeState::Stuck { .. }) {
            return Ok(false);
        }
        record.state = VolumeState::Created;
        self.persist(record).await?;
        info!("stuck state cleared");
        Ok(true)
    }
}

#[async_trait]
impl NodeControl for PmemNode {
    #[instrument(skip(self, ctx, req), fields(volume_id = %req.volume_id, mode = %req.device_mode, size = req.capacity_bytes))]
    async fn create_volume(
        &self,
        ctx: &CallContext,
        req: NodeCreateVolumeRequest,
    ) -> Result<Volume, CsiError> {
        validate_id(&req.volume_id)?;
        if req.capacity_bytes == 0 {
            return Err(CsiError::InvalidArgument("volume size must be positive".into()));
        }
        let params = VolumeParameters::parse(Origin::NodeCreateVolume, &req.parameters)?;
        let _guard = self.lock(&req.volume_id).await;

        if let Some(existing) = self.record(&req.volume_id) {
            if existing.volume.device_mode == req.device_mode
                && existing.volume.capacity_bytes >= req.capacity_bytes
            {
                debug!("volume exists");
                return Ok(existing.volume);
            }
            return Err(CsiError::VolumeAlreadyExists(req.volume_id.0.clone()));
        }

        let mut rollback = Rollback::new("create volume");
        let result = async {
            let record = self
                .allocate(
                    ctx,
                    &req.volume_id,
                    req.capacity_bytes,
                    req.device_mode,
                    &params,
                    &mut rollback,
                )
                .await?;
            rollback.check(&ctx.cancel)?;
            self.persist(record.clone()).await?;
            Ok::<_, CsiError>(record)
        }
        .await;
        let record = rollback.finish(result).await?;

        info!(handle = %record.handle, actual = record.volume.capacity_bytes, "volume created");
        self.report_capacity().await;
        Ok(record.volume)
    }

    #[instrument(skip(self, _ctx))]
    async fn delete_volume(
        &self,
        _ctx: &CallContext,
        volume_id: &VolumeId,
    ) -> Result<bool, CsiError> {
        validate_id(volume_id)?;
        let _guard = self.lock(volume_id).await;

        match self.record(volume_id) {
            Some(record) => {
                match &record.state {
                    VolumeState::Created | VolumeState::Stuck { .. } => {}
                    state => {
                        return Err(CsiError::FailedPrecondition(format!(
                            "volume {volume_id} is {state:?}"
                        )));
                    }
                }
                self.release(record).await?;
            }
            None => {
                // Storage reserved by a create whose record never got written.
                let orphan = self
                    .vgm
                    .list()
                    .await?
                    .into_iter()
                    .find(|a| a.handle.name() == volume_id.0);
                let Some(orphan) = orphan else {
                    debug!("volume not on this node");
                    return Ok(false);
                };
                warn!(handle = %orphan.handle, "releasing storage without a record");
                self.vgm.release(&orphan.handle, true).await?;
            }
        }
        self.report_capacity().await;
        Ok(true)
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        let mut volumes: Vec<Volume> = self
            .records
            .iter()
            .map(|r| {
                let mut volume = r.value().volume.clone();
                if let VolumeState::Stuck { reason } = &r.value().state {
                    volume.condition = Some(VolumeCondition {
                        abnormal: true,
                        message: format!("stuck: {reason}"),
                    });
                }
                volume
            })
            .collect();
        volumes.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        Ok(volumes)
    }

    #[instrument(skip(self, _ctx))]
    async fn expand_volume(
        &self,
        _ctx: &CallContext,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<u64, CsiError> {
        validate_id(volume_id)?;
        let _guard = self.lock(volume_id).await;
        let mut record = self
            .record(volume_id)
            .ok_or_else(|| CsiError::VolumeNotFound(volume_id.0.clone()))?;
        if capacity_bytes <= record.volume.capacity_bytes {
            return Ok(record.volume.capacity_bytes);
        }

        let size = self.vgm.expand(&record.handle, capacity_bytes).await?;
        record.volume.capacity_bytes = size;
        self.persist(record).await?;
        info!(size, "volume expanded");
        self.report_capacity().await;
        Ok(size)
    }

    async fn get_capacity(&self) -> Result<CapacityReport, CsiError> {
        self.vgm.capacity_report().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use super::*;
    use crate::backend::mount::RecordingMounter;
    use crate::device::{DeviceError, DeviceErrorKind, LvmGeometry, SimulatedAdapter};
    use crate::parameters::SIZE;
    use crate::pool::PoolConfig;

    struct Fixture {
        node: PmemNode,
        mounter: Arc<RecordingMounter>,
        sim: Arc<SimulatedAdapter>,
        vgm: Arc<VolumeGroupManager>,
    }

    async fn fixture(state_dir: &Path) -> Fixture {
        let config = PoolConfig {
            lvm: LvmGeometry {
                extent_size: 4 * MIB,
                pv_metadata_bytes: 0,
            },
            ..Default::default()
        };
        let sim = Arc::new(SimulatedAdapter::new(config.lvm).with_region("region0", 4 * GIB));
        let vgm = Arc::new(
            VolumeGroupManager::discover(sim.clone(), &config)
                .await
                .unwrap(),
        );
        let mounter = Arc::new(RecordingMounter::new());
        let node = PmemNode::new(
            NodeOptions::new("node-a"),
            Arc::clone(&vgm),
            mounter.clone(),
            StateStore::new(state_dir),
        );
        Fixture {
            node,
            mounter,
            sim,
            vgm,
        }
    }

    fn create_req(id: &str, size: u64) -> NodeCreateVolumeRequest {
        NodeCreateVolumeRequest {
            volume_id: id.into(),
            name: id.into(),
            capacity_bytes: size,
            device_mode: DeviceMode::Lvm,
            parameters: HashMap::new(),
        }
    }

    fn stage_req(id: &str, path: &str, cap: VolumeCapability) -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: id.into(),
            staging_target_path: path.into(),
            volume_capability: cap,
            volume_context: HashMap::new(),
        }
    }

    fn publish_req(id: &str, staging: &str, target: &str) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: id.into(),
            staging_target_path: staging.into(),
            target_path: target.into(),
            volume_capability: VolumeCapability::mount("xfs"),
            read_only: false,
            volume_context: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_by_id() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();

        let v1 = f.node.create_volume(&ctx, create_req("vol-a", GIB)).await.unwrap();
        let v2 = f.node.create_volume(&ctx, create_req("vol-a", GIB)).await.unwrap();
        assert_eq!(v1, v2);
        assert_eq!(f.sim.logical_volumes_created(), 1);
        assert_eq!(v1.node(f.node.topology_key.as_str()), Some("node-a"));

        let err = f
            .node
            .create_volume(&ctx, create_req("vol-a", 2 * GIB))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::VolumeAlreadyExists(_)));
    }

    #[tokio::test]
    async fn stage_unstage_stage_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();
        f.node.create_volume(&ctx, create_req("vol-a", GIB)).await.unwrap();

        let req = stage_req("vol-a", "/stage/a", VolumeCapability::mount("xfs"));
        f.node.stage_volume(&ctx, req.clone()).await.unwrap();
        f.node.stage_volume(&ctx, req.clone()).await.unwrap();
        let entry = f.mounter.mounted("/stage/a").unwrap();
        assert!(entry.options.contains(&"dax".to_owned()));
        assert_eq!(f.mounter.format_count(), 1);

        f.node
            .unstage_volume(&ctx, &"vol-a".into(), "/stage/a")
            .await
            .unwrap();
        f.node
            .unstage_volume(&ctx, &"vol-a".into(), "/stage/a")
            .await
            .unwrap();
        assert_eq!(f.mounter.mount_count(), 0);

        f.node.stage_volume(&ctx, req).await.unwrap();
        // Never reformat an existing filesystem.
        assert_eq!(f.mounter.format_count(), 1);
        assert_eq!(
            f.node.record(&"vol-a".into()).unwrap().state,
            VolumeState::Staged
        );
    }

    #[tokio::test]
    async fn conflicting_stage_is_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();
        f.node.create_volume(&ctx, create_req("vol-a", GIB)).await.unwrap();
        f.node
            .stage_volume(&ctx, stage_req("vol-a", "/stage/a", VolumeCapability::mount("xfs")))
            .await
            .unwrap();

        for other in [
            stage_req("vol-a", "/stage/b", VolumeCapability::mount("xfs")),
            stage_req("vol-a", "/stage/a", VolumeCapability::mount("ext4")),
        ] {
            let err = f.node.stage_volume(&ctx, other).await.unwrap_err();
            assert!(matches!(err, CsiError::VolumeBusyDifferentParameters(_)));
        }
    }

    #[tokio::test]
    async fn wrong_filesystem_is_not_reformatted() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();
        let volume = f.node.create_volume(&ctx, create_req("vol-a", GIB)).await.unwrap();
        let device = f.node.record(&volume.volume_id).unwrap().handle.device_path().to_owned();
        f.mounter.set_filesystem(&device, "ext4");

        let err = f
            .node
            .stage_volume(&ctx, stage_req("vol-a", "/stage/a", VolumeCapability::mount("xfs")))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::FailedPrecondition(_)));
        assert_eq!(f.mounter.format_count(), 0);
    }

    #[tokio::test]
    async fn restage_remounts_lost_mount() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();
        f.node.create_volume(&ctx, create_req("vol-a", GIB)).await.unwrap();
        let req = stage_req("vol-a", "/stage/a", VolumeCapability::mount("ext4"));
        f.node.stage_volume(&ctx, req.clone()).await.unwrap();

        f.mounter.forget("/stage/a");
        f.node.stage_volume(&ctx, req).await.unwrap();
        assert!(f.mounter.mounted("/stage/a").is_some());
    }

    #[tokio::test]
    async fn publish_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();
        f.node.create_volume(&ctx, create_req("vol-a", GIB)).await.unwrap();

        let err = f
            .node
            .publish_volume(publish_req("vol-a", "/stage/a", "/pod/1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::FailedPrecondition(_)));

        f.node
            .stage_volume(&ctx, stage_req("vol-a", "/stage/a", VolumeCapability::mount("xfs")))
            .await
            .unwrap();
        f.node
            .publish_volume(publish_req("vol-a", "/stage/a", "/pod/1"))
            .await
            .unwrap();
        f.node
            .publish_volume(publish_req("vol-a", "/stage/a", "/pod/1"))
            .await
            .unwrap();
        assert_eq!(f.mounter.mounted("/pod/1").unwrap().source, "/stage/a");

        let err = f
            .node
            .publish_volume(publish_req("vol-a", "/stage/a", "/pod/2"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::AlreadyPublishedElsewhere { ref target_path, .. } if target_path == "/pod/1"));

        let mut read_only = publish_req("vol-a", "/stage/a", "/pod/1");
        read_only.read_only = true;
        let err = f.node.publish_volume(read_only).await.unwrap_err();
        assert!(matches!(err, CsiError::VolumeBusyDifferentParameters(_)));

        let err = f
            .node
            .unstage_volume(&ctx, &"vol-a".into(), "/stage/a")
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::FailedPrecondition(_)));
        let err = f.node.delete_volume(&ctx, &"vol-a".into()).await.unwrap_err();
        assert!(matches!(err, CsiError::FailedPrecondition(_)));

        f.node.unpublish_volume(&"vol-a".into(), "/pod/1").await.unwrap();
        f.node.unpublish_volume(&"vol-a".into(), "/pod/1").await.unwrap();
        assert_eq!(
            f.node.record(&"vol-a".into()).unwrap().state,
            VolumeState::Staged
        );
        f.node
            .unstage_volume(&ctx, &"vol-a".into(), "/stage/a")
            .await
            .unwrap();
        assert!(f.node.delete_volume(&ctx, &"vol-a".into()).await.unwrap());
        assert_eq!(f.sim.logical_volume_count(), 0);
    }

    #[tokio::test]
    async fn block_volume_binds_device() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();
        f.node.create_volume(&ctx, create_req("vol-b", GIB)).await.unwrap();
        let device = f.node.record(&"vol-b".into()).unwrap().handle.device_path().to_owned();

        f.node
            .stage_volume(&ctx, stage_req("vol-b", "/stage/b", VolumeCapability::block()))
            .await
            .unwrap();
        assert_eq!(f.mounter.mount_count(), 0);

        let mut req = publish_req("vol-b", "/stage/b", "/pod/dev");
        req.volume_capability = VolumeCapability::block();
        f.node.publish_volume(req).await.unwrap();
        assert_eq!(f.mounter.mounted("/pod/dev").unwrap().source, device);
        assert_eq!(f.mounter.format_count(), 0);
    }

    #[tokio::test]
    async fn unknown_volume_unpublish_and_unstage_succeed() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();
        f.node.unpublish_volume(&"ghost".into(), "/pod/x").await.unwrap();
        f.node
            .unstage_volume(&ctx, &"ghost".into(), "/stage/x")
            .await
            .unwrap();
        assert!(!f.node.delete_volume(&ctx, &"ghost".into()).await.unwrap());
    }

    #[tokio::test]
    async fn ephemeral_volume_lives_between_stage_and_unstage() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();
        let before = f.vgm.capacity(DeviceMode::Lvm).await.unwrap();

        let mut req = stage_req("inline-1", "/stage/i", VolumeCapability::mount("ext4"));
        req.volume_context = HashMap::from([(SIZE.to_owned(), "1Gi".to_owned())]);
        f.node.stage_volume(&ctx, req).await.unwrap();
        let record = f.node.record(&"inline-1".into()).unwrap();
        assert!(record.ephemeral);
        assert_eq!(
            f.vgm.capacity(DeviceMode::Lvm).await.unwrap().available,
            before.available - GIB
        );

        f.node
            .unstage_volume(&ctx, &"inline-1".into(), "/stage/i")
            .await
            .unwrap();
        assert!(f.node.record(&"inline-1".into()).is_none());
        assert_eq!(f.vgm.capacity(DeviceMode::Lvm).await.unwrap(), before);
    }

    #[tokio::test]
    async fn failed_mount_rolls_back_ephemeral_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();
        f.mounter.fail_next(
            "mount",
            CsiError::MountFailed {
                path: "/stage/i".into(),
                reason: "injected".into(),
            },
        );

        let mut req = stage_req("inline-1", "/stage/i", VolumeCapability::mount("xfs"));
        req.volume_context = HashMap::from([(SIZE.to_owned(), "64Mi".to_owned())]);
        let err = f.node.stage_volume(&ctx, req).await.unwrap_err();
        assert!(matches!(err, CsiError::MountFailed { .. }));
        assert!(f.node.record(&"inline-1".into()).is_none());
        assert_eq!(f.sim.logical_volume_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_stage_leaves_nothing_mounted() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        f.node
            .create_volume(&CallContext::local(), create_req("vol-a", GIB))
            .await
            .unwrap();

        let ctx = CallContext::local();
        ctx.cancel.cancel();
        let err = f
            .node
            .stage_volume(&ctx, stage_req("vol-a", "/stage/a", VolumeCapability::mount("xfs")))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Cancelled(_)));
        assert_eq!(f.mounter.mount_count(), 0);
        assert_eq!(
            f.node.record(&"vol-a".into()).unwrap().state,
            VolumeState::Created
        );
    }

    #[tokio::test]
    async fn recover_drops_records_without_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();
        f.node.create_volume(&ctx, create_req("vol-keep", GIB)).await.unwrap();
        f.node.create_volume(&ctx, create_req("vol-gone", GIB)).await.unwrap();
        let gone = f.node.record(&"vol-gone".into()).unwrap();
        f.vgm.release(&gone.handle, false).await.unwrap();

        let restarted = PmemNode::new(
            NodeOptions::new("node-a"),
            Arc::clone(&f.vgm),
            f.mounter.clone(),
            StateStore::new(tmp.path()),
        );
        assert_eq!(restarted.recover().await.unwrap(), 1);
        assert!(restarted.record(&"vol-keep".into()).is_some());
        assert!(!tmp.path().join("vol-gone.json").exists());
    }

    #[tokio::test]
    async fn busy_device_leaves_volume_stuck_until_cleared() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();
        f.node.create_volume(&ctx, create_req("vol-a", GIB)).await.unwrap();
        let device = f.node.record(&"vol-a".into()).unwrap().handle.device_path().to_owned();
        f.sim.set_busy(&device, true);

        let err = f.node.delete_volume(&ctx, &"vol-a".into()).await.unwrap_err();
        assert!(matches!(err, CsiError::VolumeStuck { .. }), "{err:?}");

        // Repeat deletes answer from the record without touching the
        // device, even once it is free.
        f.sim.set_busy(&device, false);
        let err = f.node.delete_volume(&ctx, &"vol-a".into()).await.unwrap_err();
        assert!(matches!(err, CsiError::VolumeStuck { .. }), "{err:?}");
        assert_eq!(f.sim.logical_volume_count(), 1);
        assert!(f.sim.wiped().is_empty());

        let listed = f.node.list_volumes().await.unwrap();
        let condition = listed[0].condition.as_ref().unwrap();
        assert!(condition.abnormal);
        assert!(condition.message.starts_with("stuck: "));

        // The state survives a restart.
        let restarted = PmemNode::new(
            NodeOptions::new("node-a"),
            Arc::clone(&f.vgm),
            f.mounter.clone(),
            StateStore::new(tmp.path()),
        );
        restarted.recover().await.unwrap();
        assert!(matches!(
            restarted.record(&"vol-a".into()).unwrap().state,
            VolumeState::Stuck { .. }
        ));

        assert!(restarted.clear_stuck(&"vol-a".into()).await.unwrap());
        assert!(!restarted.clear_stuck(&"vol-a".into()).await.unwrap());
        assert!(restarted.list_volumes().await.unwrap()[0].condition.is_none());
        assert!(restarted.delete_volume(&ctx, &"vol-a".into()).await.unwrap());
        assert_eq!(f.sim.logical_volume_count(), 0);
    }

    #[tokio::test]
    async fn recover_keeps_records_it_cannot_check() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();
        f.node.create_volume(&ctx, create_req("vol-a", GIB)).await.unwrap();

        f.sim.fail_next(
            "list_logical_volumes",
            DeviceError::new(DeviceErrorKind::Transient, "lvs timed out"),
        );
        let restarted = PmemNode::new(
            NodeOptions::new("node-a"),
            Arc::clone(&f.vgm),
            f.mounter.clone(),
            StateStore::new(tmp.path()),
        );
        assert_eq!(restarted.recover().await.unwrap(), 1);
        assert!(restarted.record(&"vol-a".into()).is_some());
        assert!(tmp.path().join("vol-a.json").exists());

        // The volume is still deletable afterwards.
        assert!(restarted.delete_volume(&ctx, &"vol-a".into()).await.unwrap());
        assert_eq!(f.sim.logical_volume_count(), 0);
    }

    #[tokio::test]
    async fn delete_releases_orphaned_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();
        f.vgm
            .reserve("vol-orphan", GIB, DeviceMode::Lvm, &ctx.cancel)
            .await
            .unwrap();
        assert!(f.node.delete_volume(&ctx, &"vol-orphan".into()).await.unwrap());
        assert_eq!(f.sim.logical_volume_count(), 0);
    }

    #[tokio::test]
    async fn expand_grows_lvm_volume() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let ctx = CallContext::local();
        f.node.create_volume(&ctx, create_req("vol-a", GIB)).await.unwrap();
        assert_eq!(
            f.node.expand_volume(&ctx, &"vol-a".into(), 2 * GIB).await.unwrap(),
            2 * GIB
        );
        assert_eq!(
            f.node.expand_volume(&ctx, &"vol-a".into(), GIB).await.unwrap(),
            2 * GIB
        );
        let err = f
            .node
            .expand_volume(&ctx, &"missing".into(), GIB)
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::VolumeNotFound(_)));
    }

    #[tokio::test]
    async fn info_and_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        let info = f.node.get_info().await.unwrap();
        assert_eq!(info.node_id, "node-a");
        assert_eq!(info.max_volumes, 256);
        assert_eq!(
            info.accessible_topology.unwrap().segments["rk8s.pmem.csi/node"],
            "node-a"
        );
        assert!(f.node.probe().await.unwrap());
        assert_eq!(
            f.node.get_capabilities().await.unwrap(),
            vec![NodeCapability::StageUnstageVolume]
        );
        let err = f
            .node
            .stage_volume(
                &CallContext::local(),
                stage_req("../etc", "/stage/x", VolumeCapability::mount("xfs")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
    }
}
