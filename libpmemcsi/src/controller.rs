//! CSI Controller service trait.
//!
//! The Controller owns no storage.  It picks a node for each new volume and
//! forwards the lifecycle calls to that node's [`NodeControl`] service.
//!
//! [`NodeControl`]: crate::node::NodeControl

use async_trait::async_trait;

use crate::context::CallContext;
use crate::error::CsiError;
use crate::types::{
    CapacityReport, ControllerCapability, CreateVolumeRequest, GetCapacityRequest,
    ListVolumesRequest, ListVolumesResponse, Volume, VolumeCapability, VolumeId,
};

/// Controller service: cluster-wide volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a volume on some node.
    ///
    /// Idempotent by `req.name`.  The returned [`Volume`] names its node in
    /// `accessible_topology`.
    async fn create_volume(
        &self,
        ctx: &CallContext,
        req: CreateVolumeRequest,
    ) -> Result<Volume, CsiError>;

    /// Delete a volume.  Unknown ids succeed once every registered node has
    /// confirmed it does not hold the volume.
    async fn delete_volume(&self, ctx: &CallContext, volume_id: &VolumeId)
    -> Result<(), CsiError>;

    /// PMEM volumes need no attach step.
    async fn controller_publish_volume(
        &self,
        _volume_id: &VolumeId,
        _node_id: &str,
    ) -> Result<(), CsiError> {
        Ok(())
    }

    async fn controller_unpublish_volume(
        &self,
        _volume_id: &VolumeId,
        _node_id: &str,
    ) -> Result<(), CsiError> {
        Ok(())
    }

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    async fn list_volumes(&self, req: ListVolumesRequest)
    -> Result<ListVolumesResponse, CsiError>;

    /// Per-mode capacity of the reachable nodes matching `req`.
    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<CapacityReport, CsiError>;

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;

    /// Grow a volume on its owning node; returns the new size.
    async fn expand_volume(
        &self,
        ctx: &CallContext,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<u64, CsiError>;
}
