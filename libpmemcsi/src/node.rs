//! CSI Node service traits.
//!
//! [`CsiNode`] is what the orchestrator calls on the node's local socket to
//! make a volume usable by a Pod:
//!
//! 1. **Stage**: format the backing device if needed and mount it with `dax`
//!    at the global staging path (block volumes only record the path).
//! 2. **Publish**: bind-mount the staging mount (or the device node) into the
//!    Pod's target path.
//! 3. **Unpublish**: remove the bind mount.
//! 4. **Unstage**: unmount the staging path.
//!
//! [`NodeControl`] is the internal service the Controller forwards volume
//! lifecycle calls to over the mutual-TLS fabric.  Only the owning node ever
//! creates or deletes backing storage.

use async_trait::async_trait;

use crate::context::CallContext;
use crate::error::CsiError;
use crate::types::{
    CapacityReport, NodeCapability, NodeCreateVolumeRequest, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, Volume, VolumeId,
};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at the global staging path.
    ///
    /// Idempotent for identical parameters; a second call with different
    /// parameters fails with [`CsiError::VolumeBusyDifferentParameters`].
    async fn stage_volume(
        &self,
        ctx: &CallContext,
        req: NodeStageVolumeRequest,
    ) -> Result<(), CsiError>;

    /// Unmount the staging path.  Unknown volumes succeed.
    async fn unstage_volume(
        &self,
        ctx: &CallContext,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Bind-mount a staged volume into the container's target path.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Remove the bind mount.  Unknown volumes and missing mounts succeed.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Operator action: let deletes of a stuck volume run again.  Returns
    /// `false` when the volume was not stuck.
    async fn clear_stuck(&self, volume_id: &VolumeId) -> Result<bool, CsiError>;
}

/// Internal volume lifecycle service of a node agent.
#[async_trait]
pub trait NodeControl: Send + Sync {
    /// Reserve backing storage for a volume.  Idempotent by volume id.
    async fn create_volume(
        &self,
        ctx: &CallContext,
        req: NodeCreateVolumeRequest,
    ) -> Result<Volume, CsiError>;

    /// Release the volume's backing storage.  Returns `false` when this node
    /// does not hold the volume.
    async fn delete_volume(&self, ctx: &CallContext, volume_id: &VolumeId)
    -> Result<bool, CsiError>;

    /// Every volume this node holds.
    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError>;

    /// Grow the backing storage; returns the new size.
    async fn expand_volume(
        &self,
        ctx: &CallContext,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<u64, CsiError>;

    async fn get_capacity(&self) -> Result<CapacityReport, CsiError>;
}
