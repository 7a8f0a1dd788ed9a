//! Routing decoded requests to service implementations.
//!
//! One [`Dispatcher`] backs both the QUIC and the local-socket servers.  Each
//! request runs in its own task; when the caller's deadline passes the task's
//! cancellation token fires and the dispatcher waits for it to unwind before
//! answering with [`CsiError::DeadlineExceeded`].
//!
//! A service group may be restricted to callers whose certificate is valid
//! for one DNS name; everyone else gets [`CsiError::Unauthenticated`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::context::{CallContext, Peer};
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::{CsiMessage, Request, ServiceGroup};
use crate::node::{CsiNode, NodeControl};
use crate::registry::Registry;

#[derive(Clone, Default)]
pub struct Dispatcher {
    identity: Option<Arc<dyn CsiIdentity>>,
    controller: Option<Arc<dyn CsiController>>,
    node: Option<Arc<dyn CsiNode>>,
    node_control: Option<Arc<dyn NodeControl>>,
    registry: Option<Arc<dyn Registry>>,
    callers: HashMap<ServiceGroup, Arc<str>>,
}

fn reply<T>(result: Result<T, CsiError>, wrap: impl FnOnce(T) -> CsiMessage) -> CsiMessage {
    match result {
        Ok(v) => wrap(v),
        Err(e) => CsiMessage::Error(e),
    }
}

fn ack(result: Result<(), CsiError>) -> CsiMessage {
    reply(result, |()| CsiMessage::Ok)
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(mut self, service: Arc<dyn CsiIdentity>) -> Self {
        self.identity = Some(service);
        self
    }

    pub fn with_controller(mut self, service: Arc<dyn CsiController>) -> Self {
        self.controller = Some(service);
        self
    }

    pub fn with_node(mut self, service: Arc<dyn CsiNode>) -> Self {
        self.node = Some(service);
        self
    }

    pub fn with_node_control(mut self, service: Arc<dyn NodeControl>) -> Self {
        self.node_control = Some(service);
        self
    }

    pub fn with_registry(mut self, service: Arc<dyn Registry>) -> Self {
        self.registry = Some(service);
        self
    }

    /// Only accept `group` requests from a certificate issued for `name`.
    pub fn restrict(mut self, group: ServiceGroup, name: impl Into<Arc<str>>) -> Self {
        self.callers.insert(group, name.into());
        self
    }

    pub fn serves(&self, group: ServiceGroup) -> bool {
        match group {
            ServiceGroup::Identity => self.identity.is_some(),
            ServiceGroup::Controller => self.controller.is_some(),
            ServiceGroup::Node => self.node.is_some(),
            ServiceGroup::NodeControl => self.node_control.is_some(),
            ServiceGroup::Registry => self.registry.is_some(),
        }
    }

    /// Run one request to completion, honouring its deadline.
    pub async fn handle(&self, peer: Peer, request: Request) -> CsiMessage {
        let deadline = request.deadline();
        let message = request.message;
        let Some(group) = message.group() else {
            warn!(msg = %message, "response variant received as request");
            return CsiMessage::Error(CsiError::InvalidArgument(format!(
                "unexpected message: {message}"
            )));
        };
        if !self.serves(group) {
            return CsiMessage::Error(CsiError::InvalidArgument(format!(
                "{group:?} service is not served on this endpoint"
            )));
        }
        if let Some(name) = self.callers.get(&group)
            && !peer.is_named(name)
        {
            warn!(?group, fingerprint = ?peer.fingerprint, "caller not allowed");
            return CsiMessage::Error(CsiError::Unauthenticated(format!(
                "{group:?} service only accepts {name}"
            )));
        }

        let mut ctx = CallContext::for_peer(peer);
        if let Some(d) = deadline {
            ctx = ctx.with_deadline(d);
        }
        let cancel = ctx.cancel.clone();
        let label = message.to_string();
        let this = self.clone();
        let mut task = tokio::spawn(async move { this.call(&ctx, message).await });

        let joined = match deadline {
            None => (&mut task).await,
            Some(d) => match tokio::time::timeout(d, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    debug!(request = %label, "deadline passed, cancelling");
                    cancel.cancel();
                    return match task.await {
                        Ok(reply) if !matches!(reply, CsiMessage::Error(_)) => reply,
                        _ => CsiMessage::Error(CsiError::DeadlineExceeded(label)),
                    };
                }
            },
        };
        joined.unwrap_or_else(|e| {
            error!(request = %label, error = %e, "request task failed");
            CsiMessage::Error(CsiError::Internal(format!("{label}: {e}")))
        })
    }

    async fn call(&self, ctx: &CallContext, message: CsiMessage) -> CsiMessage {
        match (message.group(), message) {
            (Some(ServiceGroup::Identity), msg) => match &self.identity {
                Some(svc) => Self::identity(svc.as_ref(), msg).await,
                None => Self::unserved(ServiceGroup::Identity),
            },
            (Some(ServiceGroup::Controller), msg) => match &self.controller {
                Some(svc) => Self::controller(svc.as_ref(), ctx, msg).await,
                None => Self::unserved(ServiceGroup::Controller),
            },
            (Some(ServiceGroup::Node), msg) => match &self.node {
                Some(svc) => Self::node(svc.as_ref(), ctx, msg).await,
                None => Self::unserved(ServiceGroup::Node),
            },
            (Some(ServiceGroup::NodeControl), msg) => match &self.node_control {
                Some(svc) => Self::node_control(svc.as_ref(), ctx, msg).await,
                None => Self::unserved(ServiceGroup::NodeControl),
            },
            (Some(ServiceGroup::Registry), msg) => match &self.registry {
                Some(svc) => Self::registry(svc.as_ref(), ctx, msg).await,
                None => Self::unserved(ServiceGroup::Registry),
            },
            (None, msg) => Self::mismatch(msg),
        }
    }

    fn unserved(group: ServiceGroup) -> CsiMessage {
        CsiMessage::Error(CsiError::InvalidArgument(format!(
            "{group:?} service is not served on this endpoint"
        )))
    }

    fn mismatch(msg: CsiMessage) -> CsiMessage {
        CsiMessage::Error(CsiError::Internal(format!("misrouted message: {msg}")))
    }

    async fn identity(svc: &dyn CsiIdentity, msg: CsiMessage) -> CsiMessage {
        match msg {
            CsiMessage::Probe => reply(svc.probe().await, CsiMessage::ProbeResult),
            CsiMessage::GetPluginInfo => {
                reply(svc.get_plugin_info().await, CsiMessage::PluginInfoResponse)
            }
            CsiMessage::GetPluginCapabilities => reply(
                svc.get_plugin_capabilities().await,
                CsiMessage::PluginCapabilitiesResponse,
            ),
            other => Self::mismatch(other),
        }
    }

    async fn controller(svc: &dyn CsiController, ctx: &CallContext, msg: CsiMessage) -> CsiMessage {
        match msg {
            CsiMessage::CreateVolume(req) => {
                reply(svc.create_volume(ctx, req).await, CsiMessage::VolumeCreated)
            }
            CsiMessage::DeleteVolume(id) => ack(svc.delete_volume(ctx, &id).await),
            CsiMessage::ControllerPublishVolume { volume_id, node_id } => {
                ack(svc.controller_publish_volume(&volume_id, &node_id).await)
            }
            CsiMessage::ControllerUnpublishVolume { volume_id, node_id } => {
                ack(svc.controller_unpublish_volume(&volume_id, &node_id).await)
            }
            CsiMessage::ValidateVolumeCapabilities {
                volume_id,
                capabilities,
            } => reply(
                svc.validate_volume_capabilities(&volume_id, &capabilities)
                    .await,
                CsiMessage::CapabilitiesValid,
            ),
            CsiMessage::ListVolumes(req) => {
                reply(svc.list_volumes(req).await, CsiMessage::VolumePage)
            }
            CsiMessage::GetCapacity(req) => reply(svc.get_capacity(req).await, CsiMessage::Capacity),
            CsiMessage::ControllerGetCapabilities => reply(
                svc.get_capabilities().await,
                CsiMessage::ControllerCapabilitiesResponse,
            ),
            CsiMessage::ExpandVolume {
                volume_id,
                capacity_bytes,
            } => reply(
                svc.expand_volume(ctx, &volume_id, capacity_bytes).await,
                CsiMessage::VolumeExpanded,
            ),
            other => Self::mismatch(other),
        }
    }

    async fn node(svc: &dyn CsiNode, ctx: &CallContext, msg: CsiMessage) -> CsiMessage {
        match msg {
            CsiMessage::StageVolume(req) => ack(svc.stage_volume(ctx, req).await),
            CsiMessage::UnstageVolume {
                volume_id,
                staging_target_path,
            } => ack(
                svc.unstage_volume(ctx, &volume_id, &staging_target_path)
                    .await,
            ),
            CsiMessage::PublishVolume(req) => ack(svc.publish_volume(req).await),
            CsiMessage::UnpublishVolume {
                volume_id,
                target_path,
            } => ack(svc.unpublish_volume(&volume_id, &target_path).await),
            CsiMessage::GetNodeInfo => reply(svc.get_info().await, CsiMessage::NodeInfoResponse),
            CsiMessage::NodeGetCapabilities => reply(
                svc.get_capabilities().await,
                CsiMessage::NodeCapabilitiesResponse,
            ),
            CsiMessage::ClearStuckVolume(id) => {
                reply(svc.clear_stuck(&id).await, CsiMessage::StuckCleared)
            }
            other => Self::mismatch(other),
        }
    }

    async fn node_control(svc: &dyn NodeControl, ctx: &CallContext, msg: CsiMessage) -> CsiMessage {
        match msg {
            CsiMessage::NodeCreateVolume(req) => {
                reply(svc.create_volume(ctx, req).await, CsiMessage::VolumeCreated)
            }
            CsiMessage::NodeDeleteVolume(id) => {
                reply(svc.delete_volume(ctx, &id).await, CsiMessage::VolumeDeleted)
            }
            CsiMessage::NodeListVolumes => reply(svc.list_volumes().await, CsiMessage::VolumeList),
            CsiMessage::NodeExpandVolume {
                volume_id,
                capacity_bytes,
            } => reply(
                svc.expand_volume(ctx, &volume_id, capacity_bytes).await,
                CsiMessage::VolumeExpanded,
            ),
            CsiMessage::NodeGetCapacity => reply(svc.get_capacity().await, CsiMessage::Capacity),
            other => Self::mismatch(other),
        }
    }

    async fn registry(svc: &dyn Registry, ctx: &CallContext, msg: CsiMessage) -> CsiMessage {
        let caller = &ctx.peer;
        match msg {
            CsiMessage::RegisterNode(req) => ack(svc.register_node(caller, req).await),
            CsiMessage::UnregisterNode { node_id } => {
                ack(svc.unregister_node(caller, &node_id).await)
            }
            CsiMessage::UpdateCapacity {
                node_id,
                mode,
                seq,
                delta,
            } => reply(
                svc.update_capacity(caller, &node_id, mode, seq, delta).await,
                CsiMessage::ModeCapacity,
            ),
            CsiMessage::Heartbeat { node_id } => ack(svc.heartbeat(caller, &node_id).await),
            CsiMessage::ListNodes => reply(svc.list_nodes().await, CsiMessage::NodeList),
            CsiMessage::GetNodeCapacity { node_id, mode } => reply(
                svc.get_capacity(&node_id, mode).await,
                CsiMessage::ModeCapacity,
            ),
            other => Self::mismatch(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::types::{PluginCapability, PluginInfo};

    /// Sleeps in `probe` until cancelled, then reports the cancellation.
    struct Slow {
        delay: Duration,
    }

    #[async_trait]
    impl CsiIdentity for Slow {
        async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
            Ok(PluginInfo {
                name: "slow".into(),
                vendor_version: "0".into(),
            })
        }

        async fn probe(&self) -> Result<bool, CsiError> {
            tokio::time::sleep(self.delay).await;
            Ok(true)
        }

        async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
            Ok(vec![])
        }
    }

    fn dispatcher(delay: Duration) -> Dispatcher {
        Dispatcher::new().with_identity(Arc::new(Slow { delay }))
    }

    #[tokio::test]
    async fn routes_to_identity() {
        let reply = dispatcher(Duration::ZERO)
            .handle(Peer::local(), Request::new(CsiMessage::GetPluginInfo))
            .await;
        assert!(matches!(reply, CsiMessage::PluginInfoResponse(ref i) if i.name == "slow"));
    }

    #[tokio::test]
    async fn unserved_group_is_rejected() {
        let reply = dispatcher(Duration::ZERO)
            .handle(Peer::local(), Request::new(CsiMessage::ListNodes))
            .await;
        assert!(matches!(
            reply,
            CsiMessage::Error(CsiError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn response_variant_is_rejected() {
        let reply = dispatcher(Duration::ZERO)
            .handle(Peer::local(), Request::new(CsiMessage::Ok))
            .await;
        assert!(matches!(
            reply,
            CsiMessage::Error(CsiError::InvalidArgument(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn task_finishing_after_deadline_keeps_its_result() {
        // The probe ignores cancellation, so its late success is reported.
        let reply = dispatcher(Duration::from_secs(5))
            .handle(
                Peer::local(),
                Request::new(CsiMessage::Probe).with_deadline(Duration::from_secs(1)),
            )
            .await;
        assert!(matches!(reply, CsiMessage::ProbeResult(true)));
    }

    #[tokio::test]
    async fn restricted_group_checks_certificate_name() {
        use crate::context::named_peer;

        let d = dispatcher(Duration::ZERO).restrict(ServiceGroup::Identity, "pmem-registry");
        for peer in [named_peer("worker-2"), Peer::local()] {
            let reply = d
                .handle(peer, Request::new(CsiMessage::GetPluginInfo))
                .await;
            assert!(
                matches!(reply, CsiMessage::Error(CsiError::Unauthenticated(_))),
                "{reply:?}"
            );
        }

        let reply = d
            .handle(
                named_peer("pmem-registry"),
                Request::new(CsiMessage::GetPluginInfo),
            )
            .await;
        assert!(matches!(reply, CsiMessage::PluginInfoResponse(_)));
    }
}
