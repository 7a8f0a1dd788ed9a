//! Node-side capacity reporting.
//!
//! The node remembers the last figure the registry accepted for each mode
//! and only ever sends the difference.  Every delta carries a per-mode
//! sequence number.  A delta whose reply was lost is resent with the same
//! number, so the registry applies it at most once.  Reading the pool and
//! pushing the delta happen under one per-mode lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::Registry;
use crate::context::Peer;
use crate::error::CsiError;
use crate::pool::VolumeGroupManager;
use crate::types::{CapacityDelta, CapacityReport, DeviceMode, ModeCapacity};

/// Where capacity deltas go.
#[async_trait]
pub trait CapacitySink: Send + Sync {
    async fn push(
        &self,
        mode: DeviceMode,
        seq: u64,
        delta: CapacityDelta,
    ) -> Result<ModeCapacity, CsiError>;
}

/// Pushes straight into an in-process registry.
pub struct RegistrySink {
    registry: Arc<dyn Registry>,
    peer: Peer,
    node_id: String,
}

impl RegistrySink {
    pub fn new(registry: Arc<dyn Registry>, peer: Peer, node_id: impl Into<String>) -> Self {
        Self {
            registry,
            peer,
            node_id: node_id.into(),
        }
    }
}

#[async_trait]
impl CapacitySink for RegistrySink {
    async fn push(
        &self,
        mode: DeviceMode,
        seq: u64,
        delta: CapacityDelta,
    ) -> Result<ModeCapacity, CsiError> {
        self.registry
            .update_capacity(&self.peer, &self.node_id, mode, seq, delta)
            .await
    }
}

#[derive(Clone, Copy)]
struct Pending {
    seq: u64,
    delta: CapacityDelta,
    target: ModeCapacity,
}

#[derive(Default)]
struct ModeReport {
    accepted: ModeCapacity,
    seq: u64,
    pending: Option<Pending>,
}

pub struct CapacityReporter {
    vgm: Arc<VolumeGroupManager>,
    sink: Arc<dyn CapacitySink>,
    modes: BTreeMap<DeviceMode, Mutex<ModeReport>>,
}

impl CapacityReporter {
    pub fn new(vgm: Arc<VolumeGroupManager>, sink: Arc<dyn CapacitySink>) -> Self {
        let modes = vgm
            .modes()
            .map(|mode| (mode, Mutex::new(ModeReport::default())))
            .collect();
        Self { vgm, sink, modes }
    }

    /// Push every non-zero change since the last accepted report.
    ///
    /// An unacknowledged delta is resent unchanged before any newer change
    /// is computed.
    pub async fn sync(&self) -> Result<(), CsiError> {
        let mut first_error = None;
        for (mode, state) in &self.modes {
            let mut state = state.lock().await;
            if state.pending.is_none() {
                let now = self.vgm.capacity(*mode).await?;
                let delta = now.delta_from(&state.accepted);
                if delta.is_zero() {
                    continue;
                }
                state.seq += 1;
                state.pending = Some(Pending {
                    seq: state.seq,
                    delta,
                    target: now,
                });
            }
            let Some(pending) = state.pending else {
                continue;
            };
            match self.sink.push(*mode, pending.seq, pending.delta).await {
                Ok(registry_view) => {
                    debug!(
                        %mode,
                        seq = pending.seq,
                        total = pending.delta.total,
                        available = pending.delta.available,
                        registry_available = registry_view.available,
                        "capacity delta reported"
                    );
                    state.accepted = pending.target;
                    state.pending = None;
                }
                Err(e) => {
                    warn!(%mode, seq = pending.seq, error = %e, "capacity delta not acknowledged");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Current capacity of every mode, remembered as already reported, with
    /// sequence numbers restarted.  Used for the registration snapshot.
    pub async fn reset(&self) -> Result<CapacityReport, CsiError> {
        let mut report = CapacityReport::default();
        for (mode, state) in &self.modes {
            let mut state = state.lock().await;
            let now = self.vgm.capacity(*mode).await?;
            *state = ModeReport {
                accepted: now,
                ..ModeReport::default()
            };
            report.modes.insert(*mode, now);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::device::{LvmGeometry, SimulatedAdapter};
    use crate::pool::PoolConfig;
    use crate::types::{GIB, MIB};

    #[derive(Default)]
    struct Recorder {
        pushed: StdMutex<Vec<(DeviceMode, u64, CapacityDelta)>>,
        fail: StdMutex<bool>,
    }

    #[async_trait]
    impl CapacitySink for Recorder {
        async fn push(
            &self,
            mode: DeviceMode,
            seq: u64,
            delta: CapacityDelta,
        ) -> Result<ModeCapacity, CsiError> {
            if *self.fail.lock().unwrap() {
                return Err(CsiError::NodeUnreachable("registry".into()));
            }
            self.pushed.lock().unwrap().push((mode, seq, delta));
            Ok(ModeCapacity::default())
        }
    }

    /// Applies every delta, then reports failure for the first `lose` of
    /// them as if the reply never arrived.
    struct LostReply {
        inner: RegistrySink,
        lose: StdMutex<usize>,
    }

    #[async_trait]
    impl CapacitySink for LostReply {
        async fn push(
            &self,
            mode: DeviceMode,
            seq: u64,
            delta: CapacityDelta,
        ) -> Result<ModeCapacity, CsiError> {
            let view = self.inner.push(mode, seq, delta).await?;
            let mut lose = self.lose.lock().unwrap();
            if *lose > 0 {
                *lose -= 1;
                return Err(CsiError::DeadlineExceeded("reply lost".into()));
            }
            Ok(view)
        }
    }

    async fn pool() -> Arc<VolumeGroupManager> {
        let geometry = LvmGeometry {
            extent_size: 4 * MIB,
            pv_metadata_bytes: 0,
        };
        let sim = Arc::new(SimulatedAdapter::new(geometry).with_region("region0", 4 * GIB));
        let config = PoolConfig {
            lvm: geometry,
            ..PoolConfig::default()
        };
        Arc::new(VolumeGroupManager::discover(sim, &config).await.unwrap())
    }

    async fn setup() -> (Arc<VolumeGroupManager>, Arc<Recorder>, CapacityReporter) {
        let vgm = pool().await;
        let recorder = Arc::new(Recorder::default());
        let reporter = CapacityReporter::new(vgm.clone(), recorder.clone());
        (vgm, recorder, reporter)
    }

    #[tokio::test]
    async fn only_changes_are_pushed() {
        let (vgm, recorder, reporter) = setup().await;
        let snapshot = reporter.reset().await.unwrap();
        assert_eq!(snapshot.get(DeviceMode::Lvm).available, 4 * GIB);

        reporter.sync().await.unwrap();
        assert!(recorder.pushed.lock().unwrap().is_empty());

        vgm.reserve("v1", GIB, DeviceMode::Lvm, &CancellationToken::new())
            .await
            .unwrap();
        reporter.sync().await.unwrap();
        reporter.sync().await.unwrap();
        let pushed = recorder.pushed.lock().unwrap().clone();
        assert_eq!(
            pushed,
            vec![(
                DeviceMode::Lvm,
                1,
                CapacityDelta {
                    total: 0,
                    available: -(GIB as i64)
                }
            )]
        );
    }

    #[tokio::test]
    async fn failed_push_is_retried() {
        let (vgm, recorder, reporter) = setup().await;
        reporter.reset().await.unwrap();
        vgm.reserve("v1", GIB, DeviceMode::Lvm, &CancellationToken::new())
            .await
            .unwrap();

        *recorder.fail.lock().unwrap() = true;
        assert!(reporter.sync().await.is_err());
        *recorder.fail.lock().unwrap() = false;
        reporter.sync().await.unwrap();

        let pushed = recorder.pushed.lock().unwrap().clone();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].2.available, -(GIB as i64));
    }

    #[tokio::test]
    async fn lost_reply_is_not_applied_twice() {
        use crate::context::named_peer;
        use crate::registry::NodeRegistry;
        use crate::types::{NodeIdentity, RegisterNodeRequest};

        let vgm = pool().await;
        let registry = Arc::new(NodeRegistry::default());
        let peer = named_peer("n1");
        let sink = Arc::new(LostReply {
            inner: RegistrySink::new(registry.clone(), peer.clone(), "n1"),
            lose: StdMutex::new(1),
        });
        let reporter = CapacityReporter::new(vgm.clone(), sink);
        let snapshot = reporter.reset().await.unwrap();
        registry
            .register_node(
                &peer,
                RegisterNodeRequest {
                    identity: NodeIdentity {
                        node_id: "n1".into(),
                        endpoint: "127.0.0.1:4433".into(),
                        server_name: "n1".into(),
                        fingerprint: peer.fingerprint.clone().unwrap(),
                    },
                    capacity: snapshot,
                },
            )
            .await
            .unwrap();

        vgm.reserve("v1", GIB, DeviceMode::Lvm, &CancellationToken::new())
            .await
            .unwrap();
        assert!(reporter.sync().await.is_err());
        reporter.sync().await.unwrap();
        reporter.sync().await.unwrap();

        let seen = registry.get_capacity("n1", DeviceMode::Lvm).await.unwrap();
        assert_eq!(seen, vgm.capacity(DeviceMode::Lvm).await.unwrap());
        assert_eq!(seen.available, 3 * GIB);
    }
}
