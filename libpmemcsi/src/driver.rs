//! Assembling the controller and node roles from a [`DriverConfig`].
//!
//! The controller role serves:
//! - Identity and Controller on the local CSI socket,
//! - the registry over mutual-TLS QUIC,
//! - the scheduler extender over HTTP when `scheduler_listen` is set.
//!
//! The node role serves Identity and Node on the local CSI socket and
//! NodeControl over QUIC, and keeps itself registered with the registry.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{Mounter, NodeOptions, PmemNode, StateStore, SystemMounter};
use crate::config::{DriverConfig, Role};
use crate::device::{DeviceAdapter, SystemAdapter};
use crate::error::CsiError;
use crate::master::{ControllerOptions, ControllerServer, QuicConnector};
use crate::message::ServiceGroup;
use crate::pool::VolumeGroupManager;
use crate::registry::{CapacityReporter, NodeRegistry, RegistryLink};
use crate::scheduler::{self, SchedulerExtender};
use crate::transport::{CsiServer, Dispatcher, LocalServer, TlsIdentity};
use crate::types::NodeIdentity;

fn parse_addr(what: &str, value: &str) -> Result<SocketAddr, CsiError> {
    value
        .parse()
        .map_err(|e| CsiError::InvalidArgument(format!("{what} {value:?}: {e}")))
}

type Task = (&'static str, Result<(), CsiError>);

/// A started role.  Dropping it does not stop anything; cancel the shutdown
/// token and call [`RunningDriver::wait`].
pub struct RunningDriver {
    quic: Arc<CsiServer>,
    quic_addr: SocketAddr,
    registry: Option<Arc<NodeRegistry>>,
    node: Option<Arc<PmemNode>>,
    tasks: JoinSet<Task>,
    shutdown: CancellationToken,
}

impl RunningDriver {
    fn new(quic: CsiServer, shutdown: CancellationToken) -> Result<Self, CsiError> {
        let quic_addr = quic.local_addr()?;
        let quic = Arc::new(quic);
        let mut tasks = JoinSet::new();
        let server = Arc::clone(&quic);
        tasks.spawn(async move { ("quic server", server.serve().await) });
        Ok(Self {
            quic,
            quic_addr,
            registry: None,
            node: None,
            tasks,
            shutdown,
        })
    }

    fn spawn(
        &mut self,
        name: &'static str,
        task: impl Future<Output = Result<(), CsiError>> + Send + 'static,
    ) {
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Bound address of the QUIC endpoint (registry or node control).
    pub fn quic_addr(&self) -> SocketAddr {
        self.quic_addr
    }

    /// The registry, for the controller role.
    pub fn registry(&self) -> Option<&Arc<NodeRegistry>> {
        self.registry.as_ref()
    }

    /// The node agent, for the node role.
    pub fn node(&self) -> Option<&Arc<PmemNode>> {
        self.node.as_ref()
    }

    /// Run until the shutdown token fires or a service stops on its own,
    /// then stop the rest and wait for them.
    pub async fn wait(mut self) -> Result<(), CsiError> {
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Ok(()),
            Some(joined) = self.tasks.join_next() => match joined {
                _ if self.shutdown.is_cancelled() => Ok(()),
                Ok((name, Ok(()))) => Err(CsiError::Internal(format!("{name} stopped"))),
                Ok((name, Err(e))) => Err(CsiError::Internal(format!("{name} failed: {e}"))),
                Err(e) => Err(CsiError::internal(e)),
            },
        };

        self.shutdown.cancel();
        self.quic.shutdown();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Err(e))) => warn!(service = name, error = %e, "stopped with error"),
                Ok((_, Ok(()))) => {}
                Err(e) => warn!(error = %e, "service task panicked"),
            }
        }
        info!("driver stopped");
        result
    }
}

/// Validate `config` and run its role on real hardware until `shutdown`.
pub async fn run(config: DriverConfig, shutdown: CancellationToken) -> Result<(), CsiError> {
    config.validate()?;
    let running = match config.role {
        Role::Controller => start_controller(&config, shutdown).await?,
        Role::Node => {
            start_node(
                &config,
                Arc::new(SystemAdapter::new()),
                Arc::new(SystemMounter),
                shutdown,
            )
            .await?
        }
    };
    running.wait().await
}

pub async fn start_controller(
    config: &DriverConfig,
    shutdown: CancellationToken,
) -> Result<RunningDriver, CsiError> {
    let tls = TlsIdentity::load(&config.tls)?;
    let timeouts = &config.timeouts;

    let registry = Arc::new(NodeRegistry::new(timeouts.heartbeat_timeout()));
    let connector = Arc::new(QuicConnector::new(
        tls.client_config()?,
        timeouts.connect(),
        timeouts.request(),
    ));
    let controller = Arc::new(ControllerServer::new(
        ControllerOptions {
            driver_name: config.driver_name.clone(),
            default_mode: config.device.default_mode,
            ..Default::default()
        },
        registry.clone(),
        connector,
    ));

    let quic = CsiServer::new(
        parse_addr("registry_listen", &config.registry_listen)?,
        tls.server_config()?,
        Dispatcher::new().with_registry(registry.clone()),
    )?;
    let local = LocalServer::bind(
        &config.csi_socket,
        Dispatcher::new()
            .with_identity(controller.clone())
            .with_controller(controller),
    )?;

    let mut running = RunningDriver::new(quic, shutdown.clone())?;
    running.registry = Some(Arc::clone(&registry));
    running.spawn("csi socket", local.serve(shutdown.clone()));

    if let Some(addr) = &config.scheduler_listen {
        let addr = parse_addr("scheduler_listen", addr)?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| CsiError::TransportError(format!("bind {addr}: {e}")))?;
        let extender = Arc::new(SchedulerExtender::new(&config.driver_name, registry));
        let sd = shutdown.clone();
        running.spawn("scheduler extender", async move {
            scheduler::serve(listener, extender, sd)
                .await
                .map_err(CsiError::transport)
        });
    }

    info!(
        registry = %running.quic_addr(),
        socket = %config.csi_socket.display(),
        "controller started"
    );
    Ok(running)
}

/// Start the node role on `adapter` and `mounter`.
pub async fn start_node(
    config: &DriverConfig,
    adapter: Arc<dyn DeviceAdapter>,
    mounter: Arc<dyn Mounter>,
    shutdown: CancellationToken,
) -> Result<RunningDriver, CsiError> {
    let tls = TlsIdentity::load(&config.tls)?;
    let vgm = Arc::new(VolumeGroupManager::discover(adapter, &config.device.pool_config()).await?);
    let node = Arc::new(PmemNode::new(
        NodeOptions {
            driver_name: config.driver_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            node_id: config.node_id.clone(),
            max_volumes: config.max_volumes,
            default_mode: config.device.default_mode,
        },
        Arc::clone(&vgm),
        mounter,
        StateStore::new(&config.state_dir),
    ));
    node.recover().await?;

    let quic = CsiServer::new(
        parse_addr("node_listen", &config.node_listen)?,
        tls.server_config()?,
        Dispatcher::new()
            .with_node_control(node.clone())
            .restrict(ServiceGroup::NodeControl, config.registry_server_name.as_str()),
    )?;
    let endpoint = match &config.node_advertise {
        Some(advertise) => advertise.clone(),
        None => quic.local_addr()?.to_string(),
    };
    let link = Arc::new(RegistryLink::new(
        NodeIdentity {
            node_id: config.node_id.clone(),
            endpoint,
            server_name: config.node_id.clone(),
            fingerprint: tls.fingerprint(),
        },
        config.registry_endpoint.clone(),
        config.registry_server_name.clone(),
        tls.client_config()?,
        config.timeouts.link_timings(),
    ));
    let reporter = Arc::new(CapacityReporter::new(vgm, link.clone()));
    node.attach_reporter(Arc::clone(&reporter));

    let local = LocalServer::bind(
        &config.csi_socket,
        Dispatcher::new()
            .with_identity(node.clone())
            .with_node(node.clone()),
    )?;

    let mut running = RunningDriver::new(quic, shutdown.clone())?;
    running.node = Some(Arc::clone(&node));
    running.spawn("csi socket", local.serve(shutdown.clone()));
    let sd = shutdown.clone();
    running.spawn("registry link", async move {
        link.run(reporter, sd).await;
        Ok(())
    });

    info!(
        node = %config.node_id,
        control = %running.quic_addr(),
        socket = %config.csi_socket.display(),
        "node started"
    );
    Ok(running)
}
