//! `pmem-csi-driver`: runs the PMEM-CSI controller or node role.
//!
//! ```text
//! pmem-csi-driver --config /etc/pmem-csi/node.yaml --role node run
//! pmem-csi-driver --config /etc/pmem-csi/controller.yaml show-config
//! pmem-csi-driver --csi-socket /run/pmem-csi/node.sock clear-stuck pmem-3f2a...
//! ```

mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use libpmemcsi::transport::LocalClient;
use libpmemcsi::{CsiMessage, DriverConfig, VolumeId};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, LogFormat};

fn init_logging(format: LogFormat, level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("invalid log filter")?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Json => builder.json().flatten_event(true).init(),
        LogFormat::Text => builder.compact().init(),
    }
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => info!("SIGTERM received, shutting down"),
            _ = int.recv() => info!("SIGINT received, shutting down"),
        }
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, &cli.log_level)?;

    let mut config = DriverConfig::load(cli.config.as_deref()).with_context(|| match &cli.config
    {
        Some(path) => format!("load configuration from {}", path.display()),
        None => "load configuration".to_owned(),
    })?;
    cli.overrides.apply(&mut config);

    match cli.command.unwrap_or(Command::Run) {
        Command::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Command::Validate => {
            config.validate().context("invalid configuration")?;
            println!("configuration is valid");
            Ok(())
        }
        Command::ClearStuck { volume_id } => {
            let client = LocalClient::connect(&config.csi_socket)
                .await
                .with_context(|| format!("connect to {}", config.csi_socket.display()))?;
            match client
                .call(CsiMessage::ClearStuckVolume(VolumeId(volume_id.clone())))
                .await?
            {
                CsiMessage::StuckCleared(true) => println!("{volume_id}: cleared"),
                CsiMessage::StuckCleared(false) => println!("{volume_id}: not stuck"),
                other => bail!("unexpected reply: {other}"),
            }
            Ok(())
        }
        Command::Run => {
            let shutdown = CancellationToken::new();
            cancel_on_signal(shutdown.clone())?;
            info!(role = %config.role, driver = %config.driver_name, "starting");
            libpmemcsi::driver::run(config, shutdown)
                .await
                .inspect_err(|e| error!(error = %e, "driver failed"))
                .context("driver failed")
        }
    }
}
