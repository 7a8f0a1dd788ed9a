//! Command line flags.  Flags win over the config file and `PMEM_CSI_*`
//! variables.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use libpmemcsi::{DriverConfig, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoleArg {
    Controller,
    Node,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Controller => Role::Controller,
            RoleArg::Node => Role::Node,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// PMEM-CSI driver for RK8s
#[derive(Debug, Parser)]
#[command(name = "pmem-csi-driver", version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true, env = "PMEM_CSI_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the configured role (the default)
    Run,
    /// Print the effective configuration as YAML
    ShowConfig,
    /// Check the effective configuration and exit
    Validate,
    /// Allow deleting a stuck volume again, through the node's CSI socket
    ClearStuck {
        /// Id of the stuck volume
        volume_id: String,
    },
}

#[derive(Debug, Default, clap::Args)]
pub struct Overrides {
    #[arg(long, global = true, value_enum)]
    pub role: Option<RoleArg>,

    #[arg(long, global = true)]
    pub node_id: Option<String>,

    #[arg(long, global = true, value_name = "PATH")]
    pub csi_socket: Option<PathBuf>,

    #[arg(long, global = true, value_name = "HOST:PORT")]
    pub registry_endpoint: Option<String>,

    #[arg(long, global = true, value_name = "ADDR")]
    pub scheduler_listen: Option<String>,

    #[arg(long, global = true, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,
}

impl Overrides {
    pub fn apply(self, config: &mut DriverConfig) {
        if let Some(role) = self.role {
            config.role = role.into();
        }
        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        if let Some(path) = self.csi_socket {
            config.csi_socket = path;
        }
        if let Some(endpoint) = self.registry_endpoint {
            config.registry_endpoint = endpoint;
        }
        if let Some(addr) = self.scheduler_listen {
            config.scheduler_listen = Some(addr);
        }
        if let Some(dir) = self.state_dir {
            config.state_dir = dir;
        }
    }
}
