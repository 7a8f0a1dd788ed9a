//! Driver configuration.
//!
//! Values come from three layers, later ones winning:
//!
//! 1. a YAML file (every field optional, defaults filled per field),
//! 2. `PMEM_CSI_*` environment variables,
//! 3. command line flags, applied by the binary.
//!
//! [`DriverConfig::validate`] runs last.
//!
//! Environment variables:
//! - `PMEM_CSI_DRIVER_NAME`, `PMEM_CSI_ROLE` (`controller` or `node`),
//!   `PMEM_CSI_NODE_ID`, `PMEM_CSI_CSI_SOCKET`, `PMEM_CSI_STATE_DIR`
//! - `PMEM_CSI_REGISTRY_ENDPOINT`, `PMEM_CSI_REGISTRY_SERVER_NAME`,
//!   `PMEM_CSI_REGISTRY_LISTEN`, `PMEM_CSI_NODE_LISTEN`,
//!   `PMEM_CSI_NODE_ADVERTISE`, `PMEM_CSI_SCHEDULER_LISTEN`
//! - `PMEM_CSI_CA_FILE`, `PMEM_CSI_CERT_FILE`, `PMEM_CSI_KEY_FILE`
//! - `PMEM_CSI_DEFAULT_MODE`, `PMEM_CSI_PMEM_PERCENTAGE`,
//!   `PMEM_CSI_MAX_VOLUMES`

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::LvmGeometry;
use crate::error::CsiError;
use crate::master::DEFAULT_DRIVER_NAME;
use crate::pool::PoolConfig;
use crate::registry::LinkTimings;
use crate::transport::TlsConfig;
use crate::types::{DeviceMode, MIB};

pub const ENV_PREFIX: &str = "PMEM_CSI_";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Controller service, registry and scheduler extender.
    #[default]
    Controller,
    /// Node agent on a host with PMEM.
    Node,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Controller => "controller",
            Self::Node => "node",
        })
    }
}

impl FromStr for Role {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(Self::Controller),
            "node" => Ok(Self::Node),
            other => Err(CsiError::InvalidArgument(format!(
                "unknown role {other:?}, expected \"controller\" or \"node\""
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DirectConfig {
    /// Namespace size granularity.
    pub alignment: u64,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            alignment: 2 * MIB,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub default_mode: DeviceMode,
    pub region_modes: BTreeMap<String, DeviceMode>,
    pub pmem_percentage: u8,
    pub lvm: LvmGeometry,
    pub direct: DirectConfig,
    pub erase_blocks: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            default_mode: pool.default_mode,
            region_modes: pool.region_modes,
            pmem_percentage: pool.pmem_percentage,
            lvm: pool.lvm,
            direct: DirectConfig {
                alignment: pool.direct_alignment,
            },
            erase_blocks: pool.erase_blocks,
        }
    }
}

impl DeviceConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            default_mode: self.default_mode,
            region_modes: self.region_modes.clone(),
            pmem_percentage: self.pmem_percentage,
            lvm: self.lvm,
            direct_alignment: self.direct.alignment,
            erase_blocks: self.erase_blocks,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
    pub retry_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// A node missing heartbeats this long is unreachable.
    pub heartbeat_timeout_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request_secs: 10,
            connect_secs: 10,
            retry_secs: 5,
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
        }
    }
}

impl Timeouts {
    pub fn link_timings(&self) -> LinkTimings {
        LinkTimings {
            connect_timeout: Duration::from_secs(self.connect_secs),
            request_timeout: Duration::from_secs(self.request_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            retry_delay: Duration::from_secs(self.retry_secs),
        }
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    pub driver_name: String,
    pub role: Role,
    /// Required for nodes.  Also the DNS name in the node's certificate.
    pub node_id: String,
    /// Local socket the orchestrator talks CSI on.
    pub csi_socket: PathBuf,
    /// `host:port` of the registry, for nodes.
    pub registry_endpoint: String,
    /// DNS name in the registry's certificate.
    pub registry_server_name: String,
    /// QUIC listen address of the registry, for the controller.
    pub registry_listen: String,
    /// QUIC listen address of a node's internal service.
    pub node_listen: String,
    /// Address the controller dials for this node, if not `node_listen`.
    pub node_advertise: Option<String>,
    /// HTTP listen address of the scheduler extender; off when unset.
    pub scheduler_listen: Option<String>,
    pub tls: TlsConfig,
    pub state_dir: PathBuf,
    pub device: DeviceConfig,
    pub timeouts: Timeouts,
    pub max_volumes: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            role: Role::default(),
            node_id: String::new(),
            csi_socket: PathBuf::from("/run/pmem-csi/csi.sock"),
            registry_endpoint: String::new(),
            registry_server_name: "pmem-registry".to_owned(),
            registry_listen: "0.0.0.0:10000".to_owned(),
            node_listen: "0.0.0.0:10001".to_owned(),
            node_advertise: None,
            scheduler_listen: None,
            tls: TlsConfig::default(),
            state_dir: PathBuf::from("/var/lib/pmem-csi"),
            device: DeviceConfig::default(),
            timeouts: Timeouts::default(),
            max_volumes: 256,
        }
    }
}

fn invalid(e: impl fmt::Display) -> CsiError {
    CsiError::InvalidArgument(e.to_string())
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, CsiError>
where
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|e| invalid(format!("{ENV_PREFIX}{key}={value:?}: {e}")))
}

fn parse_addr(what: &str, value: &str) -> Result<SocketAddr, CsiError> {
    value
        .parse()
        .map_err(|e| invalid(format!("{what} {value:?}: {e}")))
}

impl DriverConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, CsiError> {
        serde_yaml::from_str(yaml).map_err(|e| invalid(format!("config: {e}")))
    }

    /// Read `path` if given, then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, CsiError> {
        let mut config = match path {
            Some(path) => {
                let yaml = std::fs::read_to_string(path)
                    .map_err(|e| invalid(format!("read {}: {e}", path.display())))?;
                Self::from_yaml(&yaml)?
            }
            None => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Apply `PMEM_CSI_*` overrides from `vars`.  Other variables are ignored.
    pub fn apply_env(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), CsiError> {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match key {
                "DRIVER_NAME" => self.driver_name = value,
                "ROLE" => self.role = parse_env(key, &value)?,
                "NODE_ID" => self.node_id = value,
                "CSI_SOCKET" => self.csi_socket = value.into(),
                "STATE_DIR" => self.state_dir = value.into(),
                "REGISTRY_ENDPOINT" => self.registry_endpoint = value,
                "REGISTRY_SERVER_NAME" => self.registry_server_name = value,
                "REGISTRY_LISTEN" => self.registry_listen = value,
                "NODE_LISTEN" => self.node_listen = value,
                "NODE_ADVERTISE" => self.node_advertise = Some(value),
                "SCHEDULER_LISTEN" => self.scheduler_listen = Some(value),
                "CA_FILE" => self.tls.ca_file = value.into(),
                "CERT_FILE" => self.tls.cert_file = value.into(),
                "KEY_FILE" => self.tls.key_file = value.into(),
                "DEFAULT_MODE" => self.device.default_mode = parse_env(key, &value)?,
                "PMEM_PERCENTAGE" => self.device.pmem_percentage = parse_env(key, &value)?,
                "MAX_VOLUMES" => self.max_volumes = parse_env(key, &value)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Endpoint other components dial for this node.
    pub fn node_endpoint(&self) -> &str {
        self.node_advertise.as_deref().unwrap_or(&self.node_listen)
    }

    pub fn validate(&self) -> Result<(), CsiError> {
        if self.driver_name.is_empty() {
            return Err(invalid("driver_name must not be empty"));
        }
        if self.csi_socket.as_os_str().is_empty() {
            return Err(invalid("csi_socket must not be empty"));
        }
        self.validate_tls()?;
        if let Some(addr) = &self.scheduler_listen {
            parse_addr("scheduler_listen", addr)?;
        }
        let t = &self.timeouts;
        if [
            t.request_secs,
            t.connect_secs,
            t.retry_secs,
            t.heartbeat_interval_secs,
            t.heartbeat_timeout_secs,
        ]
        .contains(&0)
        {
            return Err(invalid("timeouts must be non-zero"));
        }

        match self.role {
            Role::Controller => {
                parse_addr("registry_listen", &self.registry_listen)?;
            }
            Role::Node => {
                if self.node_id.is_empty() {
                    return Err(invalid("node_id is required for the node role"));
                }
                if self.registry_endpoint.is_empty() {
                    return Err(invalid("registry_endpoint is required for the node role"));
                }
                parse_addr("node_listen", &self.node_listen)?;
                if self.state_dir.as_os_str().is_empty() {
                    return Err(invalid("state_dir must not be empty"));
                }
                if self.max_volumes == 0 {
                    return Err(invalid("max_volumes must be positive"));
                }
                self.device.pool_config().validate()?;
            }
        }
        Ok(())
    }

    fn validate_tls(&self) -> Result<(), CsiError> {
        if !self.tls.is_configured() {
            return Err(invalid(
                "tls.ca_file, tls.cert_file and tls.key_file are required",
            ));
        }
        for (what, path) in [
            ("tls.ca_file", &self.tls.ca_file),
            ("tls.cert_file", &self.tls.cert_file),
            ("tls.key_file", &self.tls.key_file),
        ] {
            if !path.exists() {
                return Err(invalid(format!("{what} {} does not exist", path.display())));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_tls(dir: &Path, mut config: DriverConfig) -> DriverConfig {
        for name in ["ca.pem", "cert.pem", "key.pem"] {
            std::fs::write(dir.join(name), "").unwrap();
        }
        config.tls = TlsConfig {
            ca_file: dir.join("ca.pem"),
            cert_file: dir.join("cert.pem"),
            key_file: dir.join("key.pem"),
        };
        config
    }

    #[test]
    fn yaml_fills_defaults_per_field() {
        let config = DriverConfig::from_yaml(
            r#"
role: node
node_id: worker-1
registry_endpoint: controller:10000
device:
  default_mode: direct
  lvm:
    pv_metadata_bytes: 0
  direct:
    alignment: 1073741824
timeouts:
  heartbeat_timeout_secs: 60
"#,
        )
        .unwrap();
        assert_eq!(config.role, Role::Node);
        assert_eq!(config.driver_name, DEFAULT_DRIVER_NAME);
        assert_eq!(config.device.default_mode, DeviceMode::Direct);
        assert_eq!(config.device.lvm.extent_size, 4 * MIB);
        assert_eq!(config.device.lvm.pv_metadata_bytes, 0);
        assert_eq!(config.device.pool_config().direct_alignment, 1 << 30);
        assert_eq!(config.timeouts.heartbeat_timeout(), Duration::from_secs(60));
        assert_eq!(config.timeouts.request_secs, 10);
        assert_eq!(config.node_endpoint(), "0.0.0.0:10001");
    }

    #[test]
    fn env_overrides_file() {
        let mut config = DriverConfig::default();
        config
            .apply_env([
                ("PMEM_CSI_ROLE".to_owned(), "node".to_owned()),
                ("PMEM_CSI_NODE_ID".to_owned(), "worker-2".to_owned()),
                ("PMEM_CSI_PMEM_PERCENTAGE".to_owned(), "50".to_owned()),
                ("PMEM_CSI_NODE_ADVERTISE".to_owned(), "10.0.0.2:10001".to_owned()),
                ("HOME".to_owned(), "/root".to_owned()),
            ])
            .unwrap();
        assert_eq!(config.role, Role::Node);
        assert_eq!(config.node_id, "worker-2");
        assert_eq!(config.device.pmem_percentage, 50);
        assert_eq!(config.node_endpoint(), "10.0.0.2:10001");

        let err = config
            .apply_env([("PMEM_CSI_DEFAULT_MODE".to_owned(), "raid".to_owned())])
            .unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
    }

    #[test]
    fn validation() {
        let tmp = tempfile::tempdir().unwrap();

        // TLS is mandatory for every role.
        assert!(DriverConfig::default().validate().is_err());
        let controller = with_tls(tmp.path(), DriverConfig::default());
        controller.validate().unwrap();

        let node = with_tls(
            tmp.path(),
            DriverConfig {
                role: Role::Node,
                registry_endpoint: "controller:10000".into(),
                ..Default::default()
            },
        );
        assert!(node.validate().unwrap_err().to_string().contains("node_id"));

        let mut node = DriverConfig {
            node_id: "worker-1".into(),
            ..node
        };
        node.validate().unwrap();
        node.device.pmem_percentage = 101;
        assert!(node.validate().is_err());

        let mut missing = controller.clone();
        missing.tls.key_file = tmp.path().join("absent.pem");
        assert!(missing.validate().is_err());

        let mut bad_addr = controller;
        bad_addr.scheduler_listen = Some("not an address".into());
        assert!(bad_addr.validate().is_err());
    }
}
