//! CSI Identity service.
//!
//! Both the controller and every node agent serve Identity on their local
//! socket so the orchestrator can tell which driver it is talking to.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Driver name and version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// Node agents answer `false` until at least one PMEM pool is usable.
    async fn probe(&self) -> Result<bool, CsiError>;

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}
