//! # libpmemcsi: CSI driver for node-local persistent memory
//!
//! `libpmemcsi` provisions volumes out of PMEM regions on Kubernetes nodes
//! managed by RK8s.  A volume lives entirely on one node, either as a logical
//! volume in a volume group spanning that node's LVM regions or as a
//! dedicated fsdax namespace (Direct mode).
//!
//! One cluster-wide controller places volumes using capacity that node agents
//! report to its registry, and forwards lifecycle calls to the owning node.
//! Controller, registry and nodes talk over QUIC with mutual TLS (via
//! [`quinn`]); the orchestrator talks to each component on a local socket.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: volumes, capabilities, requests, capacity. |
//! | [`error`] | [`CsiError`], shared by every component and the wire. |
//! | [`parameters`] | Volume parameter maps and their allowed keys. |
//! | [`device`] | `ndctl` / LVM adapter and an in-memory simulation. |
//! | [`pool`] | Volume group manager: LVM and Direct allocation. |
//! | [`identity`], [`controller`], [`node`] | Service traits. |
//! | [`backend`] | The node agent: stage, publish, state records. |
//! | [`master`] | The controller: placement and forwarding. |
//! | [`registry`] | Node table, heartbeats and capacity deltas. |
//! | [`scheduler`] | Kubernetes scheduler extender over HTTP. |
//! | [`message`], [`transport`] | Wire protocol, QUIC and local sockets. |
//! | [`config`], [`driver`] | Configuration and role wiring. |

pub mod backend;
pub mod config;
pub mod context;
pub mod controller;
pub mod device;
pub mod driver;
pub mod error;
pub mod identity;
pub mod master;
pub mod message;
pub mod node;
pub mod parameters;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod transport;
pub mod types;

pub use config::{DriverConfig, Role};
pub use context::{CallContext, Peer};
pub use controller::CsiController;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::{CsiNode, NodeControl};
pub use registry::Registry;
pub use types::*;
