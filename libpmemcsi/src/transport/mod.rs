//! Transport layer.
//!
//! The internal fabric is QUIC with mutual TLS ([`CsiServer`], [`CsiClient`],
//! [`tls`]); the orchestrator reaches the CSI services over a local Unix
//! socket ([`LocalServer`]).  Both hand decoded requests to the same
//! [`Dispatcher`].

pub mod client;
pub mod dispatch;
pub mod local;
pub mod server;
pub mod tls;

pub use client::CsiClient;
pub use dispatch::Dispatcher;
pub use local::{LocalClient, LocalServer};
pub use server::CsiServer;
pub use tls::{TlsConfig, TlsIdentity};
