//! Node agent backend.
//!
//! [`pmem::PmemNode`] implements [`CsiIdentity`](crate::identity::CsiIdentity),
//! [`CsiNode`](crate::node::CsiNode) and
//! [`NodeControl`](crate::node::NodeControl) on top of the node's volume
//! group manager, a [`mount::Mounter`] and a [`state::StateStore`].

pub mod mount;
pub mod pmem;
pub mod state;

pub use mount::{MountEntry, Mounter, RecordingMounter, SystemMounter};
pub use pmem::{NodeOptions, PmemNode};
pub use state::{StateStore, VolumeRecord};
