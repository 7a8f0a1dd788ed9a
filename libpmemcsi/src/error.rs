//! CSI error types.
//!
//! All errors in the `libpmemcsi` crate are represented by the [`CsiError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can travel across
//! the QUIC transport layer unchanged.  The Controller relies on that: it
//! decides whether to retry on an alternate node by looking at the variant a
//! node returned.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceErrorKind;
use crate::types::DeviceMode;

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// Not enough free PMEM on this node for the request.  Another node may
    /// still succeed.
    #[error("insufficient {mode} capacity: requested {requested} bytes, available {available} bytes")]
    InsufficientCapacity {
        /// Device mode of the pool that was asked.
        mode: DeviceMode,
        /// Requested size after rounding.
        requested: u64,
        /// Largest allocatable size at the time of the request.
        available: u64,
    },

    /// No node could satisfy a create request.
    #[error("no capacity: {0}")]
    NoCapacity(String),

    /// No region or volume group serves the requested mode.
    #[error("no suitable volume group: {0}")]
    NoSuitableGroup(String),

    /// The volume exists with different parameters.
    #[error("volume {0} already exists with different parameters")]
    VolumeAlreadyExists(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// Volume already staged (or published) with other parameters.
    #[error("volume {0} is busy with different parameters")]
    VolumeBusyDifferentParameters(String),

    /// Volume is published at a different target path.
    #[error("volume {volume_id} already published at {target_path}")]
    AlreadyPublishedElsewhere {
        /// Volume that was asked to be published.
        volume_id: String,
        /// Target path currently holding the publication.
        target_path: String,
    },

    /// The operation is valid but not in the volume's current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The node could not be reached.
    #[error("node {0} unreachable")]
    NodeUnreachable(String),

    /// The caller's certificate does not match the node record it claims.
    #[error("stale registration: {0}")]
    StaleRegistration(String),

    /// The caller did not present a usable client certificate.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// A device or LVM command failed.
    #[error("device error ({kind}): {message}")]
    Device {
        /// Classification of the failure.
        kind: DeviceErrorKind,
        /// Command output or description.
        message: String,
    },

    /// Backing storage is held by someone else and needs operator action.
    #[error("volume {volume_id} is stuck: {reason}")]
    VolumeStuck {
        /// Affected volume.
        volume_id: String,
        /// What the device reported.
        reason: String,
    },

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The call was cancelled before it completed.  Partial work has been
    /// rolled back.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The caller's deadline passed.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Local state could not be read or written.
    #[error("backend error: {0}")]
    BackendError(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Errors after which the Controller may try another node.
    pub fn is_capacity_class(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCapacity { .. } | Self::NodeUnreachable(_)
        )
    }

    /// Errors the orchestrator may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InsufficientCapacity { .. }
            | Self::NodeUnreachable(_)
            | Self::TransportError(_)
            | Self::Cancelled(_)
            | Self::DeadlineExceeded(_) => true,
            Self::Device { kind, .. } => *kind == DeviceErrorKind::Transient,
            _ => false,
        }
    }

    /// Name of the CSI status code this error maps to.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientCapacity { .. } | Self::NoCapacity(_) => "RESOURCE_EXHAUSTED",
            Self::NoSuitableGroup(_) | Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::VolumeAlreadyExists(_)
            | Self::VolumeBusyDifferentParameters(_)
            | Self::AlreadyPublishedElsewhere { .. } => "ALREADY_EXISTS",
            Self::VolumeNotFound(_) => "NOT_FOUND",
            Self::FailedPrecondition(_) | Self::VolumeStuck { .. } => "FAILED_PRECONDITION",
            Self::NodeUnreachable(_) | Self::TransportError(_) => "UNAVAILABLE",
            Self::StaleRegistration(_) => "PERMISSION_DENIED",
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::Cancelled(_) => "CANCELLED",
            Self::DeadlineExceeded(_) => "DEADLINE_EXCEEDED",
            Self::Device { kind, .. } => match kind {
                DeviceErrorKind::Transient | DeviceErrorKind::NotReady => "UNAVAILABLE",
                DeviceErrorKind::NotFound => "NOT_FOUND",
                DeviceErrorKind::Exists => "ALREADY_EXISTS",
                DeviceErrorKind::NoSpace => "RESOURCE_EXHAUSTED",
                DeviceErrorKind::Busy | DeviceErrorKind::Permanent => "FAILED_PRECONDITION",
            },
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::BackendError(_)
            | Self::Internal(_) => "INTERNAL",
        }
    }
}
