//! Formatting and mounting block devices.
//!
//! [`SystemMounter`] formats with `mkfs.*`, probes with `blkid` and mounts
//! through `nix`.  [`RecordingMounter`] keeps a mount table in memory and is
//! what the tests run against.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use nix::mount::MsFlags;
use tracing::{debug, info};

use crate::device::run_command;
use crate::error::CsiError;

#[async_trait]
pub trait Mounter: Send + Sync {
    async fn is_mountpoint(&self, path: &str) -> bool;

    /// Filesystem type found on `device`, `None` when it holds none.
    async fn existing_fs(&self, device: &str) -> Result<Option<String>, CsiError>;

    async fn format(&self, device: &str, fs_type: &str) -> Result<(), CsiError>;

    /// Mount `device` at `target`, creating the directory.
    async fn mount(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError>;

    /// Bind `source` (directory or device node) onto `target`.
    async fn bind_mount(&self, source: &str, target: &str, read_only: bool)
    -> Result<(), CsiError>;

    async fn unmount(&self, target: &str) -> Result<(), CsiError>;
}

fn mount_failed(path: &str, reason: impl std::fmt::Display) -> CsiError {
    CsiError::MountFailed {
        path: path.to_owned(),
        reason: reason.to_string(),
    }
}

/// Split mount options into kernel flags and filesystem data.
fn split_options(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for opt in options {
        match opt.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => {}
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            other => data.push(other),
        }
    }
    (flags, data.join(","))
}

pub struct SystemMounter;

#[async_trait]
impl Mounter for SystemMounter {
    /// Note: `/proc/self/mounts` uses octal escapes (`\040` for space, etc.).
    /// CSI target paths must not contain whitespace, so direct string
    /// comparison is safe here.
    async fn is_mountpoint(&self, path: &str) -> bool {
        let contents = match tokio::fs::read_to_string("/proc/self/mounts").await {
            Ok(c) => c,
            Err(_) => return false,
        };
        // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
        contents
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(path))
    }

    async fn existing_fs(&self, device: &str) -> Result<Option<String>, CsiError> {
        let output = tokio::process::Command::new("blkid")
            .args(["-p", "-s", "TYPE", "-o", "value", device])
            .output()
            .await
            .map_err(|e| CsiError::BackendError(format!("blkid {device}: {e}")))?;
        match output.status.code() {
            Some(0) => {
                let fs = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                Ok((!fs.is_empty()).then_some(fs))
            }
            // Nothing recognisable on the device.
            Some(2) => Ok(None),
            code => Err(CsiError::BackendError(format!(
                "blkid {device}: exit {code:?}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<(), CsiError> {
        let (program, args): (&str, Vec<&str>) = match fs_type {
            "ext4" => ("mkfs.ext4", vec!["-b", "4096", "-F", device]),
            // DAX and reflink extents cannot be combined.
            "xfs" => (
                "mkfs.xfs",
                vec!["-b", "size=4096", "-m", "reflink=0", "-f", device],
            ),
            other => {
                return Err(CsiError::InvalidArgument(format!(
                    "unsupported filesystem {other:?}"
                )));
            }
        };
        run_command(program, &args).await?;
        info!(%device, %fs_type, "device formatted");
        Ok(())
    }

    async fn mount(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| mount_failed(target, e))?;
        let (flags, data) = split_options(options);
        nix::mount::mount(
            Some(device),
            target,
            Some(fs_type),
            flags,
            (!data.is_empty()).then_some(data.as_str()),
        )
        .map_err(|e| mount_failed(target, e))?;
        debug!(%device, %target, %fs_type, %data, "mounted");
        Ok(())
    }

    async fn bind_mount(
        &self,
        source: &str,
        target: &str,
        read_only: bool,
    ) -> Result<(), CsiError> {
        let source_is_dir = tokio::fs::metadata(source)
            .await
            .map_err(|e| mount_failed(target, format!("stat {source}: {e}")))?
            .is_dir();
        if source_is_dir {
            tokio::fs::create_dir_all(target)
                .await
                .map_err(|e| mount_failed(target, e))?;
        } else {
            // A device is bound onto a plain file.
            if let Some(parent) = Path::new(target).parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| mount_failed(target, e))?;
            }
            tokio::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(target)
                .await
                .map_err(|e| mount_failed(target, e))?;
        }

        let mut flags = MsFlags::MS_BIND;
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        nix::mount::mount(Some(source), target, None::<&str>, flags, None::<&str>)
            .map_err(|e| mount_failed(target, e))?;

        // Some kernels ignore MS_RDONLY on the initial bind mount.
        if read_only {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| mount_failed(target, format!("remount read-only: {e}")))?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), CsiError> {
        nix::mount::umount(target).map_err(|e| CsiError::UnmountFailed {
            path: target.to_owned(),
            reason: e.to_string(),
        })
    }
}

/// One row of [`RecordingMounter`]'s mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub fs_type: Option<String>,
    pub options: Vec<String>,
    pub read_only: bool,
}

#[derive(Default)]
struct Table {
    mounts: HashMap<String, MountEntry>,
    filesystems: HashMap<String, String>,
    formats: usize,
    failures: HashMap<&'static str, CsiError>,
}

/// In-memory [`Mounter`].
#[derive(Default)]
pub struct RecordingMounter {
    table: Mutex<Table>,
}

impl RecordingMounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_failure(&self, op: &'static str) -> Result<(), CsiError> {
        match self.table().failures.remove(op) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Make the next call of `op` (`"format"`, `"mount"`, `"bind_mount"` or
    /// `"unmount"`) fail with `err`.
    pub fn fail_next(&self, op: &'static str, err: CsiError) {
        self.table().failures.insert(op, err);
    }

    /// Pretend `device` already carries `fs_type`.
    pub fn set_filesystem(&self, device: &str, fs_type: &str) {
        self.table()
            .filesystems
            .insert(device.to_owned(), fs_type.to_owned());
    }

    pub fn mounted(&self, target: &str) -> Option<MountEntry> {
        self.table().mounts.get(target).cloned()
    }

    pub fn mount_count(&self) -> usize {
        self.table().mounts.len()
    }

    pub fn format_count(&self) -> usize {
        self.table().formats
    }

    /// Drop a mount behind the driver's back, as a reboot would.
    pub fn forget(&self, target: &str) {
        self.table().mounts.remove(target);
    }
}

#[async_trait]
impl Mounter for RecordingMounter {
    async fn is_mountpoint(&self, path: &str) -> bool {
        self.table().mounts.contains_key(path)
    }

    async fn existing_fs(&self, device: &str) -> Result<Option<String>, CsiError> {
        Ok(self.table().filesystems.get(device).cloned())
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<(), CsiError> {
        self.take_failure("format")?;
        let mut table = self.table();
        table.formats += 1;
        table
            .filesystems
            .insert(device.to_owned(), fs_type.to_owned());
        Ok(())
    }

    async fn mount(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        self.take_failure("mount")?;
        let mut table = self.table();
        if table.mounts.contains_key(target) {
            return Err(mount_failed(target, "already mounted"));
        }
        let (flags, _) = split_options(options);
        table.mounts.insert(
            target.to_owned(),
            MountEntry {
                source: device.to_owned(),
                fs_type: Some(fs_type.to_owned()),
                options: options.to_vec(),
                read_only: flags.contains(MsFlags::MS_RDONLY),
            },
        );
        Ok(())
    }

    async fn bind_mount(
        &self,
        source: &str,
        target: &str,
        read_only: bool,
    ) -> Result<(), CsiError> {
        self.take_failure("bind_mount")?;
        let mut table = self.table();
        if table.mounts.contains_key(target) {
            return Err(mount_failed(target, "already mounted"));
        }
        table.mounts.insert(
            target.to_owned(),
            MountEntry {
                source: source.to_owned(),
                fs_type: None,
                options: Vec::new(),
                read_only,
            },
        );
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), CsiError> {
        self.take_failure("unmount")?;
        match self.table().mounts.remove(target) {
            Some(_) => Ok(()),
            None => Err(CsiError::UnmountFailed {
                path: target.to_owned(),
                reason: "not mounted".into(),
            }),
        }
    }
}
