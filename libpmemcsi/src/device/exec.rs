//! Running the external device tools.

use std::time::Duration;

use tracing::{debug, warn};

use super::{DeviceError, DeviceErrorKind};

const DEVICE_APPEAR_RETRIES: u32 = 10;
const DEVICE_APPEAR_INTERVAL: Duration = Duration::from_millis(100);

/// Run `program` with `args` and return its stdout.
///
/// A non-zero exit is turned into a [`DeviceError`] whose kind is derived from
/// the command's stderr, so callers can tell "busy" from "try again".
pub async fn run_command(program: &str, args: &[&str]) -> Result<String, DeviceError> {
    debug!(%program, ?args, "executing");
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::NotFound {
                DeviceErrorKind::Permanent
            } else {
                DeviceErrorKind::Transient
            };
            DeviceError::new(kind, format!("{program}: {e}"))
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let kind = classify(&stderr);
    warn!(%program, ?args, code = ?output.status.code(), %stderr, "command failed");
    Err(DeviceError::new(
        kind,
        format!(
            "{program} {}: exit {:?}: {}",
            args.join(" "),
            output.status.code(),
            stderr.trim()
        ),
    ))
}

/// Map tool diagnostics onto an error kind.
pub(crate) fn classify(stderr: &str) -> DeviceErrorKind {
    let s = stderr.to_ascii_lowercase();
    if s.contains("busy") || s.contains("in use") || s.contains("is open") {
        DeviceErrorKind::Busy
    } else if s.contains("insufficient free")
        || s.contains("no space")
        || s.contains("not enough space")
    {
        DeviceErrorKind::NoSpace
    } else if s.contains("already exists") {
        DeviceErrorKind::Exists
    } else if s.contains("not found") || s.contains("no such") || s.contains("failed to find") {
        DeviceErrorKind::NotFound
    } else if s.contains("invalid") || s.contains("not supported") || s.contains("permission denied")
    {
        DeviceErrorKind::Permanent
    } else {
        DeviceErrorKind::Transient
    }
}

/// Udev may publish a new device node a little after the tool returns.
pub(crate) async fn wait_device_appears(path: &str) -> Result<(), DeviceError> {
    for attempt in 0..DEVICE_APPEAR_RETRIES {
        if tokio::fs::metadata(path).await.is_ok() {
            return Ok(());
        }
        debug!(%path, attempt, "device not present yet");
        tokio::time::sleep(DEVICE_APPEAR_INTERVAL).await;
    }
    Err(DeviceError::new(
        DeviceErrorKind::NotReady,
        format!("device {path} did not appear after {DEVICE_APPEAR_RETRIES} retries"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_messages() {
        assert_eq!(
            classify("  Logical volume pmem/vol-1 contains a filesystem in use."),
            DeviceErrorKind::Busy
        );
        assert_eq!(
            classify("Volume group \"pmem\" has insufficient free space (10 extents): 256 required."),
            DeviceErrorKind::NoSpace
        );
        assert_eq!(
            classify("Failed to find logical volume \"pmem/vol-2\""),
            DeviceErrorKind::NotFound
        );
        assert_eq!(classify("error: connection reset"), DeviceErrorKind::Transient);
    }

    #[tokio::test]
    async fn missing_binary_is_permanent() {
        let err = run_command("/nonexistent/pmem-tool", &[]).await.unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Permanent);
    }

    #[tokio::test]
    async fn captures_stdout() {
        let out = run_command("echo", &["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
