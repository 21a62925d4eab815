//! Host mount adapter
//!
//! Implements the [`Mounter`] port with the util-linux tools: `blkid` to
//! detect an existing filesystem, `mkfs.<fs>` when there is none, then
//! `mount`. Each tool run is bounded and its child killed on drop.

use crate::deadline::bounded;
use crate::domain::{MountRequest, Mounter};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PROC_MOUNTS: &str = "/proc/self/mounts";

/// `blkid` exit status when the probed device carries no known signature
const BLKID_NO_SIGNATURE: i32 = 2;

/// Mount adapter configuration
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Upper bound for one tool invocation
    pub timeout: Duration,
    /// How long to wait for a hot-plugged device node to appear
    pub device_wait: Duration,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            device_wait: Duration::from_secs(10),
        }
    }
}

/// [`Mounter`] backed by the host's blkid, mkfs and mount tools
#[derive(Debug, Clone)]
pub struct SystemMounter {
    config: MountConfig,
    cancel: CancellationToken,
}

impl SystemMounter {
    pub fn new(config: MountConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<Output> {
        debug!("Running {} {}", program, args.join(" "));
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        bounded(program, self.config.timeout, &self.cancel, async move {
            command
                .output()
                .await
                .map_err(|e| Error::Configuration(format!("Cannot run {}: {}", program, e)))
        })
        .await
    }

    async fn mount_table(&self) -> Result<Vec<MountEntry>> {
        let table = tokio::fs::read_to_string(PROC_MOUNTS).await?;
        Ok(parse_mounts(&table))
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(self
            .mount_table()
            .await?
            .iter()
            .any(|entry| entry.target == target))
    }

    async fn wait_for_device(&self, device: &Path) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.device_wait;
        loop {
            if tokio::fs::try_exists(device).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::not_found("device", device.display().to_string()));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::Cancelled {
                        operation: format!("wait for {}", device.display()),
                    });
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    /// Existing filesystem type on `device`, `None` when blank
    async fn probe_filesystem(&self, request: &MountRequest) -> Result<Option<String>> {
        let args = vec![
            "-p".to_string(),
            "-s".to_string(),
            "TYPE".to_string(),
            "-o".to_string(),
            "value".to_string(),
            request.device.display().to_string(),
        ];
        let output = self.run("blkid", &args).await?;

        match output.status.code() {
            Some(0) => {
                let fs = String::from_utf8_lossy(&output.stdout).trim().to_string();
                Ok((!fs.is_empty()).then_some(fs))
            }
            Some(BLKID_NO_SIGNATURE) => Ok(None),
            _ => Err(tool_failure(&request.target, "blkid", &output)),
        }
    }
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn format_and_mount(&self, request: &MountRequest) -> Result<()> {
        if self.is_mounted(&request.target).await? {
            info!("{} already mounted", request.target.display());
            return Ok(());
        }

        self.wait_for_device(&request.device).await?;

        match self.probe_filesystem(request).await? {
            Some(existing) => {
                debug!("{} already carries {}", request.device.display(), existing);
            }
            None => {
                info!("Creating {} on {}", request.fs_type, request.device.display());
                let (program, args) = mkfs_command(&request.fs_type, &request.device);
                let output = self.run(&program, &args).await?;
                if !output.status.success() {
                    return Err(tool_failure(&request.target, &program, &output));
                }
            }
        }

        let args = mount_args(request);
        let output = self.run("mount", &args).await?;
        if !output.status.success() {
            return Err(tool_failure(&request.target, "mount", &output));
        }

        info!(
            "Mounted {} on {}",
            request.device.display(),
            request.target.display()
        );
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        if !self.is_mounted(target).await? {
            debug!("{} is not mounted", target.display());
            return Ok(());
        }

        let output = self.run("umount", &[target.display().to_string()]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not mounted") {
                warn!("{} vanished before umount", target.display());
                return Ok(());
            }
            return Err(tool_failure(target, "umount", &output));
        }

        info!("Unmounted {}", target.display());
        Ok(())
    }

    async fn mounted_device(&self, target: &Path) -> Result<Option<PathBuf>> {
        Ok(self
            .mount_table()
            .await?
            .into_iter()
            .rev()
            .find(|entry| entry.target == target)
            .map(|entry| entry.source)
            .filter(|source| source.starts_with("/dev")))
    }

    async fn mount_points(&self, device: &Path) -> Result<Vec<PathBuf>> {
        Ok(self
            .mount_table()
            .await?
            .into_iter()
            .filter(|entry| entry.source == device)
            .map(|entry| entry.target)
            .collect())
    }
}

/// One line of the kernel mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Entries of a `/proc/self/mounts` table, in mount order
pub fn parse_mounts(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            Some(MountEntry {
                source: PathBuf::from(unescape_mount_field(source)),
                target: PathBuf::from(unescape_mount_field(target)),
            })
        })
        .collect()
}

/// Undo the octal escaping the kernel applies to spaces, tabs and newlines
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let escaped = rest.get(pos + 1..pos + 4);
        match escaped.and_then(|digits| u8::from_str_radix(digits, 8).ok()) {
            Some(byte) => {
                out.push(byte as char);
                rest = &rest[pos + 4..];
            }
            None => {
                out.push('\\');
                rest = &rest[pos + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// `mkfs` program and arguments forcing creation on a whole device
pub fn mkfs_command(fs_type: &str, device: &Path) -> (String, Vec<String>) {
    let mut args = Vec::new();
    if fs_type.starts_with("ext") {
        args.push("-F".to_string());
    } else if fs_type == "xfs" {
        args.push("-f".to_string());
    }
    args.push(device.display().to_string());
    (format!("mkfs.{}", fs_type), args)
}

fn mount_args(request: &MountRequest) -> Vec<String> {
    let mut args = vec!["-t".to_string(), request.fs_type.clone()];
    if !request.options.is_empty() {
        args.push("-o".to_string());
        args.push(request.options.join(","));
    }
    args.push(request.device.display().to_string());
    args.push(request.target.display().to_string());
    args
}

fn tool_failure(target: &Path, program: &str, output: &Output) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr);
    Error::Mount {
        target: target.display().to_string(),
        reason: format!("{} exited with {}: {}", program, output.status, stderr.trim()),
    }
}
