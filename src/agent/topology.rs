//! Device Topology Manager
//!
//! Reads and mutates the disk list of a running libvirt domain. Nothing is
//! cached: every call re-reads the live domain XML through the
//! [`Hypervisor`](crate::domain::Hypervisor) port, so the hypervisor stays the
//! only record of which image is plugged in where. Callers that need a
//! read-allocate-attach sequence to be atomic must serialize per domain
//! themselves (the storage agent does).
//!
//! Disks are always plugged into the SCSI bus: virtio-blk does not support
//! hot-plug on the target hypervisors, and SCSI targets are named `sda`..`sdz`.

use crate::deadline::bounded;
use crate::domain::{HypervisorRef, ImageFormat};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Prefix of SCSI disk target names
pub const DEVICE_PREFIX: &str = "sd";

/// Bus new disks are attached to
pub const DISK_BUS: &str = "scsi";

/// Number of attachable device names (`sda`..`sdz`)
pub const MAX_DEVICES: usize = 26;

// =============================================================================
// Domain XML
// =============================================================================

/// The parts of a `<domain>` description the topology manager reads
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename = "domain")]
pub struct DomainDescription {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub devices: Devices,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Devices {
    #[serde(rename = "disk", default)]
    pub disks: Vec<Disk>,
}

/// One `<disk>` entry of the live configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Disk {
    #[serde(rename = "@type", default)]
    pub kind: String,
    #[serde(rename = "@device", default)]
    pub device: String,
    #[serde(default)]
    pub source: Option<DiskSource>,
    #[serde(default)]
    pub target: Option<DiskTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DiskSource {
    #[serde(rename = "@file", default)]
    pub file: Option<String>,
    #[serde(rename = "@dev", default)]
    pub dev: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DiskTarget {
    #[serde(rename = "@dev", default)]
    pub dev: String,
    #[serde(rename = "@bus", default)]
    pub bus: Option<String>,
}

impl Disk {
    pub fn source_file(&self) -> Option<&str> {
        self.source.as_ref().and_then(|s| s.file.as_deref())
    }

    pub fn target_dev(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.dev.as_str())
    }
}

impl DomainDescription {
    pub fn parse(xml: &str) -> Result<Self> {
        Ok(quick_xml::de::from_str(xml)?)
    }

    /// Target device of the disk backed by `path`
    pub fn device_for_source(&self, path: &str) -> Option<&str> {
        self.devices
            .disks
            .iter()
            .find(|disk| disk.source_file() == Some(path))
            .and_then(Disk::target_dev)
    }
}

/// First `sd<letter>` not used by any disk, scanning `a` to `z`
pub fn next_free_device(disks: &[Disk]) -> Option<String> {
    let used: HashSet<&str> = disks
        .iter()
        .filter_map(Disk::target_dev)
        .filter(|dev| dev.starts_with(DEVICE_PREFIX))
        .collect();

    (b'a'..=b'z')
        .map(|letter| format!("{}{}", DEVICE_PREFIX, letter as char))
        .find(|name| !used.contains(name.as_str()))
}

// =============================================================================
// Disk Descriptor
// =============================================================================

/// Device XML passed to attach-device / detach-device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename = "disk")]
pub struct DiskDescriptor {
    #[serde(rename = "@type")]
    kind: &'static str,
    #[serde(rename = "@device")]
    device: &'static str,
    driver: DriverElement,
    source: SourceElement,
    target: TargetElement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct DriverElement {
    #[serde(rename = "@name")]
    name: &'static str,
    #[serde(rename = "@type")]
    kind: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct SourceElement {
    #[serde(rename = "@file")]
    file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct TargetElement {
    #[serde(rename = "@dev")]
    dev: String,
    #[serde(rename = "@bus")]
    bus: &'static str,
}

impl DiskDescriptor {
    /// File-backed SCSI disk
    pub fn new(path: &str, device: &str, format: ImageFormat) -> Self {
        Self {
            kind: "file",
            device: "disk",
            driver: DriverElement {
                name: "qemu",
                kind: format.driver_type(),
            },
            source: SourceElement {
                file: path.to_string(),
            },
            target: TargetElement {
                dev: device.to_string(),
                bus: DISK_BUS,
            },
        }
    }

    pub fn to_xml(&self) -> Result<String> {
        Ok(quick_xml::se::to_string(self)?)
    }
}

// =============================================================================
// Device Topology
// =============================================================================

/// Configuration for hypervisor calls
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Driver type written into new disk descriptors
    pub format: ImageFormat,
    /// Upper bound for each hypervisor call
    pub call_timeout: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            format: ImageFormat::Qcow2,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Live disk topology of hypervisor domains
#[derive(Clone)]
pub struct DeviceTopology {
    hypervisor: HypervisorRef,
    config: TopologyConfig,
    cancel: CancellationToken,
}

impl DeviceTopology {
    pub fn new(hypervisor: HypervisorRef, config: TopologyConfig, cancel: CancellationToken) -> Self {
        Self {
            hypervisor,
            config,
            cancel,
        }
    }

    /// Canonical URI of the hypervisor connection
    pub async fn ping(&self) -> Result<String> {
        bounded(
            "uri",
            self.config.call_timeout,
            &self.cancel,
            self.hypervisor.ping(),
        )
        .await
    }

    /// Fetch and parse the live domain XML
    pub async fn describe(&self, domain: &str) -> Result<DomainDescription> {
        let xml = bounded(
            "dumpxml",
            self.config.call_timeout,
            &self.cancel,
            self.hypervisor.domain_xml(domain),
        )
        .await?;
        DomainDescription::parse(&xml)
    }

    /// Device name of the disk whose source file is `path`
    pub async fn resolve_device_by_path(&self, domain: &str, path: &str) -> Result<String> {
        let description = self.describe(domain).await?;
        description
            .device_for_source(path)
            .map(str::to_string)
            .ok_or_else(|| Error::not_found("device", format!("{}:{}", domain, path)))
    }

    /// First unused `sd*` name on the domain
    pub async fn allocate_free_device_name(&self, domain: &str) -> Result<String> {
        let description = self.describe(domain).await?;
        let device = next_free_device(&description.devices.disks).ok_or_else(|| {
            Error::Exhausted {
                domain: domain.to_string(),
            }
        })?;
        debug!("Next free device on {}: {}", domain, device);
        Ok(device)
    }

    /// Hot-plug `path` into the domain as `device`
    pub async fn attach(&self, domain: &str, path: &str, device: &str) -> Result<()> {
        let xml = DiskDescriptor::new(path, device, self.config.format).to_xml()?;
        bounded(
            "attach-device",
            self.config.call_timeout,
            &self.cancel,
            self.hypervisor.attach_device(domain, &xml),
        )
        .await?;
        info!("Attached {} to {} as {}", path, domain, device);
        Ok(())
    }

    /// Hot-unplug the disk `device` backed by `path`
    pub async fn detach(&self, domain: &str, path: &str, device: &str) -> Result<()> {
        let xml = DiskDescriptor::new(path, device, self.config.format).to_xml()?;
        bounded(
            "detach-device",
            self.config.call_timeout,
            &self.cancel,
            self.hypervisor.detach_device(domain, &xml),
        )
        .await?;
        info!("Detached {} ({}) from {}", path, device, domain);
        Ok(())
    }
}
