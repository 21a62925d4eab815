//! In-memory adapters
//!
//! Fakes for the hypervisor and mount ports, used by unit tests, the
//! integration tests and benches. [`MemoryHypervisor`] renders real domain
//! XML and parses the device XML it receives, so the topology manager is
//! exercised end to end without libvirt.

use crate::agent::topology::Disk;
use crate::domain::{Hypervisor, MountRequest, Mounter};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// =============================================================================
// Memory Hypervisor
// =============================================================================

/// Attached disk as tracked by [`MemoryHypervisor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDisk {
    pub device: String,
    pub source: String,
}

/// Hypervisor fake holding domains and their disks in memory
///
/// Like libvirt it rejects a second disk on an occupied target. Optional
/// latency widens race windows for concurrency tests.
#[derive(Debug, Default)]
pub struct MemoryHypervisor {
    domains: RwLock<BTreeMap<String, Vec<MemoryDisk>>>,
    latency: Mutex<Option<Duration>>,
    unavailable: AtomicBool,
    reject_attach: AtomicBool,
}

impl MemoryHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a domain with disks on the given targets
    pub fn define_domain(&self, name: &str, devices: &[&str]) {
        let disks = devices
            .iter()
            .map(|dev| MemoryDisk {
                device: dev.to_string(),
                source: format!("/var/lib/libvirt/images/{}-{}.qcow2", name, dev),
            })
            .collect();
        self.domains.write().insert(name.to_string(), disks);
    }

    /// Current disks of a domain
    pub fn disks(&self, name: &str) -> Vec<MemoryDisk> {
        self.domains.read().get(name).cloned().unwrap_or_default()
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Fail every call as if libvirtd were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Reject attach calls as if the descriptor were invalid
    pub fn set_reject_attach(&self, reject: bool) {
        self.reject_attach.store(reject, Ordering::SeqCst);
    }

    async fn pause(&self) -> Result<()> {
        let latency = *self.latency.lock();
        match latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::RemoteUnavailable {
                target: "memory:///".into(),
                reason: "hypervisor offline".into(),
            });
        }
        Ok(())
    }

    fn parse_device(domain: &str, operation: &str, device_xml: &str) -> Result<MemoryDisk> {
        let disk: Disk = quick_xml::de::from_str(device_xml)?;
        match (disk.target_dev(), disk.source_file()) {
            (Some(dev), Some(source)) => Ok(MemoryDisk {
                device: dev.to_string(),
                source: source.to_string(),
            }),
            _ => Err(Error::Hypervisor {
                domain: domain.to_string(),
                operation: operation.to_string(),
                reason: "disk needs a source file and a target".into(),
            }),
        }
    }

    fn render(name: &str, disks: &[MemoryDisk]) -> String {
        let mut xml = format!(
            "<domain type='kvm'>\n  <name>{}</name>\n  <devices>\n    <emulator>/usr/bin/qemu-system-x86_64</emulator>\n",
            name
        );
        for disk in disks {
            xml.push_str(&format!(
                "    <disk type='file' device='disk'>\n      <driver name='qemu' type='qcow2'/>\n      <source file='{}'/>\n      <target dev='{}' bus='scsi'/>\n    </disk>\n    <controller type='scsi' index='0' model='virtio-scsi'/>\n",
                disk.source, disk.device
            ));
        }
        xml.push_str("  </devices>\n</domain>\n");
        xml
    }
}

#[async_trait]
impl Hypervisor for MemoryHypervisor {
    async fn domain_xml(&self, domain: &str) -> Result<String> {
        self.pause().await?;
        let domains = self.domains.read();
        let disks = domains
            .get(domain)
            .ok_or_else(|| Error::not_found("domain", domain))?;
        Ok(Self::render(domain, disks))
    }

    async fn attach_device(&self, domain: &str, device_xml: &str) -> Result<()> {
        self.pause().await?;
        let disk = Self::parse_device(domain, "attach-device", device_xml)?;
        if self.reject_attach.load(Ordering::SeqCst) {
            return Err(Error::Hypervisor {
                domain: domain.to_string(),
                operation: "attach-device".into(),
                reason: "unsupported configuration".into(),
            });
        }

        let mut domains = self.domains.write();
        let disks = domains
            .get_mut(domain)
            .ok_or_else(|| Error::not_found("domain", domain))?;
        if disks.iter().any(|d| d.device == disk.device) {
            return Err(Error::Hypervisor {
                domain: domain.to_string(),
                operation: "attach-device".into(),
                reason: format!("target '{}' already exists", disk.device),
            });
        }
        disks.push(disk);
        Ok(())
    }

    async fn detach_device(&self, domain: &str, device_xml: &str) -> Result<()> {
        self.pause().await?;
        let disk = Self::parse_device(domain, "detach-device", device_xml)?;

        let mut domains = self.domains.write();
        let disks = domains
            .get_mut(domain)
            .ok_or_else(|| Error::not_found("domain", domain))?;
        let before = disks.len();
        disks.retain(|d| d != &disk);
        if disks.len() == before {
            return Err(Error::Hypervisor {
                domain: domain.to_string(),
                operation: "detach-device".into(),
                reason: format!("disk {} not found", disk.device),
            });
        }
        Ok(())
    }

    async fn ping(&self) -> Result<String> {
        self.pause().await?;
        Ok("memory:///".to_string())
    }
}

// =============================================================================
// Recording Mounter
// =============================================================================

/// Mounter fake that records calls and keeps a mount table in memory
#[derive(Debug, Default)]
pub struct RecordingMounter {
    mounts: Mutex<Vec<MountRequest>>,
    unmounts: Mutex<Vec<PathBuf>>,
    /// Target to device
    mounted: Mutex<HashMap<PathBuf, PathBuf>>,
    fail_mount: AtomicBool,
}

impl RecordingMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next format-and-mount calls fail
    pub fn set_fail_mount(&self, fail: bool) {
        self.fail_mount.store(fail, Ordering::SeqCst);
    }

    pub fn mounts(&self) -> Vec<MountRequest> {
        self.mounts.lock().clone()
    }

    pub fn unmounts(&self) -> Vec<PathBuf> {
        self.unmounts.lock().clone()
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        self.mounted.lock().contains_key(target)
    }
}

#[async_trait]
impl Mounter for RecordingMounter {
    async fn format_and_mount(&self, request: &MountRequest) -> Result<()> {
        self.mounts.lock().push(request.clone());
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(Error::Mount {
                target: request.target.display().to_string(),
                reason: format!("mkfs.{} failed", request.fs_type),
            });
        }
        self.mounted
            .lock()
            .insert(request.target.clone(), request.device.clone());
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        self.unmounts.lock().push(target.to_path_buf());
        self.mounted.lock().remove(target);
        Ok(())
    }

    async fn mounted_device(&self, target: &Path) -> Result<Option<PathBuf>> {
        Ok(self.mounted.lock().get(target).cloned())
    }

    async fn mount_points(&self, device: &Path) -> Result<Vec<PathBuf>> {
        let mut points: Vec<PathBuf> = self
            .mounted
            .lock()
            .iter()
            .filter(|(_, source)| source.as_path() == device)
            .map(|(target, _)| target.clone())
            .collect();
        points.sort();
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::topology::DomainDescription;

    #[tokio::test]
    async fn test_rendered_xml_parses() {
        let hypervisor = MemoryHypervisor::new();
        hypervisor.define_domain("vm-1", &["sda", "sdc"]);

        let xml = hypervisor.domain_xml("vm-1").await.unwrap();
        let description = DomainDescription::parse(&xml).unwrap();
        assert_eq!(description.name, "vm-1");
        assert_eq!(description.devices.disks.len(), 2);
        assert_eq!(
            description.device_for_source("/var/lib/libvirt/images/vm-1-sdc.qcow2"),
            Some("sdc")
        );
    }

    #[tokio::test]
    async fn test_duplicate_target_rejected() {
        let hypervisor = MemoryHypervisor::new();
        hypervisor.define_domain("vm-1", &["sda"]);
        let xml = "<disk type='file' device='disk'><source file='/x.qcow2'/><target dev='sda' bus='scsi'/></disk>";
        assert!(hypervisor.attach_device("vm-1", xml).await.is_err());
        assert_eq!(hypervisor.disks("vm-1").len(), 1);
    }
}
