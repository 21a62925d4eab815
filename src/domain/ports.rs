//! Domain Ports - Core trait definitions for the driver
//!
//! These traits define the boundaries between the volume lifecycle logic and
//! the systems it drives: the hypervisor, the storage agent, the cluster API
//! and the host mount table. Adapters implement these traits to provide
//! concrete functionality; the in-memory fakes in [`crate::mock`] implement
//! them for tests.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// Volume Attachment
// =============================================================================

/// Arguments of an attach or detach call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    /// Volume / image ID
    pub image_id: String,
    /// Publish target on the node (informational on the agent side)
    pub target_path: String,
    /// libvirt domain the image is plugged into
    pub domain_name: String,
}

impl VolumeAttachment {
    pub fn new(
        image_id: impl Into<String>,
        target_path: impl Into<String>,
        domain_name: impl Into<String>,
    ) -> Self {
        Self {
            image_id: image_id.into(),
            target_path: target_path.into(),
            domain_name: domain_name.into(),
        }
    }
}

// =============================================================================
// Hypervisor Port
// =============================================================================

/// Port for live domain configuration access
///
/// Implementations must not cache: every call reflects the hypervisor's
/// current view of the domain.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Current (live) domain XML
    async fn domain_xml(&self, domain: &str) -> Result<String>;

    /// Hot-plug a device described by `device_xml` into the running domain
    async fn attach_device(&self, domain: &str, device_xml: &str) -> Result<()>;

    /// Hot-unplug the device described by `device_xml`
    async fn detach_device(&self, domain: &str, device_xml: &str) -> Result<()>;

    /// Check the hypervisor connection, returning its canonical URI
    async fn ping(&self) -> Result<String>;
}

// =============================================================================
// Storage Agent Port
// =============================================================================

/// Port for the per-host storage agent, local or remote
#[async_trait]
pub trait StorageAgentApi: Send + Sync {
    /// Create the backing image for a volume
    async fn create_image(&self, image_id: &str, size_bytes: u64) -> Result<()>;

    /// Remove the backing image of a volume
    async fn delete_image(&self, image_id: &str) -> Result<()>;

    /// Plug the volume's image into a domain, returning the guest device name
    async fn attach_volume(&self, attachment: &VolumeAttachment) -> Result<String>;

    /// Unplug the volume's image from a domain
    async fn detach_volume(&self, attachment: &VolumeAttachment) -> Result<()>;
}

// =============================================================================
// Domain Resolver Port
// =============================================================================

/// Port mapping a cluster node to the hypervisor domain backing it
#[async_trait]
pub trait DomainResolver: Send + Sync {
    async fn resolve_domain(&self, node_id: &str) -> Result<String>;
}

// =============================================================================
// Mounter Port
// =============================================================================

/// Format-and-mount request for a freshly attached block device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Block device, e.g. `/dev/sdb`
    pub device: PathBuf,
    /// Mount point
    pub target: PathBuf,
    /// Filesystem created when the device carries none
    pub fs_type: String,
    /// Extra `-o` options
    pub options: Vec<String>,
}

/// Port for the host mount table
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Create a filesystem on `device` if it has none, then mount it.
    /// Succeeds without work when `target` is already a mount point.
    async fn format_and_mount(&self, request: &MountRequest) -> Result<()>;

    /// Unmount `target`. Succeeds without work when nothing is mounted there.
    async fn unmount(&self, target: &Path) -> Result<()>;

    /// Block device mounted at `target`, if any
    async fn mounted_device(&self, target: &Path) -> Result<Option<PathBuf>>;

    /// Every mount point `device` is currently mounted on
    async fn mount_points(&self, device: &Path) -> Result<Vec<PathBuf>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type HypervisorRef = Arc<dyn Hypervisor>;
pub type StorageAgentRef = Arc<dyn StorageAgentApi>;
pub type DomainResolverRef = Arc<dyn DomainResolver>;
pub type MounterRef = Arc<dyn Mounter>;
