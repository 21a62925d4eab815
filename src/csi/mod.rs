//! CSI plugin services
//!
//! The orchestrator-facing half of the driver: Identity, Controller and
//! Node services speaking CSI v1 over a Unix socket. Controller and node
//! forward to the storage agent through the [`StorageAgentApi`] port.
//!
//! [`StorageAgentApi`]: crate::domain::StorageAgentApi

pub mod controller;
pub mod identity;
pub mod node;
pub mod server;

pub use controller::{ControllerConfig, ControllerService};
pub use identity::{IdentityService, DEFAULT_DRIVER_NAME};
pub use node::{NodeConfig, NodeService};
pub use server::{serve_csi, CsiServices, DEFAULT_CSI_ENDPOINT};

use crate::error::{Error, Result};
use crate::proto::csi::volume_capability::{access_mode::Mode, AccessType};
use crate::proto::csi::VolumeCapability;

/// Reject capabilities the driver cannot honour: raw block access and any
/// access mode that would put one image on more than one node
pub(crate) fn validate_capability(capability: &VolumeCapability) -> Result<()> {
    if let Some(AccessType::Block(_)) = capability.access_type {
        return Err(Error::InvalidArgument(
            "block access type is not supported".into(),
        ));
    }

    if let Some(access_mode) = &capability.access_mode {
        match access_mode.mode() {
            Mode::MultiNodeReaderOnly | Mode::MultiNodeSingleWriter | Mode::MultiNodeMultiWriter => {
                return Err(Error::InvalidArgument(format!(
                    "access mode {:?} is not supported",
                    access_mode.mode()
                )));
            }
            _ => {}
        }
    }

    Ok(())
}
