//! KVM CSI Driver
//!
//! A Container Storage Interface driver that provisions qcow2-backed block
//! volumes on a libvirt/KVM host and hot-plugs them into the guest that runs
//! the Kubernetes node consuming them.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────── Kubernetes node (guest) ─────────────────────┐
//! │  kubelet / sidecars ──unix socket──► Identity · Controller · Node (csi)     │
//! │                                             │          │                   │
//! │                         node label ◄── DomainResolver  │  Mounter ──► /dev/sdX
//! └─────────────────────────────────────────────┼──────────┼───────────────────┘
//!                                     StorageAgentApi (gRPC, client)
//! ┌────────────────────────────── Hypervisor host ─────────────────────────────┐
//! │  Storage Agent ──► ImageStore (<root>/<id>.qcow2)                           │
//! │        │                                                                   │
//! │        └──► DeviceTopology ──► Hypervisor port ──► virsh / libvirt domain   │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`agent`]: storage agent (image store, device topology, gRPC service)
//! - [`client`]: storage agent gRPC client
//! - [`csi`]: CSI Identity, Controller and Node services and their server
//! - [`platform`]: node-label resolver and host mount adapter
//! - [`domain`]: ports and the image layout
//! - [`error`]: error types and gRPC status mapping

pub mod agent;
pub mod client;
pub mod csi;
pub mod deadline;
pub mod domain;
pub mod error;
pub mod locks;
pub mod metrics;
pub mod mock;
pub mod platform;

/// Generated protocol types
pub mod proto {
    /// CSI v1 subset
    pub mod csi {
        tonic::include_proto!("csi.v1");
    }

    /// Storage agent protocol
    pub mod agent {
        tonic::include_proto!("storageagent.v1");
    }
}

// Re-export commonly used types
pub use agent::{AgentConfig, StorageAgent, VirshConfig, VirshHypervisor};
pub use client::{AgentClient, ClientConfig};
pub use csi::{
    serve_csi, ControllerConfig, ControllerService, CsiServices, IdentityService, NodeConfig,
    NodeService,
};
pub use domain::{
    DomainResolver, Hypervisor, ImageFormat, ImageLayout, MountRequest, Mounter,
    StorageAgentApi, VolumeAttachment,
};
pub use error::{Error, Result};
pub use metrics::{MetricsRef, OperationMetrics};
pub use platform::{KubeNodeLabelResolver, MountConfig, StaticDomainResolver, SystemMounter};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
