//! Storage Agent
//!
//! Runs on every hypervisor host. Owns the volume images under the images
//! root and hot-plugs them into the libvirt domains that back cluster nodes.
//!
//! - [`images`]: backing-file creation and removal
//! - [`qcow2`]: native qcow2 header writer
//! - [`topology`]: live domain disk list, device allocation, attach/detach
//! - [`virsh`]: hypervisor adapter over the virsh CLI
//! - [`service`]: the agent itself and its gRPC server

pub mod images;
pub mod qcow2;
pub mod service;
pub mod topology;
pub mod virsh;

pub use images::{ImageOwner, ImageStore};
pub use service::{serve, serve_with_listener, AgentConfig, AgentGrpc, StorageAgent};
pub use topology::{DeviceTopology, DiskDescriptor, DomainDescription, TopologyConfig};
pub use virsh::{VirshConfig, VirshHypervisor, DEFAULT_LIBVIRT_URI};
