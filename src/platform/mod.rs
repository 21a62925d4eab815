//! Host platform adapters
//!
//! Production implementations of the [`DomainResolver`] and [`Mounter`]
//! ports used by the node plugin.
//!
//! [`DomainResolver`]: crate::domain::DomainResolver
//! [`Mounter`]: crate::domain::Mounter

pub mod mount;
pub mod resolver;

pub use mount::{MountConfig, SystemMounter};
pub use resolver::{KubeNodeLabelResolver, StaticDomainResolver, DEFAULT_DOMAIN_LABEL};
