//! Domain layer - Core types and port definitions
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles, plus the image layout shared
//! by every component that needs to know where a volume lives.

pub mod layout;
pub mod ports;

pub use layout::*;
pub use ports::*;
