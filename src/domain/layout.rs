//! Image Layout
//!
//! The only place that turns a volume ID into an image path. The controller
//! side never touches the filesystem, but the storage agent derives the same
//! path for create, delete, attach and detach, so the mapping has to be a
//! pure function of the ID.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default directory holding volume images on a hypervisor host
pub const DEFAULT_IMAGES_ROOT: &str = "/var/lib/libvirt/images";

// =============================================================================
// Image Format
// =============================================================================

/// On-disk format of a volume image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Copy-on-write QEMU image
    #[default]
    Qcow2,
    /// Sparse raw file
    Raw,
}

impl ImageFormat {
    /// File extension used for image paths
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Raw => "img",
        }
    }

    /// libvirt `<driver type=...>` value
    pub fn driver_type(&self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Raw => "raw",
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.driver_type())
    }
}

impl FromStr for ImageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "qcow2" => Ok(ImageFormat::Qcow2),
            "raw" | "img" => Ok(ImageFormat::Raw),
            other => Err(Error::Configuration(format!(
                "Unknown image format: {}. Use 'qcow2' or 'raw'",
                other
            ))),
        }
    }
}

// =============================================================================
// Image Layout
// =============================================================================

/// Deterministic mapping from volume ID to image file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    root: PathBuf,
    format: ImageFormat,
}

impl Default for ImageLayout {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGES_ROOT, ImageFormat::default())
    }
}

impl ImageLayout {
    pub fn new(root: impl Into<PathBuf>, format: ImageFormat) -> Self {
        Self {
            root: root.into(),
            format,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// `<root>/<volume_id>.<extension>`
    pub fn image_path(&self, volume_id: &str) -> Result<PathBuf> {
        validate_volume_id(volume_id)?;
        Ok(self
            .root
            .join(format!("{}.{}", volume_id, self.format.extension())))
    }
}

/// Reject IDs that would escape the images root or produce an unnamed file
pub fn validate_volume_id(volume_id: &str) -> Result<()> {
    if volume_id.is_empty() {
        return Err(Error::InvalidArgument("volume id must not be empty".into()));
    }
    if volume_id == "." || volume_id == ".." {
        return Err(Error::InvalidArgument(format!(
            "volume id {:?} is reserved",
            volume_id
        )));
    }
    if volume_id.contains('/') || volume_id.contains('\0') {
        return Err(Error::InvalidArgument(format!(
            "volume id {:?} contains a path separator or NUL",
            volume_id
        )));
    }
    Ok(())
}
