//! Image Store
//!
//! Creates and removes the backing file of a volume at the path derived by
//! [`ImageLayout`]. New images are handed to the hypervisor's runtime user so
//! QEMU can open them after hot-plug.

use crate::agent::qcow2::Qcow2Header;
use crate::domain::{ImageFormat, ImageLayout};
use crate::error::{Error, Result};
use nix::unistd::{Gid, Group, Uid, User};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Sector size image sizes are rounded up to
pub const SECTOR_SIZE: u64 = 512;

// =============================================================================
// Image Owner
// =============================================================================

/// Owner assigned to new images, e.g. `qemu:qemu`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOwner {
    pub user: String,
    /// Defaults to the user's primary group when absent
    pub group: Option<String>,
}

impl Default for ImageOwner {
    fn default() -> Self {
        Self {
            user: "qemu".to_string(),
            group: Some("qemu".to_string()),
        }
    }
}

impl FromStr for ImageOwner {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (user, group) = match s.split_once(':') {
            Some((user, group)) => (user, Some(group)),
            None => (s, None),
        };
        if user.is_empty() || group.is_some_and(str::is_empty) {
            return Err(Error::Configuration(format!(
                "Invalid image owner {:?}, expected user[:group]",
                s
            )));
        }
        Ok(Self {
            user: user.to_string(),
            group: group.map(str::to_string),
        })
    }
}

impl ImageOwner {
    /// Parse an owner setting where an empty value disables chown
    pub fn parse_optional(s: &str) -> Result<Option<Self>> {
        if s.trim().is_empty() {
            Ok(None)
        } else {
            s.parse().map(Some)
        }
    }

    /// Look up uid and gid in the host user database
    pub fn resolve(&self) -> Result<(Uid, Gid)> {
        let user = User::from_name(&self.user)
            .map_err(|e| Error::Configuration(format!("Cannot look up user {}: {}", self.user, e)))?
            .ok_or_else(|| Error::Configuration(format!("Unknown user {}", self.user)))?;

        let gid = match &self.group {
            Some(name) => {
                Group::from_name(name)
                    .map_err(|e| {
                        Error::Configuration(format!("Cannot look up group {}: {}", name, e))
                    })?
                    .ok_or_else(|| Error::Configuration(format!("Unknown group {}", name)))?
                    .gid
            }
            None => user.gid,
        };

        Ok((user.uid, gid))
    }
}

// =============================================================================
// Image Store
// =============================================================================

/// Backing-file management for volumes
#[derive(Debug, Clone)]
pub struct ImageStore {
    layout: ImageLayout,
    owner: Option<ImageOwner>,
}

impl ImageStore {
    pub fn new(layout: ImageLayout, owner: Option<ImageOwner>) -> Self {
        Self { layout, owner }
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// Create the images root if it does not exist yet
    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(self.layout.root()).await?;
        Ok(())
    }

    /// Create a new image; fails with `AlreadyExists` if the path is taken
    pub async fn create_image(&self, image_id: &str, size_bytes: u64) -> Result<PathBuf> {
        let path = self.layout.image_path(image_id)?;
        let size = round_to_sector(size_bytes)?;
        let header = match self.layout.format() {
            ImageFormat::Qcow2 => Some(Qcow2Header::for_size(size)?),
            ImageFormat::Raw => None,
        };

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => Error::already_exists("image", image_id),
                _ => Error::Io(e),
            })?;

        if let Err(e) = self.fill(file, &path, size, header).await {
            discard(&path).await;
            return Err(e);
        }

        info!(
            "Created {} image {} ({} bytes)",
            self.layout.format(),
            path.display(),
            size
        );
        Ok(path)
    }

    async fn fill(
        &self,
        mut file: fs::File,
        path: &Path,
        size: u64,
        header: Option<Qcow2Header>,
    ) -> Result<()> {
        match header {
            Some(header) => {
                file.write_all(&header.metadata_prefix()).await?;
                file.set_len(header.file_len()).await?;
            }
            None => file.set_len(size).await?,
        }
        file.sync_all().await?;

        if let Some(owner) = &self.owner {
            let (uid, gid) = owner.resolve()?;
            nix::unistd::chown(path, Some(uid), Some(gid)).map_err(|e| {
                Error::Internal(format!(
                    "Failed to chown {} to {}: {}",
                    path.display(),
                    owner.user,
                    e
                ))
            })?;
            debug!("Image {} owned by uid {} gid {}", path.display(), uid, gid);
        }
        Ok(())
    }

    /// Remove an image; fails with `NotFound` if it does not exist
    pub async fn delete_image(&self, image_id: &str) -> Result<()> {
        let path = self.layout.image_path(image_id)?;
        fs::remove_file(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::not_found("image", image_id),
            _ => Error::Io(e),
        })?;

        info!("Deleted image {}", path.display());
        Ok(())
    }

    /// Virtual disk size of an existing image
    pub async fn virtual_size(&self, image_id: &str) -> Result<u64> {
        let path = self.layout.image_path(image_id)?;
        let not_found = |e: std::io::Error| match e.kind() {
            ErrorKind::NotFound => Error::not_found("image", image_id),
            _ => Error::Io(e),
        };

        match self.layout.format() {
            ImageFormat::Qcow2 => {
                let mut file = fs::File::open(&path).await.map_err(not_found)?;
                let mut header = vec![0u8; crate::agent::qcow2::HEADER_LENGTH as usize];
                file.read_exact(&mut header).await?;
                Ok(Qcow2Header::decode(&header[..])?.size)
            }
            ImageFormat::Raw => Ok(fs::metadata(&path).await.map_err(not_found)?.len()),
        }
    }

    /// Whether the image file exists
    pub async fn exists(&self, image_id: &str) -> Result<bool> {
        let path = self.layout.image_path(image_id)?;
        Ok(fs::try_exists(&path).await?)
    }
}

/// Round up to a whole sector; zero is rejected
pub fn round_to_sector(size_bytes: u64) -> Result<u64> {
    if size_bytes == 0 {
        return Err(Error::InvalidArgument("image size must be positive".into()));
    }
    size_bytes
        .checked_next_multiple_of(SECTOR_SIZE)
        .ok_or_else(|| Error::InvalidArgument(format!("image size {} overflows", size_bytes)))
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        warn!("Failed to remove incomplete image {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::qcow2::MAX_IMAGE_SIZE;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn store(dir: &TempDir, format: ImageFormat) -> ImageStore {
        ImageStore::new(ImageLayout::new(dir.path(), format), None)
    }

    #[tokio::test]
    async fn test_create_qcow2_image() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, ImageFormat::Qcow2);

        let path = store.create_image("pvc-123", 2 * GIB).await.unwrap();
        assert_eq!(path, dir.path().join("pvc-123.qcow2"));
        assert_eq!(store.virtual_size("pvc-123").await.unwrap(), 2 * GIB);

        let on_disk = std::fs::metadata(&path).unwrap().len();
        assert!(on_disk < 2 * GIB);
    }

    #[tokio::test]
    async fn test_create_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, ImageFormat::Qcow2);

        store.create_image("pvc-1", GIB).await.unwrap();
        let again = store.create_image("pvc-1", GIB).await;
        assert_matches!(again, Err(Error::AlreadyExists { .. }));
        assert_eq!(store.virtual_size("pvc-1").await.unwrap(), GIB);
    }

    #[tokio::test]
    async fn test_create_then_delete_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, ImageFormat::Raw);

        let path = store.create_image("pvc-2", 1000).await.unwrap();
        assert_eq!(store.virtual_size("pvc-2").await.unwrap(), 1024);

        store.delete_image("pvc-2").await.unwrap();
        assert!(!path.exists());
        assert!(!store.exists("pvc-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, ImageFormat::Qcow2);

        let result = store.delete_image("pvc-missing").await;
        assert_matches!(result, Err(Error::NotFound { ref name, .. }) if name == "pvc-missing");
    }

    #[tokio::test]
    async fn test_unknown_owner_removes_image() {
        let dir = TempDir::new().unwrap();
        let owner = ImageOwner {
            user: "no-such-user-kvm-csi".into(),
            group: None,
        };
        let store = ImageStore::new(ImageLayout::new(dir.path(), ImageFormat::Raw), Some(owner));

        let result = store.create_image("pvc-3", GIB).await;
        assert_matches!(result, Err(Error::Configuration(_)));
        assert!(!dir.path().join("pvc-3.img").exists());
    }

    #[tokio::test]
    async fn test_qcow2_size_boundaries() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, ImageFormat::Qcow2);

        assert_matches!(
            store.create_image("pvc-zero", 0).await,
            Err(Error::InvalidArgument(_))
        );
        assert!(!dir.path().join("pvc-zero.qcow2").exists());

        // Not a multiple of the cluster size: rounded to whole sectors only.
        store.create_image("pvc-odd", 65_537).await.unwrap();
        assert_eq!(store.virtual_size("pvc-odd").await.unwrap(), 66_048);

        store.create_image("pvc-max", MAX_IMAGE_SIZE).await.unwrap();
        assert_eq!(store.virtual_size("pvc-max").await.unwrap(), MAX_IMAGE_SIZE);

        for size in [MAX_IMAGE_SIZE + 1, 1 << 60] {
            assert_matches!(
                store.create_image("pvc-huge", size).await,
                Err(Error::InvalidArgument(_))
            );
            assert!(!dir.path().join("pvc-huge.qcow2").exists());
        }

        // Nothing was left behind, so a valid request under the same ID works.
        store.create_image("pvc-huge", GIB).await.unwrap();
        assert_eq!(store.virtual_size("pvc-huge").await.unwrap(), GIB);
    }

    #[test]
    fn test_owner_parse() {
        assert_eq!("qemu:kvm".parse::<ImageOwner>().unwrap().group.as_deref(), Some("kvm"));
        assert_eq!("libvirt-qemu".parse::<ImageOwner>().unwrap().group, None);
        assert!(ImageOwner::parse_optional("").unwrap().is_none());
        assert!("qemu:".parse::<ImageOwner>().is_err());
        assert!(":kvm".parse::<ImageOwner>().is_err());
    }

    #[test]
    fn test_round_to_sector() {
        assert_eq!(round_to_sector(1).unwrap(), 512);
        assert_eq!(round_to_sector(2 * GIB).unwrap(), 2 * GIB);
        assert_matches!(round_to_sector(0), Err(Error::InvalidArgument(_)));
    }
}
