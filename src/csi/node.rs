//! CSI Node service
//!
//! Publishes a volume on this host: resolve the libvirt domain backing the
//! node, ask the storage agent to hot-plug the image, then format and mount
//! the new SCSI disk at the target path. Publishing is undone with a detach
//! when the host-side steps fail, so a failed publish leaves no disk plugged.
//!
//! A disk is only detached once no mount point on this host still uses it,
//! and a volume mounted at one target is not published to a second one.

use crate::csi::validate_capability;
use crate::domain::{
    DomainResolverRef, MountRequest, MounterRef, StorageAgentRef, VolumeAttachment,
};
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::metrics::MetricsRef;
use crate::proto::csi::node_server::Node;
use crate::proto::csi::volume_capability::AccessType;
use crate::proto::csi::*;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

const COMPONENT: &str = "node";

/// Device names `sda..sdz` bound the number of volumes per domain
pub const MAX_VOLUMES_PER_NODE: i64 = 26;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Kubernetes node name of this host
    pub node_id: String,
    /// Filesystem used when the capability names none
    pub fs_type: String,
    pub max_volumes: i64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            fs_type: "ext4".to_string(),
            max_volumes: MAX_VOLUMES_PER_NODE,
        }
    }
}

/// CSI Node backed by a storage agent and the host mount table
#[derive(Clone)]
pub struct NodeService {
    agent: StorageAgentRef,
    resolver: DomainResolverRef,
    mounter: MounterRef,
    config: NodeConfig,
    volume_locks: Arc<KeyedLocks>,
    metrics: Option<MetricsRef>,
}

impl NodeService {
    pub fn new(
        agent: StorageAgentRef,
        resolver: DomainResolverRef,
        mounter: MounterRef,
        config: NodeConfig,
    ) -> Self {
        Self {
            agent,
            resolver,
            mounter,
            config,
            volume_locks: Arc::new(KeyedLocks::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRef) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn domain(&self) -> Result<String> {
        if self.config.node_id.is_empty() {
            return Err(Error::NotConfigured("node id is not set".into()));
        }
        self.resolver.resolve_domain(&self.config.node_id).await
    }

    async fn publish(&self, req: NodePublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must not be empty".into()));
        }
        if req.target_path.is_empty() {
            return Err(Error::InvalidArgument("target path must not be empty".into()));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("volume capability is required".into()))?;
        validate_capability(capability)?;

        let domain = self.domain().await?;
        let attachment = VolumeAttachment::new(&req.volume_id, &req.target_path, &domain);
        let _guard = self.volume_locks.lock(&req.volume_id).await;

        info!(
            "Publishing {} on {} (domain {})",
            req.volume_id, req.target_path, domain
        );
        let device = self.agent.attach_volume(&attachment).await?;
        let request = self.mount_request(&device, capability, &req);

        let holders = self.mounter.mount_points(&request.device).await?;
        if let Some(holder) = holders.iter().find(|point| **point != request.target) {
            warn!(
                "{} is already mounted at {}, refusing {}",
                request.device.display(),
                holder.display(),
                req.target_path
            );
            return Err(Error::InUse {
                resource: format!("{} ({})", req.volume_id, request.device.display()),
                holder: holder.display().to_string(),
            });
        }

        let created = match create_target_dir(&request.target).await {
            Ok(created) => created,
            Err(e) => {
                self.roll_back(&attachment, &request, false, &e).await;
                return Err(e);
            }
        };
        if let Err(e) = self.mounter.format_and_mount(&request).await {
            self.roll_back(&attachment, &request, created, &e).await;
            return Err(e);
        }

        info!("Published {} as /dev/{}", req.volume_id, device);
        Ok(())
    }

    /// Undo a publish that failed after the attach
    async fn roll_back(
        &self,
        attachment: &VolumeAttachment,
        request: &MountRequest,
        remove_target: bool,
        cause: &Error,
    ) {
        warn!(
            "Publishing {} failed after attach, releasing {}: {}",
            attachment.image_id,
            request.device.display(),
            cause
        );
        if remove_target {
            if let Err(e) = tokio::fs::remove_dir(&request.target).await {
                warn!("Cannot remove {}: {}", request.target.display(), e);
            }
        }
        if let Err(e) = self.release(attachment, &request.device).await {
            warn!("Release of {} after failed publish failed: {}", attachment.image_id, e);
        }
    }

    /// Detach the volume unless `device` is still mounted somewhere
    async fn release(&self, attachment: &VolumeAttachment, device: &Path) -> Result<()> {
        let holders = self.mounter.mount_points(device).await?;
        if let Some(holder) = holders.first() {
            info!(
                "Keeping {} attached, still mounted at {}",
                device.display(),
                holder.display()
            );
            return Ok(());
        }
        self.detach(attachment).await
    }

    /// Detach, treating a disk that is no longer plugged as done
    async fn detach(&self, attachment: &VolumeAttachment) -> Result<()> {
        match self.agent.detach_volume(attachment).await {
            Err(e) if e.is_not_found("device") => {
                debug!(
                    "{} already detached from {}",
                    attachment.image_id, attachment.domain_name
                );
                Ok(())
            }
            other => other,
        }
    }

    fn mount_request(
        &self,
        device: &str,
        capability: &VolumeCapability,
        req: &NodePublishVolumeRequest,
    ) -> MountRequest {
        let (fs_type, mut options) = match &capability.access_type {
            Some(AccessType::Mount(mount)) => (
                Some(mount.fs_type.clone()).filter(|fs| !fs.is_empty()),
                mount.mount_flags.clone(),
            ),
            _ => (None, Vec::new()),
        };
        if req.readonly && !options.iter().any(|o| o == "ro") {
            options.push("ro".to_string());
        }

        MountRequest {
            device: Path::new("/dev").join(device),
            target: PathBuf::from(&req.target_path),
            fs_type: fs_type.unwrap_or_else(|| self.config.fs_type.clone()),
            options,
        }
    }

    async fn unpublish(&self, req: NodeUnpublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must not be empty".into()));
        }
        if req.target_path.is_empty() {
            return Err(Error::InvalidArgument("target path must not be empty".into()));
        }
        let target = Path::new(&req.target_path);
        let _guard = self.volume_locks.lock(&req.volume_id).await;

        info!("Unpublishing {} from {}", req.volume_id, req.target_path);
        let device = self.mounter.mounted_device(target).await?;
        self.mounter.unmount(target).await?;

        let domain = self.domain().await?;
        let attachment = VolumeAttachment::new(&req.volume_id, &req.target_path, &domain);
        match device {
            Some(device) => self.release(&attachment, &device).await,
            None => self.detach(&attachment).await,
        }
    }

    fn observe<T>(&self, operation: &'static str, started: std::time::Instant, result: &Result<T>) {
        if let Some(metrics) = &self.metrics {
            metrics.observe(COMPONENT, operation, started.elapsed(), result);
        }
    }
}

/// Create the mount point; `true` when it did not exist before
async fn create_target_dir(target: &Path) -> Result<bool> {
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let existed = target.is_dir();
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&target)
            .map(|()| !existed)
            .map_err(|e| Error::Mount {
                target: target.display().to_string(),
                reason: format!("cannot create target directory: {}", e),
            })
    })
    .await
    .map_err(|e| Error::Internal(format!("target directory task failed: {}", e)))?
}

fn unsupported<T>(rpc: &str) -> std::result::Result<Response<T>, Status> {
    debug!("{} is not supported", rpc);
    Err(Error::Unimplemented(rpc.to_string()).into())
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        _request: Request<NodeStageVolumeRequest>,
    ) -> std::result::Result<Response<NodeStageVolumeResponse>, Status> {
        unsupported("NodeStageVolume")
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<NodeUnstageVolumeRequest>,
    ) -> std::result::Result<Response<NodeUnstageVolumeResponse>, Status> {
        unsupported("NodeUnstageVolume")
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> std::result::Result<Response<NodePublishVolumeResponse>, Status> {
        let started = std::time::Instant::now();
        let result = self.publish(request.into_inner()).await;
        self.observe("node_publish_volume", started, &result);

        result?;
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let started = std::time::Instant::now();
        let result = self.unpublish(request.into_inner()).await;
        self.observe("node_unpublish_volume", started, &result);

        result?;
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<NodeGetVolumeStatsRequest>,
    ) -> std::result::Result<Response<NodeGetVolumeStatsResponse>, Status> {
        unsupported("NodeGetVolumeStats")
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> std::result::Result<Response<NodeExpandVolumeResponse>, Status> {
        unsupported("NodeExpandVolume")
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: Vec::new(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> std::result::Result<Response<NodeGetInfoResponse>, Status> {
        if self.config.node_id.is_empty() {
            return Err(Error::NotConfigured("node id is not set".into()).into());
        }

        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.config.node_id.clone(),
            max_volumes_per_node: self.config.max_volumes,
            accessible_topology: None,
        }))
    }
}
