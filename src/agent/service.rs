//! Storage Agent Service
//!
//! Combines the image store and the device topology manager behind the
//! storage agent gRPC protocol. The agent keeps no volume registry: the image
//! directory and the live domain XML are the only state. Two lock tables
//! serialize work that would otherwise race:
//!
//! - per domain, for the read-allocate-attach and resolve-detach sequences
//! - per image ID, for create and delete of the backing file, and for the
//!   whole of an attach so the image cannot vanish while it is plugged in
//!
//! An attach takes the image lock before the domain lock; nothing takes them
//! in the other order.

use crate::agent::images::{round_to_sector, ImageOwner, ImageStore};
use crate::agent::topology::{DeviceTopology, TopologyConfig};
use crate::domain::{
    HypervisorRef, ImageFormat, ImageLayout, StorageAgentApi, VolumeAttachment,
    DEFAULT_IMAGES_ROOT,
};
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::metrics::MetricsRef;
use crate::proto::agent::storage_agent_server::{StorageAgent as StorageAgentRpc, StorageAgentServer};
use crate::proto::agent::{Image, ImageRequest, Volume, VolumeRequest};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

const COMPONENT: &str = "agent";

// =============================================================================
// Configuration
// =============================================================================

/// Storage agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// gRPC listen address
    pub listen: SocketAddr,
    /// Directory holding volume images
    pub images_root: PathBuf,
    /// Format of new images
    pub image_format: ImageFormat,
    /// Owner of new images; `None` leaves them owned by the agent
    pub image_owner: Option<ImageOwner>,
    /// Upper bound for each hypervisor call
    pub hypervisor_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 7003)),
            images_root: PathBuf::from(DEFAULT_IMAGES_ROOT),
            image_format: ImageFormat::Qcow2,
            image_owner: Some(ImageOwner::default()),
            hypervisor_timeout: Duration::from_secs(30),
        }
    }
}

impl AgentConfig {
    pub fn layout(&self) -> ImageLayout {
        ImageLayout::new(self.images_root.clone(), self.image_format)
    }
}

// =============================================================================
// Storage Agent
// =============================================================================

/// Per-host image and attachment operations
pub struct StorageAgent {
    images: ImageStore,
    topology: DeviceTopology,
    domain_locks: KeyedLocks,
    image_locks: KeyedLocks,
    metrics: Option<MetricsRef>,
}

impl StorageAgent {
    pub fn new(config: &AgentConfig, hypervisor: HypervisorRef, cancel: CancellationToken) -> Self {
        let topology = DeviceTopology::new(
            hypervisor,
            TopologyConfig {
                format: config.image_format,
                call_timeout: config.hypervisor_timeout,
            },
            cancel,
        );

        Self {
            images: ImageStore::new(config.layout(), config.image_owner.clone()),
            topology,
            domain_locks: KeyedLocks::new(),
            image_locks: KeyedLocks::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRef) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn topology(&self) -> &DeviceTopology {
        &self.topology
    }

    /// Prepare the images root and check the hypervisor connection
    pub async fn initialize(&self) -> Result<()> {
        self.images.ensure_root().await?;
        match self.topology.ping().await {
            Ok(uri) => info!("Connected to hypervisor {}", uri),
            Err(e) => warn!("Hypervisor not reachable yet: {}", e),
        }
        info!(
            "Storage agent ready (images in {}, format {})",
            self.images.layout().root().display(),
            self.images.layout().format()
        );
        Ok(())
    }

    fn record<T>(&self, operation: &'static str, started: std::time::Instant, result: &Result<T>) {
        if let Some(metrics) = &self.metrics {
            metrics.observe(COMPONENT, operation, started.elapsed(), result);
        }
    }

    async fn create(&self, image_id: &str, size_bytes: u64) -> Result<()> {
        let size = round_to_sector(size_bytes)?;
        let _guard = self.image_locks.lock(image_id).await;

        match self.images.create_image(image_id, size).await {
            Ok(_) => Ok(()),
            Err(Error::AlreadyExists { kind, name }) => {
                let existing = self.images.virtual_size(image_id).await?;
                if existing == size {
                    info!("Image {} already exists with {} bytes", image_id, size);
                    Ok(())
                } else {
                    warn!(
                        "Image {} exists with {} bytes, requested {}",
                        image_id, existing, size
                    );
                    Err(Error::AlreadyExists { kind, name })
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, image_id: &str) -> Result<()> {
        let _guard = self.image_locks.lock(image_id).await;
        self.images.delete_image(image_id).await
    }

    async fn attach(&self, attachment: &VolumeAttachment) -> Result<String> {
        let domain = require_domain(attachment)?;
        let path = self.image_path(&attachment.image_id)?;

        let _image = self.image_locks.lock(&attachment.image_id).await;
        if !self.images.exists(&attachment.image_id).await? {
            return Err(Error::not_found("image", &attachment.image_id));
        }

        info!(
            "Attaching {} to {} for {}",
            path, domain, attachment.target_path
        );
        let _domain = self.domain_locks.lock(domain).await;

        match self.topology.resolve_device_by_path(domain, &path).await {
            Ok(device) => {
                info!("Image {} already attached to {} as {}", path, domain, device);
                return Ok(device);
            }
            Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let device = self.topology.allocate_free_device_name(domain).await?;
        self.topology.attach(domain, &path, &device).await?;
        Ok(device)
    }

    async fn detach(&self, attachment: &VolumeAttachment) -> Result<()> {
        let domain = require_domain(attachment)?;
        let path = self.image_path(&attachment.image_id)?;

        info!(
            "Detaching {} from {} for {}",
            path, domain, attachment.target_path
        );
        let _guard = self.domain_locks.lock(domain).await;

        let device = self.topology.resolve_device_by_path(domain, &path).await?;
        self.topology.detach(domain, &path, &device).await
    }

    fn image_path(&self, image_id: &str) -> Result<String> {
        Ok(self
            .images
            .layout()
            .image_path(image_id)?
            .to_string_lossy()
            .into_owned())
    }
}

fn require_domain(attachment: &VolumeAttachment) -> Result<&str> {
    if attachment.domain_name.is_empty() {
        return Err(Error::InvalidArgument("domain name must not be empty".into()));
    }
    Ok(&attachment.domain_name)
}

#[async_trait]
impl StorageAgentApi for StorageAgent {
    async fn create_image(&self, image_id: &str, size_bytes: u64) -> Result<()> {
        let started = std::time::Instant::now();
        let result = self.create(image_id, size_bytes).await;
        self.record("create_image", started, &result);
        result
    }

    async fn delete_image(&self, image_id: &str) -> Result<()> {
        let started = std::time::Instant::now();
        let result = self.delete(image_id).await;
        self.record("delete_image", started, &result);
        result
    }

    async fn attach_volume(&self, attachment: &VolumeAttachment) -> Result<String> {
        let started = std::time::Instant::now();
        let result = self.attach(attachment).await;
        self.record("attach_volume", started, &result);
        result
    }

    async fn detach_volume(&self, attachment: &VolumeAttachment) -> Result<()> {
        let started = std::time::Instant::now();
        let result = self.detach(attachment).await;
        self.record("detach_volume", started, &result);
        result
    }
}

// =============================================================================
// gRPC Adapter
// =============================================================================

/// tonic service wrapping a [`StorageAgent`]
#[derive(Clone)]
pub struct AgentGrpc {
    agent: Arc<StorageAgent>,
}

impl AgentGrpc {
    pub fn new(agent: Arc<StorageAgent>) -> Self {
        Self { agent }
    }

    pub fn into_server(self) -> StorageAgentServer<Self> {
        StorageAgentServer::new(self)
    }
}

#[tonic::async_trait]
impl StorageAgentRpc for AgentGrpc {
    async fn create_image(&self, request: Request<ImageRequest>) -> std::result::Result<Response<Image>, Status> {
        let req = request.into_inner();
        debug!("CreateImage {} ({} bytes)", req.image_id, req.size);

        let size = u64::try_from(req.size).map_err(|_| {
            Status::invalid_argument(format!("negative image size {}", req.size))
        })?;
        self.agent.create_image(&req.image_id, size).await?;

        Ok(Response::new(Image {
            image_id: req.image_id,
            success: true,
        }))
    }

    async fn delete_image(&self, request: Request<ImageRequest>) -> std::result::Result<Response<Image>, Status> {
        let req = request.into_inner();
        debug!("DeleteImage {}", req.image_id);

        self.agent.delete_image(&req.image_id).await?;

        Ok(Response::new(Image {
            image_id: req.image_id,
            success: true,
        }))
    }

    async fn attach_volume(&self, request: Request<VolumeRequest>) -> std::result::Result<Response<Volume>, Status> {
        let req = request.into_inner();
        let attachment = VolumeAttachment::new(req.image_id, req.target_path, req.domain_name);

        let device = self.agent.attach_volume(&attachment).await?;

        Ok(Response::new(Volume {
            image_id: attachment.image_id,
            success: true,
            device,
        }))
    }

    async fn detach_volume(&self, request: Request<VolumeRequest>) -> std::result::Result<Response<Volume>, Status> {
        let req = request.into_inner();
        let attachment = VolumeAttachment::new(req.image_id, req.target_path, req.domain_name);

        self.agent.detach_volume(&attachment).await?;

        Ok(Response::new(Volume {
            image_id: attachment.image_id,
            success: true,
            device: String::new(),
        }))
    }
}

// =============================================================================
// Server
// =============================================================================

/// Serve the agent on `listen` until `shutdown` fires
pub async fn serve(agent: Arc<StorageAgent>, listen: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(listen).await.map_err(|e| {
        Error::Configuration(format!("Cannot listen on {}: {}", listen, e))
    })?;
    serve_with_listener(agent, listener, shutdown).await
}

/// Serve the agent on an already bound listener
pub async fn serve_with_listener(
    agent: Arc<StorageAgent>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Storage agent listening on {}", listener.local_addr()?);

    tonic::transport::Server::builder()
        .add_service(AgentGrpc::new(agent).into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled())
        .await?;

    info!("Storage agent stopped");
    Ok(())
}
