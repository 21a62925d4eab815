//! CSI gRPC server
//!
//! Serves the Identity service plus whichever of Controller and Node the
//! process runs, on the Unix socket the kubelet or sidecars connect to.

use crate::csi::{ControllerService, IdentityService, NodeService};
use crate::error::{Error, Result};
use crate::proto::csi::controller_server::ControllerServer;
use crate::proto::csi::identity_server::IdentityServer;
use crate::proto::csi::node_server::NodeServer;
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default CSI endpoint
pub const DEFAULT_CSI_ENDPOINT: &str = "unix:///csi/csi.sock";

/// Services hosted on one CSI endpoint
pub struct CsiServices {
    pub identity: IdentityService,
    pub controller: Option<ControllerService>,
    pub node: Option<NodeService>,
}

impl CsiServices {
    pub fn new(identity: IdentityService) -> Self {
        Self {
            identity,
            controller: None,
            node: None,
        }
    }

    pub fn with_controller(mut self, controller: ControllerService) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_node(mut self, node: NodeService) -> Self {
        self.node = Some(node);
        self
    }
}

/// Filesystem path of a `unix://` endpoint; bare paths are accepted too
pub fn socket_path(endpoint: &str) -> Result<PathBuf> {
    let path = match endpoint.split_once("://") {
        Some(("unix", path)) => path,
        Some((scheme, _)) => {
            return Err(Error::Configuration(format!(
                "Unsupported CSI endpoint scheme {}: {}",
                scheme, endpoint
            )))
        }
        None => endpoint,
    };
    if path.is_empty() {
        return Err(Error::Configuration("CSI endpoint path is empty".into()));
    }
    Ok(PathBuf::from(path))
}

/// Bind the endpoint socket, replacing a stale one left by a previous run
pub async fn bind_endpoint(endpoint: &str) -> Result<UnixListener> {
    let path = socket_path(endpoint)?;
    prepare_socket(&path).await?;

    UnixListener::bind(&path).map_err(|e| {
        Error::Configuration(format!("Cannot listen on {}: {}", path.display(), e))
    })
}

async fn prepare_socket(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Serve `services` on `endpoint` until `shutdown` fires
pub async fn serve_csi(
    endpoint: &str,
    services: CsiServices,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind_endpoint(endpoint).await?;
    serve_with_listener(listener, services, shutdown).await
}

/// Serve `services` on an already bound socket
pub async fn serve_with_listener(
    listener: UnixListener,
    services: CsiServices,
    shutdown: CancellationToken,
) -> Result<()> {
    let address = listener
        .local_addr()
        .ok()
        .and_then(|addr| addr.as_pathname().map(Path::to_path_buf));
    info!(
        "CSI endpoint listening on {} (controller: {}, node: {})",
        address
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<unnamed>".into()),
        services.controller.is_some(),
        services.node.is_some()
    );

    tonic::transport::Server::builder()
        .add_service(IdentityServer::new(services.identity))
        .add_optional_service(services.controller.map(ControllerServer::new))
        .add_optional_service(services.node.map(NodeServer::new))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown.cancelled())
        .await?;

    if let Some(path) = address {
        let _ = tokio::fs::remove_file(&path).await;
    }
    info!("CSI endpoint stopped");
    Ok(())
}
