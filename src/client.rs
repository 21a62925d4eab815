//! Storage Agent Client
//!
//! [`StorageAgentApi`] over gRPC. The channel connects lazily so controller
//! and node plugins start even while the agent is down; each RPC is bounded
//! by the configured timeout and by the plugin's cancellation token, and the
//! returned status is turned back into an [`Error`] of the same kind.

use crate::deadline::bounded;
use crate::domain::{StorageAgentApi, VolumeAttachment};
use crate::error::{Error, Result};
use crate::proto::agent::storage_agent_client::StorageAgentClient;
use crate::proto::agent::{ImageRequest, VolumeRequest};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;
use tracing::debug;

/// Agent client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the storage agent, or a full `http://` URI
    pub target: String,
    pub connect_timeout: Duration,
    /// Upper bound for a single RPC
    pub rpc_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            connect_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(60),
        }
    }
}

/// gRPC client for a remote storage agent
#[derive(Debug, Clone)]
pub struct AgentClient {
    client: StorageAgentClient<Channel>,
    endpoint: Endpoint,
    target: String,
    rpc_timeout: Duration,
    cancel: CancellationToken,
}

impl AgentClient {
    pub fn new(config: &ClientConfig, cancel: CancellationToken) -> Result<Self> {
        if config.target.is_empty() {
            return Err(Error::NotConfigured("storage agent target is not set".into()));
        }

        let uri = if config.target.contains("://") {
            config.target.clone()
        } else {
            format!("http://{}", config.target)
        };
        let endpoint = Endpoint::from_shared(uri).map_err(|e| {
            Error::Configuration(format!("Invalid storage agent target {}: {}", config.target, e))
        })?;
        let endpoint = endpoint.connect_timeout(config.connect_timeout);
        let channel = endpoint.connect_lazy();

        debug!("Storage agent client for {}", config.target);
        Ok(Self {
            client: StorageAgentClient::new(channel),
            endpoint,
            target: config.target.clone(),
            rpc_timeout: config.rpc_timeout,
            cancel,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Open a fresh connection to check that the agent is reachable
    pub async fn probe(&self) -> Result<()> {
        let endpoint = self.endpoint.clone();
        let target = self.target.clone();
        bounded("probe", self.rpc_timeout, &self.cancel, async move {
            endpoint
                .connect()
                .await
                .map(|_| ())
                .map_err(|e| Error::RemoteUnavailable {
                    target,
                    reason: e.to_string(),
                })
        })
        .await
    }

    fn status_error(&self, status: Status, kind: &str, name: &str) -> Error {
        // Connect failures can arrive as UNKNOWN with a transport message.
        if status.code() == tonic::Code::Unknown && status.message().contains("transport error") {
            return Error::RemoteUnavailable {
                target: self.target.clone(),
                reason: status.message().to_string(),
            };
        }
        match Error::from_status(status, kind, name) {
            Error::RemoteUnavailable { reason, .. } => Error::RemoteUnavailable {
                target: self.target.clone(),
                reason,
            },
            other => other,
        }
    }
}

#[async_trait]
impl StorageAgentApi for AgentClient {
    async fn create_image(&self, image_id: &str, size_bytes: u64) -> Result<()> {
        let size = i64::try_from(size_bytes)
            .map_err(|_| Error::InvalidArgument(format!("size {} out of range", size_bytes)))?;
        let mut client = self.client.clone();
        let request = ImageRequest {
            image_id: image_id.to_string(),
            size,
        };

        bounded("CreateImage", self.rpc_timeout, &self.cancel, async move {
            client
                .create_image(request)
                .await
                .map(|_| ())
                .map_err(|s| self.status_error(s, "image", image_id))
        })
        .await
    }

    async fn delete_image(&self, image_id: &str) -> Result<()> {
        let mut client = self.client.clone();
        let request = ImageRequest {
            image_id: image_id.to_string(),
            size: 0,
        };

        bounded("DeleteImage", self.rpc_timeout, &self.cancel, async move {
            client
                .delete_image(request)
                .await
                .map(|_| ())
                .map_err(|s| self.status_error(s, "image", image_id))
        })
        .await
    }

    async fn attach_volume(&self, attachment: &VolumeAttachment) -> Result<String> {
        let mut client = self.client.clone();
        let request = volume_request(attachment);

        bounded("AttachVolume", self.rpc_timeout, &self.cancel, async move {
            let response = client
                .attach_volume(request)
                .await
                .map_err(|s| match self.status_error(s, "volume", &attachment.image_id) {
                    Error::Exhausted { .. } => Error::Exhausted {
                        domain: attachment.domain_name.clone(),
                    },
                    other => other,
                })?
                .into_inner();
            if response.device.is_empty() {
                return Err(Error::Internal(format!(
                    "storage agent attached {} without reporting a device",
                    attachment.image_id
                )));
            }
            Ok(response.device)
        })
        .await
    }

    async fn detach_volume(&self, attachment: &VolumeAttachment) -> Result<()> {
        let mut client = self.client.clone();
        let request = volume_request(attachment);

        bounded("DetachVolume", self.rpc_timeout, &self.cancel, async move {
            client
                .detach_volume(request)
                .await
                .map(|_| ())
                .map_err(|s| self.status_error(s, "volume", &attachment.image_id))
        })
        .await
    }
}

fn volume_request(attachment: &VolumeAttachment) -> VolumeRequest {
    VolumeRequest {
        image_id: attachment.image_id.clone(),
        target_path: attachment.target_path.clone(),
        domain_name: attachment.domain_name.clone(),
    }
}
