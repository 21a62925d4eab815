//! CSI Controller service
//!
//! Turns CreateVolume/DeleteVolume into image operations on the storage
//! agent. Volume IDs are the persistent volume names handed over by the
//! external-provisioner, so the controller never needs to store a mapping.
//! Every other controller RPC answers UNIMPLEMENTED.

use crate::csi::validate_capability;
use crate::domain::StorageAgentRef;
use crate::error::{Error, Result};
use crate::metrics::MetricsRef;
use crate::proto::csi::controller_server::Controller;
use crate::proto::csi::*;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// Parameter carrying the persistent volume name
pub const PV_NAME_PARAMETER: &str = "csi.storage.k8s.io/pv/name";

const COMPONENT: &str = "controller";

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Capacity used when the request carries no range
    pub default_capacity_bytes: u64,
    /// Report success when deleting a volume whose image is already gone
    pub idempotent_delete: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_capacity_bytes: 1024 * 1024 * 1024,
            idempotent_delete: false,
        }
    }
}

/// CSI Controller backed by a storage agent
#[derive(Clone)]
pub struct ControllerService {
    agent: StorageAgentRef,
    config: ControllerConfig,
    metrics: Option<MetricsRef>,
}

impl ControllerService {
    pub fn new(agent: StorageAgentRef, config: ControllerConfig) -> Self {
        Self {
            agent,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRef) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn requested_capacity(&self, range: Option<&CapacityRange>) -> Result<u64> {
        let Some(range) = range else {
            return Ok(self.config.default_capacity_bytes);
        };
        if range.required_bytes < 0 || range.limit_bytes < 0 {
            return Err(Error::InvalidArgument("capacity must not be negative".into()));
        }
        if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
            return Err(Error::InvalidArgument(format!(
                "required capacity {} exceeds limit {}",
                range.required_bytes, range.limit_bytes
            )));
        }

        let capacity = if range.required_bytes > 0 {
            range.required_bytes
        } else {
            range.limit_bytes
        };
        Ok(if capacity > 0 {
            capacity as u64
        } else {
            self.config.default_capacity_bytes
        })
    }

    async fn create(&self, req: CreateVolumeRequest) -> Result<Volume> {
        let volume_id = match req.parameters.get(PV_NAME_PARAMETER) {
            Some(name) if !name.is_empty() => name.clone(),
            _ if !req.name.is_empty() => req.name.clone(),
            _ => {
                return Err(Error::InvalidArgument(
                    "volume name and pv/name parameter are both empty".into(),
                ))
            }
        };
        for capability in &req.volume_capabilities {
            validate_capability(capability)?;
        }
        let capacity = self.requested_capacity(req.capacity_range.as_ref())?;

        info!("Creating volume {} ({} bytes)", volume_id, capacity);
        self.agent.create_image(&volume_id, capacity).await?;

        Ok(Volume {
            capacity_bytes: capacity as i64,
            volume_id,
            volume_context: req.parameters,
            content_source: req.volume_content_source,
            accessible_topology: Vec::new(),
        })
    }

    async fn delete(&self, volume_id: &str) -> Result<()> {
        if volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must not be empty".into()));
        }

        info!("Deleting volume {}", volume_id);
        match self.agent.delete_image(volume_id).await {
            Err(Error::NotFound { .. }) if self.config.idempotent_delete => {
                warn!("Volume {} already deleted", volume_id);
                Ok(())
            }
            other => other,
        }
    }

    fn observe<T>(&self, operation: &'static str, started: std::time::Instant, result: &Result<T>) {
        if let Some(metrics) = &self.metrics {
            metrics.observe(COMPONENT, operation, started.elapsed(), result);
        }
    }
}

fn unsupported<T>(rpc: &str) -> std::result::Result<Response<T>, Status> {
    debug!("{} is not supported", rpc);
    Err(Error::Unimplemented(rpc.to_string()).into())
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> std::result::Result<Response<CreateVolumeResponse>, Status> {
        let started = std::time::Instant::now();
        let result = self.create(request.into_inner()).await;
        self.observe("create_volume", started, &result);

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(result?),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> std::result::Result<Response<DeleteVolumeResponse>, Status> {
        let started = std::time::Instant::now();
        let result = self.delete(&request.into_inner().volume_id).await;
        self.observe("delete_volume", started, &result);

        result?;
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let create_delete = ControllerServiceCapability {
            r#type: Some(controller_service_capability::Type::Rpc(
                controller_service_capability::Rpc {
                    r#type: controller_service_capability::rpc::Type::CreateDeleteVolume as i32,
                },
            )),
        };

        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: vec![create_delete],
        }))
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<ControllerPublishVolumeRequest>,
    ) -> std::result::Result<Response<ControllerPublishVolumeResponse>, Status> {
        unsupported("ControllerPublishVolume")
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<ControllerUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        unsupported("ControllerUnpublishVolume")
    }

    async fn validate_volume_capabilities(
        &self,
        _request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> std::result::Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        unsupported("ValidateVolumeCapabilities")
    }

    async fn list_volumes(
        &self,
        _request: Request<ListVolumesRequest>,
    ) -> std::result::Result<Response<ListVolumesResponse>, Status> {
        unsupported("ListVolumes")
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> std::result::Result<Response<GetCapacityResponse>, Status> {
        unsupported("GetCapacity")
    }

    async fn create_snapshot(
        &self,
        _request: Request<CreateSnapshotRequest>,
    ) -> std::result::Result<Response<CreateSnapshotResponse>, Status> {
        unsupported("CreateSnapshot")
    }

    async fn delete_snapshot(
        &self,
        _request: Request<DeleteSnapshotRequest>,
    ) -> std::result::Result<Response<DeleteSnapshotResponse>, Status> {
        unsupported("DeleteSnapshot")
    }

    async fn list_snapshots(
        &self,
        _request: Request<ListSnapshotsRequest>,
    ) -> std::result::Result<Response<ListSnapshotsResponse>, Status> {
        unsupported("ListSnapshots")
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<ControllerExpandVolumeRequest>,
    ) -> std::result::Result<Response<ControllerExpandVolumeResponse>, Status> {
        unsupported("ControllerExpandVolume")
    }

    async fn controller_get_volume(
        &self,
        _request: Request<ControllerGetVolumeRequest>,
    ) -> std::result::Result<Response<ControllerGetVolumeResponse>, Status> {
        unsupported("ControllerGetVolume")
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<ControllerModifyVolumeRequest>,
    ) -> std::result::Result<Response<ControllerModifyVolumeResponse>, Status> {
        unsupported("ControllerModifyVolume")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, StorageAgent};
    use crate::mock::MemoryHypervisor;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const GIB: i64 = 1024 * 1024 * 1024;

    fn controller(dir: &TempDir, config: ControllerConfig) -> ControllerService {
        let agent = StorageAgent::new(
            &AgentConfig {
                images_root: dir.path().to_path_buf(),
                image_owner: None,
                ..Default::default()
            },
            Arc::new(MemoryHypervisor::new()),
            CancellationToken::new(),
        );
        ControllerService::new(Arc::new(agent), config)
    }

    fn create_request(pv_name: &str, required: i64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: format!("csi-{}", pv_name),
            capacity_range: Some(CapacityRange {
                required_bytes: required,
                limit_bytes: 0,
            }),
            parameters: HashMap::from([(PV_NAME_PARAMETER.to_string(), pv_name.to_string())]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_volume_two_gib() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir, ControllerConfig::default());

        let response = controller
            .create_volume(Request::new(create_request("pvc-123", 2 * GIB)))
            .await
            .unwrap()
            .into_inner();
        let volume = response.volume.unwrap();
        assert_eq!(volume.volume_id, "pvc-123");
        assert_eq!(volume.capacity_bytes, 2_147_483_648);
        assert_eq!(
            volume.volume_context.get(PV_NAME_PARAMETER).map(String::as_str),
            Some("pvc-123")
        );
        assert!(dir.path().join("pvc-123.qcow2").exists());
    }

    #[tokio::test]
    async fn test_create_falls_back_to_name_and_default_capacity() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir, ControllerConfig::default());

        let volume = controller
            .create_volume(Request::new(CreateVolumeRequest {
                name: "pvc-plain".into(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();
        assert_eq!(volume.volume_id, "pvc-plain");
        assert_eq!(volume.capacity_bytes, GIB);

        let status = controller
            .create_volume(Request::new(CreateVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_delete_missing_volume_is_not_found() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir, ControllerConfig::default());

        controller
            .create_volume(Request::new(create_request("pvc-123", GIB)))
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join("pvc-123.qcow2")).unwrap();

        let status = controller
            .delete_volume(Request::new(DeleteVolumeRequest {
                volume_id: "pvc-123".into(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert_ne!(status.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn test_idempotent_delete() {
        let dir = TempDir::new().unwrap();
        let controller = controller(
            &dir,
            ControllerConfig {
                idempotent_delete: true,
                ..Default::default()
            },
        );

        controller
            .delete_volume(Request::new(DeleteVolumeRequest {
                volume_id: "pvc-gone".into(),
                ..Default::default()
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_rpcs_are_unimplemented() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir, ControllerConfig::default());

        let snapshot = controller
            .create_snapshot(Request::new(CreateSnapshotRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(snapshot.code(), tonic::Code::Unimplemented);

        let expand = controller
            .controller_expand_volume(Request::new(ControllerExpandVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(expand.code(), tonic::Code::Unimplemented);

        let publish = controller
            .controller_publish_volume(Request::new(ControllerPublishVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(publish.code(), tonic::Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_capabilities_only_create_delete() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir, ControllerConfig::default());

        let caps = controller
            .controller_get_capabilities(Request::new(ControllerGetCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner()
            .capabilities;
        assert_eq!(caps.len(), 1);
        assert!(matches!(
            caps[0].r#type,
            Some(controller_service_capability::Type::Rpc(ref rpc))
                if rpc.r#type == controller_service_capability::rpc::Type::CreateDeleteVolume as i32
        ));
    }
}
