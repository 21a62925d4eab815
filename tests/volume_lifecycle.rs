//! Volume lifecycle across the agent hop
//!
//! Runs a storage agent on a loopback TCP port backed by an in-memory
//! hypervisor, and drives it through the gRPC client from the controller and
//! node services, the way the deployed plugins do.

use assert_matches::assert_matches;
use kvm_csi_driver::agent::{serve_with_listener, AgentConfig, StorageAgent};
use kvm_csi_driver::csi::controller::PV_NAME_PARAMETER;
use kvm_csi_driver::domain::StorageAgentApi;
use kvm_csi_driver::mock::{MemoryHypervisor, RecordingMounter};
use kvm_csi_driver::proto::csi::controller_server::Controller;
use kvm_csi_driver::proto::csi::node_server::Node;
use kvm_csi_driver::proto::csi::volume_capability::{access_mode::Mode, AccessMode, AccessType, MountVolume};
use kvm_csi_driver::proto::csi::*;
use kvm_csi_driver::{
    AgentClient, ClientConfig, ControllerConfig, ControllerService, Error, NodeConfig,
    NodeService, StaticDomainResolver,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::Request;

const GIB: i64 = 1024 * 1024 * 1024;

struct Cluster {
    images: TempDir,
    targets: TempDir,
    hypervisor: Arc<MemoryHypervisor>,
    mounter: Arc<RecordingMounter>,
    client: AgentClient,
    controller: ControllerService,
    node: NodeService,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<kvm_csi_driver::Result<()>>,
}

impl Cluster {
    async fn start() -> Self {
        let images = TempDir::new().unwrap();
        let targets = TempDir::new().unwrap();
        let hypervisor = Arc::new(MemoryHypervisor::new());
        hypervisor.define_domain("vm-1", &["sda"]);

        let shutdown = CancellationToken::new();
        let agent = StorageAgent::new(
            &AgentConfig {
                images_root: images.path().to_path_buf(),
                image_owner: None,
                ..Default::default()
            },
            hypervisor.clone(),
            shutdown.clone(),
        );
        agent.initialize().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_with_listener(
            Arc::new(agent),
            listener,
            shutdown.clone(),
        ));

        let client = AgentClient::new(
            &ClientConfig {
                target: addr.to_string(),
                rpc_timeout: Duration::from_secs(10),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .unwrap();

        let controller = ControllerService::new(Arc::new(client.clone()), ControllerConfig::default());
        let mounter = Arc::new(RecordingMounter::new());
        let node = NodeService::new(
            Arc::new(client.clone()),
            Arc::new(StaticDomainResolver::new("vm-1")),
            mounter.clone(),
            NodeConfig {
                node_id: "worker-1".into(),
                ..Default::default()
            },
        );

        Self {
            images,
            targets,
            hypervisor,
            mounter,
            client,
            controller,
            node,
            shutdown,
            server,
        }
    }

    async fn stop(self) {
        let Cluster {
            client,
            controller,
            node,
            shutdown,
            server,
            ..
        } = self;
        drop((client, controller, node));
        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    async fn create(&self, pv_name: &str, bytes: i64) -> Volume {
        self.controller
            .create_volume(Request::new(CreateVolumeRequest {
                name: format!("csi-{}", pv_name),
                capacity_range: Some(CapacityRange {
                    required_bytes: bytes,
                    limit_bytes: 0,
                }),
                parameters: HashMap::from([(PV_NAME_PARAMETER.to_string(), pv_name.to_string())]),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap()
    }

    fn target(&self, volume_id: &str) -> PathBuf {
        self.targets.path().join(volume_id).join("mount")
    }

    fn publish_request(&self, volume_id: &str) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: volume_id.into(),
            target_path: self.target(volume_id).display().to_string(),
            volume_capability: Some(VolumeCapability {
                access_type: Some(AccessType::Mount(MountVolume::default())),
                access_mode: Some(AccessMode {
                    mode: Mode::SingleNodeWriter as i32,
                }),
            }),
            ..Default::default()
        }
    }
}

#[tokio::test]
async fn test_full_lifecycle() {
    let cluster = Cluster::start().await;

    let volume = cluster.create("pvc-123", 2 * GIB).await;
    assert_eq!(volume.volume_id, "pvc-123");
    assert_eq!(volume.capacity_bytes, 2 * GIB);
    let image = cluster.images.path().join("pvc-123.qcow2");
    assert!(image.exists());

    cluster
        .node
        .node_publish_volume(Request::new(cluster.publish_request("pvc-123")))
        .await
        .unwrap();
    let disks = cluster.hypervisor.disks("vm-1");
    assert!(disks
        .iter()
        .any(|d| d.device == "sdb" && d.source == image.display().to_string()));
    assert_eq!(cluster.mounter.mounts()[0].device, PathBuf::from("/dev/sdb"));

    cluster
        .node
        .node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
            volume_id: "pvc-123".into(),
            target_path: cluster.target("pvc-123").display().to_string(),
        }))
        .await
        .unwrap();
    assert_eq!(cluster.hypervisor.disks("vm-1").len(), 1);
    assert!(!cluster.mounter.is_mounted(&cluster.target("pvc-123")));

    cluster
        .controller
        .delete_volume(Request::new(DeleteVolumeRequest {
            volume_id: "pvc-123".into(),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert!(!image.exists());

    let status = cluster
        .controller
        .delete_volume(Request::new(DeleteVolumeRequest {
            volume_id: "pvc-123".into(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);

    cluster.stop().await;
}

#[tokio::test]
async fn test_errors_keep_their_kind_across_the_hop() {
    let cluster = Cluster::start().await;

    assert_matches!(
        cluster.client.delete_image("pvc-missing").await,
        Err(Error::NotFound { ref name, .. }) if name == "pvc-missing"
    );

    cluster.client.create_image("pvc-1", GIB as u64).await.unwrap();
    cluster.client.create_image("pvc-1", GIB as u64).await.unwrap();
    assert_matches!(
        cluster.client.create_image("pvc-1", 2 * GIB as u64).await,
        Err(Error::AlreadyExists { .. })
    );

    let names: Vec<String> = (b'b'..=b'z').map(|l| format!("sd{}", l as char)).collect();
    let mut full = vec!["sda"];
    full.extend(names.iter().map(String::as_str));
    cluster.hypervisor.define_domain("vm-full", &full);
    let attachment = kvm_csi_driver::VolumeAttachment::new("pvc-1", "/mnt/pvc-1", "vm-full");
    assert_matches!(
        cluster.client.attach_volume(&attachment).await,
        Err(Error::Exhausted { ref domain }) if domain == "vm-full"
    );

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishes_get_distinct_devices() {
    let cluster = Cluster::start().await;
    cluster.hypervisor.set_latency(Duration::from_millis(5));

    let ids: Vec<String> = (0..6).map(|i| format!("pvc-{}", i)).collect();
    for id in &ids {
        cluster.create(id, GIB).await;
    }

    let mut handles = Vec::new();
    for id in &ids {
        let node = cluster.node.clone();
        let request = cluster.publish_request(id);
        handles.push(tokio::spawn(async move {
            node.node_publish_volume(Request::new(request)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let devices: HashSet<String> = cluster
        .hypervisor
        .disks("vm-1")
        .into_iter()
        .map(|d| d.device)
        .collect();
    assert_eq!(devices.len(), ids.len() + 1);

    let mounted: HashSet<PathBuf> = cluster.mounter.mounts().into_iter().map(|m| m.device).collect();
    assert_eq!(mounted.len(), ids.len());

    cluster.stop().await;
}

#[tokio::test]
async fn test_unpublish_from_lost_domain_is_not_success() {
    let cluster = Cluster::start().await;
    cluster.create("pvc-1", GIB).await;
    cluster
        .node
        .node_publish_volume(Request::new(cluster.publish_request("pvc-1")))
        .await
        .unwrap();

    assert_matches!(
        cluster
            .client
            .detach_volume(&kvm_csi_driver::VolumeAttachment::new("pvc-1", "/mnt/x", "vm-gone"))
            .await,
        Err(Error::NotFound { ref kind, ref name }) if kind == "domain" && name == "vm-gone"
    );

    let lost = NodeService::new(
        Arc::new(cluster.client.clone()),
        Arc::new(StaticDomainResolver::new("vm-gone")),
        cluster.mounter.clone(),
        NodeConfig {
            node_id: "worker-1".into(),
            ..Default::default()
        },
    );
    let status = lost
        .node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
            volume_id: "pvc-1".into(),
            target_path: cluster.target("pvc-1").display().to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
    assert_eq!(cluster.hypervisor.disks("vm-1").len(), 2);

    drop(lost);
    cluster.stop().await;
}

#[tokio::test]
async fn test_volume_is_not_shared_between_targets() {
    let cluster = Cluster::start().await;
    cluster.create("pvc-1", GIB).await;
    cluster
        .node
        .node_publish_volume(Request::new(cluster.publish_request("pvc-1")))
        .await
        .unwrap();

    let mut second = cluster.publish_request("pvc-1");
    let other = cluster.targets.path().join("other-pod");
    second.target_path = other.display().to_string();
    let status = cluster
        .node
        .node_publish_volume(Request::new(second))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    assert!(cluster.mounter.is_mounted(&cluster.target("pvc-1")));
    assert!(cluster.hypervisor.disks("vm-1").iter().any(|d| d.device == "sdb"));

    cluster.stop().await;
}

#[tokio::test]
async fn test_agent_down_is_unavailable() {
    let cluster = Cluster::start().await;
    let client = cluster.client.clone();
    let controller = cluster.controller.clone();
    cluster.stop().await;

    assert_matches!(
        client.delete_image("pvc-1").await,
        Err(Error::RemoteUnavailable { .. })
    );
    let status = controller
        .delete_volume(Request::new(DeleteVolumeRequest {
            volume_id: "pvc-1".into(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unavailable);
}
