//! KVM CSI Driver
//!
//! One binary, three roles:
//!
//! - `agent`: storage agent on the hypervisor host (images + hot-plug)
//! - `controller`: CSI Identity + Controller, forwarding to an agent
//! - `node`: CSI Identity + Node inside the guest, forwarding to an agent

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kvm_csi_driver::agent::{self, ImageOwner, DEFAULT_LIBVIRT_URI};
use kvm_csi_driver::csi::{DEFAULT_CSI_ENDPOINT, DEFAULT_DRIVER_NAME};
use kvm_csi_driver::domain::{DomainResolverRef, DEFAULT_IMAGES_ROOT};
use kvm_csi_driver::metrics::serve_metrics;
use kvm_csi_driver::platform::DEFAULT_DOMAIN_LABEL;
use kvm_csi_driver::{
    serve_csi, AgentClient, AgentConfig, ClientConfig, ControllerConfig, ControllerService,
    CsiServices, Error, IdentityService, ImageFormat, KubeNodeLabelResolver, MetricsRef,
    MountConfig, NodeConfig, NodeService, OperationMetrics, Result, StaticDomainResolver,
    StorageAgent, SystemMounter, VirshConfig, VirshHypervisor,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// CSI driver for qcow2 volumes hot-plugged into libvirt/KVM guests
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    /// Serve prometheus metrics on this address
    #[arg(long, env = "METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the storage agent on a hypervisor host
    Agent(AgentArgs),
    /// Run the CSI controller plugin
    Controller(ControllerArgs),
    /// Run the CSI node plugin
    Node(NodeArgs),
}

#[derive(ClapArgs, Debug)]
struct AgentArgs {
    /// gRPC listen address
    #[arg(long, env = "AGENT_LISTEN", default_value = "0.0.0.0:7003")]
    listen: SocketAddr,

    /// Directory holding volume images
    #[arg(long, env = "IMAGES_ROOT", default_value = DEFAULT_IMAGES_ROOT)]
    images_root: PathBuf,

    /// Image format (qcow2 or raw)
    #[arg(long, env = "IMAGE_FORMAT", default_value = "qcow2")]
    image_format: String,

    /// Owner of new images as user[:group]; empty keeps the agent's
    #[arg(long, env = "IMAGE_OWNER", default_value = "qemu:qemu")]
    image_owner: String,

    /// libvirt connection URI
    #[arg(long, env = "LIBVIRT_URI", default_value = DEFAULT_LIBVIRT_URI)]
    libvirt_uri: String,

    /// virsh binary
    #[arg(long, env = "VIRSH_BINARY", default_value = "virsh")]
    virsh_binary: String,

    /// Timeout for each hypervisor call in seconds
    #[arg(long, env = "HYPERVISOR_TIMEOUT_SECS", default_value = "30")]
    hypervisor_timeout_secs: u64,
}

#[derive(ClapArgs, Debug)]
struct PluginArgs {
    /// CSI endpoint (unix socket)
    #[arg(long, env = "CSI_ENDPOINT", default_value = DEFAULT_CSI_ENDPOINT)]
    endpoint: String,

    /// Storage agent address (host:port)
    #[arg(long, env = "STORAGEAGENT_TARGET", default_value = "")]
    agent_target: String,

    /// CSI driver name
    #[arg(long, env = "DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    driver_name: String,

    /// CSI driver version
    #[arg(long, env = "DRIVER_VERSION", default_value = kvm_csi_driver::VERSION)]
    driver_version: String,

    /// Timeout for each storage agent RPC in seconds
    #[arg(long, env = "RPC_TIMEOUT_SECS", default_value = "60")]
    rpc_timeout_secs: u64,
}

impl PluginArgs {
    fn client(&self, cancel: &CancellationToken) -> Result<AgentClient> {
        let config = ClientConfig {
            target: self.agent_target.clone(),
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs),
            ..Default::default()
        };
        AgentClient::new(&config, cancel.clone())
    }
}

#[derive(ClapArgs, Debug)]
struct ControllerArgs {
    #[command(flatten)]
    plugin: PluginArgs,

    /// Capacity of volumes requested without a capacity range
    #[arg(long, env = "DEFAULT_CAPACITY_BYTES", default_value = "1073741824")]
    default_capacity_bytes: u64,

    /// Treat deletion of an already missing image as success
    #[arg(long, env = "IDEMPOTENT_DELETE")]
    idempotent_delete: bool,

    /// Report Probe readiness from storage agent reachability
    #[arg(long, env = "PROBE_AGENT")]
    probe_agent: bool,
}

#[derive(ClapArgs, Debug)]
struct NodeArgs {
    #[command(flatten)]
    plugin: PluginArgs,

    /// Kubernetes node name of this host
    #[arg(long, env = "NODE_ID", default_value = "")]
    node_id: String,

    /// Node label carrying the libvirt domain name
    #[arg(long, env = "DOMAIN_LABEL", default_value = DEFAULT_DOMAIN_LABEL)]
    domain_label: String,

    /// Use this domain instead of the node label (no Kubernetes access)
    #[arg(long, env = "STATIC_DOMAIN")]
    static_domain: Option<String>,

    /// Filesystem created on blank volumes
    #[arg(long, env = "FS_TYPE", default_value = "ext4")]
    fs_type: String,

    /// Timeout for each mount tool invocation in seconds
    #[arg(long, env = "MOUNT_TIMEOUT_SECS", default_value = "120")]
    mount_timeout_secs: u64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting {} {}", kvm_csi_driver::NAME, kvm_csi_driver::VERSION);

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let metrics: MetricsRef = Arc::new(OperationMetrics::new()?);
    if let Some(addr) = args.metrics_addr {
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(addr, metrics, shutdown).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let result = match args.command {
        Command::Agent(agent_args) => run_agent(agent_args, metrics, shutdown).await,
        Command::Controller(controller_args) => {
            run_controller(controller_args, metrics, shutdown).await
        }
        Command::Node(node_args) => run_node(node_args, metrics, shutdown).await,
    };

    if let Err(e) = &result {
        error!("Exiting: {}", e);
    }
    result
}

async fn run_agent(args: AgentArgs, metrics: MetricsRef, shutdown: CancellationToken) -> Result<()> {
    let config = AgentConfig {
        listen: args.listen,
        images_root: args.images_root,
        image_format: args.image_format.parse::<ImageFormat>()?,
        image_owner: ImageOwner::parse_optional(&args.image_owner)?,
        hypervisor_timeout: Duration::from_secs(args.hypervisor_timeout_secs),
    };

    info!("  Listen: {}", config.listen);
    info!("  Images: {} ({})", config.images_root.display(), config.image_format);
    info!("  libvirt: {}", args.libvirt_uri);

    let hypervisor = Arc::new(VirshHypervisor::new(VirshConfig {
        binary: args.virsh_binary,
        uri: args.libvirt_uri,
    }));
    let storage = StorageAgent::new(&config, hypervisor, shutdown.clone()).with_metrics(metrics);
    storage.initialize().await?;

    agent::serve(Arc::new(storage), config.listen, shutdown).await
}

async fn run_controller(
    args: ControllerArgs,
    metrics: MetricsRef,
    shutdown: CancellationToken,
) -> Result<()> {
    let client = args.plugin.client(&shutdown)?;
    info!("  Endpoint: {}", args.plugin.endpoint);
    info!("  Storage agent: {}", client.target());

    let mut identity = IdentityService::new(&args.plugin.driver_name, &args.plugin.driver_version);
    if args.probe_agent {
        identity = identity.with_agent_probe(client.clone());
    }

    let controller = ControllerService::new(
        Arc::new(client),
        ControllerConfig {
            default_capacity_bytes: args.default_capacity_bytes,
            idempotent_delete: args.idempotent_delete,
        },
    )
    .with_metrics(metrics);

    let services = CsiServices::new(identity).with_controller(controller);
    serve_csi(&args.plugin.endpoint, services, shutdown).await
}

async fn run_node(args: NodeArgs, metrics: MetricsRef, shutdown: CancellationToken) -> Result<()> {
    if args.node_id.is_empty() {
        return Err(Error::NotConfigured("NODE_ID is not set".into()));
    }

    let client = args.plugin.client(&shutdown)?;
    info!("  Endpoint: {}", args.plugin.endpoint);
    info!("  Node: {}", args.node_id);
    info!("  Storage agent: {}", client.target());

    let resolver: DomainResolverRef = match &args.static_domain {
        Some(domain) => {
            info!("  Domain: {} (static)", domain);
            Arc::new(StaticDomainResolver::new(domain))
        }
        None => {
            info!("  Domain label: {}", args.domain_label);
            Arc::new(KubeNodeLabelResolver::try_default(&args.domain_label).await?)
        }
    };

    let mounter = SystemMounter::new(
        MountConfig {
            timeout: Duration::from_secs(args.mount_timeout_secs),
            ..Default::default()
        },
        shutdown.clone(),
    );

    let node = NodeService::new(
        Arc::new(client),
        resolver,
        Arc::new(mounter),
        NodeConfig {
            node_id: args.node_id,
            fs_type: args.fs_type,
            ..Default::default()
        },
    )
    .with_metrics(metrics);

    let identity = IdentityService::new(&args.plugin.driver_name, &args.plugin.driver_version);
    let services = CsiServices::new(identity).with_node(node);
    serve_csi(&args.plugin.endpoint, services, shutdown).await
}

// =============================================================================
// Shutdown
// =============================================================================

async fn watch_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot watch SIGTERM: {}", e);
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        _ = terminate.recv() => info!("SIGTERM received, shutting down"),
    }
    shutdown.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["h2=warn", "hyper=warn", "tower=warn", "kube=info"] {
        let directive = directive
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", directive, e)))?;
        filter = filter.add_directive(directive);
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
