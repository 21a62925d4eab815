//! CSI Identity service

use crate::client::AgentClient;
use crate::error::Error;
use crate::proto::csi::identity_server::Identity;
use crate::proto::csi::{
    plugin_capability, GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse,
    GetPluginInfoRequest, GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};
use std::collections::HashMap;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

/// Default CSI driver name
pub const DEFAULT_DRIVER_NAME: &str = "example.csi.clew.cz";

/// Plugin identity and readiness
#[derive(Debug, Clone)]
pub struct IdentityService {
    name: String,
    version: String,
    /// Checked on Probe when set
    agent: Option<AgentClient>,
}

impl IdentityService {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            agent: None,
        }
    }

    /// Report readiness from the storage agent's reachability
    pub fn with_agent_probe(mut self, agent: AgentClient) -> Self {
        self.agent = Some(agent);
        self
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        if self.name.is_empty() {
            return Err(Error::NotConfigured("driver name".into()).into());
        }
        if self.version.is_empty() {
            return Err(Error::NotConfigured("driver version".into()).into());
        }

        Ok(Response::new(GetPluginInfoResponse {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let controller = PluginCapability {
            r#type: Some(plugin_capability::Type::Service(plugin_capability::Service {
                r#type: plugin_capability::service::Type::ControllerService as i32,
            })),
        };

        Ok(Response::new(GetPluginCapabilitiesResponse {
            capabilities: vec![controller],
        }))
    }

    async fn probe(&self, _request: Request<ProbeRequest>) -> Result<Response<ProbeResponse>, Status> {
        let ready = match &self.agent {
            Some(agent) => match agent.probe().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Storage agent {} not reachable: {}", agent.target(), e);
                    false
                }
            },
            None => true,
        };
        debug!("Probe: ready={}", ready);

        Ok(Response::new(ProbeResponse { ready: Some(ready) }))
    }
}
