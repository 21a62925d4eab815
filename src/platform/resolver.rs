//! Node-to-domain resolution
//!
//! A cluster node runs inside a libvirt domain on some hypervisor host; the
//! domain name is published as a label on the Kubernetes Node object. The
//! label is read on every call so relabelled nodes take effect immediately.

use crate::domain::DomainResolver;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use tracing::debug;

/// Default node label naming the backing domain
pub const DEFAULT_DOMAIN_LABEL: &str = "example.clew.cz/kvm-domain";

// =============================================================================
// Kubernetes Resolver
// =============================================================================

/// Reads the domain name from a label on the Node object
#[derive(Clone)]
pub struct KubeNodeLabelResolver {
    client: Client,
    label: String,
}

impl KubeNodeLabelResolver {
    pub fn new(client: Client, label: impl Into<String>) -> Self {
        Self {
            client,
            label: label.into(),
        }
    }

    /// Resolver using the in-cluster or kubeconfig credentials
    pub async fn try_default(label: impl Into<String>) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, label))
    }
}

#[async_trait]
impl DomainResolver for KubeNodeLabelResolver {
    async fn resolve_domain(&self, node_id: &str) -> Result<String> {
        if node_id.is_empty() {
            return Err(Error::NotConfigured("node id is not set".into()));
        }

        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = match nodes.get(node_id).await {
            Ok(node) => node,
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                return Err(Error::not_found("node", node_id));
            }
            Err(e) => return Err(e.into()),
        };

        let domain = domain_from_labels(&node, &self.label)?;
        debug!("Node {} maps to domain {}", node_id, domain);
        Ok(domain)
    }
}

/// Value of `label` on `node`; missing or empty labels are `NotFound`
pub fn domain_from_labels(node: &Node, label: &str) -> Result<String> {
    let node_name = node.metadata.name.as_deref().unwrap_or_default();
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(label))
        .filter(|value| !value.is_empty())
        .cloned()
        .ok_or_else(|| Error::not_found("node label", format!("{}/{}", node_name, label)))
}

// =============================================================================
// Static Resolver
// =============================================================================

/// Maps every node to one configured domain (standalone mode)
#[derive(Debug, Clone)]
pub struct StaticDomainResolver {
    domain: String,
}

impl StaticDomainResolver {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }
}

#[async_trait]
impl DomainResolver for StaticDomainResolver {
    async fn resolve_domain(&self, _node_id: &str) -> Result<String> {
        if self.domain.is_empty() {
            return Err(Error::NotConfigured("static domain is empty".into()));
        }
        Ok(self.domain.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn node(labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("worker-1".into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_domain_from_label() {
        let node = node(&[(DEFAULT_DOMAIN_LABEL, "vm-1"), ("kubernetes.io/os", "linux")]);
        assert_eq!(domain_from_labels(&node, DEFAULT_DOMAIN_LABEL).unwrap(), "vm-1");
    }

    #[test]
    fn test_missing_label_is_not_found() {
        assert_matches!(
            domain_from_labels(&node(&[]), DEFAULT_DOMAIN_LABEL),
            Err(Error::NotFound { ref kind, .. }) if kind == "node label"
        );
        assert_matches!(
            domain_from_labels(&node(&[(DEFAULT_DOMAIN_LABEL, "")]), DEFAULT_DOMAIN_LABEL),
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticDomainResolver::new("vm-1");
        assert_eq!(resolver.resolve_domain("any-node").await.unwrap(), "vm-1");
        assert_matches!(
            StaticDomainResolver::new("").resolve_domain("n").await,
            Err(Error::NotConfigured(_))
        );
    }
}
