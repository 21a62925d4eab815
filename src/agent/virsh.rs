//! virsh Hypervisor Adapter
//!
//! Implements the [`Hypervisor`] port by running `virsh -c <uri>` once per
//! call, so every operation opens and closes its own libvirt connection.
//! Device XML is fed through stdin. Children are spawned with `kill_on_drop`
//! so a timed-out or cancelled call does not leave virsh running.

use crate::domain::Hypervisor;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Default libvirt connection URI
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";

/// Configuration for the virsh adapter
#[derive(Debug, Clone)]
pub struct VirshConfig {
    /// Path or name of the virsh binary
    pub binary: String,
    /// libvirt connection URI
    pub uri: String,
}

impl Default for VirshConfig {
    fn default() -> Self {
        Self {
            binary: "virsh".to_string(),
            uri: DEFAULT_LIBVIRT_URI.to_string(),
        }
    }
}

/// Hypervisor access through the virsh CLI
#[derive(Debug, Clone, Default)]
pub struct VirshHypervisor {
    config: VirshConfig,
}

impl VirshHypervisor {
    pub fn new(config: VirshConfig) -> Self {
        Self { config }
    }

    async fn run(
        &self,
        operation: &str,
        domain: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<String> {
        debug!("virsh -c {} {} {}", self.config.uri, operation, args.join(" "));

        let mut child = Command::new(&self.config.binary)
            .arg("-c")
            .arg(&self.config.uri)
            .arg(operation)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Configuration(format!("Cannot run {}: {}", self.config.binary, e))
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("virsh {} on {} failed: {}", operation, domain, stderr.trim());
            return Err(classify_failure(&self.config.uri, operation, domain, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn domain_xml(&self, domain: &str) -> Result<String> {
        self.run("dumpxml", domain, &[domain], None).await
    }

    async fn attach_device(&self, domain: &str, device_xml: &str) -> Result<()> {
        self.run(
            "attach-device",
            domain,
            &[domain, "/dev/stdin", "--live"],
            Some(device_xml),
        )
        .await?;
        Ok(())
    }

    async fn detach_device(&self, domain: &str, device_xml: &str) -> Result<()> {
        self.run(
            "detach-device",
            domain,
            &[domain, "/dev/stdin", "--live"],
            Some(device_xml),
        )
        .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<String> {
        let uri = self.run("uri", "-", &[], None).await?;
        Ok(uri.trim().to_string())
    }
}

/// Map virsh stderr onto the error taxonomy
pub fn classify_failure(uri: &str, operation: &str, domain: &str, stderr: &str) -> Error {
    let lower = stderr.to_lowercase();

    if lower.contains("domain not found")
        || lower.contains("no domain with matching")
        || lower.contains("failed to get domain")
    {
        return Error::not_found("domain", domain);
    }

    if lower.contains("failed to connect")
        || lower.contains("connection refused")
        || lower.contains("no connection driver")
        || lower.contains("cannot recv data")
    {
        return Error::RemoteUnavailable {
            target: uri.to_string(),
            reason: stderr.trim().to_string(),
        };
    }

    Error::Hypervisor {
        domain: domain.to_string(),
        operation: operation.to_string(),
        reason: stderr.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_unknown_domain() {
        let err = classify_failure(
            DEFAULT_LIBVIRT_URI,
            "dumpxml",
            "vm-9",
            "error: failed to get domain 'vm-9'\n",
        );
        assert_matches!(err, Error::NotFound { ref kind, ref name } if kind == "domain" && name == "vm-9");
    }

    #[test]
    fn test_connection_failure() {
        let stderr = "error: failed to connect to the hypervisor\n\
                      error: Failed to connect socket to '/var/run/libvirt/libvirt-sock': Connection refused";
        let err = classify_failure(DEFAULT_LIBVIRT_URI, "attach-device", "vm-1", stderr);
        assert_matches!(err, Error::RemoteUnavailable { ref target, .. } if target == DEFAULT_LIBVIRT_URI);
        assert!(err.is_transient());
    }

    #[test]
    fn test_rejected_descriptor_is_internal() {
        let err = classify_failure(
            DEFAULT_LIBVIRT_URI,
            "attach-device",
            "vm-1",
            "error: Failed to attach device from /dev/stdin\nerror: XML error: target 'sdb' duplicated",
        );
        assert_matches!(err, Error::Hypervisor { ref operation, .. } if operation == "attach-device");
        assert_eq!(err.code(), tonic::Code::Internal);
    }

    #[tokio::test]
    async fn test_missing_binary_is_configuration_error() {
        let hypervisor = VirshHypervisor::new(VirshConfig {
            binary: "/nonexistent/virsh".into(),
            uri: DEFAULT_LIBVIRT_URI.into(),
        });
        assert_matches!(hypervisor.ping().await, Err(Error::Configuration(_)));
    }
}
