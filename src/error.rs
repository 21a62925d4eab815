//! Error types for the KVM CSI driver
//!
//! One error enum shared by the storage agent, the CSI services and the
//! platform adapters. Every variant maps onto a gRPC status code so failures
//! cross the agent hop and reach the orchestrator without losing their kind.

use std::time::Duration;
use thiserror::Error;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Code, Status};

/// Status metadata naming the kind of resource a NOT_FOUND or
/// ALREADY_EXISTS status is about
pub const RESOURCE_KIND_KEY: &str = "x-resource-kind";

/// Status metadata naming the resource itself
pub const RESOURCE_NAME_KEY: &str = "x-resource-name";

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not configured: {0}")]
    NotConfigured(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation not supported: {0}")]
    Unimplemented(String),

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    #[error("No free device name left on domain {domain} (sda..sdz in use)")]
    Exhausted { domain: String },

    #[error("Resource {resource} is in use by {holder}")]
    InUse { resource: String, holder: String },

    // =========================================================================
    // Remote / Hypervisor Errors
    // =========================================================================
    #[error("Remote unavailable: {target} - {reason}")]
    RemoteUnavailable { target: String, reason: String },

    #[error("Hypervisor operation failed: {operation} on {domain}: {reason}")]
    Hypervisor {
        domain: String,
        operation: String,
        reason: String,
    },

    #[error("Operation {operation} timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("Operation {operation} cancelled")]
    Cancelled { operation: String },

    // =========================================================================
    // Host Errors
    // =========================================================================
    #[error("Mount operation failed on {target}: {reason}")]
    Mount { target: String, reason: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Domain XML error: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for [`Error::NotFound`]
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Shorthand for [`Error::AlreadyExists`]
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Whether this is a `NotFound` about a resource of `kind`
    pub fn is_not_found(&self, kind: &str) -> bool {
        matches!(self, Error::NotFound { kind: k, .. } if k == kind)
    }

    /// gRPC status code reported for this error
    pub fn code(&self) -> Code {
        match self {
            Error::NotConfigured(_) | Error::Configuration(_) | Error::InUse { .. } => {
                Code::FailedPrecondition
            }
            Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::Unimplemented(_) => Code::Unimplemented,
            Error::NotFound { .. } => Code::NotFound,
            Error::AlreadyExists { .. } => Code::AlreadyExists,
            Error::Exhausted { .. } => Code::ResourceExhausted,
            Error::RemoteUnavailable { .. } | Error::Transport(_) => Code::Unavailable,
            Error::Timeout { .. } => Code::DeadlineExceeded,
            Error::Cancelled { .. } => Code::Cancelled,
            Error::Kube(kube::Error::Api(resp)) if resp.code == 404 => Code::NotFound,
            Error::Kube(_) => Code::Unavailable,
            Error::Internal(_)
            | Error::Hypervisor { .. }
            | Error::Mount { .. }
            | Error::Xml(_)
            | Error::Io(_) => Code::Internal,
        }
    }

    /// Rebuild an error from a status returned by a remote service.
    ///
    /// Resource variants take their kind and name from the status metadata
    /// when the remote set it; `kind` and `name` describe what the call was
    /// about and fill in for statuses that carry none.
    pub fn from_status(status: Status, kind: &str, name: &str) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::NotFound => Error::NotFound {
                kind: resource_field(&status, RESOURCE_KIND_KEY, kind),
                name: resource_field(&status, RESOURCE_NAME_KEY, name),
            },
            Code::AlreadyExists => Error::AlreadyExists {
                kind: resource_field(&status, RESOURCE_KIND_KEY, kind),
                name: resource_field(&status, RESOURCE_NAME_KEY, name),
            },
            Code::ResourceExhausted => Error::Exhausted {
                domain: name.to_string(),
            },
            Code::InvalidArgument => Error::InvalidArgument(message),
            Code::Unimplemented => Error::Unimplemented(message),
            Code::FailedPrecondition => Error::NotConfigured(message),
            Code::Unavailable => Error::RemoteUnavailable {
                target: "storage-agent".into(),
                reason: message,
            },
            Code::DeadlineExceeded => Error::Timeout {
                operation: format!("{} {}", kind, name),
                duration: Duration::ZERO,
            },
            Code::Cancelled => Error::Cancelled {
                operation: format!("{} {}", kind, name),
            },
            _ => Error::Internal(message),
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RemoteUnavailable { .. }
                | Error::Timeout { .. }
                | Error::Transport(_)
                | Error::Kube(_)
        )
    }

    /// Check if re-issuing the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::InvalidArgument(_)
            | Error::Unimplemented(_)
            | Error::NotConfigured(_)
            | Error::Configuration(_)
            | Error::AlreadyExists { .. } => false,
            Error::Kube(kube::Error::Api(resp)) if resp.code == 404 => false,
            _ => true,
        }
    }
}

fn resource_field(status: &Status, key: &str, fallback: &str) -> String {
    status
        .metadata()
        .get(key)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        let mut metadata = MetadataMap::new();
        if let Error::NotFound { kind, name } | Error::AlreadyExists { kind, name } = &err {
            for (key, value) in [(RESOURCE_KIND_KEY, kind), (RESOURCE_NAME_KEY, name)] {
                if let Ok(value) = MetadataValue::try_from(value.as_str()) {
                    metadata.insert(key, value);
                }
            }
        }
        Status::with_metadata(err.code(), err.to_string(), metadata)
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;
