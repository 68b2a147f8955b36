use std::path::PathBuf;
use std::time::Duration;

use crate::unit::UnitState;

/// Errors raised while writing a unit's artifact folder.
#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed environment spec at {path}: {reason}")]
    MalformedEnvironment { path: PathBuf, reason: String },
    #[error("invalid unit metadata: {0}")]
    InvalidMetadata(String),
    #[error("artifact hash mismatch for {file}: expected {expected}, got {actual}")]
    HashMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the artifact store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("unsupported storage scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("source not found: {0}")]
    NotFound(PathBuf),
    #[error("unit '{0}' has not been saved; call save before upload")]
    NotSaved(String),
    #[error("no artifact store configured for this runtime")]
    NotConfigured,
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transfer task failed: {0}")]
    Task(String),
}

/// Errors translating payloads to and from a wire protocol.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("payload has no tensors")]
    EmptyPayload,
    #[error("tensor '{name}': shape {shape:?} needs {expected} elements, got {actual}")]
    ShapeMismatch {
        name: String,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("tensor '{name}' contains a non-finite value")]
    NonFinite { name: String },
    #[error("unsupported datatype '{0}'")]
    UnsupportedDType(String),
    #[error("tensor '{name}' is ragged or mixes element types")]
    Ragged { name: String },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors provisioning backend resources.
#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    #[error("no serving image or implementation for '{0}'")]
    MissingImage(String),
    #[error("unit '{0}' must be uploaded before cluster deployment")]
    NotUploaded(String),
    #[error("artifact folder {0} does not exist")]
    MissingArtifacts(PathBuf),
    #[error("'{0}' is not a valid resource name (lowercase alphanumerics and '-', max 63)")]
    InvalidName(String),
    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(String),
    #[error("container engine error: {0}")]
    Engine(String),
    #[error("cluster API error: {0}")]
    Cluster(String),
    #[error("unit '{name}' failed: {reason}")]
    Failed { name: String, reason: String },
    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Errors tearing down backend resources.
#[derive(Debug, thiserror::Error)]
pub enum UndeployError {
    #[error("backend refused to remove '{name}': {reason}")]
    Backend { name: String, reason: String },
    #[error("unexpected backend state for '{name}': {state}")]
    UnexpectedState { name: String, state: String },
}

/// Errors in how units are bound to runtimes and composed.
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("unit '{0}' has no runtime bound")]
    Unbound(String),
    #[error("unit '{0}' is bound to a different runtime")]
    RuntimeMismatch(String),
    #[error("cannot rebind '{name}' while {state:?}; undeploy first")]
    Rebind { name: String, state: UnitState },
    #[error("pipeline '{pipeline}' has no child '{alias}'")]
    UnknownChild { pipeline: String, alias: String },
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("two different units share the name '{0}'")]
    DuplicateName(String),
}

/// Top-level error.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("packaging error: {0}")]
    Packaging(#[from] PackagingError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("deployment error: {0}")]
    Deployment(#[from] DeploymentError),
    #[error("undeploy error: {0}")]
    Undeploy(#[from] UndeployError),
    #[error("binding error: {0}")]
    Binding(#[from] BindingError),
    #[error("timed out after {timeout:?} waiting for '{name}' to become ready")]
    Timeout { name: String, timeout: Duration },
    #[error("unit '{name}' is not ready (state: {state:?})")]
    NotReady { name: String, state: UnitState },
    #[error("remote call to '{name}' failed: {reason}")]
    Invocation { name: String, reason: String },
    #[error("pipeline '{name}' failed: {reason}")]
    Logic { name: String, reason: String },
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ComposeError>;
