pub mod client;
pub mod error;
pub mod executor;
pub mod metadata;
pub mod payload;
pub mod protocol;
pub mod runtime;
pub mod serve;
pub mod storage;
pub mod tensor;
pub mod unit;

pub use client::{BearerToken, Endpoint, EndpointClient};
pub use error::{
    BindingError, ComposeError, DeploymentError, EncodingError, PackagingError, Result,
    StorageError, UndeployError,
};
pub use executor::{InferenceHandler, LogicFn, PipelineLogic};
pub use metadata::{
    EnvironmentDescriptor, EnvironmentSpec, ModelFramework, UnitDetails, UnitKind, UnitMetadata,
};
pub use payload::{InferenceRequest, InferenceResponse};
pub use protocol::Protocol;
#[cfg(feature = "kube")]
pub use runtime::cluster::KubeClusterApi;
#[cfg(feature = "docker")]
pub use runtime::container::DockerCli;
pub use runtime::{
    ClusterApi, ClusterConfig, ContainerConfig, ContainerEngine, DeploymentHandle,
    DeploymentPlan, Runtime, RuntimeOptions,
};
pub use storage::{ArtifactStore, FsObjectStore, ObjectStore, StorageConfig, StorageUri};
pub use tensor::{DType, Tensor, TensorData};
pub use unit::{ComputeUnit, Model, Pipeline, PipelineModels, UnitState};
