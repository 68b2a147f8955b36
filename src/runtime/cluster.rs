//! Cluster backend: units become `SeldonDeployment` resources reached
//! through the cluster's ingress gateway.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::client::{BearerToken, Endpoint, EndpointClient};
use crate::error::{DeploymentError, UndeployError};
use crate::metadata::is_valid_resource_name;
use crate::protocol::Protocol;
use crate::runtime::container::{ENDPOINTS_ENV, PORT_ENV, SELDON_PORT, UNIT_ENV, V2_PORT};
use crate::runtime::{DeploymentHandle, Probe, RuntimeOptions};
use crate::unit::ComputeUnit;

pub const SELDON_API_VERSION: &str = "machinelearning.seldon.io/v1";
pub const SELDON_KIND: &str = "SeldonDeployment";

/// Namespace, credentials and gateway consumed by the cluster runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub namespace: String,
    /// Ingress gateway base URL, e.g. `http://localhost:8003`.
    pub gateway: String,
    /// Secret holding object-storage credentials for the model initializer.
    pub storage_secret: Option<String>,
    pub service_account: Option<String>,
    /// Image whose entrypoint serves a pipeline.
    pub pipeline_image: Option<String>,
    pub replicas: u32,
    /// Sent as `Authorization: Bearer` to the gateway.
    #[serde(skip)]
    pub token: Option<BearerToken>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
            gateway: "http://localhost:8003".into(),
            storage_secret: None,
            service_account: None,
            pipeline_image: None,
            replicas: 1,
            token: None,
        }
    }
}

impl ClusterConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_token(mut self, token: BearerToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn validate(&self) -> Result<(), DeploymentError> {
        if !is_valid_resource_name(&self.namespace) {
            return Err(DeploymentError::InvalidConfig(format!(
                "namespace '{}' is not a DNS-1123 label",
                self.namespace
            )));
        }
        if !(self.gateway.starts_with("http://") || self.gateway.starts_with("https://")) {
            return Err(DeploymentError::InvalidConfig(format!(
                "gateway '{}' must be an http(s) URL",
                self.gateway
            )));
        }
        if self.replicas == 0 {
            return Err(DeploymentError::InvalidConfig("replicas must be at least 1".into()));
        }
        Ok(())
    }

    /// `<gateway>/seldon/<namespace>/<name>`
    pub fn endpoint_url(&self, name: &str) -> String {
        format!(
            "{}/seldon/{}/{name}",
            self.gateway.trim_end_matches('/'),
            self.namespace
        )
    }
}

/// Workload state reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadStatus {
    Available,
    Creating,
    Failed(String),
    Missing,
}

/// Cluster control plane operations on `SeldonDeployment` resources.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create or update the resource described by `manifest`.
    async fn apply(&self, namespace: &str, manifest: &Value) -> Result<(), DeploymentError>;

    async fn status(&self, namespace: &str, name: &str) -> Result<WorkloadStatus, DeploymentError>;

    /// Delete the resource. `Ok(false)` if it did not exist.
    async fn delete(&self, namespace: &str, name: &str) -> Result<bool, UndeployError>;
}

/// Read `status.state` / `status.description` of a SeldonDeployment.
pub fn workload_status(resource: &Value) -> WorkloadStatus {
    let status = &resource["status"];
    match status["state"].as_str() {
        Some("Available") => WorkloadStatus::Available,
        Some("Failed") => WorkloadStatus::Failed(
            status["description"]
                .as_str()
                .unwrap_or("deployment failed")
                .to_string(),
        ),
        _ => WorkloadStatus::Creating,
    }
}

/// Build the `SeldonDeployment` for one unit.
///
/// Models use the prepackaged server for their framework and pull the
/// artifacts from the unit's URI. Pipelines run `pipeline_image` with
/// their children's endpoints in the environment.
pub fn seldon_deployment(
    unit: &ComputeUnit,
    config: &ClusterConfig,
    peers: &BTreeMap<String, Endpoint>,
) -> Result<Value, DeploymentError> {
    let details = unit.details();
    let name = details.name.as_str();

    let mut graph = json!({
        "name": name,
        "type": "MODEL",
        "modelUri": details.uri.to_string(),
        "children": [],
    });
    if let Some(secret) = &config.storage_secret {
        graph["envSecretRefName"] = json!(secret);
    }
    if let Some(account) = &config.service_account {
        graph["serviceAccountName"] = json!(account);
    }

    let mut predictor = json!({
        "name": "default",
        "replicas": config.replicas,
    });

    match unit {
        ComputeUnit::Model(model) => {
            let implementation = model
                .platform()
                .seldon_implementation()
                .ok_or_else(|| DeploymentError::MissingImage(name.to_string()))?;
            graph["implementation"] = json!(implementation);
        }
        ComputeUnit::Pipeline(_) => {
            let image = config
                .pipeline_image
                .as_ref()
                .ok_or_else(|| DeploymentError::MissingImage(name.to_string()))?;
            let endpoints = serde_json::to_string(peers)
                .map_err(|e| DeploymentError::InvalidConfig(e.to_string()))?;
            let port = match details.protocol {
                Protocol::Seldon => SELDON_PORT,
                Protocol::V2 => V2_PORT,
            };
            predictor["componentSpecs"] = json!([{
                "spec": {
                    "containers": [{
                        "name": name,
                        "image": image,
                        "env": [
                            { "name": ENDPOINTS_ENV, "value": endpoints },
                            { "name": UNIT_ENV, "value": name },
                            { "name": PORT_ENV, "value": port.to_string() },
                        ],
                    }],
                },
            }]);
        }
    }
    predictor["graph"] = graph;

    Ok(json!({
        "apiVersion": SELDON_API_VERSION,
        "kind": SELDON_KIND,
        "metadata": {
            "name": name,
            "namespace": config.namespace,
            "labels": {
                "app.kubernetes.io/managed-by": env!("CARGO_PKG_NAME"),
                "model-compose/unit": name,
            },
        },
        "spec": {
            "protocol": details.protocol.cluster_protocol(),
            "predictors": [predictor],
        },
    }))
}

pub struct ClusterRuntime {
    config: ClusterConfig,
    api: Arc<dyn ClusterApi>,
    client: EndpointClient,
    pub(crate) options: RuntimeOptions,
    deployments: Mutex<BTreeMap<String, DeploymentHandle>>,
}

impl ClusterRuntime {
    pub fn new(
        config: ClusterConfig,
        api: Arc<dyn ClusterApi>,
        options: RuntimeOptions,
    ) -> Result<Self, DeploymentError> {
        config.validate()?;
        let client = EndpointClient::new(options.request_timeout)?.with_token(config.token.clone());
        Ok(Self {
            config,
            api,
            client,
            options,
            deployments: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub(crate) fn client(&self) -> &EndpointClient {
        &self.client
    }

    pub(crate) fn deployment(&self, name: &str) -> Option<DeploymentHandle> {
        self.deployments.lock().get(name).cloned()
    }

    /// Gateway route of a unit; derivable without a deployment record.
    pub(crate) fn endpoint(&self, unit: &ComputeUnit) -> Endpoint {
        Endpoint::new(self.config.endpoint_url(unit.name()), unit.protocol())
    }

    pub(crate) async fn provision(
        &self,
        unit: &ComputeUnit,
        peers: &BTreeMap<String, Endpoint>,
    ) -> Result<DeploymentHandle, DeploymentError> {
        let name = unit.name();
        if !is_valid_resource_name(name) {
            return Err(DeploymentError::InvalidName(name.to_string()));
        }
        if !unit.is_uploaded() {
            return Err(DeploymentError::NotUploaded(name.to_string()));
        }

        let manifest = seldon_deployment(unit, &self.config, peers)?;
        self.api.apply(&self.config.namespace, &manifest).await?;

        let handle = DeploymentHandle {
            unit: name.to_string(),
            resource_id: format!("{}/{name}", self.config.namespace),
            endpoint: self.endpoint(unit),
            created_at: SystemTime::now(),
        };
        info!(
            unit = %name,
            namespace = %self.config.namespace,
            endpoint = %handle.endpoint.base_url,
            "cluster: workload applied"
        );
        self.deployments
            .lock()
            .insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    pub(crate) async fn probe(&self, unit: &ComputeUnit) -> Result<Probe, DeploymentError> {
        match self.api.status(&self.config.namespace, unit.name()).await? {
            WorkloadStatus::Available => {
                if self.client.is_ready(&self.endpoint(unit), unit.name()).await {
                    Ok(Probe::Ready)
                } else {
                    Ok(Probe::Pending)
                }
            }
            WorkloadStatus::Creating => Ok(Probe::Pending),
            WorkloadStatus::Failed(reason) => Ok(Probe::Failed(reason)),
            WorkloadStatus::Missing => Ok(Probe::Failed("workload not found".into())),
        }
    }

    pub(crate) async fn teardown(&self, unit: &ComputeUnit) -> Result<bool, UndeployError> {
        let removed = self.api.delete(&self.config.namespace, unit.name()).await?;
        self.deployments.lock().remove(unit.name());
        Ok(removed)
    }
}

#[cfg(feature = "kube")]
pub use kubernetes::KubeClusterApi;

#[cfg(feature = "kube")]
mod kubernetes {
    use super::*;
    use kube::api::{
        Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams,
    };

    const FIELD_MANAGER: &str = "model-compose";

    /// [`ClusterApi`] over the Kubernetes API using server-side apply.
    pub struct KubeClusterApi {
        client: kube::Client,
        resource: ApiResource,
    }

    impl KubeClusterApi {
        pub fn new(client: kube::Client) -> Self {
            let gvk = GroupVersionKind::gvk("machinelearning.seldon.io", "v1", SELDON_KIND);
            Self {
                client,
                resource: ApiResource::from_gvk(&gvk),
            }
        }

        /// Client from the local kubeconfig or in-cluster environment.
        pub async fn try_default() -> Result<Self, DeploymentError> {
            let client = kube::Client::try_default()
                .await
                .map_err(|e| DeploymentError::Cluster(e.to_string()))?;
            Ok(Self::new(client))
        }

        fn api(&self, namespace: &str) -> Api<DynamicObject> {
            Api::namespaced_with(self.client.clone(), namespace, &self.resource)
        }
    }

    #[async_trait]
    impl ClusterApi for KubeClusterApi {
        async fn apply(&self, namespace: &str, manifest: &Value) -> Result<(), DeploymentError> {
            let name = manifest["metadata"]["name"].as_str().ok_or_else(|| {
                DeploymentError::Cluster("manifest has no metadata.name".into())
            })?;
            let pp = PatchParams::apply(FIELD_MANAGER).force();
            self.api(namespace)
                .patch(name, &pp, &Patch::Apply(manifest))
                .await
                .map_err(|e| DeploymentError::Cluster(e.to_string()))?;
            Ok(())
        }

        async fn status(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<WorkloadStatus, DeploymentError> {
            let obj = self
                .api(namespace)
                .get_opt(name)
                .await
                .map_err(|e| DeploymentError::Cluster(e.to_string()))?;
            Ok(match obj {
                Some(obj) => workload_status(&obj.data),
                None => WorkloadStatus::Missing,
            })
        }

        async fn delete(&self, namespace: &str, name: &str) -> Result<bool, UndeployError> {
            match self.api(namespace).delete(name, &DeleteParams::default()).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
                Err(e) => Err(UndeployError::Backend {
                    name: name.to_string(),
                    reason: e.to_string(),
                }),
            }
        }
    }
}
