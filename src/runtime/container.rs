//! Local container backend.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::client::{Endpoint, EndpointClient};
use crate::error::{DeploymentError, UndeployError};
use crate::metadata::{is_valid_resource_name, ModelFramework};
use crate::protocol::Protocol;
use crate::runtime::{DeploymentHandle, Probe, RuntimeOptions};
use crate::unit::ComputeUnit;

/// Environment variable carrying a pipeline's child endpoints as JSON.
pub const ENDPOINTS_ENV: &str = "MODEL_COMPOSE_ENDPOINTS";
/// Environment variable naming the unit a container serves.
pub const UNIT_ENV: &str = "MODEL_COMPOSE_UNIT";
/// Environment variable with the port a pipeline container listens on.
pub const PORT_ENV: &str = "MODEL_COMPOSE_PORT";
/// Docker network shared by all containers of a deployment.
pub const DEFAULT_NETWORK: &str = "tempo";
/// Port legacy-protocol servers listen on.
pub const SELDON_PORT: u16 = 9000;
/// Port V2-protocol servers listen on.
pub const V2_PORT: u16 = 8080;

/// Configuration for the local container runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Host interface container ports are published on.
    pub host: String,
    /// Docker network containers join.
    pub network: Option<String>,
    /// Resolve child endpoints by container name on `network` instead of
    /// through published host ports. Turning it off only works for engines
    /// whose containers share the host's loopback.
    pub in_network: bool,
    /// Prepackaged legacy-protocol servers per framework.
    pub seldon_images: BTreeMap<ModelFramework, String>,
    /// Server image for V2-protocol models.
    pub v2_image: String,
    /// Image whose entrypoint serves a pipeline.
    pub pipeline_image: Option<String>,
    pub seldon_port: u16,
    pub v2_port: u16,
    /// Where the unit's artifact folder is mounted inside the container.
    pub mount_path: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            network: Some(DEFAULT_NETWORK.into()),
            in_network: true,
            seldon_images: BTreeMap::from([
                (ModelFramework::SKLearn, "seldonio/sklearnserver:1.11.0".into()),
                (ModelFramework::XGBoost, "seldonio/xgboostserver:1.11.0".into()),
                (ModelFramework::MLFlow, "seldonio/mlflowserver:1.11.0".into()),
            ]),
            v2_image: "seldonio/mlserver:1.2.0".into(),
            pipeline_image: None,
            seldon_port: SELDON_PORT,
            v2_port: V2_PORT,
            mount_path: "/mnt/models".into(),
        }
    }
}

impl ContainerConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn validate(&self) -> Result<(), DeploymentError> {
        if self.host.trim().is_empty() {
            return Err(DeploymentError::InvalidConfig("host is empty".into()));
        }
        if self.seldon_port == 0 || self.v2_port == 0 {
            return Err(DeploymentError::InvalidConfig(
                "container ports must be non-zero".into(),
            ));
        }
        if self.in_network && self.network.is_none() {
            return Err(DeploymentError::InvalidConfig(
                "in_network requires a network".into(),
            ));
        }
        if !self.mount_path.starts_with('/') {
            return Err(DeploymentError::InvalidConfig(format!(
                "mount path '{}' is not absolute",
                self.mount_path
            )));
        }
        Ok(())
    }

    pub fn port_for(&self, protocol: Protocol) -> u16 {
        match protocol {
            Protocol::Seldon => self.seldon_port,
            Protocol::V2 => self.v2_port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything an engine needs to start one unit's container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Container name; equal to the unit name.
    pub name: String,
    pub image: String,
    /// Port the server listens on inside the container.
    pub port: u16,
    /// Host interface the port is published on.
    pub publish_host: String,
    pub network: Option<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub labels: BTreeMap<String, String>,
}

/// A started container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    /// Host port the container's server port was published on.
    pub host_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Starting,
    Running,
    Exited { code: Option<i32> },
    Missing,
}

/// Backend that starts and stops containers.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerInfo, DeploymentError>;

    async fn status(&self, name: &str) -> Result<ContainerStatus, DeploymentError>;

    /// Force-remove a container. `Ok(false)` if it did not exist.
    async fn remove(&self, name: &str) -> Result<bool, UndeployError>;
}

pub struct ContainerRuntime {
    config: ContainerConfig,
    engine: Arc<dyn ContainerEngine>,
    client: EndpointClient,
    pub(crate) options: RuntimeOptions,
    deployments: Mutex<BTreeMap<String, DeploymentHandle>>,
}

impl ContainerRuntime {
    pub fn new(
        config: ContainerConfig,
        engine: Arc<dyn ContainerEngine>,
        options: RuntimeOptions,
    ) -> Result<Self, DeploymentError> {
        config.validate()?;
        let client = EndpointClient::new(options.request_timeout)?;
        Ok(Self {
            config,
            engine,
            client,
            options,
            deployments: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub(crate) fn client(&self) -> &EndpointClient {
        &self.client
    }

    pub(crate) fn deployment(&self, name: &str) -> Option<DeploymentHandle> {
        self.deployments.lock().get(name).cloned()
    }

    pub(crate) fn adopt(&self, handle: DeploymentHandle) {
        self.deployments.lock().insert(handle.unit.clone(), handle);
    }

    /// Host-reachable endpoint of a deployed unit.
    pub(crate) fn endpoint(&self, name: &str) -> Option<Endpoint> {
        self.deployments.lock().get(name).map(|h| h.endpoint.clone())
    }

    /// Endpoint another container should use to reach `unit`.
    pub(crate) fn peer_endpoint(&self, unit: &ComputeUnit) -> Option<Endpoint> {
        if self.config.in_network {
            let port = self.config.port_for(unit.protocol());
            return Some(Endpoint::new(
                format!("http://{}:{port}", unit.name()),
                unit.protocol(),
            ));
        }
        self.endpoint(unit.name())
    }

    pub fn container_spec(
        &self,
        unit: &ComputeUnit,
        peers: &BTreeMap<String, Endpoint>,
    ) -> Result<ContainerSpec, DeploymentError> {
        let details = unit.details();
        if !is_valid_resource_name(&details.name) {
            return Err(DeploymentError::InvalidName(details.name.clone()));
        }
        if !details.local_folder.is_dir() {
            return Err(DeploymentError::MissingArtifacts(details.local_folder.clone()));
        }
        // Docker reads a relative bind source as a volume name.
        let source = std::fs::canonicalize(&details.local_folder)
            .map_err(|_| DeploymentError::MissingArtifacts(details.local_folder.clone()))?;

        let protocol = details.protocol;
        let port = self.config.port_for(protocol);
        let mount_path = self.config.mount_path.clone();
        let mut env = BTreeMap::new();

        let image = match unit {
            ComputeUnit::Model(model) => {
                let platform = model.platform();
                match protocol {
                    Protocol::Seldon => {
                        let params = json!([{
                            "name": "model_uri",
                            "value": mount_path,
                            "type": "STRING",
                        }]);
                        env.insert("PREDICTIVE_UNIT_PARAMETERS".into(), params.to_string());
                        env.insert("PREDICTIVE_UNIT_SERVICE_PORT".into(), port.to_string());
                        env.insert("PREDICTIVE_UNIT_HTTP_SERVICE_PORT".into(), port.to_string());
                        env.insert("PREDICTIVE_UNIT_ID".into(), details.name.clone());
                        self.config.seldon_images.get(&platform).cloned()
                    }
                    Protocol::V2 => platform.mlserver_runtime().map(|implementation| {
                        env.insert("MLSERVER_HTTP_PORT".into(), port.to_string());
                        env.insert("MLSERVER_MODEL_NAME".into(), details.name.clone());
                        env.insert("MLSERVER_MODEL_IMPLEMENTATION".into(), implementation.into());
                        env.insert("MLSERVER_MODEL_URI".into(), mount_path.clone());
                        self.config.v2_image.clone()
                    }),
                }
            }
            ComputeUnit::Pipeline(_) => {
                let endpoints = serde_json::to_string(peers)
                    .map_err(|e| DeploymentError::InvalidConfig(e.to_string()))?;
                env.insert(ENDPOINTS_ENV.into(), endpoints);
                env.insert(UNIT_ENV.into(), details.name.clone());
                env.insert(PORT_ENV.into(), port.to_string());
                self.config.pipeline_image.clone()
            }
        }
        .ok_or_else(|| DeploymentError::MissingImage(details.name.clone()))?;

        Ok(ContainerSpec {
            name: details.name.clone(),
            image,
            port,
            publish_host: self.config.host.clone(),
            network: self.config.network.clone(),
            env,
            mounts: vec![Mount {
                source,
                target: mount_path,
                read_only: true,
            }],
            labels: BTreeMap::from([
                ("app.kubernetes.io/managed-by".into(), env!("CARGO_PKG_NAME").into()),
                ("model-compose/unit".into(), details.name.clone()),
                ("model-compose/protocol".into(), protocol.to_string()),
            ]),
        })
    }

    pub(crate) async fn provision(
        &self,
        unit: &ComputeUnit,
        peers: &BTreeMap<String, Endpoint>,
    ) -> Result<DeploymentHandle, DeploymentError> {
        let spec = self.container_spec(unit, peers)?;

        // Clear a leftover container with the same name.
        let stale = self
            .engine
            .remove(&spec.name)
            .await
            .map_err(|e| DeploymentError::Engine(e.to_string()))?;
        if stale {
            debug!(unit = %spec.name, "container: removed stale container");
        }

        let info = self.engine.run(&spec).await?;
        let handle = DeploymentHandle {
            unit: spec.name.clone(),
            resource_id: info.id,
            endpoint: Endpoint::new(
                format!("http://{}:{}", self.config.host, info.host_port),
                unit.protocol(),
            ),
            created_at: SystemTime::now(),
        };
        info!(
            unit = %handle.unit,
            image = %spec.image,
            endpoint = %handle.endpoint.base_url,
            "container: started"
        );
        self.deployments
            .lock()
            .insert(handle.unit.clone(), handle.clone());
        Ok(handle)
    }

    pub(crate) async fn probe(&self, unit: &ComputeUnit) -> Result<Probe, DeploymentError> {
        let Some(endpoint) = self.endpoint(unit.name()) else {
            return Ok(Probe::Failed("no container was started".into()));
        };
        match self.engine.status(unit.name()).await? {
            ContainerStatus::Running => {
                if self.client.is_ready(&endpoint, unit.name()).await {
                    Ok(Probe::Ready)
                } else {
                    Ok(Probe::Pending)
                }
            }
            ContainerStatus::Starting => Ok(Probe::Pending),
            ContainerStatus::Exited { code } => Ok(Probe::Failed(match code {
                Some(code) => format!("container exited with code {code}"),
                None => "container exited".into(),
            })),
            ContainerStatus::Missing => Ok(Probe::Failed("container disappeared".into())),
        }
    }

    /// Remove the unit's container; the deployment record is kept if the
    /// engine refuses.
    pub(crate) async fn teardown(&self, unit: &ComputeUnit) -> Result<bool, UndeployError> {
        let removed = self.engine.remove(unit.name()).await?;
        self.deployments.lock().remove(unit.name());
        Ok(removed)
    }
}

#[cfg(feature = "docker")]
pub use docker::DockerCli;

#[cfg(feature = "docker")]
mod docker {
    use super::*;
    use tokio::process::Command;

    /// [`ContainerEngine`] driving the `docker` CLI.
    pub struct DockerCli {
        binary: String,
    }

    impl Default for DockerCli {
        fn default() -> Self {
            Self::new("docker")
        }
    }

    impl DockerCli {
        pub fn new(binary: impl Into<String>) -> Self {
            Self {
                binary: binary.into(),
            }
        }

        async fn exec(&self, args: &[String]) -> Result<(bool, String, String), std::io::Error> {
            let output = Command::new(&self.binary).args(args).output().await?;
            Ok((
                output.status.success(),
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }

        /// Create the network unless it already exists.
        async fn ensure_network(&self, network: &str) -> Result<(), DeploymentError> {
            let engine_err = |e: std::io::Error| DeploymentError::Engine(e.to_string());
            let inspect = vec!["network".to_string(), "inspect".into(), network.to_string()];
            let (exists, _, _) = self.exec(&inspect).await.map_err(engine_err)?;
            if exists {
                return Ok(());
            }
            let create = vec!["network".to_string(), "create".into(), network.to_string()];
            let (ok, _, stderr) = self.exec(&create).await.map_err(engine_err)?;
            // Lost a race with another deployment creating it.
            if ok || stderr.contains("already exists") {
                debug!(network, "docker: network ready");
                return Ok(());
            }
            Err(DeploymentError::Engine(stderr))
        }
    }

    pub(crate) fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
            "-p".into(),
            format!("{}::{}", spec.publish_host, spec.port),
        ];
        if let Some(network) = &spec.network {
            args.extend(["--network".into(), network.clone()]);
        }
        for (k, v) in &spec.labels {
            args.extend(["--label".into(), format!("{k}={v}")]);
        }
        for (k, v) in &spec.env {
            args.extend(["-e".into(), format!("{k}={v}")]);
        }
        for m in &spec.mounts {
            let mode = if m.read_only { ":ro" } else { "" };
            args.extend([
                "-v".into(),
                format!("{}:{}{mode}", m.source.display(), m.target),
            ]);
        }
        args.push(spec.image.clone());
        args
    }

    /// Last `host:port` line printed by `docker port`.
    pub(crate) fn parse_host_port(output: &str) -> Option<u16> {
        output
            .lines()
            .filter_map(|line| line.trim().rsplit_once(':'))
            .filter_map(|(_, port)| port.parse().ok())
            .last()
    }

    fn is_missing(stderr: &str) -> bool {
        stderr.contains("No such container") || stderr.contains("No such object")
    }

    fn is_removing(stderr: &str) -> bool {
        stderr.contains("removal of container") && stderr.contains("already in progress")
    }

    #[async_trait]
    impl ContainerEngine for DockerCli {
        async fn run(&self, spec: &ContainerSpec) -> Result<ContainerInfo, DeploymentError> {
            if let Some(network) = &spec.network {
                self.ensure_network(network).await?;
            }
            let engine_err = |e: std::io::Error| DeploymentError::Engine(e.to_string());
            let (ok, id, stderr) = self.exec(&run_args(spec)).await.map_err(engine_err)?;
            if !ok {
                return Err(DeploymentError::Engine(stderr));
            }

            let port_args = vec![
                "port".to_string(),
                spec.name.clone(),
                format!("{}/tcp", spec.port),
            ];
            let (ok, out, stderr) = self.exec(&port_args).await.map_err(engine_err)?;
            if !ok {
                return Err(DeploymentError::Engine(stderr));
            }
            let host_port = parse_host_port(&out).ok_or_else(|| {
                DeploymentError::Engine(format!("cannot parse published port from '{out}'"))
            })?;
            Ok(ContainerInfo { id, host_port })
        }

        async fn status(&self, name: &str) -> Result<ContainerStatus, DeploymentError> {
            let args = vec![
                "inspect".to_string(),
                "--format".into(),
                "{{.State.Status}} {{.State.ExitCode}}".into(),
                name.to_string(),
            ];
            let (ok, out, stderr) = self
                .exec(&args)
                .await
                .map_err(|e| DeploymentError::Engine(e.to_string()))?;
            if !ok {
                if is_missing(&stderr) {
                    return Ok(ContainerStatus::Missing);
                }
                return Err(DeploymentError::Engine(stderr));
            }
            let mut parts = out.split_whitespace();
            let state = parts.next().unwrap_or_default();
            let code = parts.next().and_then(|c| c.parse().ok());
            Ok(match state {
                "running" => ContainerStatus::Running,
                "created" | "restarting" => ContainerStatus::Starting,
                _ => ContainerStatus::Exited { code },
            })
        }

        async fn remove(&self, name: &str) -> Result<bool, UndeployError> {
            let args = vec!["rm".to_string(), "-f".into(), name.to_string()];
            let (ok, _, stderr) = self.exec(&args).await.map_err(|e| UndeployError::Backend {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
            if ok {
                return Ok(true);
            }
            if is_missing(&stderr) {
                return Ok(false);
            }
            if is_removing(&stderr) {
                return Err(UndeployError::UnexpectedState {
                    name: name.to_string(),
                    state: "removal in progress".into(),
                });
            }
            Err(UndeployError::Backend {
                name: name.to_string(),
                reason: stderr,
            })
        }
    }

}
