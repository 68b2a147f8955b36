//! Backend runtimes: save, upload, deploy, wait-until-ready, predict and
//! undeploy, over a local container engine or a cluster.
//!
//! Operations on a unit tree walk its [`DeploymentPlan`]. Every unit in
//! the tree is handled by the runtime it is bound to, so a pipeline on one
//! backend can call models on another.

pub mod cluster;
pub mod container;
pub mod plan;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{Endpoint, EndpointClient};
use crate::error::{BindingError, ComposeError, DeploymentError, PackagingError, Result, StorageError};
use crate::metadata::write_artifacts;
use crate::payload::{InferenceRequest, InferenceResponse};
use crate::storage::ArtifactStore;
use crate::unit::{ComputeUnit, UnitState};

pub use cluster::{ClusterApi, ClusterConfig, ClusterRuntime, WorkloadStatus};
pub use container::{
    ContainerConfig, ContainerEngine, ContainerInfo, ContainerRuntime, ContainerSpec,
    ContainerStatus, Mount,
};
pub use plan::DeploymentPlan;

/// Options shared by every runtime variant.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Delay between readiness probes (default: 250 ms).
    pub poll_interval: Duration,
    /// How long `deploy` waits for each dependency to become ready
    /// (default: 120 seconds).
    pub dependency_timeout: Duration,
    /// Timeout for a single HTTP request (default: 30 seconds).
    pub request_timeout: Duration,
    /// Store used by `upload`. `None` makes `upload` fail.
    pub artifact_store: Option<ArtifactStore>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            dependency_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
            artifact_store: None,
        }
    }
}

impl RuntimeOptions {
    pub fn with_artifact_store(mut self, store: ArtifactStore) -> Self {
        self.artifact_store = Some(store);
        self
    }
}

/// Backend resource created by `deploy`. Invalid after `undeploy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentHandle {
    pub unit: String,
    /// Container id, or `<namespace>/<name>` on a cluster.
    pub resource_id: String,
    pub endpoint: Endpoint,
    pub created_at: SystemTime,
}

/// Result of one readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Probe {
    Ready,
    Pending,
    Failed(String),
}

/// A backend able to run compute units.
pub enum Runtime {
    LocalContainer(ContainerRuntime),
    Cluster(ClusterRuntime),
}

impl Runtime {
    pub fn local_container(
        config: ContainerConfig,
        engine: Arc<dyn ContainerEngine>,
        options: RuntimeOptions,
    ) -> std::result::Result<Arc<Self>, DeploymentError> {
        Ok(Arc::new(Runtime::LocalContainer(ContainerRuntime::new(
            config, engine, options,
        )?)))
    }

    /// Local containers through the `docker` CLI.
    #[cfg(feature = "docker")]
    pub fn docker(
        config: ContainerConfig,
        options: RuntimeOptions,
    ) -> std::result::Result<Arc<Self>, DeploymentError> {
        Self::local_container(config, Arc::new(container::DockerCli::default()), options)
    }

    pub fn cluster(
        config: ClusterConfig,
        api: Arc<dyn ClusterApi>,
        options: RuntimeOptions,
    ) -> std::result::Result<Arc<Self>, DeploymentError> {
        Ok(Arc::new(Runtime::Cluster(ClusterRuntime::new(
            config, api, options,
        )?)))
    }

    /// Cluster runtime talking to Kubernetes with the default kubeconfig.
    #[cfg(feature = "kube")]
    pub async fn kubernetes(
        config: ClusterConfig,
        options: RuntimeOptions,
    ) -> std::result::Result<Arc<Self>, DeploymentError> {
        let api = cluster::KubeClusterApi::try_default().await?;
        Self::cluster(config, Arc::new(api), options)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Runtime::LocalContainer(_) => "local-container",
            Runtime::Cluster(_) => "cluster",
        }
    }

    pub fn options(&self) -> &RuntimeOptions {
        match self {
            Runtime::LocalContainer(c) => &c.options,
            Runtime::Cluster(k) => &k.options,
        }
    }

    fn client(&self) -> &EndpointClient {
        match self {
            Runtime::LocalContainer(c) => c.client(),
            Runtime::Cluster(k) => k.client(),
        }
    }

    /// Current deployment record for a unit name, if any.
    pub fn deployment(&self, name: &str) -> Option<DeploymentHandle> {
        match self {
            Runtime::LocalContainer(c) => c.deployment(name),
            Runtime::Cluster(k) => k.deployment(name),
        }
    }

    /// Register endpoints started elsewhere, e.g. the children handed to a
    /// pipeline container through its environment.
    pub fn adopt_endpoints(&self, endpoints: BTreeMap<String, Endpoint>) {
        match self {
            Runtime::LocalContainer(c) => {
                for (name, endpoint) in endpoints {
                    c.adopt(DeploymentHandle {
                        unit: name.clone(),
                        resource_id: name,
                        endpoint,
                        created_at: SystemTime::now(),
                    });
                }
            }
            // Cluster endpoints are derived from the unit name.
            Runtime::Cluster(_) => {}
        }
    }

    fn ensure_bound(&self, unit: &ComputeUnit) -> std::result::Result<(), BindingError> {
        let bound = unit.bound_runtime()?;
        if std::ptr::eq(Arc::as_ptr(&bound), self) {
            Ok(())
        } else {
            Err(BindingError::RuntimeMismatch(unit.name().to_string()))
        }
    }

    /// Write metadata (and optionally the environment descriptor) into the
    /// folder of `unit` and of every unit it depends on.
    pub async fn save(&self, unit: &ComputeUnit, capture_environment: bool) -> Result<()> {
        self.ensure_bound(unit)?;
        for u in DeploymentPlan::generate(unit).units {
            let folder = u.details().local_folder.clone();
            let metadata = u.metadata();
            let task_folder = folder.clone();
            tokio::task::spawn_blocking(move || {
                write_artifacts(&task_folder, metadata, capture_environment)
            })
            .await
            .map_err(|e| PackagingError::Io {
                path: folder,
                source: std::io::Error::other(e.to_string()),
            })??;
            u.mark_saved();
            info!(unit = %u.name(), capture_environment, "runtime: unit saved");
        }
        Ok(())
    }

    /// Copy every saved folder in the tree to its unit's URI.
    pub async fn upload(&self, unit: &ComputeUnit) -> Result<()> {
        self.ensure_bound(unit)?;
        let store = self
            .options()
            .artifact_store
            .as_ref()
            .ok_or(StorageError::NotConfigured)?;
        for u in DeploymentPlan::generate(unit).units {
            store.upload_unit(u.details()).await?;
            u.mark_uploaded();
        }
        Ok(())
    }

    /// Deploy every dependency that is not ready yet, waiting for each to
    /// pass its readiness check, then provision `unit` itself.
    ///
    /// Calling it on a unit that is already deployed does not create a
    /// second resource.
    pub async fn deploy(&self, unit: &ComputeUnit) -> Result<()> {
        self.ensure_bound(unit)?;
        let plan = DeploymentPlan::generate(unit);

        // Resolve every binding before touching a backend.
        let bound = plan
            .dependencies()
            .iter()
            .map(|dep| dep.bound_runtime().map(|runtime| (dep, runtime)))
            .collect::<std::result::Result<Vec<_>, BindingError>>()?;

        let dependency_timeout = self.options().dependency_timeout;
        for (dep, runtime) in bound {
            match dep.state() {
                UnitState::Ready => continue,
                UnitState::Deployed => {}
                _ => runtime.provision(dep).await?,
            }
            let deadline = Instant::now() + dependency_timeout;
            runtime.await_ready(dep, deadline, dependency_timeout).await?;
        }

        if unit.state().is_live() {
            debug!(unit = %unit.name(), "runtime: already deployed");
            return Ok(());
        }
        self.provision(unit).await
    }

    /// Provision one unit, without its dependencies.
    async fn provision(&self, unit: &ComputeUnit) -> Result<()> {
        let peers = peer_endpoints(unit)?;
        let handle = match self {
            Runtime::LocalContainer(c) => c.provision(unit, &peers).await?,
            Runtime::Cluster(k) => k.provision(unit, &peers).await?,
        };
        unit.set_state(UnitState::Deployed);
        info!(
            unit = %unit.name(),
            runtime = self.kind(),
            resource = %handle.resource_id,
            "runtime: unit deployed"
        );
        Ok(())
    }

    /// Endpoint other units should use to reach `unit`.
    fn peer_endpoint(&self, unit: &ComputeUnit) -> Option<Endpoint> {
        match self {
            Runtime::LocalContainer(c) => c.peer_endpoint(unit),
            Runtime::Cluster(k) => Some(k.endpoint(unit)),
        }
    }

    async fn probe(&self, unit: &ComputeUnit) -> std::result::Result<Probe, DeploymentError> {
        match self {
            Runtime::LocalContainer(c) => c.probe(unit).await,
            Runtime::Cluster(k) => k.probe(unit).await,
        }
    }

    /// Poll one unit until it is ready, it fails, or `deadline` passes.
    async fn await_ready(
        &self,
        unit: &ComputeUnit,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        match tokio::time::timeout_at(deadline, self.poll_until_ready(unit)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(unit = %unit.name(), ?timeout, "runtime: readiness timed out");
                return Err(ComposeError::Timeout {
                    name: unit.name().to_string(),
                    timeout,
                });
            }
        }
        unit.set_state(UnitState::Ready);
        info!(
            unit = %unit.name(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "runtime: unit ready"
        );
        Ok(())
    }

    async fn poll_until_ready(&self, unit: &ComputeUnit) -> Result<()> {
        let poll_interval = self.options().poll_interval;
        loop {
            match self.probe(unit).await? {
                Probe::Ready => return Ok(()),
                Probe::Pending => tokio::time::sleep(poll_interval).await,
                Probe::Failed(reason) => {
                    return Err(DeploymentError::Failed {
                        name: unit.name().to_string(),
                        reason,
                    }
                    .into());
                }
            }
        }
    }

    /// Wait until `unit` and all its dependencies pass their readiness
    /// checks. `timeout` bounds the whole wait.
    pub async fn wait_ready(&self, unit: &ComputeUnit, timeout: Duration) -> Result<()> {
        self.ensure_bound(unit)?;
        let deadline = Instant::now() + timeout;
        for u in DeploymentPlan::generate(unit).units {
            match u.state() {
                UnitState::Ready => continue,
                UnitState::Deployed => {}
                state => {
                    return Err(ComposeError::NotReady {
                        name: u.name().to_string(),
                        state,
                    });
                }
            }
            u.bound_runtime()?.await_ready(&u, deadline, timeout).await?;
        }
        Ok(())
    }

    /// Tear down `unit` and then its dependencies. Missing resources are
    /// not an error, so calling this twice succeeds.
    pub async fn undeploy(&self, unit: &ComputeUnit) -> Result<()> {
        self.ensure_bound(unit)?;
        let plan = DeploymentPlan::generate(unit);
        for u in plan.teardown_order() {
            let Some(runtime) = u.runtime() else {
                debug!(unit = %u.name(), "runtime: unbound dependency skipped");
                continue;
            };
            let removed = runtime.teardown(u).await?;
            u.set_state(UnitState::Undeployed);
            info!(unit = %u.name(), removed, "runtime: unit undeployed");
        }
        Ok(())
    }

    async fn teardown(
        &self,
        unit: &ComputeUnit,
    ) -> std::result::Result<bool, crate::error::UndeployError> {
        match self {
            Runtime::LocalContainer(c) => c.teardown(unit).await,
            Runtime::Cluster(k) => k.teardown(unit).await,
        }
    }

    /// Call the deployed endpoint of `unit`.
    pub async fn predict(
        &self,
        unit: &ComputeUnit,
        request: InferenceRequest,
    ) -> Result<InferenceResponse> {
        let endpoint = match self {
            Runtime::LocalContainer(c) => {
                c.endpoint(unit.name()).ok_or_else(|| ComposeError::NotReady {
                    name: unit.name().to_string(),
                    state: unit.state(),
                })?
            }
            Runtime::Cluster(k) => k.endpoint(unit),
        };
        self.client().predict(&endpoint, unit.name(), &request).await
    }
}

/// Endpoints of the direct children of `unit`, keyed by unit name.
fn peer_endpoints(unit: &ComputeUnit) -> Result<BTreeMap<String, Endpoint>> {
    let mut peers = BTreeMap::new();
    for dep in unit.dependencies() {
        let runtime = dep.bound_runtime()?;
        let endpoint = runtime
            .peer_endpoint(&dep)
            .ok_or_else(|| ComposeError::NotReady {
                name: dep.name().to_string(),
                state: dep.state(),
            })?;
        peers.insert(dep.name().to_string(), endpoint);
    }
    Ok(peers)
}
