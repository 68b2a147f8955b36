#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use model_compose::runtime::{ContainerInfo, ContainerSpec, ContainerStatus, WorkloadStatus};
use model_compose::serve::{handle_predict, handle_ready, serve};
use model_compose::{
    ClusterApi, ComposeError, ComputeUnit, ContainerConfig, ContainerEngine, DeploymentError,
    InferenceHandler, InferenceRequest, InferenceResponse, Model, ModelFramework, Pipeline,
    PipelineLogic, PipelineModels, Protocol, Result, RuntimeOptions, Tensor, UndeployError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Ready,
    Removed,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub unit: String,
    pub kind: EventKind,
    pub at: Instant,
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

fn record(log: &EventLog, unit: &str, kind: EventKind) {
    log.lock().push(Event {
        unit: unit.to_string(),
        kind,
        at: Instant::now(),
    });
}

pub fn first_event(log: &EventLog, unit: &str, kind: EventKind) -> Option<Instant> {
    log.lock()
        .iter()
        .find(|e| e.unit == unit && e.kind == kind)
        .map(|e| e.at)
}

pub fn count_events(log: &EventLog, unit: &str, kind: EventKind) -> usize {
    log.lock()
        .iter()
        .filter(|e| e.unit == unit && e.kind == kind)
        .count()
}

/// Handler wrapper that reports ready only after `delay` and logs the
/// first successful readiness check.
struct Tracked {
    inner: Arc<dyn InferenceHandler>,
    started: Instant,
    delay: Option<Duration>,
    log: EventLog,
    reported: Mutex<bool>,
}

#[async_trait]
impl InferenceHandler for Tracked {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn ready(&self) -> bool {
        let Some(delay) = self.delay else {
            return false;
        };
        if self.started.elapsed() < delay || !self.inner.ready().await {
            return false;
        }
        let mut reported = self.reported.lock();
        if !*reported {
            *reported = true;
            record(&self.log, self.inner.name(), EventKind::Ready);
        }
        true
    }

    async fn predict(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        self.inner.predict(request).await
    }
}

/// Container engine running each "container" as an in-process axum server.
#[derive(Default)]
pub struct InProcessEngine {
    handlers: Mutex<HashMap<String, Arc<dyn InferenceHandler>>>,
    ready_delays: Mutex<HashMap<String, Duration>>,
    never_ready: Mutex<HashSet<String>>,
    crashing: Mutex<HashSet<String>>,
    stuck: Mutex<HashSet<String>>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
    pub specs: Mutex<Vec<ContainerSpec>>,
    pub events: EventLog,
}

impl InProcessEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `handler` for containers named `name`.
    pub fn register(&self, name: &str, handler: Arc<dyn InferenceHandler>) {
        self.handlers.lock().insert(name.to_string(), handler);
    }

    pub fn set_ready_delay(&self, name: &str, delay: Duration) {
        self.ready_delays.lock().insert(name.to_string(), delay);
    }

    pub fn never_ready(&self, name: &str) {
        self.never_ready.lock().insert(name.to_string());
    }

    /// The container exits right after starting.
    pub fn crash_on_start(&self, name: &str) {
        self.crashing.lock().insert(name.to_string());
    }

    /// Removing the container fails until [`Self::release`] is called.
    pub fn fail_remove(&self, name: &str) {
        self.stuck.lock().insert(name.to_string());
    }

    pub fn release(&self, name: &str) {
        self.stuck.lock().remove(name);
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.lock().contains_key(name)
    }

    pub fn spec_for(&self, name: &str) -> Option<ContainerSpec> {
        self.specs.lock().iter().rev().find(|s| s.name == name).cloned()
    }
}

#[async_trait]
impl ContainerEngine for InProcessEngine {
    async fn run(&self, spec: &ContainerSpec) -> std::result::Result<ContainerInfo, DeploymentError> {
        if self.running.lock().contains_key(&spec.name) {
            return Err(DeploymentError::Engine(format!(
                "container name '{}' already in use",
                spec.name
            )));
        }
        let inner = self
            .handlers
            .lock()
            .get(&spec.name)
            .cloned()
            .ok_or_else(|| DeploymentError::Engine(format!("no image for '{}'", spec.name)))?;

        let delay = if self.never_ready.lock().contains(&spec.name) {
            None
        } else {
            Some(
                self.ready_delays
                    .lock()
                    .get(&spec.name)
                    .copied()
                    .unwrap_or_default(),
            )
        };
        let tracked = Arc::new(Tracked {
            inner,
            started: Instant::now(),
            delay,
            log: self.events.clone(),
            reported: Mutex::new(false),
        });

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| DeploymentError::Engine(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| DeploymentError::Engine(e.to_string()))?
            .port();
        let task = tokio::spawn(async move {
            let _ = serve(tracked, listener).await;
        });

        record(&self.events, &spec.name, EventKind::Created);
        self.specs.lock().push(spec.clone());
        self.running.lock().insert(spec.name.clone(), task);
        Ok(ContainerInfo {
            id: format!("fake-{}", spec.name),
            host_port: port,
        })
    }

    async fn status(&self, name: &str) -> std::result::Result<ContainerStatus, DeploymentError> {
        if !self.running.lock().contains_key(name) {
            return Ok(ContainerStatus::Missing);
        }
        if self.crashing.lock().contains(name) {
            return Ok(ContainerStatus::Exited { code: Some(1) });
        }
        Ok(ContainerStatus::Running)
    }

    async fn remove(&self, name: &str) -> std::result::Result<bool, UndeployError> {
        if self.stuck.lock().contains(name) {
            return Err(UndeployError::Backend {
                name: name.to_string(),
                reason: "device or resource busy".into(),
            });
        }
        match self.running.lock().remove(name) {
            Some(task) => {
                task.abort();
                record(&self.events, name, EventKind::Removed);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

struct Workload {
    manifest: Value,
}

/// In-memory cluster with an HTTP gateway routing
/// `/seldon/<ns>/<name>/...` to registered handlers.
pub struct FakeCluster {
    pub gateway: String,
    handlers: Mutex<HashMap<String, Arc<dyn InferenceHandler>>>,
    workloads: Mutex<HashMap<(String, String), Workload>>,
    failing: Mutex<HashMap<String, String>>,
    finalized: Mutex<HashSet<String>>,
    pub events: EventLog,
}

impl FakeCluster {
    pub async fn start() -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cluster = Arc::new(Self {
            gateway: format!("http://{addr}"),
            handlers: Mutex::new(HashMap::new()),
            workloads: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashMap::new()),
            finalized: Mutex::new(HashSet::new()),
            events: EventLog::default(),
        });
        let app = Router::new()
            .route("/seldon/:ns/:name/*rest", get(gateway_get).post(gateway_post))
            .with_state(cluster.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        cluster
    }

    pub fn register(&self, name: &str, handler: Arc<dyn InferenceHandler>) {
        self.handlers.lock().insert(name.to_string(), handler);
    }

    /// The workload reports `Failed` once applied.
    pub fn fail_workload(&self, name: &str, reason: &str) {
        self.failing
            .lock()
            .insert(name.to_string(), reason.to_string());
    }

    /// Deleting the workload is refused, as if a finalizer were pending.
    pub fn block_delete(&self, name: &str) {
        self.finalized.lock().insert(name.to_string());
    }

    pub fn manifest(&self, namespace: &str, name: &str) -> Option<Value> {
        self.workloads
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .map(|w| w.manifest.clone())
    }

    pub fn workload_count(&self) -> usize {
        self.workloads.lock().len()
    }

    fn handler_for(&self, ns: &str, name: &str) -> Option<Arc<dyn InferenceHandler>> {
        if !self
            .workloads
            .lock()
            .contains_key(&(ns.to_string(), name.to_string()))
        {
            return None;
        }
        self.handlers.lock().get(name).cloned()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn apply(
        &self,
        namespace: &str,
        manifest: &Value,
    ) -> std::result::Result<(), DeploymentError> {
        let name = manifest["metadata"]["name"]
            .as_str()
            .ok_or_else(|| DeploymentError::Cluster("manifest without name".into()))?
            .to_string();
        record(&self.events, &name, EventKind::Created);
        self.workloads.lock().insert(
            (namespace.to_string(), name),
            Workload {
                manifest: manifest.clone(),
            },
        );
        Ok(())
    }

    async fn status(
        &self,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<WorkloadStatus, DeploymentError> {
        if !self
            .workloads
            .lock()
            .contains_key(&(namespace.to_string(), name.to_string()))
        {
            return Ok(WorkloadStatus::Missing);
        }
        if let Some(reason) = self.failing.lock().get(name) {
            return Ok(WorkloadStatus::Failed(reason.clone()));
        }
        Ok(WorkloadStatus::Available)
    }

    async fn delete(&self, namespace: &str, name: &str) -> std::result::Result<bool, UndeployError> {
        if self.finalized.lock().contains(name) {
            return Err(UndeployError::Backend {
                name: name.to_string(),
                reason: "finalizer pending".into(),
            });
        }
        let removed = self
            .workloads
            .lock()
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some();
        if removed {
            record(&self.events, name, EventKind::Removed);
        }
        Ok(removed)
    }
}

async fn gateway_get(
    State(cluster): State<Arc<FakeCluster>>,
    UrlPath((ns, name, rest)): UrlPath<(String, String, String)>,
) -> Response {
    let Some(handler) = cluster.handler_for(&ns, &name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let rest = rest.trim_start_matches('/');
    let status = if rest == "health/status" {
        handle_ready(handler.as_ref(), None).await
    } else if let Some(model) = rest
        .strip_prefix("v2/models/")
        .and_then(|r| r.strip_suffix("/ready"))
    {
        handle_ready(handler.as_ref(), Some(model)).await
    } else {
        StatusCode::NOT_FOUND
    };
    status.into_response()
}

async fn gateway_post(
    State(cluster): State<Arc<FakeCluster>>,
    UrlPath((ns, name, rest)): UrlPath<(String, String, String)>,
    body: Bytes,
) -> Response {
    let Some(handler) = cluster.handler_for(&ns, &name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let rest = rest.trim_start_matches('/');
    if rest == "api/v1.0/predictions" {
        return handle_predict(handler.as_ref(), Protocol::Seldon, None, &body).await;
    }
    if let Some(model) = rest
        .strip_prefix("v2/models/")
        .and_then(|r| r.strip_suffix("/infer"))
    {
        return handle_predict(handler.as_ref(), Protocol::V2, Some(model), &body).await;
    }
    StatusCode::NOT_FOUND.into_response()
}

/// Model whose first-class score is the first input value.
pub struct EchoScoreModel {
    pub name: String,
}

#[async_trait]
impl InferenceHandler for EchoScoreModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn predict(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        let score = request
            .first()
            .and_then(|t| t.to_f64_vec())
            .and_then(|v| v.first().copied())
            .unwrap_or_default();
        Ok(InferenceResponse::new(
            self.name.clone(),
            vec![Tensor::from_f64("predict", vec![1, 2], vec![score, 1.0 - score])],
        ))
    }
}

/// Model returning the same class scores for every request.
pub struct FixedScoreModel {
    pub name: String,
    pub scores: Vec<f64>,
}

#[async_trait]
impl InferenceHandler for FixedScoreModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn predict(&self, _request: InferenceRequest) -> Result<InferenceResponse> {
        Ok(InferenceResponse::new(
            self.name.clone(),
            vec![Tensor::from_f64(
                "predict",
                vec![1, self.scores.len()],
                self.scores.clone(),
            )],
        ))
    }
}

/// Routes to `sklearn` when its first-class score is above 0.5, otherwise
/// to `xgboost`, and appends which model answered as a `label` output.
pub struct Classifier;

#[async_trait]
impl PipelineLogic for Classifier {
    async fn run(
        &self,
        models: &PipelineModels,
        request: InferenceRequest,
    ) -> Result<InferenceResponse> {
        let first = models.call("sklearn", request.clone()).await?;
        let score = first
            .first()
            .and_then(|t| t.value_at(&[0, 0]))
            .ok_or_else(|| ComposeError::Logic {
                name: "classifier".into(),
                reason: "sklearn returned no score".into(),
            })?;
        let (mut response, label) = if score > 0.5 {
            (first, "sklearn prediction")
        } else {
            (models.call("xgboost", request).await?, "xgboost prediction")
        };
        response
            .outputs
            .push(Tensor::from_str_scalar("label", label));
        Ok(response)
    }
}

pub const SKLEARN: &str = "test-iris-sklearn";
pub const XGBOOST: &str = "test-iris-xgboost";
pub const CLASSIFIER: &str = "classifier";

/// Artifact folders for the two models and the pipeline.
pub struct Artifacts {
    pub dir: tempfile::TempDir,
}

impl Artifacts {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for (name, file, bytes) in [
            (SKLEARN, "model.joblib", &b"sklearn-weights"[..]),
            (XGBOOST, "model.bst", &b"xgboost-weights"[..]),
            (CLASSIFIER, "logic.txt", &b"classifier"[..]),
        ] {
            let folder = dir.path().join(name);
            std::fs::create_dir_all(&folder).unwrap();
            std::fs::write(folder.join(file), bytes).unwrap();
        }
        Self { dir }
    }

    pub fn folder(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }
}

pub fn sklearn_model(artifacts: &Artifacts, protocol: Protocol) -> Model {
    Model::new(
        SKLEARN,
        ModelFramework::SKLearn,
        artifacts.folder(SKLEARN),
        "s3://tempo/basic/sklearn".parse().unwrap(),
    )
    .with_protocol(protocol)
}

pub fn xgboost_model(artifacts: &Artifacts, protocol: Protocol) -> Model {
    Model::new(
        XGBOOST,
        ModelFramework::XGBoost,
        artifacts.folder(XGBOOST),
        "s3://tempo/basic/xgboost".parse().unwrap(),
    )
    .with_protocol(protocol)
}

pub fn classifier(
    artifacts: &Artifacts,
    sklearn: ComputeUnit,
    xgboost: ComputeUnit,
    protocol: Protocol,
) -> ComputeUnit {
    Pipeline::new(
        CLASSIFIER,
        artifacts.folder(CLASSIFIER),
        "s3://tempo/basic/pipeline".parse().unwrap(),
        [("sklearn", sklearn), ("xgboost", xgboost)],
        Classifier,
    )
    .unwrap()
    .with_protocol(protocol)
    .into()
}

/// Register fake model servers for both models.
pub fn register_models(register: impl Fn(&str, Arc<dyn InferenceHandler>)) {
    register(
        SKLEARN,
        Arc::new(EchoScoreModel {
            name: SKLEARN.into(),
        }),
    );
    register(
        XGBOOST,
        Arc::new(FixedScoreModel {
            name: XGBOOST.into(),
            scores: vec![0.3, 0.7],
        }),
    );
}

pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        poll_interval: Duration::from_millis(20),
        dependency_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        artifact_store: None,
    }
}

/// Host-published endpoints; in-process containers share the test's loopback.
pub fn container_config() -> ContainerConfig {
    ContainerConfig {
        network: None,
        in_network: false,
        pipeline_image: Some("model-compose/pipeline:test".into()),
        ..Default::default()
    }
}

/// Single `[1, 4]` iris-like row whose first value drives the routing.
pub fn payload(first: f32) -> InferenceRequest {
    InferenceRequest::single(Tensor::from_f32(
        "input",
        vec![1, 4],
        vec![first, 3.5, 1.4, 0.2],
    ))
}

pub fn label(response: &InferenceResponse) -> String {
    response
        .output("label")
        .and_then(|t| t.as_strings())
        .and_then(|s| s.first().cloned())
        .unwrap_or_default()
}

pub fn tree_bytes(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    collect(root, root, &mut out);
    out.sort();
    out
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect(root, &path, out);
        } else {
            let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
            out.push((rel, std::fs::read(&path).unwrap()));
        }
    }
}
