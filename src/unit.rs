//! Compute units and the execution dispatcher.
//!
//! A [`ComputeUnit`] is either a [`Model`] (one trained artifact served by
//! a backend) or a [`Pipeline`] (user logic over child units). Both expose
//! the same two entry points: [`ComputeUnit::invoke_local`] runs the unit's
//! logic in this process, and [`ComputeUnit::invoke_remote`] forwards the
//! whole call to the unit's own deployed endpoint.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{BindingError, ComposeError, Result};
use crate::executor::{InferenceHandler, PipelineLogic};
use crate::metadata::{ModelFramework, UnitDetails, UnitKind, UnitMetadata};
use crate::payload::{InferenceRequest, InferenceResponse};
use crate::protocol::Protocol;
use crate::runtime::Runtime;
use crate::storage::StorageUri;

/// Lifecycle of a unit: `Defined → Saved → Uploaded → Deployed → Ready → Undeployed`.
///
/// `Saved` and `Uploaded` are only required before cluster deployment.
/// `Undeployed` is reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UnitState {
    #[default]
    Defined,
    Saved,
    Uploaded,
    Deployed,
    Ready,
    Undeployed,
}

impl UnitState {
    /// A backend resource exists for the unit.
    pub const fn is_live(self) -> bool {
        matches!(self, UnitState::Deployed | UnitState::Ready)
    }
}

#[derive(Default)]
struct Binding {
    runtime: Option<Arc<Runtime>>,
    state: UnitState,
    uploaded: bool,
}

/// Leaf unit wrapping one trained artifact.
pub struct Model {
    details: UnitDetails,
    platform: ModelFramework,
    binding: RwLock<Binding>,
}

impl Model {
    pub fn new(
        name: impl Into<String>,
        platform: ModelFramework,
        local_folder: impl Into<PathBuf>,
        uri: StorageUri,
    ) -> Self {
        Self {
            details: UnitDetails::new(name, local_folder, uri),
            platform,
            binding: RwLock::new(Binding::default()),
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.details.protocol = protocol;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.details.description = Some(description.into());
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<Runtime>) -> Self {
        self.binding.get_mut().runtime = Some(runtime);
        self
    }

    pub fn details(&self) -> &UnitDetails {
        &self.details
    }

    pub fn platform(&self) -> ModelFramework {
        self.platform
    }
}

/// Composite unit running user logic over child units.
pub struct Pipeline {
    details: UnitDetails,
    children: Arc<BTreeMap<String, ComputeUnit>>,
    logic: Arc<dyn PipelineLogic>,
    binding: RwLock<Binding>,
}

impl Pipeline {
    /// Build a pipeline over `children`, keyed by the alias the logic uses.
    ///
    /// Fails if a descendant carries the pipeline's own name (a cycle) or if
    /// two different units in the tree share a name.
    pub fn new<A, I>(
        name: impl Into<String>,
        local_folder: impl Into<PathBuf>,
        uri: StorageUri,
        children: I,
        logic: impl PipelineLogic + 'static,
    ) -> std::result::Result<Self, BindingError>
    where
        A: Into<String>,
        I: IntoIterator<Item = (A, ComputeUnit)>,
    {
        let details = UnitDetails::new(name, local_folder, uri);
        let children: BTreeMap<String, ComputeUnit> = children
            .into_iter()
            .map(|(alias, unit)| (alias.into(), unit))
            .collect();

        let mut seen = HashMap::new();
        for child in children.values() {
            let mut path = vec![details.name.clone()];
            check_descendants(&details.name, child, &mut path, &mut seen)?;
        }

        Ok(Self {
            details,
            children: Arc::new(children),
            logic: Arc::new(logic),
            binding: RwLock::new(Binding::default()),
        })
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.details.protocol = protocol;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.details.description = Some(description.into());
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<Runtime>) -> Self {
        self.binding.get_mut().runtime = Some(runtime);
        self
    }

    pub fn details(&self) -> &UnitDetails {
        &self.details
    }

    /// Children keyed by alias.
    pub fn children(&self) -> impl Iterator<Item = (&str, &ComputeUnit)> {
        self.children.iter().map(|(alias, unit)| (alias.as_str(), unit))
    }

    pub fn models(&self) -> PipelineModels {
        PipelineModels {
            pipeline: self.details.name.clone(),
            children: Arc::clone(&self.children),
        }
    }
}

fn check_descendants(
    root: &str,
    unit: &ComputeUnit,
    path: &mut Vec<String>,
    seen: &mut HashMap<String, ComputeUnit>,
) -> std::result::Result<(), BindingError> {
    path.push(unit.name().to_string());
    if unit.name() == root {
        return Err(BindingError::Cycle { path: path.clone() });
    }
    match seen.get(unit.name()) {
        Some(existing) if !existing.same_unit(unit) => {
            return Err(BindingError::DuplicateName(unit.name().to_string()));
        }
        Some(_) => {}
        None => {
            seen.insert(unit.name().to_string(), unit.clone());
            if let ComputeUnit::Pipeline(p) = unit {
                for child in p.children.values() {
                    check_descendants(root, child, path, seen)?;
                }
            }
        }
    }
    path.pop();
    Ok(())
}

/// Children of a pipeline as seen from its logic.
#[derive(Clone)]
pub struct PipelineModels {
    pipeline: String,
    children: Arc<BTreeMap<String, ComputeUnit>>,
}

impl PipelineModels {
    pub fn get(&self, alias: &str) -> std::result::Result<&ComputeUnit, BindingError> {
        self.children
            .get(alias)
            .ok_or_else(|| BindingError::UnknownChild {
                pipeline: self.pipeline.clone(),
                alias: alias.to_string(),
            })
    }

    /// Invoke a child locally; the child dispatches per its own binding.
    pub async fn call(&self, alias: &str, request: InferenceRequest) -> Result<InferenceResponse> {
        self.get(alias)?.invoke_local(request).await
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }
}

/// A deployable, invocable unit: a model or a pipeline.
#[derive(Clone)]
pub enum ComputeUnit {
    Model(Arc<Model>),
    Pipeline(Arc<Pipeline>),
}

impl From<Model> for ComputeUnit {
    fn from(model: Model) -> Self {
        ComputeUnit::Model(Arc::new(model))
    }
}

impl From<Pipeline> for ComputeUnit {
    fn from(pipeline: Pipeline) -> Self {
        ComputeUnit::Pipeline(Arc::new(pipeline))
    }
}

impl fmt::Debug for ComputeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeUnit")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl ComputeUnit {
    pub fn details(&self) -> &UnitDetails {
        match self {
            ComputeUnit::Model(m) => &m.details,
            ComputeUnit::Pipeline(p) => &p.details,
        }
    }

    pub fn name(&self) -> &str {
        &self.details().name
    }

    pub fn protocol(&self) -> Protocol {
        self.details().protocol
    }

    pub fn kind(&self) -> UnitKind {
        match self {
            ComputeUnit::Model(_) => UnitKind::Model,
            ComputeUnit::Pipeline(_) => UnitKind::Pipeline,
        }
    }

    fn binding(&self) -> &RwLock<Binding> {
        match self {
            ComputeUnit::Model(m) => &m.binding,
            ComputeUnit::Pipeline(p) => &p.binding,
        }
    }

    /// Direct children, one entry per distinct unit.
    pub fn dependencies(&self) -> Vec<ComputeUnit> {
        let ComputeUnit::Pipeline(p) = self else {
            return Vec::new();
        };
        let mut deps: Vec<ComputeUnit> = Vec::new();
        for child in p.children.values() {
            if !deps.iter().any(|d| d.same_unit(child)) {
                deps.push(child.clone());
            }
        }
        deps
    }

    /// Both handles point at the same unit.
    pub fn same_unit(&self, other: &ComputeUnit) -> bool {
        match (self, other) {
            (ComputeUnit::Model(a), ComputeUnit::Model(b)) => Arc::ptr_eq(a, b),
            (ComputeUnit::Pipeline(a), ComputeUnit::Pipeline(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn runtime(&self) -> Option<Arc<Runtime>> {
        self.binding().read().runtime.clone()
    }

    pub(crate) fn bound_runtime(&self) -> std::result::Result<Arc<Runtime>, BindingError> {
        self.runtime()
            .ok_or_else(|| BindingError::Unbound(self.name().to_string()))
    }

    /// Bind this unit (only) to `runtime`.
    ///
    /// Refused while a backend resource exists, so the old runtime's
    /// resource is never orphaned. Undeploy first.
    pub fn set_runtime(&self, runtime: Arc<Runtime>) -> std::result::Result<(), BindingError> {
        let mut binding = self.binding().write();
        if binding.state.is_live() {
            return Err(BindingError::Rebind {
                name: self.name().to_string(),
                state: binding.state,
            });
        }
        debug!(unit = %self.name(), runtime = runtime.kind(), "unit: runtime bound");
        binding.runtime = Some(runtime);
        Ok(())
    }

    pub fn state(&self) -> UnitState {
        self.binding().read().state
    }

    pub(crate) fn set_state(&self, state: UnitState) {
        let mut binding = self.binding().write();
        if binding.state != state {
            debug!(unit = %self.name(), from = ?binding.state, to = ?state, "unit: state change");
            binding.state = state;
        }
    }

    /// Whether `upload` has copied the artifacts to the unit's URI.
    pub fn is_uploaded(&self) -> bool {
        self.binding().read().uploaded
    }

    pub(crate) fn mark_uploaded(&self) {
        let mut binding = self.binding().write();
        binding.uploaded = true;
        if matches!(
            binding.state,
            UnitState::Defined | UnitState::Saved | UnitState::Undeployed
        ) {
            binding.state = UnitState::Uploaded;
        }
    }

    pub(crate) fn mark_saved(&self) {
        let mut binding = self.binding().write();
        if matches!(binding.state, UnitState::Defined | UnitState::Undeployed) {
            binding.state = UnitState::Saved;
        }
    }

    /// Descriptor written to the unit's folder by `save`.
    pub fn metadata(&self) -> UnitMetadata {
        let details = self.details();
        UnitMetadata {
            name: details.name.clone(),
            kind: self.kind(),
            platform: match self {
                ComputeUnit::Model(m) => Some(m.platform),
                ComputeUnit::Pipeline(_) => None,
            },
            uri: details.uri.to_string(),
            protocol: details.protocol,
            dependencies: self
                .dependencies()
                .iter()
                .map(|d| d.name().to_string())
                .collect(),
            artifact_hashes: BTreeMap::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Run the unit's logic in this process.
    ///
    /// A model delegates one level down to the backend it is bound to. A
    /// pipeline runs its body here; every child call recurses into this
    /// same rule using the child's binding.
    pub async fn invoke_local(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        match self {
            ComputeUnit::Model(_) => {
                let runtime = self.bound_runtime()?;
                runtime.predict(self, request).await
            }
            ComputeUnit::Pipeline(p) => {
                request.validate()?;
                debug!(unit = %p.details.name, "unit: running pipeline locally");
                let mut response = p.logic.run(&p.models(), request).await?;
                response.model_name = p.details.name.clone();
                Ok(response)
            }
        }
    }

    /// Send the whole call to this unit's deployed endpoint.
    ///
    /// Fails with `NotReady` unless the unit has been deployed and has
    /// passed its readiness check.
    pub async fn invoke_remote(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        let state = self.state();
        if state != UnitState::Ready {
            return Err(ComposeError::NotReady {
                name: self.name().to_string(),
                state,
            });
        }
        let runtime = self.bound_runtime()?;
        runtime.predict(self, request).await
    }

    pub async fn save(&self, capture_environment: bool) -> Result<()> {
        self.bound_runtime()?.save(self, capture_environment).await
    }

    pub async fn upload(&self) -> Result<()> {
        self.bound_runtime()?.upload(self).await
    }

    pub async fn deploy(&self) -> Result<()> {
        self.bound_runtime()?.deploy(self).await
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        self.bound_runtime()?.wait_ready(self, timeout).await
    }

    pub async fn undeploy(&self) -> Result<()> {
        self.bound_runtime()?.undeploy(self).await
    }
}

#[async_trait]
impl InferenceHandler for ComputeUnit {
    fn name(&self) -> &str {
        ComputeUnit::name(self)
    }

    async fn predict(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        self.invoke_local(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LogicFn;
    use crate::tensor::Tensor;

    fn uri(path: &str) -> StorageUri {
        format!("s3://tempo/{path}").parse().unwrap()
    }

    fn model(name: &str) -> ComputeUnit {
        Model::new(name, ModelFramework::SKLearn, "/tmp/none", uri(name)).into()
    }

    fn echo_pipeline(name: &str, children: Vec<(&str, ComputeUnit)>) -> Pipeline {
        Pipeline::new(
            name,
            "/tmp/none",
            uri(name),
            children,
            LogicFn(|_models: PipelineModels, req: InferenceRequest| async move {
                Ok(InferenceResponse::new("ignored", req.inputs))
            }),
        )
        .unwrap()
    }

    fn payload() -> InferenceRequest {
        InferenceRequest::single(Tensor::from_f32("input", vec![1, 2], vec![1.0, 2.0]))
    }

    #[test]
    fn child_named_like_pipeline_is_a_cycle() {
        let inner: ComputeUnit = echo_pipeline("classifier", vec![]).into();
        let err = Pipeline::new(
            "classifier",
            "/tmp/none",
            uri("c"),
            [("inner", inner)],
            LogicFn(|_m: PipelineModels, req: InferenceRequest| async move {
                Ok(InferenceResponse::new("x", req.inputs))
            }),
        )
        .err()
        .unwrap();
        match err {
            BindingError::Cycle { path } => assert_eq!(path, ["classifier", "classifier"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn distinct_units_sharing_a_name_rejected() {
        let result = Pipeline::new(
            "p",
            "/tmp/none",
            uri("p"),
            [("a", model("sk")), ("b", model("sk"))],
            LogicFn(|_m: PipelineModels, req: InferenceRequest| async move {
                Ok(InferenceResponse::new("x", req.inputs))
            }),
        );
        assert!(matches!(result, Err(BindingError::DuplicateName(n)) if n == "sk"));
    }

    #[test]
    fn shared_child_is_one_dependency() {
        let sk = model("sk");
        let p: ComputeUnit = echo_pipeline("p", vec![("a", sk.clone()), ("b", sk)]).into();
        assert_eq!(p.dependencies().len(), 1);
        assert_eq!(p.metadata().dependencies, ["sk"]);
    }

    #[tokio::test]
    async fn remote_before_deploy_is_not_ready() {
        let sk = model("sk");
        let err = sk.invoke_remote(payload()).await.unwrap_err();
        assert!(matches!(
            err,
            ComposeError::NotReady { state: UnitState::Defined, .. }
        ));
    }

    #[tokio::test]
    async fn unbound_model_fails_with_binding_error() {
        let err = model("sk").invoke_local(payload()).await.unwrap_err();
        assert!(matches!(err, ComposeError::Binding(BindingError::Unbound(n)) if n == "sk"));
    }

    #[tokio::test]
    async fn nested_pipeline_runs_locally_and_is_renamed() {
        let inner: ComputeUnit = echo_pipeline("inner", vec![]).into();
        let outer: ComputeUnit = Pipeline::new(
            "outer",
            "/tmp/none",
            uri("outer"),
            [("inner", inner)],
            LogicFn(|models: PipelineModels, req: InferenceRequest| async move {
                models.call("inner", req).await
            }),
        )
        .unwrap()
        .into();

        let resp = outer.invoke_local(payload()).await.unwrap();
        assert_eq!(resp.model_name, "outer");
        assert_eq!(resp.outputs[0].value_at(&[0, 1]), Some(2.0));
    }

    #[tokio::test]
    async fn unknown_alias_is_binding_error() {
        let p: ComputeUnit = Pipeline::new(
            "p",
            "/tmp/none",
            uri("p"),
            Vec::<(String, ComputeUnit)>::new(),
            LogicFn(|models: PipelineModels, req: InferenceRequest| async move {
                models.call("missing", req).await
            }),
        )
        .unwrap()
        .into();
        let err = p.invoke_local(payload()).await.unwrap_err();
        assert!(matches!(
            err,
            ComposeError::Binding(BindingError::UnknownChild { .. })
        ));
    }

    #[tokio::test]
    async fn empty_payload_rejected_before_logic() {
        let p: ComputeUnit = echo_pipeline("p", vec![]).into();
        let err = p.invoke_local(InferenceRequest::default()).await.unwrap_err();
        assert!(matches!(err, ComposeError::Encoding(_)));
    }
}
