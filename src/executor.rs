use std::future::Future;

use async_trait::async_trait;

use crate::error::Result;
use crate::payload::{InferenceRequest, InferenceResponse};
use crate::unit::PipelineModels;

/// User-implemented orchestration body of a pipeline.
///
/// `models` resolves the pipeline's children by alias. Each call made
/// through it follows the child's own binding, so the body does not need to
/// know where a child runs.
#[async_trait]
pub trait PipelineLogic: Send + Sync {
    async fn run(
        &self,
        models: &PipelineModels,
        request: InferenceRequest,
    ) -> Result<InferenceResponse>;
}

/// Adapter turning an async closure into a [`PipelineLogic`].
///
/// ```ignore
/// let logic = LogicFn(|models: PipelineModels, req: InferenceRequest| async move {
///     models.call("sklearn", req).await
/// });
/// ```
pub struct LogicFn<F>(pub F);

#[async_trait]
impl<F, Fut> PipelineLogic for LogicFn<F>
where
    F: Fn(PipelineModels, InferenceRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<InferenceResponse>> + Send,
{
    async fn run(
        &self,
        models: &PipelineModels,
        request: InferenceRequest,
    ) -> Result<InferenceResponse> {
        (self.0)(models.clone(), request).await
    }
}

/// Something that can answer predictions over HTTP.
///
/// Implemented by [`ComputeUnit`](crate::unit::ComputeUnit) so a unit can be
/// served from inside its own container; tests implement it for fakes.
#[async_trait]
pub trait InferenceHandler: Send + Sync {
    /// Name the handler answers to.
    fn name(&self) -> &str;

    /// Whether the handler can take traffic. Defaults to always ready.
    async fn ready(&self) -> bool {
        true
    }

    async fn predict(&self, request: InferenceRequest) -> Result<InferenceResponse>;
}
