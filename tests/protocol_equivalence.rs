mod common;

use std::time::Duration;

use common::*;
use model_compose::{ComputeUnit, InferenceRequest, Protocol, Runtime, Tensor};

async fn deploy_sklearn(artifacts: &Artifacts, protocol: Protocol) -> ComputeUnit {
    let engine = InProcessEngine::new();
    register_models(|name, handler| engine.register(name, handler));
    let runtime = Runtime::local_container(container_config(), engine, fast_options()).unwrap();
    let unit: ComputeUnit = sklearn_model(artifacts, protocol)
        .with_runtime(runtime)
        .into();
    unit.deploy().await.unwrap();
    unit.wait_ready(Duration::from_secs(5)).await.unwrap();
    unit
}

#[tokio::test]
async fn both_protocols_return_equal_predictions() {
    let artifacts = Artifacts::new();
    let seldon = deploy_sklearn(&artifacts, Protocol::Seldon).await;
    let v2 = deploy_sklearn(&artifacts, Protocol::V2).await;

    for first in [0.9_f32, 0.25, 5.0] {
        let a = seldon.invoke_remote(payload(first)).await.unwrap();
        let b = v2.invoke_remote(payload(first)).await.unwrap();
        assert_eq!(a.model_name, SKLEARN);
        assert_eq!(b.model_name, SKLEARN);
        assert!(a.approx_eq(&b, 1e-6), "seldon {a:?} != v2 {b:?}");
    }
}

#[tokio::test]
async fn integer_payload_is_equivalent() {
    let artifacts = Artifacts::new();
    let seldon = deploy_sklearn(&artifacts, Protocol::Seldon).await;
    let v2 = deploy_sklearn(&artifacts, Protocol::V2).await;

    let request = InferenceRequest::single(Tensor::from_i64("input", vec![1, 3], vec![1, 2, 3]));
    let a = seldon.invoke_remote(request.clone()).await.unwrap();
    let b = v2.invoke_remote(request).await.unwrap();
    assert!(a.approx_eq(&b, 1e-9));
    assert_eq!(a.first().unwrap().value_at(&[0, 0]), Some(1.0));
}

#[tokio::test]
async fn pipeline_label_survives_both_protocols() {
    for protocol in [Protocol::Seldon, Protocol::V2] {
        let artifacts = Artifacts::new();
        let engine = InProcessEngine::new();
        register_models(|name, handler| engine.register(name, handler));
        let runtime =
            Runtime::local_container(container_config(), engine.clone(), fast_options()).unwrap();
        let sklearn: ComputeUnit = sklearn_model(&artifacts, protocol)
            .with_runtime(runtime.clone())
            .into();
        let xgboost: ComputeUnit = xgboost_model(&artifacts, protocol)
            .with_runtime(runtime.clone())
            .into();
        let pipeline = classifier(&artifacts, sklearn, xgboost, protocol);
        pipeline.set_runtime(runtime).unwrap();
        engine.register(CLASSIFIER, std::sync::Arc::new(pipeline.clone()));

        pipeline.deploy().await.unwrap();
        pipeline.wait_ready(Duration::from_secs(5)).await.unwrap();

        let response = pipeline.invoke_remote(payload(0.1)).await.unwrap();
        assert_eq!(label(&response), "xgboost prediction", "{protocol}");
        assert_eq!(response.model_name, CLASSIFIER);
    }
}
