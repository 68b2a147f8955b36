//! Open inference protocol (V2).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EncodingError;
use crate::payload::{InferenceRequest, InferenceResponse};
use crate::tensor::{DType, Tensor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub datatype: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    /// Row-major data. Nested arrays are accepted on decode.
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    pub inputs: Vec<V2Tensor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2Response {
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    pub outputs: Vec<V2Tensor>,
}

impl V2Tensor {
    fn from_tensor(tensor: &Tensor) -> Result<Self, EncodingError> {
        tensor.validate()?;
        Ok(Self {
            name: tensor.name.clone(),
            shape: tensor.shape.clone(),
            datatype: tensor.dtype().v2_name().to_string(),
            parameters: BTreeMap::new(),
            data: Value::Array(tensor.to_flat_json()),
        })
    }

    fn into_tensor(self) -> Result<Tensor, EncodingError> {
        let dtype = DType::from_v2_name(&self.datatype)?;
        let mut flat = Vec::new();
        flatten_data(self.data, &mut flat);
        Tensor::from_flat_json(self.name, self.shape, dtype, &flat)
    }
}

fn flatten_data(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => items.into_iter().for_each(|v| flatten_data(v, out)),
        scalar => out.push(scalar),
    }
}

fn to_v2_tensors(tensors: &[Tensor]) -> Result<Vec<V2Tensor>, EncodingError> {
    if tensors.is_empty() {
        return Err(EncodingError::EmptyPayload);
    }
    tensors.iter().map(V2Tensor::from_tensor).collect()
}

fn from_v2_tensors(tensors: Vec<V2Tensor>) -> Result<Vec<Tensor>, EncodingError> {
    if tensors.is_empty() {
        return Err(EncodingError::EmptyPayload);
    }
    tensors.into_iter().map(V2Tensor::into_tensor).collect()
}

pub(crate) fn predict_path(model_name: &str) -> String {
    format!("/v2/models/{model_name}/infer")
}

pub(crate) fn ready_path(model_name: &str) -> String {
    format!("/v2/models/{model_name}/ready")
}

pub(crate) fn encode_request(request: &InferenceRequest) -> Result<Vec<u8>, EncodingError> {
    let msg = V2Request {
        id: request.id.clone(),
        parameters: request.parameters.clone(),
        inputs: to_v2_tensors(&request.inputs)?,
    };
    Ok(serde_json::to_vec(&msg)?)
}

pub(crate) fn decode_request(body: &[u8]) -> Result<InferenceRequest, EncodingError> {
    let msg: V2Request = serde_json::from_slice(body)?;
    Ok(InferenceRequest {
        id: msg.id,
        inputs: from_v2_tensors(msg.inputs)?,
        parameters: msg.parameters,
    })
}

pub(crate) fn encode_response(response: &InferenceResponse) -> Result<Vec<u8>, EncodingError> {
    let msg = V2Response {
        model_name: response.model_name.clone(),
        model_version: None,
        id: response.id.clone(),
        parameters: response.parameters.clone(),
        outputs: to_v2_tensors(&response.outputs)?,
    };
    Ok(serde_json::to_vec(&msg)?)
}

pub(crate) fn decode_response(body: &[u8]) -> Result<InferenceResponse, EncodingError> {
    let msg: V2Response = serde_json::from_slice(body)?;
    Ok(InferenceResponse {
        model_name: msg.model_name,
        id: msg.id,
        outputs: from_v2_tensors(msg.outputs)?,
        parameters: msg.parameters,
    })
}
