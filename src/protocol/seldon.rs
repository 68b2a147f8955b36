//! Legacy Seldon prediction protocol.
//!
//! A single tensor travels as `data.ndarray`, several tensors as a
//! `jsonData` list of `{name, ndarray}` entries, and a scalar string as
//! `strData`. Dtypes are not carried on the wire; decoding infers them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::EncodingError;
use crate::payload::{InferenceRequest, InferenceResponse};
use crate::tensor::{DType, Tensor, TensorData};

pub(crate) const PREDICT_PATH: &str = "/api/v1.0/predictions";
pub(crate) const STATUS_PATH: &str = "/health/status";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeldonMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DefaultData>,
    #[serde(rename = "jsonData", default, skip_serializing_if = "Option::is_none")]
    pub json_data: Option<Value>,
    #[serde(rename = "strData", default, skip_serializing_if = "Option::is_none")]
    pub str_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<SeldonMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    pub ndarray: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeldonMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub puid: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Value>,
    /// Graph component name -> serving image.
    #[serde(rename = "requestPath", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request_path: BTreeMap<String, String>,
}

impl SeldonMessage {
    fn from_tensors(tensors: &[Tensor], meta: SeldonMeta) -> Result<Self, EncodingError> {
        let mut msg = SeldonMessage {
            meta: Some(meta),
            ..Default::default()
        };
        match tensors {
            [] => return Err(EncodingError::EmptyPayload),
            [t] if t.shape.is_empty() && t.dtype() == DType::Bytes => {
                t.validate()?;
                if let TensorData::Bytes(v) = &t.data {
                    msg.str_data = v.first().cloned();
                }
            }
            [t] => {
                msg.data = Some(DefaultData {
                    names: vec![t.name.clone()],
                    ndarray: t.to_ndarray()?,
                });
            }
            many => {
                let entries = many
                    .iter()
                    .map(|t| {
                        t.to_ndarray()
                            .map(|ndarray| json!({ "name": t.name, "ndarray": ndarray }))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                msg.json_data = Some(Value::Array(entries));
            }
        }
        Ok(msg)
    }

    fn into_tensors(self, default_name: &str) -> Result<Vec<Tensor>, EncodingError> {
        if let Some(data) = self.data {
            // More than one name means per-column labels, not a tensor name.
            let name = match data.names.as_slice() {
                [single] => single.clone(),
                _ => default_name.to_string(),
            };
            return Ok(vec![Tensor::from_ndarray(name, &data.ndarray)?]);
        }
        if let Some(json_data) = self.json_data {
            let entries = json_data.as_array().ok_or_else(|| {
                EncodingError::Malformed("jsonData is not a list of tensors".into())
            })?;
            return entries
                .iter()
                .enumerate()
                .map(|(i, entry)| {
                    let ndarray = entry.get("ndarray").ok_or_else(|| {
                        EncodingError::Malformed(format!("jsonData[{i}] has no ndarray"))
                    })?;
                    let name = entry
                        .get("name")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("{default_name}-{i}"));
                    Tensor::from_ndarray(name, ndarray)
                })
                .collect();
        }
        if let Some(s) = self.str_data {
            return Ok(vec![Tensor::new(
                default_name,
                vec![],
                TensorData::Bytes(vec![s]),
            )]);
        }
        Err(EncodingError::Malformed(
            "message carries no data, jsonData or strData".into(),
        ))
    }
}

pub(crate) fn encode_request(request: &InferenceRequest) -> Result<Vec<u8>, EncodingError> {
    request.validate()?;
    let meta = SeldonMeta {
        puid: request.id.clone(),
        tags: request.parameters.clone(),
        ..Default::default()
    };
    let msg = SeldonMessage::from_tensors(&request.inputs, meta)?;
    Ok(serde_json::to_vec(&msg)?)
}

pub(crate) fn decode_request(body: &[u8]) -> Result<InferenceRequest, EncodingError> {
    let mut msg: SeldonMessage = serde_json::from_slice(body)?;
    let meta = msg.meta.take().unwrap_or_default();
    Ok(InferenceRequest {
        id: meta.puid,
        inputs: msg.into_tensors("input")?,
        parameters: meta.tags,
    })
}

pub(crate) fn encode_response(response: &InferenceResponse) -> Result<Vec<u8>, EncodingError> {
    response.validate()?;
    let meta = SeldonMeta {
        puid: response.id.clone(),
        tags: response.parameters.clone(),
        request_path: BTreeMap::from([(
            response.model_name.clone(),
            env!("CARGO_PKG_NAME").to_string(),
        )]),
    };
    let msg = SeldonMessage::from_tensors(&response.outputs, meta)?;
    Ok(serde_json::to_vec(&msg)?)
}

pub(crate) fn decode_response(
    model_name: &str,
    body: &[u8],
) -> Result<InferenceResponse, EncodingError> {
    let mut msg: SeldonMessage = serde_json::from_slice(body)?;
    let meta = msg.meta.take().unwrap_or_default();
    let model_name = meta
        .request_path
        .keys()
        .next()
        .cloned()
        .unwrap_or_else(|| model_name.to_string());
    Ok(InferenceResponse {
        model_name,
        id: meta.puid,
        outputs: msg.into_tensors("output")?,
        parameters: meta.tags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_tensor_uses_ndarray() {
        let req = InferenceRequest::single(Tensor::from_f32(
            "input",
            vec![1, 4],
            vec![5.1, 3.5, 1.4, 0.2],
        ))
        .with_id("abc");
        let body = encode_request(&req).unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["data"]["ndarray"], json!([[5.1, 3.5, 1.4, 0.2]]));
        assert_eq!(v["data"]["names"], json!(["input"]));
        assert_eq!(v["meta"]["puid"], "abc");
    }

    #[test]
    fn multiple_tensors_use_json_data() {
        let resp = InferenceResponse::new(
            "classifier",
            vec![
                Tensor::from_f32("output", vec![1, 2], vec![0.9, 0.1]),
                Tensor::from_str_scalar("label", "sklearn prediction"),
            ],
        );
        let body = encode_response(&resp).unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["jsonData"][1]["ndarray"], json!(["sklearn prediction"]));
        assert_eq!(v["meta"]["requestPath"]["classifier"], "model-compose");

        let decoded = decode_response("fallback", &body).unwrap();
        assert_eq!(decoded.model_name, "classifier");
        assert_eq!(decoded.outputs.len(), 2);
        assert!(decoded.approx_eq(&resp, 1e-6));
    }

    #[test]
    fn str_data_decodes_to_scalar() {
        let body = br#"{"strData":"hello"}"#;
        let resp = decode_response("m", body).unwrap();
        assert_eq!(resp.model_name, "m");
        let t = &resp.outputs[0];
        assert!(t.shape.is_empty());
        assert_eq!(t.as_strings().unwrap(), ["hello"]);
    }

    #[test]
    fn column_names_fall_back_to_default_name() {
        let body = br#"{"data":{"names":["t:0","t:1"],"ndarray":[[0.2,0.8]]}}"#;
        let resp = decode_response("m", body).unwrap();
        assert_eq!(resp.outputs[0].name, "output");
        assert_eq!(resp.outputs[0].value_at(&[0, 1]), Some(0.8));
    }

    #[test]
    fn empty_message_is_malformed() {
        assert!(matches!(
            decode_response("m", b"{}"),
            Err(EncodingError::Malformed(_))
        ));
    }

    #[test]
    fn request_roundtrip_keeps_id_and_tags() {
        let mut req =
            InferenceRequest::single(Tensor::from_i64("input", vec![2], vec![1, 2])).with_id("x");
        req.parameters.insert("threshold".into(), json!(0.5));
        let decoded = decode_request(&encode_request(&req).unwrap()).unwrap();
        assert_eq!(decoded, req);
    }
}
