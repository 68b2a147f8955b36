use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::EncodingError;
use crate::tensor::Tensor;

/// Typed input to a compute unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceRequest {
    /// Caller-chosen request id, echoed back by servers that support it.
    pub id: Option<String>,
    pub inputs: Vec<Tensor>,
    pub parameters: BTreeMap<String, Value>,
}

/// Typed output of a compute unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceResponse {
    /// Identity of the unit that produced the response.
    pub model_name: String,
    pub id: Option<String>,
    pub outputs: Vec<Tensor>,
    pub parameters: BTreeMap<String, Value>,
}

impl InferenceRequest {
    pub fn new(inputs: Vec<Tensor>) -> Self {
        Self {
            inputs,
            ..Default::default()
        }
    }

    pub fn single(input: Tensor) -> Self {
        Self::new(vec![input])
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The first input tensor.
    pub fn first(&self) -> Option<&Tensor> {
        self.inputs.first()
    }

    pub fn input(&self, name: &str) -> Option<&Tensor> {
        self.inputs.iter().find(|t| t.name == name)
    }

    /// Reject empty payloads and malformed tensors before any I/O.
    pub fn validate(&self) -> Result<(), EncodingError> {
        if self.inputs.is_empty() {
            return Err(EncodingError::EmptyPayload);
        }
        self.inputs.iter().try_for_each(Tensor::validate)
    }
}

impl InferenceResponse {
    pub fn new(model_name: impl Into<String>, outputs: Vec<Tensor>) -> Self {
        Self {
            model_name: model_name.into(),
            outputs,
            ..Default::default()
        }
    }

    pub fn first(&self) -> Option<&Tensor> {
        self.outputs.first()
    }

    pub fn output(&self, name: &str) -> Option<&Tensor> {
        self.outputs.iter().find(|t| t.name == name)
    }

    pub fn validate(&self) -> Result<(), EncodingError> {
        if self.outputs.is_empty() {
            return Err(EncodingError::EmptyPayload);
        }
        self.outputs.iter().try_for_each(Tensor::validate)
    }

    /// Turn this response into the next unit's request, keeping the id.
    pub fn into_request(self) -> InferenceRequest {
        InferenceRequest {
            id: self.id,
            inputs: self.outputs,
            parameters: self.parameters,
        }
    }

    /// Compare outputs pairwise within a numeric tolerance; names are ignored.
    pub fn approx_eq(&self, other: &InferenceResponse, tolerance: f64) -> bool {
        self.outputs.len() == other.outputs.len()
            && self
                .outputs
                .iter()
                .zip(&other.outputs)
                .all(|(a, b)| a.approx_eq(b, tolerance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_request_rejected() {
        assert!(matches!(
            InferenceRequest::default().validate(),
            Err(EncodingError::EmptyPayload)
        ));
    }

    #[test]
    fn request_lookup_by_name() {
        let req = InferenceRequest::new(vec![
            Tensor::from_f32("a", vec![1], vec![1.0]),
            Tensor::from_f32("b", vec![1], vec![2.0]),
        ]);
        assert_eq!(req.input("b").unwrap().value_at(&[0]), Some(2.0));
        assert!(req.input("c").is_none());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn into_request_carries_outputs() {
        let mut resp =
            InferenceResponse::new("m", vec![Tensor::from_f32("out", vec![1], vec![0.5])]);
        resp.id = Some("r-1".into());
        let req = resp.into_request();
        assert_eq!(req.id.as_deref(), Some("r-1"));
        assert_eq!(req.inputs[0].name, "out");
    }
}
