//! Wire protocols spoken by inference endpoints.

pub mod seldon;
pub mod v2;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::EncodingError;
use crate::payload::{InferenceRequest, InferenceResponse};

/// Protocol used to talk to a unit's endpoint.
///
/// Both variants carry the payload, the outputs and the unit identity, and
/// decode equivalent inputs to equal typed results up to float precision:
/// Seldon does not carry dtypes, so numbers come back as `I64`/`F64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Legacy Seldon prediction protocol.
    #[default]
    Seldon,
    /// Open inference protocol, a.k.a. KServe V2.
    V2,
}

impl Protocol {
    /// Path of the prediction endpoint, relative to the unit's base URL.
    pub fn predict_path(self, model_name: &str) -> String {
        match self {
            Protocol::Seldon => seldon::PREDICT_PATH.to_string(),
            Protocol::V2 => v2::predict_path(model_name),
        }
    }

    /// Path answering 200 once the unit can serve predictions.
    pub fn ready_path(self, model_name: &str) -> String {
        match self {
            Protocol::Seldon => seldon::STATUS_PATH.to_string(),
            Protocol::V2 => v2::ready_path(model_name),
        }
    }

    /// Value of `spec.protocol` on a SeldonDeployment.
    pub const fn cluster_protocol(self) -> &'static str {
        match self {
            Protocol::Seldon => "seldon",
            Protocol::V2 => "v2",
        }
    }

    /// Encode a request body. Validation runs first, so nothing is sent
    /// for an unsupported payload.
    pub fn encode_request(self, request: &InferenceRequest) -> Result<Bytes, EncodingError> {
        let body = match self {
            Protocol::Seldon => seldon::encode_request(request)?,
            Protocol::V2 => v2::encode_request(request)?,
        };
        Ok(Bytes::from(body))
    }

    pub fn decode_request(self, body: &[u8]) -> Result<InferenceRequest, EncodingError> {
        match self {
            Protocol::Seldon => seldon::decode_request(body),
            Protocol::V2 => v2::decode_request(body),
        }
    }

    pub fn encode_response(self, response: &InferenceResponse) -> Result<Bytes, EncodingError> {
        let body = match self {
            Protocol::Seldon => seldon::encode_response(response)?,
            Protocol::V2 => v2::encode_response(response)?,
        };
        Ok(Bytes::from(body))
    }

    /// Decode a response body. `model_name` is used when the wire format
    /// does not name the responding unit.
    pub fn decode_response(
        self,
        model_name: &str,
        body: &[u8],
    ) -> Result<InferenceResponse, EncodingError> {
        match self {
            Protocol::Seldon => seldon::decode_response(model_name, body),
            Protocol::V2 => v2::decode_response(body),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cluster_protocol())
    }
}

impl FromStr for Protocol {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "seldon" => Ok(Protocol::Seldon),
            "v2" | "kfserving" | "kserve" => Ok(Protocol::V2),
            other => Err(EncodingError::Malformed(format!("unknown protocol '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn sample_response() -> InferenceResponse {
        InferenceResponse::new(
            "test-iris-sklearn",
            vec![Tensor::from_f32("predict", vec![1, 3], vec![0.9, 0.05, 0.05])],
        )
    }

    #[test]
    fn paths() {
        assert_eq!(Protocol::Seldon.predict_path("m"), "/api/v1.0/predictions");
        assert_eq!(Protocol::V2.predict_path("m"), "/v2/models/m/infer");
        assert_eq!(Protocol::V2.ready_path("m"), "/v2/models/m/ready");
    }

    #[test]
    fn both_protocols_decode_equivalently() {
        let resp = sample_response();
        for protocol in [Protocol::Seldon, Protocol::V2] {
            let body = protocol.encode_response(&resp).unwrap();
            let decoded = protocol.decode_response("test-iris-sklearn", &body).unwrap();
            assert_eq!(decoded.model_name, "test-iris-sklearn");
            assert!(
                decoded.approx_eq(&resp, 1e-6),
                "{protocol} changed the payload: {decoded:?}"
            );
        }
    }

    #[test]
    fn empty_payload_fails_fast() {
        for protocol in [Protocol::Seldon, Protocol::V2] {
            assert!(matches!(
                protocol.encode_request(&InferenceRequest::default()),
                Err(EncodingError::EmptyPayload)
            ));
        }
    }

    #[test]
    fn protocol_serde_and_parse() {
        assert_eq!(serde_json::to_string(&Protocol::V2).unwrap(), "\"v2\"");
        assert_eq!("kfserving".parse::<Protocol>().unwrap(), Protocol::V2);
        assert_eq!("Seldon".parse::<Protocol>().unwrap(), Protocol::Seldon);
        assert!("grpc".parse::<Protocol>().is_err());
    }
}
