use std::fmt;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ComposeError, DeploymentError, Result};
use crate::payload::{InferenceRequest, InferenceResponse};
use crate::protocol::Protocol;

/// Bearer credential for a cluster gateway. Wiped on drop and never
/// printed or serialized.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(***)")
    }
}

/// Where a unit answers, and how to talk to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Base URL; protocol paths are appended to it.
    pub base_url: String,
    pub protocol: Protocol,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            protocol,
        }
    }

    pub fn predict_url(&self, model_name: &str) -> String {
        format!("{}{}", self.base_url, self.protocol.predict_path(model_name))
    }

    pub fn ready_url(&self, model_name: &str) -> String {
        format!("{}{}", self.base_url, self.protocol.ready_path(model_name))
    }
}

/// HTTP client for deployed inference endpoints.
///
/// Calls are never retried here; a failed request surfaces as
/// [`ComposeError::Invocation`].
#[derive(Debug, Clone)]
pub struct EndpointClient {
    http: reqwest::Client,
    token: Option<BearerToken>,
    request_timeout: Duration,
}

impl EndpointClient {
    pub fn new(request_timeout: Duration) -> std::result::Result<Self, DeploymentError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DeploymentError::Client(e.to_string()))?;
        Ok(Self {
            http,
            token: None,
            request_timeout,
        })
    }

    pub fn with_token(mut self, token: Option<BearerToken>) -> Self {
        self.token = token;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Encode `request`, post it to the unit's predict route and decode the
    /// reply. Encoding failures return before anything is sent.
    pub async fn predict(
        &self,
        endpoint: &Endpoint,
        model_name: &str,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse> {
        let body = endpoint.protocol.encode_request(request)?;
        let url = endpoint.predict_url(model_name);
        debug!(unit = %model_name, endpoint = %url, bytes = body.len(), "client: predict");

        let mut req = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.expose());
        }

        let invocation = |reason: String| ComposeError::Invocation {
            name: model_name.to_string(),
            reason,
        };
        let resp = req.send().await.map_err(|e| invocation(e.to_string()))?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| invocation(e.to_string()))?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            warn!(unit = %model_name, %status, "client: predict rejected");
            return Err(invocation(format!("HTTP {status}: {text}")));
        }

        Ok(endpoint.protocol.decode_response(model_name, &bytes)?)
    }

    /// One readiness probe. Any transport error counts as not ready.
    pub async fn is_ready(&self, endpoint: &Endpoint, model_name: &str) -> bool {
        let mut req = self.http.get(endpoint.ready_url(model_name));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.expose());
        }
        match req.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(unit = %model_name, error = %e, "client: readiness probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls() {
        let ep = Endpoint::new("http://127.0.0.1:9000/", Protocol::V2);
        assert_eq!(ep.base_url, "http://127.0.0.1:9000");
        assert_eq!(
            ep.predict_url("sk"),
            "http://127.0.0.1:9000/v2/models/sk/infer"
        );
        let seldon = Endpoint::new("http://gw/seldon/ns/sk", Protocol::Seldon);
        assert_eq!(
            seldon.ready_url("sk"),
            "http://gw/seldon/ns/sk/health/status"
        );
    }

    #[test]
    fn token_is_redacted() {
        let token = BearerToken::new("s3cr3t");
        assert_eq!(format!("{token:?}"), "BearerToken(***)");
        assert_eq!(token.expose(), "s3cr3t");
    }

    #[tokio::test]
    async fn encoding_error_before_network() {
        let client = EndpointClient::new(Duration::from_secs(1)).unwrap();
        // Port 9 is discard; the request must never be attempted.
        let ep = Endpoint::new("http://127.0.0.1:9", Protocol::V2);
        let err = client
            .predict(&ep, "sk", &InferenceRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ComposeError::Encoding(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_invocation_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = EndpointClient::new(Duration::from_secs(2)).unwrap();
        let ep = Endpoint::new(format!("http://127.0.0.1:{port}"), Protocol::Seldon);
        let req = InferenceRequest::single(crate::tensor::Tensor::from_f32(
            "input",
            vec![1],
            vec![1.0],
        ));
        let err = client.predict(&ep, "sk", &req).await.unwrap_err();
        assert!(matches!(err, ComposeError::Invocation { name, .. } if name == "sk"));
        assert!(!client.is_ready(&ep, "sk").await);
    }
}
