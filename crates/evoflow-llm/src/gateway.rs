use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::debug;

use evoflow_core::config::GatewayConfig;
use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::traits::ModelClient;
use evoflow_core::types::*;

/// Client for a model gateway speaking the completion contract:
/// `POST {base_url}/v1/complete` with a [`CompletionRequest`] body, answered
/// by a [`CompletionResponse`]. Provider selection and pricing live behind
/// the gateway.
pub struct GatewayClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http,
            endpoint: endpoint_url(&config.base_url),
            api_key: config.api_key.clone(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn endpoint_url(base_url: &str) -> String {
    format!("{}/v1/complete", base_url.trim_end_matches('/'))
}

impl ModelClient for GatewayClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            debug!(model = %request.model, mode = ?request.mode, "Sending completion request");

            let mut builder = self
                .http
                .post(&self.endpoint)
                .header("content-type", "application/json")
                .json(&request);
            if let Some(key) = &self.api_key {
                builder = builder.header("Authorization", format!("Bearer {}", key));
            }

            let response = builder
                .send()
                .await
                .map_err(|e| EvoflowError::ModelRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(EvoflowError::ModelRequest(format!("HTTP {}: {}", status, body)));
            }

            let body = response
                .text()
                .await
                .map_err(|e| EvoflowError::ModelRequest(e.to_string()))?;
            serde_json::from_str::<CompletionResponse>(&body)
                .map_err(|e| EvoflowError::ModelParse(format!("{}: {}", e, body)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        assert_eq!(endpoint_url("http://gw:8787"), "http://gw:8787/v1/complete");
        assert_eq!(endpoint_url("http://gw:8787/"), "http://gw:8787/v1/complete");
    }

    #[test]
    fn test_client_from_config() {
        let config = GatewayConfig {
            base_url: "http://localhost:9999/".into(),
            api_key: Some("k".into()),
            ..GatewayConfig::default()
        };
        let client = GatewayClient::new(&config);
        assert_eq!(client.endpoint(), "http://localhost:9999/v1/complete");
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_request_error() {
        let config = GatewayConfig {
            base_url: "http://127.0.0.1:1".into(),
            timeout_secs: 2,
            ..GatewayConfig::default()
        };
        let client = GatewayClient::new(&config);
        let err = client
            .complete(CompletionRequest::text("m", vec![ChatMessage::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, EvoflowError::ModelRequest(_)));
    }
}
