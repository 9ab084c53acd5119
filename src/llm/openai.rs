//! OpenAI provider using the chat completions API

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{ChatRequest, LlmClient, LlmError};
use crate::error::ProbeError;

const API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Per-request timeout; a timed-out call is a transport failure
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OpenAiClient {
    api_key: String,
    model: String,
    client: Client,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("tabprobe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Internal {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            api_key: api_key.into(),
            model: "gpt-4o".to_string(),
            client,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the endpoint (tests point this at a local mock server)
    #[doc(hidden)]
    pub fn with_base_url(self, base_url: impl Into<String>) -> OpenAiClientWithUrl {
        OpenAiClientWithUrl {
            inner: self,
            url: base_url.into(),
        }
    }

    async fn complete_at(&self, url: &str, request: &ChatRequest) -> Result<String, LlmError> {
        debug!(model = %self.model, temperature = request.temperature, "openai request");

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "temperature": request.temperature,
                "response_format": {"type": "json_object"},
                "messages": [
                    {"role": "system", "content": request.system},
                    {"role": "user", "content": request.user}
                ]
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Transport(format!("request timed out: {e}"))
                } else {
                    LlmError::Transport(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("invalid response body: {e}")))?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::Parse("response has no message content".to_string()))
    }
}

fn classify_status(status: StatusCode, body: &str) -> LlmError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            LlmError::Fatal(format!("authentication failed ({status}): {body}"))
        }
        StatusCode::TOO_MANY_REQUESTS => LlmError::Transport(format!("rate limited: {body}")),
        s if s.is_server_error() => LlmError::Transport(format!("server error {s}: {body}")),
        s => LlmError::Fatal(format!("request rejected ({s}): {body}")),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
        self.complete_at(API_URL, request).await
    }
}

/// OpenAI client bound to an alternative endpoint (wiremock tests)
pub struct OpenAiClientWithUrl {
    inner: OpenAiClient,
    url: String,
}

#[async_trait]
impl LlmClient for OpenAiClientWithUrl {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
        self.inner.complete_at(&self.url, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            LlmError::Fatal(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            LlmError::Transport(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            LlmError::Transport(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, ""),
            LlmError::Fatal(_)
        ));
    }
}
