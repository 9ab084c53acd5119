//! LLM provider abstraction
//!
//! Every LLM interaction in the pipeline is one call through this module:
//! `(request, response shape) → parsed value | transport error | parse
//! error`. Retries live here and nowhere else; callers treat failure as an
//! outcome, not an exception.
//!
//! | Provider | Use case |
//! |----------|----------|
//! | `openai` | Production (JSON-object response format) |
//! | `mock` | Tests: scripted replies or a routing handler |

mod mock;
mod openai;
mod retry;

pub use mock::MockClient;
pub use openai::{OpenAiClient, OpenAiClientWithUrl};
pub use retry::{RetryConfig, RetryPolicy};

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use crate::config::FileConfig;
use crate::error::ProbeError;

/// Per-call failure taxonomy; `Transport` and `Parse` are retryable
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Network failure, rate limit, timeout, 5xx
    #[error("transport failure: {0}")]
    Transport(String),
    /// The model returned content that does not parse into the target shape
    #[error("response parse failure: {0}")]
    Parse(String),
    /// Misconfiguration (bad key, bad request); retrying cannot help
    #[error("provider rejected the request: {0}")]
    Fatal(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Parse(_))
    }
}

impl From<LlmError> for ProbeError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Transport(reason) => ProbeError::ProviderApiError { reason },
            LlmError::Parse(reason) => ProbeError::ResponseParse { reason },
            LlmError::Fatal(reason) => ProbeError::ProviderApiError { reason },
        }
    }
}

/// One chat-style request with a JSON-object response contract
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>, temperature: f32) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature,
        }
    }
}

/// Core trait all LLM providers implement
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name ("openai", "mock")
    fn name(&self) -> &str;

    /// Execute one request and return the raw response content.
    ///
    /// The provider asks for a JSON-object response format where the API
    /// supports it; fenced output is tolerated and stripped by the caller.
    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError>;
}

/// Create a provider by name.
///
/// | Name | Requires |
/// |------|----------|
/// | `openai` | `OPENAI_API_KEY` env var or config.toml key |
/// | `mock` | Nothing |
pub fn create_client(name: &str, file_config: &FileConfig) -> Result<Arc<dyn LlmClient>, ProbeError> {
    match name.to_lowercase().as_str() {
        "openai" => {
            let key = file_config
                .openai_key()
                .ok_or_else(|| ProbeError::MissingApiKey {
                    provider: "openai".to_string(),
                })?;
            Ok(Arc::new(OpenAiClient::new(key)?))
        }
        "mock" => Ok(Arc::new(MockClient::new())),
        other => Err(ProbeError::ProviderNotConfigured {
            provider: other.to_string(),
        }),
    }
}

/// Strip a markdown code fence if the model wrapped its JSON in one
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse response content into the target shape
fn parse_content<T: DeserializeOwned>(content: &str) -> Result<T, LlmError> {
    serde_json::from_str(strip_fences(content)).map_err(|e| LlmError::Parse(e.to_string()))
}

/// The single retrying entry point: call the model, parse the response into
/// `T`, and retry transport and parse failures with exponential backoff.
pub async fn call_structured<T: DeserializeOwned>(
    client: &dyn LlmClient,
    request: &ChatRequest,
    retry: &RetryPolicy,
) -> Result<T, LlmError> {
    retry
        .execute(|| async {
            let content = client.complete(request).await?;
            parse_content::<T>(&content)
        })
        .await
        .map_err(|e| {
            warn!(provider = client.name(), error = %e, "LLM call failed after retries");
            e
        })
}

/// `call_structured` specialized to an untyped JSON object
pub async fn call_json(
    client: &dyn LlmClient,
    request: &ChatRequest,
    retry: &RetryPolicy,
) -> Result<serde_json::Value, LlmError> {
    call_structured(client, request, retry).await
}
