//! Mock provider for tests
//!
//! Two modes: a FIFO queue of scripted replies, or a routing handler that
//! inspects the request (scenario tests key on the question id embedded in
//! the prompt). Every request is recorded for assertions.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use super::{ChatRequest, LlmClient, LlmError};

type Handler = Box<dyn Fn(&ChatRequest) -> Result<String, LlmError> + Send + Sync>;

#[derive(Default)]
pub struct MockClient {
    queue: Mutex<VecDeque<Result<String, LlmError>>>,
    handler: Mutex<Option<Handler>>,
    calls: Mutex<Vec<ChatRequest>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every request through a closure instead of the queue
    pub fn with_handler(
        handler: impl Fn(&ChatRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Self {
        let client = Self::new();
        *client.handler.lock() = Some(Box::new(handler));
        client
    }

    /// Queue a JSON reply (serialized to the raw content string)
    pub fn push_json(&self, value: serde_json::Value) {
        self.queue.lock().push_back(Ok(value.to_string()));
    }

    /// Queue raw content (e.g. malformed JSON to exercise parse retries)
    pub fn push_raw(&self, content: impl Into<String>) {
        self.queue.lock().push_back(Ok(content.into()));
    }

    pub fn push_transport_failure(&self, reason: impl Into<String>) {
        self.queue
            .lock()
            .push_back(Err(LlmError::Transport(reason.into())));
    }

    pub fn push_fatal(&self, reason: impl Into<String>) {
        self.queue
            .lock()
            .push_back(Err(LlmError::Fatal(reason.into())));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Requests received so far, in order
    pub fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LlmClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
        self.calls.lock().push(request.clone());

        if let Some(handler) = self.handler.lock().as_ref() {
            return handler(request);
        }

        self.queue.lock().pop_front().unwrap_or_else(|| {
            Err(LlmError::Fatal(
                "mock reply queue is empty — script more replies".to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn queue_replies_in_order() {
        let mock = MockClient::new();
        mock.push_json(json!({"n": 1}));
        mock.push_json(json!({"n": 2}));

        let req = ChatRequest::new("s", "u", 0.0);
        assert!(mock.complete(&req).await.unwrap().contains('1'));
        assert!(mock.complete(&req).await.unwrap().contains('2'));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn empty_queue_is_fatal() {
        let mock = MockClient::new();
        let err = mock
            .complete(&ChatRequest::new("s", "u", 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Fatal(_)));
    }

    #[tokio::test]
    async fn handler_routes_by_request() {
        let mock = MockClient::with_handler(|req| {
            if req.user.contains("q_01") {
                Ok(json!({"for": "q_01"}).to_string())
            } else {
                Ok(json!({"for": "other"}).to_string())
            }
        });
        let a = mock
            .complete(&ChatRequest::new("s", "about q_01", 0.0))
            .await
            .unwrap();
        assert!(a.contains("q_01"));
        let b = mock
            .complete(&ChatRequest::new("s", "about q_02", 0.0))
            .await
            .unwrap();
        assert!(b.contains("other"));
        assert_eq!(mock.calls().len(), 2);
    }
}
