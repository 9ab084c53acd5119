//! Retry with exponential backoff
//!
//! Transient LLM failures (rate limits, timeouts, malformed JSON) are
//! retried with exponential backoff and a little jitter. The production
//! schedule is 5 s then 10 s, then the caller's fallback policy applies.

use std::future::Future;
use std::time::Duration;

use super::LlmError;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the initial attempt)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on the delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(20),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
}

/// Retry policy that executes operations with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Millisecond-scale delays so test suites stay fast
    pub fn fast_for_tests() -> Self {
        Self::new(
            RetryConfig::default()
                .with_max_retries(2)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(0.0),
        )
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay for a given 0-indexed attempt
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.config.initial_delay.as_millis() as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.config.max_delay.as_millis() as f64);

        let jittered = if self.config.jitter > 0.0 {
            let range = capped * self.config.jitter;
            let offset = rand::random::<f64>() * range * 2.0 - range;
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(jittered as u64)
    }

    /// Execute an operation, retrying retryable `LlmError`s.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, LlmError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_error = Some(e);
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(self.calculate_delay(attempt)).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| LlmError::Transport("retry loop ran zero attempts".to_string())))
    }
}
