// =============================================================================
// Tool-call retry — exponential backoff with jitter
// =============================================================================
//
// Retries live here in the adapter layer, not in the agent supervisor: a
// capability either succeeds, exhausts its retries, or fails fatally, and the
// caller sees exactly one outcome. Only retryable `ToolError` kinds are
// retried; a `Fatal` short-circuits immediately.
// =============================================================================

use std::future::Future;

use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::config::AgentPolicy;
use crate::tools::{ToolError, ToolResult};

/// Retry configuration.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    pub fn from_policy(policy: &AgentPolicy) -> Self {
        Self {
            max_retries: policy.max_retries,
            base_delay_ms: policy.retry_base_delay_ms,
            ..Self::default()
        }
    }

    /// Delay for the given zero-based attempt: exponential, clamped, with
    /// ±jitter_factor of noise so concurrent retries do not align.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((clamped + jitter).max(0.0) as u64)
    }
}

/// Run a tool operation, retrying retryable failures with backoff.
pub async fn retry_tool<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> ToolResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ToolResult<T>>,
{
    let mut last_error: Option<ToolError> = None;

    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() => {
                if attempt < config.max_retries {
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        attempts = config.max_retries + 1,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "tool call failed; retrying"
                    );
                    sleep(delay).await;
                }
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error
        .unwrap_or_else(|| ToolError::Transient("retry loop exhausted without error".to_string())))
}
