use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{TaskContextRef, Tool, ToolInvocation, ToolRegistry, ToolRequest, ToolStatus};
use crate::core::error::ToolFailure;

/// Retry schedule for soft failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(63) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn delay_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let mut delay = self.backoff_for(retry);
        if self.jitter {
            let spread = delay.as_millis() as u64 / 4;
            if spread > 0 {
                delay += Duration::from_millis(rand::thread_rng().gen_range(0..=spread));
            }
        }
        match retry_after {
            Some(hint) if hint > delay => hint,
            _ => delay,
        }
    }
}

/// Outcome of a retried call plus every attempt made along the way.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub outcome: Result<Value, ToolFailure>,
    pub invocations: Vec<ToolInvocation>,
}

/// Call `tool` until it succeeds, fails hard, exhausts retries, runs out of
/// budget or `cancel` fires.
///
/// Each attempt is bounded by `deadline`. A missed deadline counts as a soft
/// failure while retries remain and as a hard failure on the last attempt.
pub async fn invoke_with_retry(
    registry: &ToolRegistry,
    tool: &Arc<dyn Tool>,
    payload: Value,
    context: &TaskContextRef,
    deadline: Duration,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> InvocationResult {
    let descriptor = tool.descriptor();
    let name = descriptor.name.clone();
    let mut invocations = Vec::new();
    let total_attempts = policy.max_retries.saturating_add(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return InvocationResult {
                outcome: Err(ToolFailure::Canceled),
                invocations,
            };
        }

        if let Err(detail) = registry.budgets().try_reserve(&name, descriptor.cost_units) {
            warn!("Budget exhausted for tool {}: {}", name, detail);
            return InvocationResult {
                outcome: Err(ToolFailure::BudgetExhausted { tool: name, detail }),
                invocations,
            };
        }

        let request = ToolRequest {
            tool_name: name.clone(),
            payload: payload.clone(),
            deadline,
            context: context.clone(),
            attempt,
            cancel: cancel.child_token(),
        };

        let started_at = Utc::now();
        let clock = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            res = tokio::time::timeout(deadline, tool.invoke(&request)) => Some(res),
        };
        let latency_ms = clock.elapsed().as_millis() as u64;
        let last_attempt = attempt >= total_attempts;

        let Some(result) = result else {
            debug!("Discarding in-flight call to {} after cancellation", name);
            return InvocationResult {
                outcome: Err(ToolFailure::Canceled),
                invocations,
            };
        };

        let (status, error, retry_after, value) = match result {
            Ok(response) => {
                let retry_after = response.retry_after();
                (response.status, response.error, retry_after, response.result)
            }
            Err(_) => {
                let status = if last_attempt {
                    ToolStatus::HardFailure
                } else {
                    ToolStatus::SoftFailure
                };
                let detail = format!("deadline of {}ms exceeded", deadline.as_millis());
                (status, Some(detail), None, None)
            }
        };

        invocations.push(ToolInvocation {
            tool_name: name.clone(),
            input: payload.clone(),
            attempt,
            outcome: status,
            started_at,
            latency_ms,
            error: error.clone(),
        });

        match status {
            ToolStatus::Success => {
                return InvocationResult {
                    outcome: Ok(value.unwrap_or(Value::Null)),
                    invocations,
                };
            }
            ToolStatus::HardFailure => {
                let detail = error.unwrap_or_else(|| "hard failure".to_string());
                warn!("Tool {} failed hard on attempt {}: {}", name, attempt, detail);
                return InvocationResult {
                    outcome: Err(ToolFailure::Hard { tool: name, detail }),
                    invocations,
                };
            }
            ToolStatus::SoftFailure if last_attempt => {
                let detail = error.unwrap_or_else(|| "soft failure".to_string());
                warn!(
                    "Tool {} still failing after {} attempts: {}",
                    name, attempt, detail
                );
                return InvocationResult {
                    outcome: Err(ToolFailure::SoftExhausted {
                        tool: name,
                        attempts: attempt,
                        detail,
                    }),
                    invocations,
                };
            }
            ToolStatus::SoftFailure => {
                let delay = policy.delay_for(attempt, retry_after);
                debug!(
                    "Tool {} soft failure on attempt {} ({}), retrying in {:?}",
                    name,
                    attempt,
                    error.as_deref().unwrap_or("no detail"),
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return InvocationResult {
                            outcome: Err(ToolFailure::Canceled),
                            invocations,
                        };
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
