//! Applies single operations to a sink with bounded retries.

use crate::adapters::{with_timeout, AdapterError, StateSink};
use converge_engine::{EntitySchema, Operation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff policy for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Result of executing one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub result: Result<(), AdapterError>,
    /// Sink calls made
    pub attempts: u32,
}

impl Execution {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Executes operations against a sink.
///
/// Creates and updates are retried on transient failure. Deletes are
/// attempted exactly once.
#[derive(Debug, Clone, Copy)]
pub struct ApplyExecutor {
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl ApplyExecutor {
    pub fn new(policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            policy,
            call_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute(
        &self,
        sink: &dyn StateSink,
        schema: &EntitySchema,
        operation: &Operation,
    ) -> Execution {
        if let Operation::NoOp(_) = operation {
            return Execution {
                result: Ok(()),
                attempts: 0,
            };
        }

        let retryable = !operation.is_delete();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = self.call(sink, schema, operation).await;

            match result {
                Err(err) if retryable && err.is_transient() && attempt < max_attempts => {
                    let delay = self
                        .policy
                        .backoff(attempt)
                        .max(err.retry_after().unwrap_or_default());
                    tracing::warn!(
                        op = operation.name(),
                        kind = %operation.kind(),
                        identity = %operation.identity(),
                        attempt,
                        ?delay,
                        error = %err,
                        "transient apply failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => {
                    return Execution {
                        result,
                        attempts: attempt,
                    }
                }
            }
        }
    }

    async fn call(
        &self,
        sink: &dyn StateSink,
        schema: &EntitySchema,
        operation: &Operation,
    ) -> Result<(), AdapterError> {
        with_timeout(self.call_timeout, async {
            match operation {
                Operation::Create(op) => sink.apply_create(schema, &op.record).await,
                Operation::Update(op) => {
                    sink.apply_update(schema, &op.identity, &op.changed_fields)
                        .await
                }
                Operation::Delete(op) => sink.apply_delete(schema, &op.identity).await,
                Operation::NoOp(_) => Ok(()),
            }
        })
        .await
    }
}
